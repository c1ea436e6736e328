use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::CloseCode;
use crate::protocol::frame::{parse_header, reserved_frame_len};
use crate::protocol::mask::generate_mask;
use crate::protocol::validation::FrameValidator;
use crate::protocol::{Frame, OpCode};

/// An upgraded stream, ready to be split into a frame reader and writer.
///
/// Every outbound frame is masked with a fresh key. Inbound frames are
/// validated from their header before the payload is buffered.
pub struct WebSocketCodec<T> {
    io: T,
    read_buf: BytesMut,
    validator: FrameValidator,
    write_buffer_size: usize,
}

impl<T> WebSocketCodec<T> {
    #[must_use]
    pub fn new(io: T, config: &Config) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            validator: FrameValidator::new(config.limits.clone()),
            write_buffer_size: config.write_buffer_size,
        }
    }

    /// Seed the read buffer with bytes that arrived together with the
    /// upgrade response.
    #[must_use]
    pub fn with_read_buf(mut self, leftover: &[u8]) -> Self {
        self.read_buf.extend_from_slice(leftover);
        self
    }

    /// Bytes received but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.read_buf.len()
    }
}

impl<T: AsyncRead + AsyncWrite> WebSocketCodec<T> {
    /// Split into halves that can be driven from different tasks.
    pub fn split(self) -> (FrameReader<ReadHalf<T>>, FrameWriter<WriteHalf<T>>) {
        let (read, write) = tokio::io::split(self.io);
        let reader = FrameReader {
            io: read,
            read_buf: self.read_buf,
            validator: self.validator,
        };
        let writer = FrameWriter {
            io: write,
            write_buf: BytesMut::with_capacity(self.write_buffer_size),
        };
        (reader, writer)
    }
}

/// Decodes server frames from the read half of a stream.
pub struct FrameReader<R> {
    io: R,
    read_buf: BytesMut,
    validator: FrameValidator,
}

impl<R> FrameReader<R> {
    #[must_use]
    pub fn new(io: R, config: &Config) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            validator: FrameValidator::new(config.limits.clone()),
        }
    }

    /// Bytes received but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.read_buf.len()
    }

    /// Try to decode one frame from the bytes already buffered.
    ///
    /// Frames with a reserved opcode are dropped once fully buffered.
    fn decode(&mut self) -> Result<Option<Frame>> {
        loop {
            match reserved_frame_len(&self.read_buf) {
                Ok(Some((header_len, payload_len))) => {
                    self.validator.check_skipped(payload_len)?;
                    let total = header_len.saturating_add(payload_len);
                    if self.read_buf.len() < total {
                        self.read_buf.reserve(total - self.read_buf.len());
                        return Ok(None);
                    }
                    debug!(opcode = self.read_buf[0] & 0x0F, len = payload_len, "ignoring reserved opcode");
                    self.read_buf.advance(total);
                }
                Ok(None) => break,
                Err(Error::IncompleteFrame { .. }) => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        let header = match parse_header(&self.read_buf) {
            Ok(header) => header,
            Err(Error::IncompleteFrame { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.validator.validate_header(&header)?;

        match Frame::parse(&self.read_buf) {
            Ok((frame, consumed)) => {
                self.read_buf.advance(consumed);
                Ok(Some(frame))
            }
            Err(Error::IncompleteFrame { needed }) => {
                self.read_buf.reserve(needed);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read the next complete frame.
    ///
    /// Cancel safe: partial data stays in the read buffer, so dropping the
    /// future and calling again resumes where it left off.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConnectionClosed(None)` when the peer closes the
    /// stream, an I/O error, or a validation error for a bad frame.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decode()? {
                trace!(opcode = %frame.opcode, fin = frame.fin, len = frame.payload().len(), "frame in");
                return Ok(frame);
            }

            self.read_buf.reserve(4096);
            let n = self.io.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed(None));
            }
        }
    }
}

/// Masks and writes client frames to the write half of a stream.
pub struct FrameWriter<W> {
    io: W,
    write_buf: BytesMut,
}

impl<W> FrameWriter<W> {
    #[must_use]
    pub fn new(io: W, config: &Config) -> Self {
        Self {
            io,
            write_buf: BytesMut::with_capacity(config.write_buffer_size),
        }
    }

    #[must_use]
    pub fn get_ref(&self) -> &W {
        &self.io
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Mask and write one frame.
    ///
    /// Close frames carrying the local-only codes 1005 or 1006 go out as 1000.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mask = Some(generate_mask());

        let sanitized;
        let frame = match frame.opcode {
            OpCode::Close if frame.payload().len() >= 2 => {
                let code = u16::from_be_bytes([frame.payload()[0], frame.payload()[1]]);
                let wire = CloseCode::from_u16(code).wire_code();
                if wire == code {
                    frame
                } else {
                    let reason = std::str::from_utf8(&frame.payload()[2..]).unwrap_or_default();
                    sanitized = Frame::close(Some(wire), reason);
                    &sanitized
                }
            }
            _ => frame,
        };

        let wire_size = frame.wire_size(true);
        self.write_buf.clear();
        self.write_buf.resize(wire_size, 0);

        let written = frame.write(&mut self.write_buf, mask)?;
        self.io.write_all(&self.write_buf[..written]).await?;
        trace!(opcode = %frame.opcode, len = frame.payload().len(), "frame out");
        Ok(())
    }

    /// Write one frame and flush it.
    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        self.write_frame(frame).await?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.io.flush().await?;
        Ok(())
    }

    /// Shut down the write half of the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}
