//! Reassembly of fragmented messages (RFC 6455 Section 5.4).

use bytes::BytesMut;

use crate::config::Limits;
use crate::error::{Error, Result};
use crate::protocol::{Frame, OpCode};

/// Kind of data message being reassembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// UTF-8 text.
    Text,
    /// Opaque bytes.
    Binary,
}

/// Accumulator for one fragmented message.
///
/// Opened by the first text or binary frame, extended by continuation frames,
/// and drained when a frame with FIN set arrives. At most one sequence is open
/// at a time.
#[derive(Debug)]
pub struct FrameSequence {
    buffer: BytesMut,
    kind: Option<DataKind>,
    fragment_count: usize,
    limits: Limits,
}

impl FrameSequence {
    /// Create an empty accumulator enforcing `limits`.
    #[must_use]
    pub fn new(limits: Limits) -> Self {
        Self {
            buffer: BytesMut::new(),
            kind: None,
            fragment_count: 0,
            limits,
        }
    }

    /// Add a data frame. Returns the complete message when the frame has FIN set.
    ///
    /// Control frames are not part of any sequence and are ignored.
    ///
    /// # Errors
    ///
    /// - `Error::ProtocolViolation` for a continuation with no open sequence, or
    ///   a new text/binary frame while one is still open
    /// - `Error::MessageTooLarge` / `Error::TooManyFragments` past the limits
    /// - `Error::InvalidUtf8` if a completed text message is not UTF-8
    pub fn push(&mut self, frame: Frame) -> Result<Option<Assembled>> {
        match frame.opcode {
            OpCode::Continuation => {
                if self.kind.is_none() {
                    return Err(Error::ProtocolViolation(
                        "Continuation frame without an open message".into(),
                    ));
                }
            }
            OpCode::Text | OpCode::Binary => {
                if self.kind.is_some() {
                    return Err(Error::ProtocolViolation(
                        "Expected continuation frame".into(),
                    ));
                }
                self.kind = Some(if frame.opcode == OpCode::Text {
                    DataKind::Text
                } else {
                    DataKind::Binary
                });
            }
            _ => return Ok(None),
        }

        self.limits.check_fragment_count(self.fragment_count + 1)?;
        self.limits
            .check_message_size(self.buffer.len() + frame.payload().len())?;

        let fin = frame.fin;
        self.buffer.extend_from_slice(frame.payload());
        self.fragment_count += 1;

        if !fin {
            return Ok(None);
        }

        let payload = self.buffer.split().to_vec();
        let kind = self.kind.take();
        self.fragment_count = 0;

        match kind {
            Some(DataKind::Text) => String::from_utf8(payload)
                .map(|text| Some(Assembled::Text(text)))
                .map_err(|_| Error::InvalidUtf8),
            Some(DataKind::Binary) => Ok(Some(Assembled::Binary(payload))),
            None => Ok(None),
        }
    }

    /// Returns `true` while a fragmented message is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.kind.is_some()
    }

    /// Bytes accumulated so far.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial message.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.kind = None;
        self.fragment_count = 0;
    }
}

/// A fully reassembled data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// Complete text message.
    Text(String),
    /// Complete binary message.
    Binary(Vec<u8>),
}
