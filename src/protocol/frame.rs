//! WebSocket frame parsing and serialization (RFC 6455 Section 5.2).

use crate::error::{Error, Result};
use crate::protocol::OpCode;
use crate::protocol::mask::apply_mask;

/// Maximum payload size for control frames (RFC 6455).
pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;

/// Decoded fixed part of a frame header.
#[derive(Debug, Clone)]
pub(crate) struct FrameHeader {
    pub(crate) fin: bool,
    pub(crate) rsv1: bool,
    pub(crate) rsv2: bool,
    pub(crate) rsv3: bool,
    pub(crate) opcode: OpCode,
    pub(crate) mask: Option<[u8; 4]>,
    pub(crate) payload_len: usize,
    pub(crate) header_len: usize,
}

/// Parse a frame header from the start of `buf`.
///
/// # Errors
///
/// - `Error::IncompleteFrame` if not enough data is available
/// - `Error::InvalidOpcode` / `Error::ReservedOpcode` for unknown opcodes
/// - `Error::PayloadTooLargeForPlatform` if the 64-bit length does not fit in `usize`
pub(crate) fn parse_header(buf: &[u8]) -> Result<FrameHeader> {
    if buf.len() < 2 {
        return Err(Error::IncompleteFrame {
            needed: 2 - buf.len(),
        });
    }

    let byte0 = buf[0];
    let byte1 = buf[1];
    let opcode = OpCode::from_u8(byte0 & 0x0F)?;
    let masked = (byte1 & 0x80) != 0;
    let (payload_len, len_end) = parse_length(buf)?;

    let header_len = if masked { len_end + 4 } else { len_end };
    if buf.len() < header_len {
        return Err(Error::IncompleteFrame {
            needed: header_len - buf.len(),
        });
    }

    let mask = masked.then(|| [buf[len_end], buf[len_end + 1], buf[len_end + 2], buf[len_end + 3]]);

    Ok(FrameHeader {
        fin: (byte0 & 0x80) != 0,
        rsv1: (byte0 & 0x40) != 0,
        rsv2: (byte0 & 0x20) != 0,
        rsv3: (byte0 & 0x10) != 0,
        opcode,
        mask,
        payload_len,
        header_len,
    })
}

/// Decode the payload length, returning it with the offset where it ends.
fn parse_length(buf: &[u8]) -> Result<(usize, usize)> {
    match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Err(Error::IncompleteFrame {
                    needed: 4 - buf.len(),
                });
            }
            Ok((u16::from_be_bytes([buf[2], buf[3]]) as usize, 4))
        }
        127 => {
            if buf.len() < 10 {
                return Err(Error::IncompleteFrame {
                    needed: 10 - buf.len(),
                });
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&buf[2..10]);
            let len_u64 = u64::from_be_bytes(len_bytes);
            // RFC 6455: the most significant bit MUST be 0
            if len_u64 >> 63 != 0 {
                return Err(Error::InvalidFrameLength(len_u64));
            }
            let len = usize::try_from(len_u64)
                .map_err(|_| Error::PayloadTooLargeForPlatform { size: len_u64 })?;
            Ok((len, 10))
        }
        short => Ok((short as usize, 2)),
    }
}

/// Header and payload length of a frame with a reserved opcode at the start
/// of `buf`, or `None` if the frame uses a known opcode.
///
/// # Errors
///
/// - `Error::IncompleteFrame` if the header is not complete yet
/// - `Error::InvalidFrameLength` / `Error::PayloadTooLargeForPlatform` for a bad length
pub(crate) fn reserved_frame_len(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    if buf.len() < 2 {
        return Err(Error::IncompleteFrame {
            needed: 2 - buf.len(),
        });
    }
    if !matches!(OpCode::from_u8(buf[0] & 0x0F), Err(Error::ReservedOpcode(_))) {
        return Ok(None);
    }

    let (payload_len, len_end) = parse_length(buf)?;
    let header_len = if buf[1] & 0x80 != 0 { len_end + 4 } else { len_end };
    Ok(Some((header_len, payload_len)))
}

/// A WebSocket frame as defined in RFC 6455.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
/// |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
/// |N|V|V|V|       |S|             |   (if payload len==126/127)   |
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |                 Masking key (client frames only)              |
/// +---------------------------------------------------------------+
/// |                          Payload data                         |
/// +---------------------------------------------------------------+
/// ```
///
/// The payload is always held unmasked. `mask_key` records the key the frame
/// carried on the wire (for parsed frames) and is ignored when writing; the
/// writer takes the key as an argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Reserved bit 1. Must be 0, no extensions are negotiated.
    pub rsv1: bool,
    /// Reserved bit 2.
    pub rsv2: bool,
    /// Reserved bit 3.
    pub rsv3: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Masking key seen on the wire, if any.
    pub mask_key: Option<[u8; 4]>,
    payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame.
    #[must_use]
    pub fn new(fin: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask_key: None,
            payload,
        }
    }

    /// Create a final text frame.
    #[must_use]
    pub fn text(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Text, data.into())
    }

    /// Create a final binary frame.
    #[must_use]
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Binary, data.into())
    }

    /// Create a close frame with an optional status code and reason.
    ///
    /// The code is written as given; callers translate local-only codes with
    /// [`CloseCode::wire_code`](crate::CloseCode::wire_code) first.
    #[must_use]
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let payload = match code {
            Some(code) => {
                let mut data = code.to_be_bytes().to_vec();
                data.extend_from_slice(reason.as_bytes());
                data
            }
            None => Vec::new(),
        };
        Self::new(true, OpCode::Close, payload)
    }

    /// Create a ping frame.
    #[must_use]
    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Ping, data.into())
    }

    /// Create a pong frame.
    #[must_use]
    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Pong, data.into())
    }

    /// Get the (unmasked) payload bytes.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take ownership of the payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Parse a frame from the start of `buf`, unmasking the payload.
    ///
    /// Returns the frame and the number of bytes consumed.
    ///
    /// ## Errors
    ///
    /// - `Error::IncompleteFrame` if not enough data is available
    /// - `Error::InvalidOpcode` / `Error::ReservedOpcode` for unknown opcodes
    /// - `Error::InvalidFrameLength` for a 64-bit length with the high bit set
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        let header = parse_header(buf)?;

        let total_size = header
            .header_len
            .checked_add(header.payload_len)
            .ok_or(Error::PayloadTooLargeForPlatform {
                size: header.payload_len as u64,
            })?;

        if buf.len() < total_size {
            return Err(Error::IncompleteFrame {
                needed: total_size - buf.len(),
            });
        }

        let mut payload = buf[header.header_len..total_size].to_vec();
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        let frame = Frame {
            fin: header.fin,
            rsv1: header.rsv1,
            rsv2: header.rsv2,
            rsv3: header.rsv3,
            opcode: header.opcode,
            mask_key: header.mask,
            payload,
        };

        Ok((frame, total_size))
    }

    /// Validate the frame according to RFC 6455.
    ///
    /// # Errors
    ///
    /// - `Error::ReservedBitsSet` if RSV bits are set
    /// - `Error::FragmentedControlFrame` if a control frame has FIN=0
    /// - `Error::ControlFrameTooLarge` if a control frame payload exceeds 125 bytes
    pub fn validate(&self) -> Result<()> {
        if self.rsv1 || self.rsv2 || self.rsv3 {
            return Err(Error::ReservedBitsSet);
        }

        if self.opcode.is_control() {
            if !self.fin {
                return Err(Error::FragmentedControlFrame);
            }
            if self.payload.len() > MAX_CONTROL_FRAME_PAYLOAD {
                return Err(Error::ControlFrameTooLarge(self.payload.len()));
            }
        }

        Ok(())
    }

    /// Write the frame to a buffer, masking the payload with `mask` if given.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidFrame` if the buffer is too small.
    pub fn write(&self, buf: &mut [u8], mask: Option<[u8; 4]>) -> Result<usize> {
        let payload_len = self.payload.len();
        let total_size = self.wire_size(mask.is_some());

        if buf.len() < total_size {
            return Err(Error::InvalidFrame(format!(
                "Buffer too small: need {} bytes, have {}",
                total_size,
                buf.len()
            )));
        }

        let mut byte0 = self.opcode.as_u8();
        if self.fin {
            byte0 |= 0x80;
        }
        if self.rsv1 {
            byte0 |= 0x40;
        }
        if self.rsv2 {
            byte0 |= 0x20;
        }
        if self.rsv3 {
            byte0 |= 0x10;
        }
        buf[0] = byte0;

        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        let mut offset = 2;
        if payload_len <= 125 {
            buf[1] = mask_bit | payload_len as u8;
        } else if payload_len <= 0xFFFF {
            buf[1] = mask_bit | 126;
            buf[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
            offset = 4;
        } else {
            buf[1] = mask_bit | 127;
            buf[2..10].copy_from_slice(&(payload_len as u64).to_be_bytes());
            offset = 10;
        }

        if let Some(mask_key) = mask {
            buf[offset..offset + 4].copy_from_slice(&mask_key);
            offset += 4;
        }

        let body = &mut buf[offset..offset + payload_len];
        body.copy_from_slice(&self.payload);
        if let Some(mask_key) = mask {
            apply_mask(body, mask_key);
        }

        Ok(total_size)
    }

    /// Serialize into a fresh vector.
    #[must_use]
    pub fn encode(&self, mask: Option<[u8; 4]>) -> Vec<u8> {
        let mut buf = vec![0u8; self.wire_size(mask.is_some())];
        // The buffer is sized by wire_size, so write cannot fail.
        let _ = self.write(&mut buf, mask);
        buf
    }

    /// Calculate the size needed to write this frame.
    #[must_use]
    pub fn wire_size(&self, masked: bool) -> usize {
        let payload_len = self.payload.len();
        let extended_len_size = if payload_len <= 125 {
            0
        } else if payload_len <= 0xFFFF {
            2
        } else {
            8
        };
        let mask_size = if masked { 4 } else { 0 };
        2 + extended_len_size + mask_size + payload_len
    }
}
