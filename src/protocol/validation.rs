//! Validation of frames received from the server (RFC 6455).
//!
//! Checks run on the header, before the payload is buffered:
//! - Server frames must not be masked (Section 5.1)
//! - RSV bits must be clear, no extensions are negotiated (Section 5.2)
//! - Frame payload size must fit the configured limit
//! - Control frames must be final and at most 125 bytes (Section 5.5)

use crate::config::Limits;
use crate::error::{Error, Result};
use crate::protocol::OpCode;
use crate::protocol::frame::{FrameHeader, MAX_CONTROL_FRAME_PAYLOAD};

/// Validator for frames arriving at the client.
#[derive(Debug, Clone)]
pub struct FrameValidator {
    limits: Limits,
}

impl FrameValidator {
    /// Create a new frame validator.
    #[must_use]
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }

    /// Validate the header fields of an incoming frame.
    ///
    /// # Errors
    ///
    /// - `Error::MaskedServerFrame` - the server masked its frame
    /// - `Error::ReservedBitsSet` - RSV bits set
    /// - `Error::FragmentedControlFrame` - control frame with FIN=0
    /// - `Error::ControlFrameTooLarge` - control payload over 125 bytes
    /// - `Error::FrameTooLarge` - payload exceeds the frame limit
    pub fn validate_incoming(
        &self,
        opcode: OpCode,
        fin: bool,
        masked: bool,
        rsv: (bool, bool, bool),
        payload_len: usize,
    ) -> Result<()> {
        if masked {
            return Err(Error::MaskedServerFrame);
        }

        if rsv.0 || rsv.1 || rsv.2 {
            return Err(Error::ReservedBitsSet);
        }

        if opcode.is_control() {
            if !fin {
                return Err(Error::FragmentedControlFrame);
            }
            if payload_len > MAX_CONTROL_FRAME_PAYLOAD {
                return Err(Error::ControlFrameTooLarge(payload_len));
            }
        }

        self.limits.check_frame_size(payload_len)
    }

    /// Size check for a frame that is skipped rather than decoded.
    pub(crate) fn check_skipped(&self, payload_len: usize) -> Result<()> {
        self.limits.check_frame_size(payload_len)
    }

    pub(crate) fn validate_header(&self, header: &FrameHeader) -> Result<()> {
        self.validate_incoming(
            header.opcode,
            header.fin,
            header.mask.is_some(),
            (header.rsv1, header.rsv2, header.rsv3),
            header.payload_len,
        )
    }
}
