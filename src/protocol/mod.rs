//! WebSocket protocol core implementation (RFC 6455).

pub mod assembler;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod opcode;
pub mod validation;

pub use assembler::{Assembled, DataKind, FrameSequence};
pub use frame::Frame;
pub use handshake::{HandshakeRequest, HandshakeResponse, WS_GUID, compute_accept_key};
pub use mask::{apply_mask, generate_mask};
pub use opcode::OpCode;
pub use validation::FrameValidator;
