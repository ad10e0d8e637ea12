//! Wire formats: JSON control commands published to a worker's channel, and
//! the length-prefixed frames exchanged with a work horse over its pipes.

mod codec;
mod command;
mod message;

pub use codec::HorseCodec;
pub use command::Command;
pub use message::{Frame, FrameType, HorseReport, HorseRequest};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Malformed command: {0}")]
    MalformedCommand(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Maximum frame size: 11MB (10MB job payload or result + record overhead)
pub const MAX_FRAME_SIZE: usize = 11 * 1024 * 1024;
