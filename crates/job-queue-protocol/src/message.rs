use job_queue_core::Job;
use serde::{Deserialize, Serialize};

/// Frame types for the horse pipe protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Request = 1,
    Report = 2,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameType::Request),
            2 => Some(FrameType::Report),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Frames exchanged between a worker and its work horse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Worker -> horse, written once on stdin
    Request(HorseRequest),

    /// Horse -> worker, written once on stdout before exiting
    Report(HorseReport),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Request(_) => FrameType::Request,
            Frame::Report(_) => FrameType::Report,
        }
    }
}

/// The job a horse must run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorseRequest {
    pub job: Job,
    /// Name of the serializer that encoded `job.payload`
    pub serializer: String,
}

/// What the job code did, as seen from inside the horse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HorseReport {
    /// Returned normally with an encoded result
    Success { result: Vec<u8> },

    /// Returned an application error
    Raised { error: String },

    /// Payload could not be decoded, or the function is unknown
    Invalid { error: String },

    /// Stopped early after an interrupt, without a result
    Interrupted,
}
