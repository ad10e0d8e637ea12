use crate::JobStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Payload size exceeds maximum allowed size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("Invalid job status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid job record: {0}")]
    Invalid(String),
}

impl From<serde_json::Error> for JobError {
    fn from(e: serde_json::Error) -> Self {
        JobError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for JobError {
    fn from(e: serde_yaml::Error) -> Self {
        JobError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
