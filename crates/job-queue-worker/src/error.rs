use job_queue_core::JobError;
use job_queue_protocol::ProtocolError;
use job_queue_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("A live worker named {0} is already registered")]
    DuplicateWorker(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WorkerError {
    /// Store connectivity faults are surfaced to the operator, not retried forever
    pub fn is_connection(&self) -> bool {
        matches!(self, WorkerError::Store(e) if e.is_connection())
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
