mod error;
mod job;
pub mod keys;
mod serializer;
mod worker_record;

pub use error::{JobError, Result};
pub use job::{
    FailureKind, Invocation, Job, JobBuilder, JobId, JobStatus, Ttl, DEFAULT_FAILURE_TTL,
    DEFAULT_RESULT_TTL,
};
pub use serializer::{serializer_by_name, JsonSerializer, Serializer, YamlSerializer};
pub use worker_record::{WorkerRecord, WorkerState};

pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024; // 10MB
