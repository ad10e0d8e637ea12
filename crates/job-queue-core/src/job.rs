use crate::serializer::Serializer;
use crate::{keys, JobError, Result, MAX_PAYLOAD_SIZE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a job
pub type JobId = Uuid;

/// Seconds a finished job is kept when its `result_ttl` is `Ttl::Default`
pub const DEFAULT_RESULT_TTL: u64 = 500;

/// Seconds a failed job is kept when its `failure_ttl` is `Ttl::Default`
pub const DEFAULT_FAILURE_TTL: u64 = 365 * 24 * 60 * 60;

/// Job status across its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in a queue
    Queued,
    /// Owned by a worker and executing
    Started,
    /// Completed successfully
    Finished,
    /// Completed with a failure
    Failed,
    /// Cancelled by a stop command or a forced shutdown
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed | JobStatus::Stopped)
    }

    /// Whether `self -> to` is a legal lifecycle step
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Started)
                | (Started, Finished)
                | (Started, Failed)
                | (Started, Stopped)
                | (Started, Queued)
                | (Failed, Queued)
                | (Stopped, Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "started" => Ok(JobStatus::Started),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            "stopped" => Ok(JobStatus::Stopped),
            other => Err(JobError::Invalid(format!("unknown job status: {}", other))),
        }
    }
}

/// Why a job ended up in the failed registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Execution exceeded its deadline
    Timeout,
    /// The work horse terminated abnormally
    Crashed,
    /// Job code returned an application error
    Raised,
    /// Cancelled via command or shutdown escalation
    Stopped,
    /// Owning worker stopped heartbeating; assigned by the orphan sweep
    WorkerDied,
    /// Payload could not be decoded, or the callable is unknown
    Invalid,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Crashed => "crashed",
            FailureKind::Raised => "raised",
            FailureKind::Stopped => "stopped",
            FailureKind::WorkerDied => "worker_died",
            FailureKind::Invalid => "invalid",
        }
    }

    /// Failures that may consume a retry instead of landing in the failed registry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::Crashed | FailureKind::Raised | FailureKind::WorkerDied
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retention of a terminal job record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ttl {
    /// Use the record-type default
    #[default]
    Default,
    /// Keep until deleted explicitly
    Forever,
    /// Keep for this many seconds; zero deletes right after recording
    Seconds(u64),
}

impl Ttl {
    /// Resolve to a number of seconds, `None` meaning no expiry.
    pub fn resolve(&self, default_secs: u64) -> Option<u64> {
        match self {
            Ttl::Default => Some(default_secs),
            Ttl::Forever => None,
            Ttl::Seconds(secs) => Some(*secs),
        }
    }
}

/// The callable-plus-arguments carried in a job payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Name of a registered job function
    pub function: String,
    /// Arguments handed to the function
    pub args: serde_json::Value,
}

impl Invocation {
    pub fn new(function: impl Into<String>, args: serde_json::Value) -> Self {
        Invocation {
            function: function.into(),
            args,
        }
    }

    pub fn encode(&self, serializer: &dyn Serializer) -> Result<Vec<u8>> {
        serializer.encode(&serde_json::to_value(self)?)
    }

    pub fn decode(bytes: &[u8], serializer: &dyn Serializer) -> Result<Self> {
        let value = serializer.decode(bytes)?;
        serde_json::from_value(value).map_err(|e| JobError::Invalid(e.to_string()))
    }
}

/// Job record with all lifecycle metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Human-readable description, usually the function name
    pub description: String,

    /// Serializer-encoded `Invocation` (max 10MB)
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,

    /// Queue the job was enqueued on
    pub origin: String,

    /// Current status
    pub status: JobStatus,

    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Retention once finished
    pub result_ttl: Ttl,

    /// Retention once failed or stopped
    pub failure_ttl: Ttl,

    /// Max wall-clock execution time in seconds, `None` for the worker default
    pub timeout: Option<u64>,

    /// Worker currently (or last) executing this job
    pub worker_name: Option<String>,

    /// Retries still available after a retryable failure
    pub retries_left: u32,

    /// Number of times execution has started
    pub attempts: u32,

    /// Encoded result (if finished)
    #[serde(default, with = "base64_bytes_opt")]
    pub result: Option<Vec<u8>>,

    /// Error description (if failed or stopped)
    pub error: Option<String>,

    /// Failure classification (if failed or stopped)
    pub failure_kind: Option<FailureKind>,
}

impl Job {
    /// Create a new job for the given queue
    pub fn new(origin: impl Into<String>, description: impl Into<String>, payload: Vec<u8>) -> Result<Self> {
        Job::builder(origin, payload).description(description).build()
    }

    /// Create a job calling `invocation`, encoding it with `serializer`
    pub fn for_call(
        origin: impl Into<String>,
        invocation: &Invocation,
        serializer: &dyn Serializer,
    ) -> Result<JobBuilder> {
        let payload = invocation.encode(serializer)?;
        Ok(JobBuilder::new(origin, payload).description(invocation.function.clone()))
    }

    /// Create a new job builder
    pub fn builder(origin: impl Into<String>, payload: Vec<u8>) -> JobBuilder {
        JobBuilder::new(origin, payload)
    }

    /// Serialize job to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(JobError::from)
    }

    /// Deserialize job from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(JobError::from)
    }

    /// Store key of this record
    pub fn key(&self) -> String {
        keys::job_key(&self.id)
    }

    fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Mark job as owned by `worker_name`
    pub fn start(&mut self, worker_name: &str) -> Result<()> {
        self.transition(JobStatus::Started)?;
        self.started_at = Some(stamp_after(self.enqueued_at));
        self.worker_name = Some(worker_name.to_string());
        self.attempts += 1;
        Ok(())
    }

    /// Mark job as completed successfully
    pub fn finish(&mut self, result: Vec<u8>) -> Result<()> {
        if result.len() > MAX_PAYLOAD_SIZE {
            return Err(JobError::PayloadTooLarge {
                max: MAX_PAYLOAD_SIZE,
                actual: result.len(),
            });
        }

        self.transition(JobStatus::Finished)?;
        self.result = Some(result);
        self.ended_at = Some(stamp_after(self.started_at));
        Ok(())
    }

    /// Mark job as failed; a `Stopped` kind lands in the `stopped` status
    pub fn fail(&mut self, kind: FailureKind, error: impl Into<String>) -> Result<()> {
        let to = if kind == FailureKind::Stopped {
            JobStatus::Stopped
        } else {
            JobStatus::Failed
        };
        self.transition(to)?;
        self.failure_kind = Some(kind);
        self.error = Some(error.into());
        self.ended_at = Some(stamp_after(self.started_at));
        Ok(())
    }

    /// Put the job back to `queued`, starting a fresh attempt
    pub fn requeue(&mut self) -> Result<()> {
        self.transition(JobStatus::Queued)?;
        self.enqueued_at = Some(stamp_after(self.ended_at.or(self.started_at)));
        self.started_at = None;
        self.ended_at = None;
        self.worker_name = None;
        self.result = None;
        self.error = None;
        self.failure_kind = None;
        Ok(())
    }

    /// Check if a failure of `kind` should be retried
    pub fn can_retry(&self, kind: FailureKind) -> bool {
        kind.is_retryable() && self.retries_left > 0
    }

    /// Spend one retry and requeue
    pub fn retry(&mut self) -> Result<()> {
        self.retries_left = self.retries_left.saturating_sub(1);
        self.requeue()
    }

    /// Execution deadline, falling back to `default`
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.map(Duration::from_secs).unwrap_or(default)
    }

    /// Wall-clock execution time, once ended
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// `Utc::now()`, clamped so timestamps never go backwards
fn stamp_after(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if prev > now => prev,
        _ => now,
    }
}

/// Builder for creating jobs with custom configuration
pub struct JobBuilder {
    origin: String,
    payload: Vec<u8>,
    description: Option<String>,
    id: Option<JobId>,
    timeout: Option<u64>,
    result_ttl: Ttl,
    failure_ttl: Ttl,
    retries: u32,
}

impl JobBuilder {
    pub fn new(origin: impl Into<String>, payload: Vec<u8>) -> Self {
        JobBuilder {
            origin: origin.into(),
            payload,
            description: None,
            id: None,
            timeout: None,
            result_ttl: Ttl::Default,
            failure_ttl: Ttl::Default,
            retries: 0,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn timeout_seconds(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn result_ttl(mut self, ttl: Ttl) -> Self {
        self.result_ttl = ttl;
        self
    }

    pub fn failure_ttl(mut self, ttl: Ttl) -> Self {
        self.failure_ttl = ttl;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn build(self) -> Result<Job> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(JobError::PayloadTooLarge {
                max: MAX_PAYLOAD_SIZE,
                actual: self.payload.len(),
            });
        }
        if self.origin.is_empty() {
            return Err(JobError::Invalid("queue name must not be empty".to_string()));
        }

        Ok(Job {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            description: self.description.unwrap_or_default(),
            payload: self.payload,
            origin: self.origin,
            status: JobStatus::Queued,
            enqueued_at: Some(Utc::now()),
            started_at: None,
            ended_at: None,
            result_ttl: self.result_ttl,
            failure_ttl: self.failure_ttl,
            timeout: self.timeout,
            worker_name: None,
            retries_left: self.retries,
            attempts: 0,
            result: None,
            error: None,
            failure_kind: None,
        })
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
