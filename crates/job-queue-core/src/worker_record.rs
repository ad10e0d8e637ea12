use crate::{keys, JobError, JobId, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Worker lifecycle state as published in its record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Suspended,
    Started,
    Busy,
    Idle,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Suspended => "suspended",
            WorkerState::Started => "started",
            WorkerState::Busy => "busy",
            WorkerState::Idle => "idle",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted identity and status of one worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub name: String,
    pub state: WorkerState,
    pub hostname: String,
    pub pid: u32,
    pub queues: Vec<String>,
    pub current_job_id: Option<JobId>,
    pub last_heartbeat: DateTime<Utc>,
    pub birth_date: DateTime<Utc>,
    pub successful_job_count: u64,
    pub failed_job_count: u64,
    /// Accumulated execution time in milliseconds
    pub total_working_time: u64,
}

impl WorkerRecord {
    pub fn new(name: String, hostname: String, pid: u32, queues: Vec<String>) -> Self {
        let now = Utc::now();
        WorkerRecord {
            name,
            state: WorkerState::Suspended,
            hostname,
            pid,
            queues,
            current_job_id: None,
            last_heartbeat: now,
            birth_date: now,
            successful_job_count: 0,
            failed_job_count: 0,
            total_working_time: 0,
        }
    }

    pub fn key(&self) -> String {
        keys::worker_key(&self.name)
    }

    /// Check if the worker has heartbeated within `threshold`
    pub fn is_alive(&self, threshold: Duration) -> bool {
        Utc::now() - self.last_heartbeat < threshold
    }

    /// Refresh the heartbeat timestamp
    pub fn heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    /// Record the outcome of one executed job
    pub fn record_job(&mut self, succeeded: bool, working_time: Duration) {
        if succeeded {
            self.successful_job_count += 1;
        } else {
            self.failed_job_count += 1;
        }
        self.total_working_time += working_time.num_milliseconds().max(0) as u64;
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(JobError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(JobError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> WorkerRecord {
        WorkerRecord::new("worker-1".into(), "host".into(), 42, vec!["default".into()])
    }

    #[test]
    fn test_new_record_is_suspended() {
        let record = record();
        assert_eq!(record.state, WorkerState::Suspended);
        assert_eq!(record.key(), "jq:worker:worker-1");
        assert!(record.is_alive(Duration::seconds(30)));
    }

    #[test]
    fn test_stale_heartbeat_detection() {
        let mut record = record();
        record.last_heartbeat = Utc::now() - Duration::seconds(60);
        assert!(!record.is_alive(Duration::seconds(30)));

        record.heartbeat();
        assert!(record.is_alive(Duration::seconds(30)));
    }

    #[test]
    fn test_job_counters() {
        let mut record = record();
        record.record_job(true, Duration::milliseconds(250));
        record.record_job(false, Duration::milliseconds(750));

        assert_eq!(record.successful_job_count, 1);
        assert_eq!(record.failed_job_count, 1);
        assert_eq!(record.total_working_time, 1000);
    }
}
