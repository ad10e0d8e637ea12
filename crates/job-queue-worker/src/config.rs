use crate::dequeue::DequeueStrategyKind;
use crate::registry::OrphanPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a worker runs each job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum IsolationKind {
    /// Fresh child process per job (default)
    #[default]
    Process,
    /// Cancellable task inside the worker process
    InProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub redis_url: String,
    /// Worker name (auto-generated if not provided)
    pub name: Option<String>,
    /// Queues to listen on, highest priority first
    pub queues: Vec<String>,
    pub dequeue_strategy: DequeueStrategyKind,
    pub isolation: IsolationKind,
    /// Serializer used to decode payloads and encode results
    pub serializer: String,
    /// Execution timeout for jobs that do not set their own
    pub default_timeout_secs: u64,
    /// Longest single blocking wait on the queues; shutdown is noticed between waits
    pub dequeue_timeout_secs: u64,
    /// Time between the death penalty's interrupt and kill phases
    pub kill_grace_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Expiry of the worker record key, renewed by every heartbeat
    pub worker_ttl_secs: u64,
    /// Heartbeat age after which a worker is considered dead
    pub staleness_threshold_secs: u64,
    /// Interval between registry cleanups and orphan sweeps
    pub maintenance_interval_secs: u64,
    pub orphan_policy: OrphanPolicy,
    pub disable_default_exception_handler: bool,
    pub log_format: LogFormat,
    /// Serve Prometheus metrics on this port
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            name: None,
            queues: vec!["default".to_string()],
            dequeue_strategy: DequeueStrategyKind::default(),
            isolation: IsolationKind::default(),
            serializer: "json".to_string(),
            default_timeout_secs: 180,
            dequeue_timeout_secs: 2,
            kill_grace_secs: 2,
            heartbeat_interval_secs: 10,
            worker_ttl_secs: 420,
            staleness_threshold_secs: 120,
            maintenance_interval_secs: 600,
            orphan_policy: OrphanPolicy::default(),
            disable_default_exception_handler: false,
            log_format: LogFormat::default(),
            metrics_port: None,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.queues.is_empty() {
            return Err("at least one queue is required".to_string());
        }
        if let Some(queue) = self.queues.iter().find(|q| q.is_empty()) {
            return Err(format!("invalid queue name: {:?}", queue));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err("heartbeat_interval_secs must be positive".to_string());
        }
        if self.staleness_threshold_secs <= self.heartbeat_interval_secs {
            return Err("staleness_threshold_secs must exceed heartbeat_interval_secs".to_string());
        }
        if self.worker_ttl_secs < self.staleness_threshold_secs {
            return Err("worker_ttl_secs must be at least staleness_threshold_secs".to_string());
        }
        Ok(())
    }

    pub fn worker_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let pid = std::process::id();
        let random = uuid::Uuid::new_v4().simple().to_string();

        format!("{}.{}.{}", hostname, pid, &random[..8])
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_secs.max(1))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn worker_ttl(&self) -> Duration {
        Duration::from_secs(self.worker_ttl_secs)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "queues: [high, default, low]\ndequeue_strategy: round_robin\norphan_policy: fail\ndefault_timeout_secs: 30"
        )
        .unwrap();

        let config = WorkerConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.queues, vec!["high", "default", "low"]);
        assert_eq!(config.dequeue_strategy, DequeueStrategyKind::RoundRobin);
        assert_eq!(config.orphan_policy, OrphanPolicy::Fail);
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = WorkerConfig::default();
        config.queues.clear();
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.staleness_threshold_secs = config.heartbeat_interval_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generated_worker_name() {
        let config = WorkerConfig::default();
        let name = config.worker_name();
        assert!(name.contains(&std::process::id().to_string()));
        assert_ne!(name, config.worker_name());

        let named = WorkerConfig {
            name: Some("w1".to_string()),
            ..WorkerConfig::default()
        };
        assert_eq!(named.worker_name(), "w1");
    }
}
