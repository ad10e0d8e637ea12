//! Store key layout shared by workers and admin tooling.

use crate::JobId;

pub const KEY_PREFIX: &str = "jq:";

/// Set of every queue name that has ever received a job
pub const QUEUES_KEY: &str = "jq:queues";

/// Set of every registered worker name
pub const WORKERS_KEY: &str = "jq:workers";

pub fn queue_key(queue: &str) -> String {
    format!("{}queue:{}", KEY_PREFIX, queue)
}

/// Queue name back from a `queue_key`
pub fn queue_name(key: &str) -> &str {
    key.strip_prefix("jq:queue:").unwrap_or(key)
}

pub fn job_key(id: &JobId) -> String {
    format!("{}job:{}", KEY_PREFIX, id)
}

pub fn started_registry_key(queue: &str) -> String {
    format!("{}wip:{}", KEY_PREFIX, queue)
}

pub fn finished_registry_key(queue: &str) -> String {
    format!("{}finished:{}", KEY_PREFIX, queue)
}

pub fn failed_registry_key(queue: &str) -> String {
    format!("{}failed:{}", KEY_PREFIX, queue)
}

pub fn worker_key(name: &str) -> String {
    format!("{}worker:{}", KEY_PREFIX, name)
}

/// Control channel a worker subscribes to
pub fn command_channel(worker_name: &str) -> String {
    format!("{}pubsub:{}", KEY_PREFIX, worker_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_key_roundtrip() {
        assert_eq!(queue_key("high"), "jq:queue:high");
        assert_eq!(queue_name(&queue_key("high")), "high");
        assert_eq!(queue_name("other"), "other");
    }
}
