use crate::Result;
use job_queue_core::JobId;
use serde::{Deserialize, Serialize};

/// Control message published on `jq:pubsub:<worker>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Request a graceful shutdown
    Shutdown,
    /// Kill the current work horse, if any
    KillHorse,
    /// Stop the current job if its id matches
    StopJob { job_id: JobId },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Shutdown => "shutdown",
            Command::KillHorse => "kill_horse",
            Command::StopJob { .. } => "stop_job",
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a published message; unknown or malformed commands are errors
    pub fn decode(message: &str) -> Result<Self> {
        Ok(serde_json::from_str(message)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_wire_format() {
        assert_eq!(Command::Shutdown.encode().unwrap(), r#"{"command":"shutdown"}"#);
        assert_eq!(Command::KillHorse.encode().unwrap(), r#"{"command":"kill_horse"}"#);

        let id = Uuid::new_v4();
        let encoded = Command::StopJob { job_id: id }.encode().unwrap();
        assert_eq!(encoded, format!(r#"{{"command":"stop_job","job_id":"{}"}}"#, id));
    }

    #[test]
    fn test_decode_published_message() {
        let id = Uuid::new_v4();
        let message = format!(r#"{{"job_id":"{}","command":"stop_job"}}"#, id);
        assert_eq!(Command::decode(&message).unwrap(), Command::StopJob { job_id: id });
        assert_eq!(Command::decode(r#"{"command":"shutdown"}"#).unwrap().name(), "shutdown");
    }

    #[test]
    fn test_unknown_commands_rejected() {
        assert!(Command::decode(r#"{"command":"reboot"}"#).is_err());
        assert!(Command::decode(r#"{"command":"stop_job"}"#).is_err());
        assert!(Command::decode("not json").is_err());
    }
}
