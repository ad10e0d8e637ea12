//! Per-worker command channel: the listener side run by each worker and the
//! sender helpers used by operators.

use crate::control::WorkerControl;
use crate::queue::fetch_job;
use crate::WorkerError;
use futures::StreamExt;
use job_queue_core::{keys, JobError, JobId, JobStatus};
use job_queue_protocol::{Command, ProtocolError};
use job_queue_store::{Store, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error("Job {0} is not executing on any worker")]
    JobNotExecuting(JobId),

    #[error("No worker is listening on {0}")]
    NoListener(String),
}

impl From<WorkerError> for CommandError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::Store(e) => CommandError::Store(e),
            WorkerError::Job(e) => CommandError::Job(e),
            WorkerError::Protocol(e) => CommandError::Protocol(e),
            other => CommandError::Job(JobError::Invalid(other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Subscribe to the worker's command channel and relay commands into `control`.
///
/// The subscription is established before this returns, so commands published
/// afterwards are never missed.
pub async fn spawn_listener(
    store: Arc<dyn Store>,
    worker_name: &str,
    control: Arc<WorkerControl>,
    cancel: CancellationToken,
) -> crate::Result<JoinHandle<()>> {
    let channel = keys::command_channel(worker_name);
    let mut messages = store.subscribe(&channel).await?;
    info!("Listening for commands on {}", channel);

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = messages.next() => match message {
                    Some(message) => handle_command(&control, &message),
                    None => {
                        warn!("Command subscription on {} closed", channel);
                        break;
                    }
                },
            }
        }
        debug!("Command listener on {} stopped", channel);
    }))
}

/// Apply one published message to `control`; unknown commands are ignored
pub fn handle_command(control: &WorkerControl, message: &str) {
    let command = match Command::decode(message) {
        Ok(command) => command,
        Err(e) => {
            debug!("Ignoring unknown command {:?}: {}", message, e);
            return;
        }
    };

    info!("Received {} command", command.name());
    match command {
        Command::Shutdown => {
            control.request_shutdown();
        }
        Command::KillHorse => {
            control.request_kill_horse();
        }
        Command::StopJob { job_id } => {
            control.request_stop_job(job_id);
        }
    }
}

async fn send(store: &dyn Store, worker_name: &str, command: Command) -> Result<usize> {
    let channel = keys::command_channel(worker_name);
    let receivers = store.publish(&channel, &command.encode()?).await?;
    debug!("Sent {} to {} ({} receivers)", command.name(), worker_name, receivers);
    Ok(receivers)
}

/// Ask a worker to shut down gracefully. Returns the number of receivers.
pub async fn send_shutdown_command(store: &dyn Store, worker_name: &str) -> Result<usize> {
    send(store, worker_name, Command::Shutdown).await
}

/// Ask a worker to kill its current work horse. Returns the number of receivers.
pub async fn send_kill_horse_command(store: &dyn Store, worker_name: &str) -> Result<usize> {
    send(store, worker_name, Command::KillHorse).await
}

/// Stop `job_id` on the worker executing it, returning that worker's name
pub async fn send_stop_job_command(store: &dyn Store, job_id: JobId) -> Result<String> {
    let job = fetch_job(store, &job_id)
        .await?
        .ok_or(CommandError::JobNotFound(job_id))?;

    let worker_name = match (job.status, job.worker_name) {
        (JobStatus::Started, Some(name)) => name,
        _ => return Err(CommandError::JobNotExecuting(job_id)),
    };

    if send(store, &worker_name, Command::StopJob { job_id }).await? == 0 {
        return Err(CommandError::NoListener(worker_name));
    }
    Ok(worker_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{CurrentJob, HorseStop};
    use crate::queue::Queue;
    use crate::registry::Registries;
    use job_queue_store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_handle_command_updates_control() {
        let control = WorkerControl::new();
        handle_command(&control, r#"{"command":"reboot"}"#);
        handle_command(&control, "garbage");
        assert!(!control.shutdown_requested());

        handle_command(&control, r#"{"command":"shutdown"}"#);
        assert!(control.shutdown_requested());
        assert!(!control.force_requested());

        handle_command(&control, r#"{"command":"shutdown"}"#);
        assert!(control.force_requested());
    }

    #[tokio::test]
    async fn test_listener_relays_commands() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let control = Arc::new(WorkerControl::new());
        let cancel = CancellationToken::new();
        let handle = spawn_listener(store.clone(), "w1", control.clone(), cancel.clone())
            .await
            .unwrap();

        let id = Uuid::new_v4();
        control.begin_job(CurrentJob {
            id,
            queue: "default".into(),
            timeout: Duration::from_secs(10),
        });
        assert_eq!(send_kill_horse_command(store.as_ref(), "w1").await.unwrap(), 1);
        tokio::time::timeout(Duration::from_secs(1), control.notified())
            .await
            .unwrap();
        assert_eq!(control.take_horse_stop(id), Some(HorseStop::Killed));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_job_requires_started_job() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let missing = Uuid::new_v4();
        assert!(matches!(
            send_stop_job_command(store.as_ref(), missing).await,
            Err(CommandError::JobNotFound(id)) if id == missing
        ));

        let queue = Queue::new("default", store.clone());
        let mut job = queue
            .enqueue_call("echo", json!(1), Default::default())
            .await
            .unwrap();
        assert!(matches!(
            send_stop_job_command(store.as_ref(), job.id).await,
            Err(CommandError::JobNotExecuting(_))
        ));

        Registries::for_queue(store.clone(), "default")
            .mark_started(&mut job, "w1", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(matches!(
            send_stop_job_command(store.as_ref(), job.id).await,
            Err(CommandError::NoListener(name)) if name == "w1"
        ));
    }
}
