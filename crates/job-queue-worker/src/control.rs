//! Shutdown and horse-control requests shared between the worker loop, the
//! command listener and the signal handlers.
//!
//! Requests only set flags; the worker acts on them at its own safe points.

use job_queue_core::JobId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// The job a worker is executing right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentJob {
    pub id: JobId,
    pub queue: String,
    pub timeout: Duration,
}

/// Why the supervisor terminated a horse early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HorseStop {
    /// `kill_horse` command
    Killed,
    /// `stop_job` command naming the current job
    JobStopped,
    /// Repeated shutdown signal while waiting for the job
    ForcedShutdown,
}

#[derive(Default)]
pub struct WorkerControl {
    shutdown: AtomicBool,
    force: AtomicBool,
    requests: AtomicUsize,
    kill_horse: AtomicBool,
    stop_job: Mutex<Option<JobId>>,
    current: Mutex<Option<CurrentJob>>,
    notify: Notify,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a shutdown. The first request is graceful; any later one, from
    /// a signal or a command alike, forces the current horse down.
    ///
    /// Returns whether this was the first request.
    pub fn request_shutdown(&self) -> bool {
        let seen = self.requests.fetch_add(1, Ordering::SeqCst);
        self.shutdown.store(true, Ordering::SeqCst);
        if seen == 0 {
            info!("Graceful shutdown requested");
        } else if !self.force.swap(true, Ordering::SeqCst) {
            warn!("Repeated shutdown request: forcing termination of the current job");
        }
        self.notify.notify_one();
        seen == 0
    }

    /// SIGINT or SIGTERM
    pub fn on_signal(&self) {
        self.request_shutdown();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn force_requested(&self) -> bool {
        self.force.load(Ordering::SeqCst)
    }

    /// Kill the current horse; a no-op while idle
    pub fn request_kill_horse(&self) -> bool {
        if self.current.lock().is_none() {
            info!("kill_horse received while idle, ignoring");
            return false;
        }
        self.kill_horse.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        true
    }

    /// Stop the current job if it is `id`; otherwise the request is rejected
    pub fn request_stop_job(&self, id: JobId) -> bool {
        let current = self.current.lock().as_ref().map(|c| c.id);
        if current != Some(id) {
            warn!("stop_job for {} rejected: job is not executing on this worker", id);
            return false;
        }
        *self.stop_job.lock() = Some(id);
        self.notify.notify_one();
        true
    }

    pub fn begin_job(&self, job: CurrentJob) {
        self.kill_horse.store(false, Ordering::SeqCst);
        *self.stop_job.lock() = None;
        *self.current.lock() = Some(job);
    }

    pub fn end_job(&self) {
        *self.current.lock() = None;
        self.kill_horse.store(false, Ordering::SeqCst);
        *self.stop_job.lock() = None;
    }

    pub fn current_job(&self) -> Option<CurrentJob> {
        self.current.lock().clone()
    }

    /// Pending request to terminate the horse running `id`, consumed on read
    pub fn take_horse_stop(&self, id: JobId) -> Option<HorseStop> {
        if self.force_requested() {
            return Some(HorseStop::ForcedShutdown);
        }
        {
            let mut stop = self.stop_job.lock();
            if *stop == Some(id) {
                *stop = None;
                return Some(HorseStop::JobStopped);
            }
        }
        if self.kill_horse.swap(false, Ordering::SeqCst) {
            return Some(HorseStop::Killed);
        }
        None
    }

    /// Resolves after any request was made since the last wakeup
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn current(id: JobId) -> CurrentJob {
        CurrentJob {
            id,
            queue: "default".into(),
            timeout: Duration::from_secs(180),
        }
    }

    #[test]
    fn test_second_shutdown_request_forces() {
        let control = WorkerControl::new();
        assert!(control.request_shutdown());
        assert!(control.shutdown_requested());
        assert!(!control.force_requested());

        assert!(!control.request_shutdown());
        assert!(control.force_requested());
    }

    #[test]
    fn test_signal_after_shutdown_command_forces() {
        let control = WorkerControl::new();
        control.request_shutdown();
        control.on_signal();
        assert!(control.force_requested());
        assert_eq!(control.take_horse_stop(Uuid::new_v4()), Some(HorseStop::ForcedShutdown));
    }

    #[test]
    fn test_second_signal_forces() {
        let control = WorkerControl::new();
        control.on_signal();
        assert!(control.shutdown_requested());
        assert!(!control.force_requested());

        control.on_signal();
        assert!(control.force_requested());
    }

    #[test]
    fn test_kill_horse_ignored_while_idle() {
        let control = WorkerControl::new();
        assert!(!control.request_kill_horse());

        let id = Uuid::new_v4();
        control.begin_job(current(id));
        assert!(control.request_kill_horse());
        assert_eq!(control.take_horse_stop(id), Some(HorseStop::Killed));
        assert_eq!(control.take_horse_stop(id), None);
    }

    #[test]
    fn test_stop_job_only_matches_current_job() {
        let control = WorkerControl::new();
        let id = Uuid::new_v4();
        assert!(!control.request_stop_job(id));

        control.begin_job(current(id));
        assert!(!control.request_stop_job(Uuid::new_v4()));
        assert_eq!(control.take_horse_stop(id), None);

        assert!(control.request_stop_job(id));
        assert_eq!(control.take_horse_stop(id), Some(HorseStop::JobStopped));

        control.end_job();
        assert!(control.current_job().is_none());
    }

    #[tokio::test]
    async fn test_requests_wake_the_waiter() {
        let control = WorkerControl::new();
        control.begin_job(current(Uuid::new_v4()));
        control.request_kill_horse();
        tokio::time::timeout(Duration::from_secs(1), control.notified())
            .await
            .unwrap();
    }
}
