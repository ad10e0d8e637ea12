//! Timeout enforcement policies.

use job_queue_core::JobId;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Step of the two-phase timeout escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Ask the horse to stop
    Interrupt,
    /// Terminate the horse unconditionally
    Kill,
}

/// Armed timer for one job
#[derive(Debug)]
pub struct Watchdog {
    phases: VecDeque<(Instant, Escalation)>,
    fired: bool,
}

impl Watchdog {
    pub fn new(phases: impl IntoIterator<Item = (Instant, Escalation)>) -> Self {
        Watchdog {
            phases: phases.into_iter().collect(),
            fired: false,
        }
    }

    /// A watchdog that never fires
    pub fn disarmed() -> Self {
        Watchdog {
            phases: VecDeque::new(),
            fired: false,
        }
    }

    /// Wait for the next phase; pends forever once all phases fired.
    ///
    /// Cancel safe: a phase is consumed only when it is returned.
    pub async fn next(&mut self) -> Escalation {
        match self.phases.front() {
            Some((deadline, _)) => tokio::time::sleep_until(*deadline).await,
            None => std::future::pending::<()>().await,
        }
        self.fired = true;
        match self.phases.pop_front() {
            Some((_, escalation)) => escalation,
            None => Escalation::Kill,
        }
    }

    /// Whether the timeout has been reached
    pub fn fired(&self) -> bool {
        self.fired
    }
}

/// Policy arming a watchdog when a horse starts
pub trait DeathPenalty: Send + Sync {
    fn arm(&self, job_id: JobId, timeout: Duration) -> Watchdog;
}

/// Interrupt at the timeout, kill after a grace period
#[derive(Debug, Clone)]
pub struct TimerDeathPenalty {
    grace: Duration,
}

impl TimerDeathPenalty {
    pub fn new(grace: Duration) -> Self {
        TimerDeathPenalty { grace }
    }
}

impl Default for TimerDeathPenalty {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl DeathPenalty for TimerDeathPenalty {
    fn arm(&self, job_id: JobId, timeout: Duration) -> Watchdog {
        debug!("Arming {:?} death penalty for job {}", timeout, job_id);
        let interrupt_at = Instant::now() + timeout;
        Watchdog::new([
            (interrupt_at, Escalation::Interrupt),
            (interrupt_at + self.grace, Escalation::Kill),
        ])
    }
}

/// Jobs run without a deadline
#[derive(Debug, Clone, Default)]
pub struct NoDeathPenalty;

impl DeathPenalty for NoDeathPenalty {
    fn arm(&self, _job_id: JobId, _timeout: Duration) -> Watchdog {
        Watchdog::disarmed()
    }
}
