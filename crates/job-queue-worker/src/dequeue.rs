//! Multi-queue dequeue strategies.

use crate::queue::fetch_job;
use crate::Result;
use job_queue_core::{keys, Job, JobId};
use job_queue_store::Store;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Order in which a worker tries its queues
pub trait DequeueStrategy: Send + Sync {
    /// Queue names in the order the next pop should try them
    fn order(&mut self, queues: &[String]) -> Vec<String>;

    /// Called after a pop returned a job from `queue`
    fn on_hit(&mut self, _queues: &[String], _queue: &str) {}
}

/// Always the configured order; the first queue with work wins
#[derive(Debug, Default)]
pub struct StrictPriority;

impl DequeueStrategy for StrictPriority {
    fn order(&mut self, queues: &[String]) -> Vec<String> {
        queues.to_vec()
    }
}

/// Rotates so the queue after the last hit is tried first
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: usize,
}

impl DequeueStrategy for RoundRobin {
    fn order(&mut self, queues: &[String]) -> Vec<String> {
        if queues.is_empty() {
            return Vec::new();
        }
        let start = self.cursor % queues.len();
        queues[start..].iter().chain(&queues[..start]).cloned().collect()
    }

    fn on_hit(&mut self, queues: &[String], queue: &str) {
        if let Some(index) = queues.iter().position(|q| q == queue) {
            self.cursor = (index + 1) % queues.len();
        }
    }
}

/// Fresh shuffle before every pop
#[derive(Debug, Default)]
pub struct RandomOrder;

impl DequeueStrategy for RandomOrder {
    fn order(&mut self, queues: &[String]) -> Vec<String> {
        let mut order = queues.to_vec();
        order.shuffle(&mut rand::thread_rng());
        order
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DequeueStrategyKind {
    #[default]
    StrictPriority,
    RoundRobin,
    Random,
}

impl DequeueStrategyKind {
    pub fn build(&self) -> Box<dyn DequeueStrategy> {
        match self {
            DequeueStrategyKind::StrictPriority => Box::new(StrictPriority),
            DequeueStrategyKind::RoundRobin => Box::new(RoundRobin::default()),
            DequeueStrategyKind::Random => Box::new(RandomOrder),
        }
    }
}

/// Pops jobs from a set of queues following a strategy
pub struct Dequeuer {
    store: Arc<dyn Store>,
    strategy: Box<dyn DequeueStrategy>,
}

impl Dequeuer {
    pub fn new(store: Arc<dyn Store>, strategy: Box<dyn DequeueStrategy>) -> Self {
        Dequeuer { store, strategy }
    }

    /// Remove and return one job from `queues`.
    ///
    /// `timeout = None` probes every queue once without blocking. Otherwise the
    /// call waits on the store for at most `timeout` in total. Ids whose record
    /// has been deleted are dropped and the pop is retried within the deadline.
    pub async fn select_and_pop(&mut self, queues: &[String], timeout: Option<Duration>) -> Result<Option<Job>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let order: Vec<String> = self
                .strategy
                .order(queues)
                .iter()
                .map(|q| keys::queue_key(q))
                .collect();

            let hit = match deadline {
                None => self.store.pop_first(&order).await?,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    self.store.blocking_pop(&order, remaining).await?
                }
            };

            let Some((list, raw_id)) = hit else {
                return Ok(None);
            };
            let queue = keys::queue_name(&list);
            self.strategy.on_hit(queues, queue);

            let id: JobId = match raw_id.parse() {
                Ok(id) => id,
                Err(_) => {
                    warn!("Dropping malformed job id {:?} popped from {}", raw_id, queue);
                    continue;
                }
            };

            match fetch_job(self.store.as_ref(), &id).await {
                Ok(Some(job)) => return Ok(Some(job)),
                Ok(None) => debug!("Skipping job {} from {}: record no longer exists", id, queue),
                Err(e) if e.is_connection() => return Err(e),
                Err(e) => warn!("Skipping job {} from {}: {}", id, queue, e),
            }
        }
    }
}
