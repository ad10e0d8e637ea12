//! Started, finished and failed registries of a queue, plus the orphan sweep.
//!
//! Each registry is a sorted set of job ids. Finished and failed scores are the
//! expiry time of the record (`+inf` for records kept forever); started scores
//! are the time after which a job is presumed abandoned even if its owner still
//! heartbeats.

use crate::queue::fetch_job;
use crate::retry::RetryPolicy;
use crate::Result;
use chrono::Utc;
use job_queue_core::{
    keys, FailureKind, Job, JobError, JobId, JobStatus, WorkerRecord, DEFAULT_FAILURE_TTL, DEFAULT_RESULT_TTL,
};
use job_queue_store::{Store, WriteBatch};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Extra time a started job may run past its timeout before the sweep may reclaim it
pub const STARTED_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryKind {
    Started,
    Finished,
    Failed,
}

impl RegistryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryKind::Started => "started",
            RegistryKind::Finished => "finished",
            RegistryKind::Failed => "failed",
        }
    }

    pub fn key(&self, queue: &str) -> String {
        match self {
            RegistryKind::Started => keys::started_registry_key(queue),
            RegistryKind::Finished => keys::finished_registry_key(queue),
            RegistryKind::Failed => keys::failed_registry_key(queue),
        }
    }
}

/// Seconds since the epoch, as a registry score
pub fn now_score() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Registries of one queue
#[derive(Clone)]
pub struct Registries {
    queue: String,
    store: Arc<dyn Store>,
    retry: RetryPolicy,
}

impl Registries {
    pub fn for_queue(store: Arc<dyn Store>, queue: impl Into<String>) -> Self {
        Registries {
            queue: queue.into(),
            store,
            retry: RetryPolicy::none(),
        }
    }

    /// Retry registry writes on connection faults
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    async fn commit(&self, what: &str, batch: WriteBatch) -> Result<()> {
        let store = &self.store;
        self.retry
            .run(what, || {
                let batch = batch.clone();
                async move { store.apply(batch).await }
            })
            .await?;
        Ok(())
    }

    /// Move a popped job into the started registry under `worker_name`
    pub async fn mark_started(&self, job: &mut Job, worker_name: &str, timeout: Duration) -> Result<()> {
        job.start(worker_name)?;

        let id = job.id.to_string();
        let mut batch = WriteBatch::new();
        batch
            .set(job.key(), job.to_bytes()?, None)
            .list_remove(keys::queue_key(&self.queue), id.as_str())
            .sorted_add(
                RegistryKind::Started.key(&self.queue),
                id.as_str(),
                started_deadline(timeout),
            );
        self.commit("mark_started", batch).await
    }

    /// Push a started job's orphan deadline further out. A job that already
    /// left the started registry stays out of it.
    pub async fn touch_started(&self, id: &JobId, timeout: Duration) -> Result<()> {
        let store = &self.store;
        let key = RegistryKind::Started.key(&self.queue);
        let member = id.to_string();
        let score = started_deadline(timeout);
        self.retry
            .run("touch_started", || store.sorted_update(&key, &member, score))
            .await?;
        Ok(())
    }

    pub async fn mark_finished(&self, job: &mut Job, result: Vec<u8>) -> Result<()> {
        job.finish(result)?;
        let ttl = job.result_ttl.resolve(DEFAULT_RESULT_TTL);
        self.record_terminal(job, RegistryKind::Finished, ttl).await
    }

    /// Record a failure; a `Stopped` kind leaves the job in the `stopped` status
    pub async fn mark_failed(&self, job: &mut Job, kind: FailureKind, error: &str) -> Result<()> {
        job.fail(kind, error)?;
        let ttl = job.failure_ttl.resolve(DEFAULT_FAILURE_TTL);
        self.record_terminal(job, RegistryKind::Failed, ttl).await
    }

    /// Record a popped job that never made it into the started registry
    pub async fn mark_rejected(&self, job: &mut Job, worker_name: &str, error: &str) -> Result<()> {
        if job.status == JobStatus::Queued {
            job.start(worker_name)?;
        }
        job.fail(FailureKind::Invalid, error)?;
        let ttl = job.failure_ttl.resolve(DEFAULT_FAILURE_TTL);
        self.write_terminal(job, WriteBatch::new(), RegistryKind::Failed, ttl).await
    }

    async fn record_terminal(&self, job: &Job, registry: RegistryKind, ttl: Option<u64>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.sorted_remove(RegistryKind::Started.key(&self.queue), job.id.to_string());
        self.write_terminal(job, batch, registry, ttl).await
    }

    async fn write_terminal(
        &self,
        job: &Job,
        mut batch: WriteBatch,
        registry: RegistryKind,
        ttl: Option<u64>,
    ) -> Result<()> {
        let id = job.id.to_string();

        match ttl {
            Some(0) => {
                batch.delete(job.key());
            }
            Some(secs) => {
                batch
                    .set(job.key(), job.to_bytes()?, Some(Duration::from_secs(secs)))
                    .sorted_add(registry.key(&self.queue), id.as_str(), now_score() + secs as f64);
            }
            None => {
                batch
                    .set(job.key(), job.to_bytes()?, None)
                    .sorted_add(registry.key(&self.queue), id.as_str(), f64::INFINITY);
            }
        }

        self.commit("record_terminal", batch).await?;
        debug!("Job {} recorded in {} registry of {}", job.id, registry.as_str(), self.queue);
        Ok(())
    }

    /// Spend one retry of a started job and put it back at the tail of its queue
    pub async fn mark_retried(&self, job: &mut Job, kind: FailureKind, error: &str) -> Result<()> {
        job.retry()?;
        info!(
            "Job {} failed ({}: {}), requeued with {} retries left",
            job.id, kind, error, job.retries_left
        );
        let id = job.id.to_string();
        let mut batch = WriteBatch::new();
        batch
            .sorted_remove(RegistryKind::Started.key(&self.queue), id.as_str())
            .set(job.key(), job.to_bytes()?, None)
            .push(keys::queue_key(&self.queue), id.as_str())
            .set_add(keys::QUEUES_KEY, self.queue.as_str());
        self.commit("mark_retried", batch).await
    }

    /// Operator requeue of a failed or stopped job
    pub async fn requeue_failed(&self, id: &JobId) -> Result<Job> {
        let failed_key = RegistryKind::Failed.key(&self.queue);
        if self.store.sorted_score(&failed_key, &id.to_string()).await?.is_none() {
            return Err(JobError::JobNotFound(format!("{} in failed registry of {}", id, self.queue)).into());
        }
        let mut job = fetch_job(self.store.as_ref(), id)
            .await?
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))?;
        job.requeue()?;

        let member = id.to_string();
        let mut batch = WriteBatch::new();
        batch
            .sorted_remove(failed_key, member.as_str())
            .set(job.key(), job.to_bytes()?, None)
            .push(keys::queue_key(&self.queue), member.as_str())
            .set_add(keys::QUEUES_KEY, self.queue.as_str());
        self.commit("requeue_failed", batch).await?;

        info!("Requeued job {} on {}", id, self.queue);
        Ok(job)
    }

    /// Delete finished and failed jobs whose retention has run out.
    ///
    /// Safe to run concurrently from many workers: removing an id that is
    /// already gone is a no-op.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = now_score();
        let mut removed = 0;
        for registry in [RegistryKind::Finished, RegistryKind::Failed] {
            let key = registry.key(&self.queue);
            let expired = self.store.range_by_score(&key, f64::NEG_INFINITY, now).await?;
            for member in expired {
                let mut batch = WriteBatch::new();
                batch.sorted_remove(key.as_str(), member.as_str());
                if let Ok(id) = member.parse::<JobId>() {
                    batch.delete(keys::job_key(&id));
                }
                self.store.apply(batch).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Cleaned up {} expired jobs from {}", removed, self.queue);
        }
        Ok(removed)
    }

    pub async fn ids(&self, registry: RegistryKind) -> Result<Vec<JobId>> {
        let members = self.store.sorted_members(&registry.key(&self.queue)).await?;
        Ok(members.iter().filter_map(|m| m.parse().ok()).collect())
    }

    pub async fn count(&self, registry: RegistryKind) -> Result<usize> {
        Ok(self.store.sorted_len(&registry.key(&self.queue)).await?)
    }
}

fn started_deadline(timeout: Duration) -> f64 {
    now_score() + (timeout + STARTED_MARGIN).as_secs_f64()
}

/// What the orphan sweep does with a started job whose worker is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Always record `WorkerDied`
    Fail,
    /// Spend a retry and requeue when one is left, else record `WorkerDied`
    #[default]
    Requeue,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub failed: usize,
    pub workers_removed: usize,
}

/// Reclaims jobs owned by dead workers
#[derive(Clone)]
pub struct OrphanSweeper {
    store: Arc<dyn Store>,
    policy: OrphanPolicy,
    staleness: Duration,
}

impl OrphanSweeper {
    pub fn new(store: Arc<dyn Store>, policy: OrphanPolicy, staleness: Duration) -> Self {
        OrphanSweeper {
            store,
            policy,
            staleness,
        }
    }

    async fn live_worker(&self, name: &str) -> Result<Option<WorkerRecord>> {
        let Some(bytes) = self.store.get(&keys::worker_key(name)).await? else {
            return Ok(None);
        };
        match WorkerRecord::from_bytes(&bytes) {
            Ok(record) if record.is_alive(chrono_duration(self.staleness)) => Ok(Some(record)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("Unreadable record for worker {}: {}", name, e);
                Ok(None)
            }
        }
    }

    /// Drop dead workers from the index and reclaim their started jobs on `queues`
    pub async fn sweep(&self, queues: &[String]) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for name in self.store.set_members(keys::WORKERS_KEY).await? {
            if self.live_worker(&name).await?.is_none() {
                let mut batch = WriteBatch::new();
                batch.delete(keys::worker_key(&name)).set_remove(keys::WORKERS_KEY, name.as_str());
                self.store.apply(batch).await?;
                warn!("Removed stale worker {} from the worker index", name);
                report.workers_removed += 1;
            }
        }

        for queue in queues {
            self.sweep_queue(queue, &mut report).await?;
        }

        if report != SweepReport::default() {
            info!(
                "Orphan sweep: {} requeued, {} failed, {} stale workers removed",
                report.requeued, report.failed, report.workers_removed
            );
        }
        Ok(report)
    }

    async fn sweep_queue(&self, queue: &str, report: &mut SweepReport) -> Result<()> {
        let registries = Registries::for_queue(self.store.clone(), queue);
        let started_key = RegistryKind::Started.key(queue);
        let now = now_score();

        for member in self.store.sorted_members(&started_key).await? {
            let Ok(id) = member.parse::<JobId>() else {
                self.store.sorted_remove(&started_key, &member).await?;
                continue;
            };
            let Some(mut job) = fetch_job(self.store.as_ref(), &id).await? else {
                self.store.sorted_remove(&started_key, &member).await?;
                continue;
            };
            if job.status != JobStatus::Started {
                // Left over from a write that raced with the job's cleanup
                if self.store.sorted_remove(&started_key, &member).await? {
                    debug!("Dropped {} job {} from started registry of {}", job.status, id, queue);
                }
                continue;
            }

            let owner = match &job.worker_name {
                Some(name) => self.live_worker(name).await?,
                None => None,
            };
            let expired = self
                .store
                .sorted_score(&started_key, &member)
                .await?
                .is_some_and(|score| score <= now);
            let orphaned = match owner {
                None => true,
                Some(record) => expired && record.current_job_id != Some(id),
            };
            if !orphaned {
                continue;
            }

            // Whoever removes the entry owns the reclaim
            if !self.store.sorted_remove(&started_key, &member).await? {
                continue;
            }

            let owner_name = job.worker_name.clone().unwrap_or_default();
            let error = format!("worker {} died while executing the job", owner_name);
            if self.policy == OrphanPolicy::Requeue && job.can_retry(FailureKind::WorkerDied) {
                registries.mark_retried(&mut job, FailureKind::WorkerDied, &error).await?;
                report.requeued += 1;
            } else {
                registries.mark_failed(&mut job, FailureKind::WorkerDied, &error).await?;
                warn!("Job {} failed: {}", id, error);
                report.failed += 1;
            }
        }
        Ok(())
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::seconds(duration.as_secs().min(i64::MAX as u64 / 1000) as i64)
}
