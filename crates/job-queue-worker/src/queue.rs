//! Named FIFO queues of job ids.

use crate::registry::Registries;
use crate::Result;
use job_queue_core::{keys, Invocation, Job, JobError, JobId, JobStatus, JsonSerializer, Serializer, Ttl};
use job_queue_store::{Store, WriteBatch};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-job settings for `Queue::enqueue_call`
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub job_id: Option<JobId>,
    pub description: Option<String>,
    pub timeout_secs: Option<u64>,
    pub result_ttl: Ttl,
    pub failure_ttl: Ttl,
    pub retries: u32,
}

/// A named queue backed by a store list
#[derive(Clone)]
pub struct Queue {
    name: String,
    store: Arc<dyn Store>,
    serializer: Arc<dyn Serializer>,
}

impl Queue {
    pub fn new(name: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self::with_serializer(name, store, Arc::new(JsonSerializer))
    }

    pub fn with_serializer(name: impl Into<String>, store: Arc<dyn Store>, serializer: Arc<dyn Serializer>) -> Self {
        Queue {
            name: name.into(),
            store,
            serializer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> String {
        keys::queue_key(&self.name)
    }

    /// Persist `job` and append it to the queue in one atomic write
    pub async fn enqueue(&self, job: Job) -> Result<Job> {
        if job.origin != self.name {
            return Err(JobError::Invalid(format!(
                "job {} belongs to queue {}, not {}",
                job.id, job.origin, self.name
            ))
            .into());
        }
        if job.status != JobStatus::Queued {
            return Err(JobError::InvalidTransition {
                from: job.status,
                to: JobStatus::Queued,
            }
            .into());
        }

        let id = job.id.to_string();
        let mut batch = WriteBatch::new();
        batch
            .set(job.key(), job.to_bytes()?, None)
            .push(self.key(), id.as_str())
            .set_add(keys::QUEUES_KEY, self.name.as_str());
        self.store.apply(batch).await?;

        debug!("Enqueued job {} ({}) on {}", job.id, job.description, self.name);
        Ok(job)
    }

    /// Enqueue a call to a registered function
    pub async fn enqueue_call(&self, function: &str, args: Value, options: EnqueueOptions) -> Result<Job> {
        let invocation = Invocation::new(function, args);
        let mut builder = Job::for_call(self.name.as_str(), &invocation, self.serializer.as_ref())?
            .result_ttl(options.result_ttl)
            .failure_ttl(options.failure_ttl)
            .retries(options.retries);
        if let Some(id) = options.job_id {
            builder = builder.id(id);
        }
        if let Some(description) = options.description {
            builder = builder.description(description);
        }
        if let Some(timeout) = options.timeout_secs {
            builder = builder.timeout_seconds(timeout);
        }

        self.enqueue(builder.build()?).await
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.list_len(&self.key()).await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Queued job ids, head first
    pub async fn job_ids(&self) -> Result<Vec<JobId>> {
        let raw = self.store.list_range(&self.key()).await?;
        Ok(raw
            .iter()
            .filter_map(|id| match id.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!("Ignoring malformed job id {:?} in queue {}", id, self.name);
                    None
                }
            })
            .collect())
    }

    /// Remove a queued job and its record
    pub async fn remove(&self, id: &JobId) -> Result<bool> {
        let removed = self.store.list_remove(&self.key(), &id.to_string()).await?;
        if removed == 0 {
            return Ok(false);
        }
        self.store.delete(&keys::job_key(id)).await?;
        Ok(true)
    }

    /// Drop every queued job, returning how many were removed
    pub async fn empty(&self) -> Result<usize> {
        let ids = self.job_ids().await?;
        let mut batch = WriteBatch::new();
        for id in &ids {
            batch.delete(keys::job_key(id));
        }
        batch.delete(self.key());
        self.store.apply(batch).await?;

        info!("Emptied queue {} ({} jobs)", self.name, ids.len());
        Ok(ids.len())
    }

    /// Put a failed or stopped job of this queue back at the tail
    pub async fn requeue(&self, id: &JobId) -> Result<Job> {
        Registries::for_queue(self.store.clone(), &self.name)
            .requeue_failed(id)
            .await
    }
}

/// Load a job record; `None` when it no longer exists
pub async fn fetch_job(store: &dyn Store, id: &JobId) -> Result<Option<Job>> {
    match store.get(&keys::job_key(id)).await? {
        Some(bytes) => Ok(Some(Job::from_bytes(&bytes)?)),
        None => Ok(None),
    }
}

/// Every queue that has ever received a job, sorted
pub async fn all_queues(store: &dyn Store) -> Result<Vec<String>> {
    let mut names = store.set_members(keys::QUEUES_KEY).await?;
    names.sort();
    Ok(names)
}
