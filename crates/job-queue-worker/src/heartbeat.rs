//! The worker's own record: birth and death registration, state writes and
//! the periodic heartbeat.

use crate::control::WorkerControl;
use crate::registry::Registries;
use crate::retry::RetryPolicy;
use crate::{Result, WorkerError};
use job_queue_core::{keys, WorkerRecord, WorkerState};
use job_queue_store::{Store, WriteBatch};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Owner of a worker's record in the store.
///
/// All writes go through one lock so heartbeats never overwrite a newer state
/// with an older snapshot.
pub struct WorkerRecordHandle {
    record: Mutex<WorkerRecord>,
    store: Arc<dyn Store>,
    ttl: Duration,
    retry: RetryPolicy,
}

impl WorkerRecordHandle {
    pub fn new(record: WorkerRecord, store: Arc<dyn Store>, ttl: Duration) -> Self {
        WorkerRecordHandle {
            record: Mutex::new(record),
            store,
            ttl,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn snapshot(&self) -> WorkerRecord {
        self.record.lock().await.clone()
    }

    /// Insert the record into the worker index. Fails if a live worker
    /// already uses the same name.
    pub async fn register_birth(&self, staleness: Duration) -> Result<()> {
        let mut record = self.record.lock().await;
        let key = record.key();

        if let Some(bytes) = self.store.get(&key).await? {
            match WorkerRecord::from_bytes(&bytes) {
                Ok(existing) if existing.is_alive(chrono_duration(staleness)) => {
                    return Err(WorkerError::DuplicateWorker(record.name.clone()));
                }
                Ok(_) => info!("Replacing stale record of worker {}", record.name),
                Err(e) => warn!("Replacing unreadable record of worker {}: {}", record.name, e),
            }
        }

        record.state = WorkerState::Started;
        record.heartbeat();

        let mut batch = WriteBatch::new();
        batch
            .set(key, record.to_bytes()?, Some(self.ttl))
            .set_add(keys::WORKERS_KEY, record.name.as_str());
        self.store.apply(batch).await?;

        info!("Worker {} registered (queues: {})", record.name, record.queues.join(", "));
        Ok(())
    }

    /// Mutate the record and write it back with a fresh heartbeat
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut WorkerRecord),
    {
        let mut record = self.record.lock().await;
        f(&mut record);
        record.heartbeat();
        self.write(&record).await
    }

    pub async fn set_state(&self, state: WorkerState) -> Result<()> {
        self.update(|record| record.state = state).await
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.update(|_| {}).await
    }

    async fn write(&self, record: &WorkerRecord) -> Result<()> {
        let store = &self.store;
        let key = record.key();
        let bytes = record.to_bytes()?;
        let ttl = self.ttl;
        self.retry
            .run("worker heartbeat", || store.set(&key, bytes.clone(), Some(ttl)))
            .await?;
        Ok(())
    }

    /// Remove the record from the worker index.
    ///
    /// Failure leaves a stale record behind, which the orphan sweep of a peer
    /// eventually reclaims.
    pub async fn register_death(&self) {
        let mut record = self.record.lock().await;
        record.state = WorkerState::Suspended;
        record.current_job_id = None;

        let mut batch = WriteBatch::new();
        batch
            .delete(record.key())
            .set_remove(keys::WORKERS_KEY, record.name.as_str());

        let store = &self.store;
        match self
            .retry
            .run("death registration", || store.apply(batch.clone()))
            .await
        {
            Ok(()) => info!("Worker {} unregistered", record.name),
            Err(e) => error!(
                "Death registration of worker {} failed, leaving a stale record: {}",
                record.name, e
            ),
        }
    }
}

/// Renew the worker record, and the started-registry deadline of the current
/// job, every `interval` until `cancel` fires.
pub fn spawn_heartbeat(
    handle: Arc<WorkerRecordHandle>,
    control: Arc<WorkerControl>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately and birth registration just wrote the record
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = handle.heartbeat().await {
                error!("Heartbeat failed: {}", e);
            }

            if let Some(current) = control.current_job() {
                let registries = Registries::for_queue(handle.store.clone(), current.queue.clone())
                    .with_retry(handle.retry.clone());
                if let Err(e) = registries.touch_started(&current.id, current.timeout).await {
                    error!("Failed to renew started deadline of job {}: {}", current.id, e);
                }
            }
            debug!("Heartbeat sent");
        }
    })
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::CurrentJob;
    use crate::registry::RegistryKind;
    use job_queue_store::MemoryStore;
    use uuid::Uuid;

    fn record(name: &str) -> WorkerRecord {
        WorkerRecord::new(name.to_string(), "host".to_string(), 42, vec!["default".to_string()])
    }

    async fn stored(store: &MemoryStore, name: &str) -> Option<WorkerRecord> {
        store
            .get(&keys::worker_key(name))
            .await
            .unwrap()
            .map(|bytes| WorkerRecord::from_bytes(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_birth_and_death() {
        let store = MemoryStore::new();
        let handle = WorkerRecordHandle::new(record("w1"), Arc::new(store.clone()), Duration::from_secs(420));

        handle.register_birth(Duration::from_secs(120)).await.unwrap();
        assert_eq!(stored(&store, "w1").await.unwrap().state, WorkerState::Started);
        assert_eq!(store.set_members(keys::WORKERS_KEY).await.unwrap(), vec!["w1".to_string()]);
        assert!(store.ttl(&keys::worker_key("w1")).is_some());

        handle.set_state(WorkerState::Idle).await.unwrap();
        assert_eq!(stored(&store, "w1").await.unwrap().state, WorkerState::Idle);

        handle.register_death().await;
        assert!(stored(&store, "w1").await.is_none());
        assert!(store.set_members(keys::WORKERS_KEY).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_live_worker_rejected() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let first = WorkerRecordHandle::new(record("w1"), store.clone(), Duration::from_secs(420));
        first.register_birth(Duration::from_secs(120)).await.unwrap();

        let second = WorkerRecordHandle::new(record("w1"), store.clone(), Duration::from_secs(420));
        assert!(matches!(
            second.register_birth(Duration::from_secs(120)).await,
            Err(WorkerError::DuplicateWorker(name)) if name == "w1"
        ));
    }

    #[tokio::test]
    async fn test_stale_record_is_replaced() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut stale = record("w1");
        stale.last_heartbeat = chrono::Utc::now() - chrono::Duration::seconds(600);
        store
            .set(&keys::worker_key("w1"), stale.to_bytes().unwrap(), None)
            .await
            .unwrap();

        let handle = WorkerRecordHandle::new(record("w1"), store, Duration::from_secs(420));
        handle.register_birth(Duration::from_secs(120)).await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_renews_started_deadline() {
        let store = MemoryStore::new();
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let handle = Arc::new(WorkerRecordHandle::new(record("w1"), shared.clone(), Duration::from_secs(420)));
        handle.register_birth(Duration::from_secs(120)).await.unwrap();

        let control = Arc::new(WorkerControl::new());
        let id = Uuid::new_v4();
        control.begin_job(CurrentJob {
            id,
            queue: "default".into(),
            timeout: Duration::from_secs(30),
        });

        let cancel = CancellationToken::new();
        let task = spawn_heartbeat(handle, control, Duration::from_millis(20), cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        let score = store
            .sorted_score(&RegistryKind::Started.key("default"), &id.to_string())
            .await
            .unwrap();
        assert!(score.is_some());
    }
}
