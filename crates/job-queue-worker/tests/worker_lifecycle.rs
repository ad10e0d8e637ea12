// Full worker runs against the in-memory store

use async_trait::async_trait;
use job_queue_core::{keys, FailureKind, JobId, JobStatus, JsonSerializer, WorkerRecord};
use job_queue_protocol::Command;
use job_queue_store::{MemoryStore, Store};
use job_queue_worker::commands::{send_kill_horse_command, send_shutdown_command, send_stop_job_command};
use job_queue_worker::handler::HandlerResult;
use job_queue_worker::registry::SweepReport;
use job_queue_worker::{
    default_registry, fetch_job, CommandError, EnqueueOptions, InProcessIsolation, IsolationKind, JobHandler,
    OrphanPolicy, OrphanSweeper, Queue, Registries, RegistryKind, WorkOptions, WorkSummary, Worker, WorkerConfig,
    WorkerError,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

struct RecordingHandler {
    seen: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn call(&self, args: Value) -> HandlerResult {
        self.seen.lock().push(args.clone());
        Ok(args)
    }
}

fn config(name: &str) -> WorkerConfig {
    WorkerConfig {
        name: Some(name.to_string()),
        queues: vec!["default".to_string()],
        isolation: IsolationKind::InProcess,
        dequeue_timeout_secs: 1,
        kill_grace_secs: 1,
        heartbeat_interval_secs: 1,
        staleness_threshold_secs: 5,
        worker_ttl_secs: 10,
        ..Default::default()
    }
}

fn worker(store: &MemoryStore, name: &str) -> Worker {
    worker_with(store, config(name), Arc::new(default_registry()))
}

fn worker_with(store: &MemoryStore, config: WorkerConfig, registry: Arc<job_queue_worker::HandlerRegistry>) -> Worker {
    let isolation = Arc::new(InProcessIsolation::new(registry, Arc::new(JsonSerializer)));
    Worker::new(config, Arc::new(store.clone()), isolation).unwrap()
}

fn spawn_work(mut worker: Worker, options: WorkOptions) -> JoinHandle<job_queue_worker::Result<WorkSummary>> {
    tokio::spawn(async move { worker.work(options).await })
}

async fn enqueue(store: &MemoryStore, function: &str, args: Value, options: EnqueueOptions) -> JobId {
    Queue::new("default", Arc::new(store.clone()))
        .enqueue_call(function, args, options)
        .await
        .unwrap()
        .id
}

async fn wait_for_status(store: &MemoryStore, id: JobId, status: JobStatus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let job = fetch_job(store, &id).await.unwrap();
        if job.map(|j| j.status) == Some(status) {
            return;
        }
        assert!(Instant::now() < deadline, "job {} never reached {}", id, status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn worker_registered(store: &MemoryStore, name: &str) -> bool {
    store.exists(&keys::worker_key(name)).await.unwrap()
        || store
            .set_members(keys::WORKERS_KEY)
            .await
            .unwrap()
            .contains(&name.to_string())
}

#[tokio::test]
async fn test_burst_processes_jobs_in_fifo_order() {
    let store = MemoryStore::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = default_registry();
    registry.register("record", RecordingHandler { seen: seen.clone() });

    let mut ids = Vec::new();
    for n in 1..=3 {
        ids.push(enqueue(&store, "record", json!(n), EnqueueOptions::default()).await);
    }

    let mut worker = worker_with(&store, config("fifo"), Arc::new(registry));
    let summary = worker.work(WorkOptions { burst: true, max_jobs: None }).await.unwrap();

    assert_eq!(
        summary,
        WorkSummary {
            jobs_executed: 3,
            succeeded: 3,
            failed: 0
        }
    );
    assert_eq!(*seen.lock(), vec![json!(1), json!(2), json!(3)]);

    let registries = Registries::for_queue(Arc::new(store.clone()), "default");
    assert_eq!(registries.count(RegistryKind::Finished).await.unwrap(), 3);
    assert_eq!(registries.count(RegistryKind::Started).await.unwrap(), 0);
    for id in ids {
        let job = fetch_job(&store, &id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.worker_name.as_deref(), Some("fifo"));
    }
    assert!(!worker_registered(&store, "fifo").await);
}

#[tokio::test]
async fn test_burst_with_empty_queues_exits_without_blocking() {
    let store = MemoryStore::new();
    let started = Instant::now();

    let summary = worker(&store, "idle")
        .work(WorkOptions { burst: true, max_jobs: None })
        .await
        .unwrap();

    assert_eq!(summary, WorkSummary::default());
    assert!(started.elapsed() < Duration::from_millis(900));
    assert!(!worker_registered(&store, "idle").await);
}

#[tokio::test]
async fn test_timeout_is_recorded_as_failure() {
    let store = MemoryStore::new();
    let id = enqueue(
        &store,
        "sleep",
        json!(5),
        EnqueueOptions {
            timeout_secs: Some(1),
            ..Default::default()
        },
    )
    .await;

    let started = Instant::now();
    let summary = worker(&store, "timeout")
        .work(WorkOptions { burst: true, max_jobs: None })
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert!(started.elapsed() < Duration::from_secs(3));

    let job = fetch_job(&store, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Timeout));
    let failed = Registries::for_queue(Arc::new(store.clone()), "default")
        .ids(RegistryKind::Failed)
        .await
        .unwrap();
    assert_eq!(failed, vec![id]);
}

#[tokio::test]
async fn test_max_jobs_counts_completed_jobs() {
    let store = MemoryStore::new();
    for n in 0..3 {
        enqueue(&store, "echo", json!(n), EnqueueOptions::default()).await;
    }

    let summary = worker(&store, "limited")
        .work(WorkOptions {
            burst: false,
            max_jobs: Some(2),
        })
        .await
        .unwrap();

    assert_eq!(summary.jobs_executed, 2);
    let queue = Queue::new("default", Arc::new(store.clone()));
    assert_eq!(queue.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_job_is_retried_until_exhausted() {
    let store = MemoryStore::new();
    let id = enqueue(
        &store,
        "fail",
        json!("boom"),
        EnqueueOptions {
            retries: 1,
            ..Default::default()
        },
    )
    .await;

    let summary = worker(&store, "retrier")
        .work(WorkOptions { burst: true, max_jobs: None })
        .await
        .unwrap();

    assert_eq!(summary.jobs_executed, 2);
    let job = fetch_job(&store, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Raised));
    assert_eq!(job.error.as_deref(), Some("boom"));
    assert_eq!(job.attempts, 2);
    assert_eq!(job.retries_left, 0);
}

#[tokio::test]
async fn test_stop_job_stops_matching_job() {
    let store = MemoryStore::new();
    let id = enqueue(
        &store,
        "sleep",
        json!(10),
        EnqueueOptions {
            timeout_secs: Some(30),
            ..Default::default()
        },
    )
    .await;

    let handle = spawn_work(
        worker(&store, "stopper"),
        WorkOptions {
            burst: false,
            max_jobs: Some(1),
        },
    );
    wait_for_status(&store, id, JobStatus::Started).await;

    let target = send_stop_job_command(&store, id).await.unwrap();
    assert_eq!(target, "stopper");

    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.failed, 1);

    let job = fetch_job(&store, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Stopped);
    assert_eq!(job.failure_kind, Some(FailureKind::Stopped));
    let failed = Registries::for_queue(Arc::new(store.clone()), "default")
        .ids(RegistryKind::Failed)
        .await
        .unwrap();
    assert_eq!(failed, vec![id]);
}

#[tokio::test]
async fn test_stop_job_for_other_job_is_rejected() {
    let store = MemoryStore::new();
    let running = enqueue(&store, "sleep", json!(1.0), EnqueueOptions::default()).await;
    let waiting = enqueue(&store, "echo", json!("later"), EnqueueOptions::default()).await;

    let handle = spawn_work(
        worker(&store, "busy"),
        WorkOptions {
            burst: false,
            max_jobs: Some(1),
        },
    );
    wait_for_status(&store, running, JobStatus::Started).await;

    assert!(matches!(
        send_stop_job_command(&store, waiting).await,
        Err(CommandError::JobNotExecuting(id)) if id == waiting
    ));
    // Published directly, the command still names a job the worker is not running
    let command = Command::StopJob { job_id: waiting }.encode().unwrap();
    assert_eq!(
        store.publish(&keys::command_channel("busy"), &command).await.unwrap(),
        1
    );

    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    let job = fetch_job(&store, &running).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    let job = fetch_job(&store, &waiting).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
}

#[tokio::test]
async fn test_kill_horse_fails_current_job_and_keeps_working() {
    let store = MemoryStore::new();
    let killed = enqueue(
        &store,
        "sleep",
        json!(10),
        EnqueueOptions {
            timeout_secs: Some(30),
            ..Default::default()
        },
    )
    .await;
    let next = enqueue(&store, "echo", json!("next"), EnqueueOptions::default()).await;

    let handle = spawn_work(
        worker(&store, "killer"),
        WorkOptions {
            burst: false,
            max_jobs: Some(2),
        },
    );
    wait_for_status(&store, killed, JobStatus::Started).await;
    assert_eq!(send_kill_horse_command(&store, "killer").await.unwrap(), 1);

    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.jobs_executed, 2);

    let job = fetch_job(&store, &killed).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Crashed));
    let job = fetch_job(&store, &next).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Finished);
}

#[tokio::test]
async fn test_graceful_shutdown_lets_current_job_finish() {
    let store = MemoryStore::new();
    let id = enqueue(&store, "sleep", json!(0.5), EnqueueOptions::default()).await;
    enqueue(&store, "echo", json!("never"), EnqueueOptions::default()).await;

    let handle = spawn_work(worker(&store, "graceful"), WorkOptions::default());
    wait_for_status(&store, id, JobStatus::Started).await;
    assert_eq!(send_shutdown_command(&store, "graceful").await.unwrap(), 1);
    // Repeating the command has no further effect
    send_shutdown_command(&store, "graceful").await.unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.jobs_executed, 1);

    let job = fetch_job(&store, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    let queue = Queue::new("default", Arc::new(store.clone()));
    assert_eq!(queue.len().await.unwrap(), 1);
    assert!(!worker_registered(&store, "graceful").await);
}

#[tokio::test]
async fn test_second_signal_forces_termination() {
    let store = MemoryStore::new();
    let id = enqueue(
        &store,
        "sleep",
        json!(10),
        EnqueueOptions {
            timeout_secs: Some(30),
            ..Default::default()
        },
    )
    .await;

    let worker = worker(&store, "forced");
    let control = worker.control();
    let handle = spawn_work(worker, WorkOptions::default());
    wait_for_status(&store, id, JobStatus::Started).await;

    control.on_signal();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let job = fetch_job(&store, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Started);

    control.on_signal();
    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.failed, 1);

    let job = fetch_job(&store, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Stopped);
    assert!(!worker_registered(&store, "forced").await);
}

#[tokio::test]
async fn test_duplicate_live_worker_is_rejected() {
    let store = MemoryStore::new();
    let first = worker(&store, "twin");
    let control = first.control();
    let handle = spawn_work(first, WorkOptions::default());

    let deadline = Instant::now() + Duration::from_secs(5);
    while !worker_registered(&store, "twin").await {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let result = worker(&store, "twin")
        .work(WorkOptions { burst: true, max_jobs: None })
        .await;
    assert!(matches!(result, Err(WorkerError::DuplicateWorker(name)) if name == "twin"));

    control.request_shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_startup_sweep_reclaims_orphaned_job() {
    let store = MemoryStore::new();
    let shared: Arc<dyn Store> = Arc::new(store.clone());
    let queue = Queue::new("default", shared.clone());
    let mut job = queue
        .enqueue_call("echo", json!("orphan"), EnqueueOptions::default())
        .await
        .unwrap();
    shared.pop_first(&[queue.key()]).await.unwrap();

    // Owner heartbeated long ago and never came back
    let mut ghost = WorkerRecord::new("ghost".into(), "host".into(), 1, vec!["default".into()]);
    ghost.last_heartbeat = chrono::Utc::now() - chrono::Duration::seconds(600);
    ghost.current_job_id = Some(job.id);
    shared
        .set(&keys::worker_key("ghost"), ghost.to_bytes().unwrap(), None)
        .await
        .unwrap();
    shared.set_add(keys::WORKERS_KEY, "ghost").await.unwrap();
    Registries::for_queue(shared.clone(), "default")
        .mark_started(&mut job, "ghost", Duration::from_secs(180))
        .await
        .unwrap();

    let summary = worker(&store, "sweeper")
        .work(WorkOptions { burst: true, max_jobs: None })
        .await
        .unwrap();
    assert_eq!(summary.jobs_executed, 0);

    let reclaimed = fetch_job(&store, &job.id).await.unwrap().unwrap();
    assert_eq!(reclaimed.status, JobStatus::Failed);
    assert_eq!(reclaimed.failure_kind, Some(FailureKind::WorkerDied));
    assert!(!worker_registered(&store, "ghost").await);
}

#[tokio::test]
async fn test_heartbeat_protects_long_job_from_peer_sweep() {
    let store = MemoryStore::new();
    let id = enqueue(&store, "sleep", json!(3.5), EnqueueOptions::default()).await;
    let config = WorkerConfig {
        staleness_threshold_secs: 2,
        ..config("steady")
    };
    let worker = worker_with(&store, config, Arc::new(default_registry()));
    let control = worker.control();
    let handle = spawn_work(worker, WorkOptions::default());

    wait_for_status(&store, id, JobStatus::Started).await;
    // Past the staleness threshold: only heartbeats keep the owner alive
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let sweeper = OrphanSweeper::new(Arc::new(store.clone()), OrphanPolicy::Fail, Duration::from_secs(2));
    let report = sweeper.sweep(&["default".to_string()]).await.unwrap();
    assert_eq!(report, SweepReport::default());
    assert_eq!(fetch_job(&store, &id).await.unwrap().unwrap().status, JobStatus::Started);

    wait_for_status(&store, id, JobStatus::Finished).await;
    // Let another heartbeat tick pass while the worker idles
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let registries = Registries::for_queue(Arc::new(store.clone()), "default");
    assert_eq!(registries.count(RegistryKind::Started).await.unwrap(), 0);
    assert_eq!(registries.ids(RegistryKind::Finished).await.unwrap(), vec![id]);

    control.request_shutdown();
    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.succeeded, 1);
}

#[tokio::test]
async fn test_job_that_cannot_start_is_recorded_invalid() {
    let store = MemoryStore::new();
    let id = enqueue(&store, "echo", json!(1), EnqueueOptions::default()).await;
    // A started registry holding the wrong type makes the start write fail
    store
        .set(&RegistryKind::Started.key("default"), b"corrupt".to_vec(), None)
        .await
        .unwrap();

    let summary = worker(&store, "picky")
        .work(WorkOptions { burst: true, max_jobs: None })
        .await
        .unwrap();

    assert_eq!(
        summary,
        WorkSummary {
            jobs_executed: 1,
            succeeded: 0,
            failed: 1
        }
    );
    let job = fetch_job(&store, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Invalid));
    let registries = Registries::for_queue(Arc::new(store.clone()), "default");
    assert_eq!(registries.ids(RegistryKind::Failed).await.unwrap(), vec![id]);
    assert_eq!(store.list_len(&keys::queue_key("default")).await.unwrap(), 0);
}
