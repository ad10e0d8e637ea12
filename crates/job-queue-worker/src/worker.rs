use crate::commands::spawn_listener;
use crate::config::WorkerConfig;
use crate::control::{CurrentJob, WorkerControl};
use crate::death_penalty::{DeathPenalty, TimerDeathPenalty};
use crate::dequeue::{DequeueStrategy, Dequeuer};
use crate::exceptions::{ExceptionHandler, ExceptionHandlers};
use crate::heartbeat::{spawn_heartbeat, WorkerRecordHandle};
use crate::metrics::WorkerMetrics;
use crate::registry::{OrphanSweeper, Registries};
use crate::retry::RetryPolicy;
use crate::supervisor::{ExecutionSupervisor, Isolation, Outcome};
use crate::{Result, WorkerError};
use job_queue_core::{FailureKind, Job, WorkerRecord, WorkerState};
use job_queue_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long `Worker::work` keeps going
#[derive(Debug, Clone, Default)]
pub struct WorkOptions {
    /// Stop as soon as every queue is empty
    pub burst: bool,
    /// Stop after this many jobs went through cleanup
    pub max_jobs: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkSummary {
    pub jobs_executed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Worker process that executes jobs one at a time
pub struct Worker {
    config: WorkerConfig,
    name: String,
    store: Arc<dyn Store>,
    isolation: Arc<dyn Isolation>,
    death_penalty: Arc<dyn DeathPenalty>,
    dequeuer: Dequeuer,
    exception_handlers: ExceptionHandlers,
    sweeper: OrphanSweeper,
    record: Arc<WorkerRecordHandle>,
    control: Arc<WorkerControl>,
    metrics: Option<Arc<WorkerMetrics>>,
    retry: RetryPolicy,
}

impl Worker {
    /// Build a worker. Nothing is written to the store until `work` is called.
    pub fn new(config: WorkerConfig, store: Arc<dyn Store>, isolation: Arc<dyn Isolation>) -> Result<Self> {
        config.validate().map_err(WorkerError::Config)?;

        let name = config.worker_name();
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let record = WorkerRecord::new(name.clone(), hostname, std::process::id(), config.queues.clone());
        let retry = RetryPolicy::default();

        Ok(Worker {
            dequeuer: Dequeuer::new(store.clone(), config.dequeue_strategy.build()),
            death_penalty: Arc::new(TimerDeathPenalty::new(config.kill_grace())),
            exception_handlers: ExceptionHandlers::new(config.disable_default_exception_handler),
            sweeper: OrphanSweeper::new(store.clone(), config.orphan_policy, config.staleness_threshold()),
            record: Arc::new(
                WorkerRecordHandle::new(record, store.clone(), config.worker_ttl()).with_retry(retry.clone()),
            ),
            control: Arc::new(WorkerControl::new()),
            metrics: None,
            name,
            config,
            store,
            isolation,
            retry,
        })
    }

    pub fn with_death_penalty(mut self, death_penalty: Arc<dyn DeathPenalty>) -> Self {
        self.death_penalty = death_penalty;
        self
    }

    pub fn with_dequeue_strategy(mut self, strategy: Box<dyn DequeueStrategy>) -> Self {
        self.dequeuer = Dequeuer::new(self.store.clone(), strategy);
        self
    }

    /// Append a handler to the exception chain
    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handlers.push(handler);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<WorkerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared control flags, for signal handlers and embedding code
    pub fn control(&self) -> Arc<WorkerControl> {
        self.control.clone()
    }

    /// Register, process jobs until told to stop, then unregister.
    ///
    /// Returns an error only for faults the loop cannot recover from, such as
    /// losing the store connection; job failures are recorded, not returned.
    pub async fn work(&mut self, options: WorkOptions) -> Result<WorkSummary> {
        self.record.register_birth(self.config.staleness_threshold()).await?;
        info!(
            "Worker {} started (queues: {}, burst: {})",
            self.name,
            self.config.queues.join(", "),
            options.burst
        );

        let cancel = CancellationToken::new();
        let listener = match spawn_listener(self.store.clone(), &self.name, self.control.clone(), cancel.clone()).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to subscribe to the command channel: {}", e);
                self.record.register_death().await;
                return Err(e);
            }
        };
        let heartbeat = spawn_heartbeat(
            self.record.clone(),
            self.control.clone(),
            self.config.heartbeat_interval(),
            cancel.clone(),
        );

        let result = self.run_loop(&options).await;
        if let Err(e) = &result {
            error!("Worker {} stopping on error: {}", self.name, e);
        }

        cancel.cancel();
        for task in [listener, heartbeat] {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.record.register_death().await;

        if let Ok(summary) = &result {
            info!(
                "Worker {} stopped after {} jobs ({} succeeded, {} failed)",
                self.name, summary.jobs_executed, summary.succeeded, summary.failed
            );
        }
        result
    }

    async fn run_loop(&mut self, options: &WorkOptions) -> Result<WorkSummary> {
        let mut summary = WorkSummary::default();
        let mut next_maintenance = Instant::now();
        let mut state = WorkerState::Started;

        loop {
            if self.control.shutdown_requested() {
                info!("Worker {} shutting down", self.name);
                break;
            }

            if Instant::now() >= next_maintenance {
                self.maintain().await;
                next_maintenance = Instant::now() + self.config.maintenance_interval();
            }

            if state != WorkerState::Idle {
                self.record.set_state(WorkerState::Idle).await?;
                state = WorkerState::Idle;
            }

            let Some(job) = self.listen(options.burst).await? else {
                if options.burst {
                    info!("Burst mode: all queues empty");
                    break;
                }
                continue;
            };

            let succeeded = self.perform(job).await?;
            summary.jobs_executed += 1;
            if succeeded {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }

            if let Some(max_jobs) = options.max_jobs {
                if summary.jobs_executed >= max_jobs {
                    info!("Reached the limit of {} jobs", max_jobs);
                    break;
                }
            }
        }

        Ok(summary)
    }

    /// Wait for the next job. Burst mode probes each queue once without blocking.
    async fn listen(&mut self, burst: bool) -> Result<Option<Job>> {
        let timeout = if burst {
            None
        } else {
            Some(self.config.dequeue_timeout())
        };
        let job = self.dequeuer.select_and_pop(&self.config.queues, timeout).await?;
        if job.is_none() {
            if let Some(metrics) = &self.metrics {
                metrics.dequeue_misses.inc();
            }
        }
        Ok(job)
    }

    /// Prepare, execute and clean up one job. Returns whether it succeeded.
    async fn perform(&mut self, mut job: Job) -> Result<bool> {
        let timeout = job.timeout_or(self.config.default_timeout());
        let registries = Registries::for_queue(self.store.clone(), job.origin.clone()).with_retry(self.retry.clone());
        let id = job.id;

        self.control.begin_job(CurrentJob {
            id,
            queue: job.origin.clone(),
            timeout,
        });

        let prepared = self.prepare(&registries, &mut job, timeout).await;
        if let Err(e) = prepared {
            self.control.end_job();
            if e.is_connection() {
                return Err(e);
            }
            error!("Could not start job {}: {}", id, e);
            let reason = format!("could not start job: {}", e);
            match registries.mark_rejected(&mut job, &self.name, &reason).await {
                Ok(()) => warn!("Job {} recorded as invalid", id),
                Err(e) if e.is_connection() => return Err(e),
                Err(e) => error!("Could not record job {} as invalid: {}", id, e),
            }
            self.record
                .update(|record| {
                    record.state = WorkerState::Idle;
                    record.current_job_id = None;
                })
                .await?;
            return Ok(false);
        }

        info!("{}: {} ({})", job.origin, job.description, id);
        let started = Instant::now();
        let supervisor = ExecutionSupervisor::new(self.isolation.clone(), self.death_penalty.clone());
        let outcome = supervisor.execute(&job, timeout, &self.control).await;
        let elapsed = started.elapsed();

        let succeeded = matches!(outcome, Outcome::Success(_));
        // Heartbeats stop renewing the started entry before it is removed
        self.control.end_job();
        let recorded = self.record_outcome(&registries, &mut job, outcome.clone()).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_job(registries.queue(), outcome.label(), elapsed);
        }
        let working_time = chrono::Duration::milliseconds(elapsed.as_millis().min(i64::MAX as u128) as i64);
        self.record
            .update(|record| {
                record.state = WorkerState::Idle;
                record.current_job_id = None;
                record.record_job(succeeded, working_time);
            })
            .await?;

        match recorded {
            Err(e) if e.is_connection() => Err(e),
            Err(e) => {
                error!("Failed to record outcome of job {}: {}", id, e);
                Ok(succeeded)
            }
            Ok(()) => Ok(succeeded),
        }
    }

    async fn prepare(&self, registries: &Registries, job: &mut Job, timeout: Duration) -> Result<()> {
        let id = job.id;
        self.record
            .update(|record| {
                record.state = WorkerState::Busy;
                record.current_job_id = Some(id);
            })
            .await?;
        registries.mark_started(job, &self.name, timeout).await
    }

    async fn record_outcome(&self, registries: &Registries, job: &mut Job, outcome: Outcome) -> Result<()> {
        let (kind, error) = match outcome {
            Outcome::Success(result) => {
                info!("Job {} finished", job.id);
                return registries.mark_finished(job, result).await;
            }
            Outcome::Failure { kind, error } => (kind, error),
            Outcome::Stopped(reason) => (FailureKind::Stopped, reason),
        };

        self.exception_handlers.run(job, kind, &error).await;
        if job.can_retry(kind) {
            registries.mark_retried(job, kind, &error).await
        } else {
            registries.mark_failed(job, kind, &error).await
        }
    }

    /// Expire finished/failed records and reclaim orphaned jobs
    async fn maintain(&self) {
        debug!("Running maintenance");
        for queue in &self.config.queues {
            let registries = Registries::for_queue(self.store.clone(), queue.clone());
            if let Err(e) = registries.cleanup_expired().await {
                warn!("Registry cleanup of {} failed: {}", queue, e);
            }
        }
        if let Err(e) = self.sweeper.sweep(&self.config.queues).await {
            warn!("Orphan sweep failed: {}", e);
        }
    }
}
