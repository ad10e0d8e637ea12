use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Table};
use job_queue_core::{keys, Job, JobId, Ttl, WorkerRecord};
use job_queue_store::{RedisStore, Store};
use job_queue_worker::commands::{send_kill_horse_command, send_shutdown_command, send_stop_job_command};
use job_queue_worker::queue::all_queues;
use job_queue_worker::{
    fetch_job, EnqueueOptions, OrphanPolicy, OrphanSweeper, Queue, Registries, RegistryKind,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "jq-admin")]
#[command(about = "Job Queue Admin CLI", long_about = None)]
struct Args {
    /// Redis URL
    #[arg(long, env = "JQ_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Yaml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RegistryArg {
    Started,
    Finished,
    Failed,
}

impl From<RegistryArg> for RegistryKind {
    fn from(arg: RegistryArg) -> Self {
        match arg {
            RegistryArg::Started => RegistryKind::Started,
            RegistryArg::Finished => RegistryKind::Finished,
            RegistryArg::Failed => RegistryKind::Failed,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enqueue a call to a registered job function
    Enqueue {
        /// Function name
        function: String,

        /// Arguments as JSON
        #[arg(short, long, default_value = "null")]
        args: String,

        #[arg(short, long, default_value = "default")]
        queue: String,

        /// Execution timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Retries after a retryable failure
        #[arg(short, long, default_value = "0")]
        retries: u32,

        /// Result retention: seconds, "default" or "forever"
        #[arg(long, value_parser = parse_ttl, default_value = "default")]
        result_ttl: Ttl,

        /// Failure retention: seconds, "default" or "forever"
        #[arg(long, value_parser = parse_ttl, default_value = "default")]
        failure_ttl: Ttl,

        #[arg(long)]
        description: Option<String>,
    },

    /// Show a job record
    Status {
        job_id: JobId,
    },

    /// List queues with their lengths and registry sizes
    Queues,

    /// List registered workers
    Workers,

    /// List job ids in a registry
    Registry {
        #[arg(value_enum)]
        kind: RegistryArg,

        #[arg(short, long, default_value = "default")]
        queue: String,
    },

    /// Delete expired finished/failed jobs, optionally reclaiming orphans too
    Cleanup {
        /// Only this queue (default: all queues)
        #[arg(short, long)]
        queue: Option<String>,

        /// Also run the orphan sweep
        #[arg(long)]
        sweep: bool,

        /// Heartbeat age in seconds after which a worker counts as dead
        #[arg(long, default_value = "120")]
        staleness: u64,

        #[arg(long, value_enum, default_value_t = OrphanPolicy::Requeue)]
        orphan_policy: OrphanPolicy,
    },

    /// Requeue a failed or stopped job
    Requeue {
        job_id: JobId,
    },

    /// Ask a worker to shut down gracefully
    Shutdown {
        worker: String,
    },

    /// Kill the job a worker is currently running
    KillHorse {
        worker: String,
    },

    /// Stop a job on whichever worker is executing it
    StopJob {
        job_id: JobId,
    },

    /// Remove every queued job from a queue
    Empty {
        queue: String,
    },
}

fn parse_ttl(value: &str) -> Result<Ttl, String> {
    match value {
        "default" => Ok(Ttl::Default),
        "forever" => Ok(Ttl::Forever),
        secs => secs
            .parse::<u64>()
            .map(Ttl::Seconds)
            .map_err(|_| format!("expected seconds, \"default\" or \"forever\", got {:?}", secs)),
    }
}

#[derive(Debug, Serialize)]
struct QueueSummary {
    name: String,
    queued: usize,
    started: usize,
    finished: usize,
    failed: usize,
}

fn print_structured<T: Serialize>(format: OutputFormat, value: &T) -> anyhow::Result<bool> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
        OutputFormat::Table => return Ok(false),
    }
    Ok(true)
}

fn job_table(job: &Job) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["ID".to_string(), job.id.to_string()]);
    table.add_row(vec!["Description".to_string(), job.description.clone()]);
    table.add_row(vec!["Queue".to_string(), job.origin.clone()]);
    table.add_row(vec!["Status".to_string(), job.status.to_string()]);
    table.add_row(vec!["Attempts".to_string(), job.attempts.to_string()]);
    table.add_row(vec!["Retries Left".to_string(), job.retries_left.to_string()]);
    for (label, stamp) in [
        ("Enqueued", job.enqueued_at),
        ("Started", job.started_at),
        ("Ended", job.ended_at),
    ] {
        if let Some(stamp) = stamp {
            table.add_row(vec![label.to_string(), stamp.to_rfc3339()]);
        }
    }
    if let Some(worker) = &job.worker_name {
        table.add_row(vec!["Worker".to_string(), worker.clone()]);
    }
    if let Some(kind) = job.failure_kind {
        table.add_row(vec!["Failure".to_string(), kind.to_string()]);
    }
    if let Some(error) = &job.error {
        table.add_row(vec!["Error".to_string(), error.clone()]);
    }
    if let Some(result) = &job.result {
        table.add_row(vec!["Result".to_string(), String::from_utf8_lossy(result).into_owned()]);
    }
    table
}

async fn load_workers(store: &dyn Store) -> anyhow::Result<Vec<WorkerRecord>> {
    let mut names = store.set_members(keys::WORKERS_KEY).await?;
    names.sort();

    let mut workers = Vec::new();
    for name in names {
        if let Some(bytes) = store.get(&keys::worker_key(&name)).await? {
            workers.push(WorkerRecord::from_bytes(&bytes)?);
        }
    }
    Ok(workers)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let store: Arc<dyn Store> = Arc::new(
        RedisStore::connect(&args.redis_url)
            .await
            .context("failed to connect to Redis")?,
    );

    match args.command {
        Commands::Enqueue {
            function,
            args: raw_args,
            queue,
            timeout,
            retries,
            result_ttl,
            failure_ttl,
            description,
        } => {
            let call_args: Value = serde_json::from_str(&raw_args).context("--args must be valid JSON")?;
            let job = Queue::new(queue, store.clone())
                .enqueue_call(
                    &function,
                    call_args,
                    EnqueueOptions {
                        job_id: None,
                        description,
                        timeout_secs: timeout,
                        result_ttl,
                        failure_ttl,
                        retries,
                    },
                )
                .await?;

            if !print_structured(args.format, &serde_json::json!({ "job_id": job.id, "queue": job.origin }))? {
                println!("Job enqueued: {} on {}", job.id, job.origin);
            }
        }

        Commands::Status { job_id } => match fetch_job(store.as_ref(), &job_id).await? {
            Some(job) => {
                if !print_structured(args.format, &job)? {
                    println!("{}", job_table(&job));
                }
            }
            None => eprintln!("Job {} not found", job_id),
        },

        Commands::Queues => {
            let mut summaries = Vec::new();
            for name in all_queues(store.as_ref()).await? {
                let registries = Registries::for_queue(store.clone(), name.clone());
                summaries.push(QueueSummary {
                    queued: Queue::new(name.clone(), store.clone()).len().await?,
                    started: registries.count(RegistryKind::Started).await?,
                    finished: registries.count(RegistryKind::Finished).await?,
                    failed: registries.count(RegistryKind::Failed).await?,
                    name,
                });
            }

            if !print_structured(args.format, &summaries)? {
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Queue", "Queued", "Started", "Finished", "Failed"]);
                for summary in &summaries {
                    table.add_row(vec![
                        summary.name.clone(),
                        summary.queued.to_string(),
                        summary.started.to_string(),
                        summary.finished.to_string(),
                        summary.failed.to_string(),
                    ]);
                }
                println!("{table}");
            }
        }

        Commands::Workers => {
            let workers = load_workers(store.as_ref()).await?;

            if !print_structured(args.format, &workers)? {
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec![
                    "Worker",
                    "State",
                    "Queues",
                    "Current Job",
                    "Succeeded",
                    "Failed",
                    "Last Heartbeat",
                ]);
                for worker in &workers {
                    table.add_row(vec![
                        worker.name.clone(),
                        worker.state.to_string(),
                        worker.queues.join(","),
                        worker.current_job_id.map(|id| id.to_string()).unwrap_or_default(),
                        worker.successful_job_count.to_string(),
                        worker.failed_job_count.to_string(),
                        worker.last_heartbeat.to_rfc3339(),
                    ]);
                }
                println!("{table}");
            }
        }

        Commands::Registry { kind, queue } => {
            let ids = Registries::for_queue(store.clone(), queue).ids(kind.into()).await?;

            if !print_structured(args.format, &ids)? {
                for id in ids {
                    println!("{}", id);
                }
            }
        }

        Commands::Cleanup {
            queue,
            sweep,
            staleness,
            orphan_policy,
        } => {
            let queues = match queue {
                Some(queue) => vec![queue],
                None => all_queues(store.as_ref()).await?,
            };

            let mut removed = 0;
            for queue in &queues {
                removed += Registries::for_queue(store.clone(), queue.clone())
                    .cleanup_expired()
                    .await?;
            }

            let report = if sweep {
                Some(
                    OrphanSweeper::new(store.clone(), orphan_policy, Duration::from_secs(staleness))
                        .sweep(&queues)
                        .await?,
                )
            } else {
                None
            };

            let output = serde_json::json!({
                "expired_removed": removed,
                "orphans_requeued": report.as_ref().map(|r| r.requeued),
                "orphans_failed": report.as_ref().map(|r| r.failed),
                "workers_removed": report.as_ref().map(|r| r.workers_removed),
            });
            if !print_structured(args.format, &output)? {
                println!("Removed {} expired jobs", removed);
                if let Some(report) = report {
                    println!(
                        "Orphan sweep: {} requeued, {} failed, {} stale workers removed",
                        report.requeued, report.failed, report.workers_removed
                    );
                }
            }
        }

        Commands::Requeue { job_id } => {
            let job = fetch_job(store.as_ref(), &job_id)
                .await?
                .with_context(|| format!("job {} not found", job_id))?;
            let job = Queue::new(job.origin.clone(), store.clone()).requeue(&job_id).await?;
            println!("Job {} requeued on {}", job.id, job.origin);
        }

        Commands::Shutdown { worker } => {
            let receivers = send_shutdown_command(store.as_ref(), &worker).await?;
            report_delivery("shutdown", &worker, receivers);
        }

        Commands::KillHorse { worker } => {
            let receivers = send_kill_horse_command(store.as_ref(), &worker).await?;
            report_delivery("kill_horse", &worker, receivers);
        }

        Commands::StopJob { job_id } => {
            let worker = send_stop_job_command(store.as_ref(), job_id).await?;
            println!("Sent stop_job for {} to {}", job_id, worker);
        }

        Commands::Empty { queue } => {
            let removed = Queue::new(queue.clone(), store.clone()).empty().await?;
            println!("Removed {} jobs from {}", removed, queue);
        }
    }

    Ok(())
}

fn report_delivery(command: &str, worker: &str, receivers: usize) {
    if receivers == 0 {
        eprintln!("No worker named {} is listening; {} not delivered", worker, command);
    } else {
        println!("Sent {} to {}", command, worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ttl() {
        assert_eq!(parse_ttl("default"), Ok(Ttl::Default));
        assert_eq!(parse_ttl("forever"), Ok(Ttl::Forever));
        assert_eq!(parse_ttl("0"), Ok(Ttl::Seconds(0)));
        assert!(parse_ttl("-1").is_err());
        assert!(parse_ttl("soon").is_err());
    }

    #[test]
    fn test_cli_parses_commands() {
        let args = Args::try_parse_from([
            "jq-admin",
            "--format",
            "json",
            "enqueue",
            "sleep",
            "--args",
            "5",
            "--queue",
            "high",
            "--result-ttl",
            "forever",
        ])
        .unwrap();
        assert_eq!(args.format, OutputFormat::Json);
        match args.command {
            Commands::Enqueue {
                function,
                queue,
                result_ttl,
                failure_ttl,
                ..
            } => {
                assert_eq!(function, "sleep");
                assert_eq!(queue, "high");
                assert_eq!(result_ttl, Ttl::Forever);
                assert_eq!(failure_ttl, Ttl::Default);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let args = Args::try_parse_from(["jq-admin", "registry", "failed", "-q", "low"]).unwrap();
        assert!(matches!(
            args.command,
            Commands::Registry {
                kind: RegistryArg::Failed,
                ..
            }
        ));
    }
}
