use clap::{Args, Parser, Subcommand};
use job_queue_core::{serializer_by_name, Serializer};
use job_queue_store::RedisStore;
use job_queue_worker::horse::run_horse;
use job_queue_worker::metrics::{serve_metrics, WorkerMetrics};
use job_queue_worker::shutdown::install_signal_handlers;
use job_queue_worker::{
    default_registry, DequeueStrategyKind, InProcessIsolation, Isolation, IsolationKind, LogFormat,
    ProcessIsolation, WorkOptions, Worker, WorkerConfig,
};
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "jq-worker")]
#[command(about = "Job Queue Worker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process jobs from one or more queues
    Work(WorkArgs),

    /// Run a single job handed over on stdin (spawned by the worker)
    #[command(hide = true)]
    Horse,
}

#[derive(Args, Debug)]
struct WorkArgs {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Redis URL
    #[arg(long, env = "JQ_REDIS_URL")]
    redis_url: Option<String>,

    /// Worker name (auto-generated if not provided)
    #[arg(long)]
    name: Option<String>,

    /// Queues to listen on, highest priority first
    #[arg(short, long, value_delimiter = ',')]
    queues: Vec<String>,

    /// Exit once all queues are empty
    #[arg(short, long)]
    burst: bool,

    /// Exit after this many jobs
    #[arg(long)]
    max_jobs: Option<usize>,

    #[arg(long, value_enum)]
    dequeue_strategy: Option<DequeueStrategyKind>,

    /// Timeout in seconds for jobs that do not set one
    #[arg(long)]
    default_timeout: Option<u64>,

    #[arg(long, value_enum)]
    isolation: Option<IsolationKind>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    #[arg(long)]
    disable_default_exception_handler: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Horse => {
            // stdout carries the report frame
            init_tracing(LogFormat::Text, true);
            run_horse(&default_registry()).await?;
            Ok(())
        }
        Commands::Work(args) => work(args).await,
    }
}

fn init_tracing(format: LogFormat, to_stderr: bool) {
    let writer = if to_stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    );

    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(writer))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init(),
    }
}

fn load_config(args: &WorkArgs) -> anyhow::Result<WorkerConfig> {
    let mut config = match &args.config {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };

    // Override with CLI args
    if let Some(redis_url) = &args.redis_url {
        config.redis_url = redis_url.clone();
    }
    if let Some(name) = &args.name {
        config.name = Some(name.clone());
    }
    if !args.queues.is_empty() {
        config.queues = args.queues.clone();
    }
    if let Some(strategy) = args.dequeue_strategy {
        config.dequeue_strategy = strategy;
    }
    if let Some(timeout) = args.default_timeout {
        config.default_timeout_secs = timeout;
    }
    if let Some(isolation) = args.isolation {
        config.isolation = isolation;
    }
    if let Some(format) = args.log_format {
        config.log_format = format;
    }
    if args.metrics_port.is_some() {
        config.metrics_port = args.metrics_port;
    }
    if args.disable_default_exception_handler {
        config.disable_default_exception_handler = true;
    }

    config.validate().map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
    Ok(config)
}

async fn work(args: WorkArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    init_tracing(config.log_format, false);

    let serializer: Arc<dyn Serializer> = serializer_by_name(&config.serializer)
        .map(Arc::from)
        .ok_or_else(|| anyhow::anyhow!("unknown serializer: {}", config.serializer))?;

    let isolation: Arc<dyn Isolation> = match config.isolation {
        IsolationKind::Process => Arc::new(ProcessIsolation::current_exe(config.serializer.clone())?),
        IsolationKind::InProcess => Arc::new(InProcessIsolation::new(Arc::new(default_registry()), serializer)),
    };

    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let mut worker = Worker::new(config.clone(), store, isolation)?;

    if let Some(port) = config.metrics_port {
        let metrics = Arc::new(WorkerMetrics::new()?);
        worker = worker.with_metrics(metrics.clone());
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(metrics, port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    install_signal_handlers(worker.control())?;

    let summary = worker
        .work(WorkOptions {
            burst: args.burst,
            max_jobs: args.max_jobs,
        })
        .await?;

    tracing::info!("Executed {} jobs", summary.jobs_executed);
    Ok(())
}
