pub mod commands;
pub mod config;
pub mod control;
pub mod death_penalty;
pub mod dequeue;
mod error;
pub mod exceptions;
pub mod handler;
pub mod heartbeat;
pub mod horse;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod shutdown;
pub mod supervisor;
pub mod worker;

pub use commands::CommandError;
pub use config::{IsolationKind, LogFormat, WorkerConfig};
pub use control::WorkerControl;
pub use death_penalty::{DeathPenalty, NoDeathPenalty, TimerDeathPenalty};
pub use dequeue::{DequeueStrategy, DequeueStrategyKind, Dequeuer};
pub use error::{Result, WorkerError};
pub use exceptions::{ExceptionHandler, HandlerFlow};
pub use handler::{default_registry, HandlerRegistry, JobHandler};
pub use queue::{fetch_job, EnqueueOptions, Queue};
pub use registry::{OrphanPolicy, OrphanSweeper, Registries, RegistryKind};
pub use supervisor::{ExecutionSupervisor, InProcessIsolation, Isolation, Outcome, ProcessIsolation};
pub use worker::{WorkOptions, WorkSummary, Worker};
