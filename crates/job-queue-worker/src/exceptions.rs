//! Exception handler chain invoked when a job fails.

use async_trait::async_trait;
use job_queue_core::{FailureKind, Job};
use std::sync::Arc;
use tracing::{debug, error};

/// Whether later handlers in the chain should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerFlow {
    Continue,
    Stop,
}

#[async_trait]
pub trait ExceptionHandler: Send + Sync {
    async fn handle(&self, job: &Job, kind: FailureKind, error: &str) -> HandlerFlow;
}

/// Logs the failure and lets the chain continue
#[derive(Debug, Clone, Default)]
pub struct LogExceptionHandler;

#[async_trait]
impl ExceptionHandler for LogExceptionHandler {
    async fn handle(&self, job: &Job, kind: FailureKind, error: &str) -> HandlerFlow {
        error!(
            job_id = %job.id,
            queue = %job.origin,
            kind = kind.as_str(),
            attempts = job.attempts,
            "Job {} failed: {}",
            job.description,
            error
        );
        HandlerFlow::Continue
    }
}

/// Ordered handler chain
#[derive(Clone)]
pub struct ExceptionHandlers {
    handlers: Vec<Arc<dyn ExceptionHandler>>,
}

impl ExceptionHandlers {
    pub fn new(disable_default: bool) -> Self {
        let mut handlers: Vec<Arc<dyn ExceptionHandler>> = Vec::new();
        if !disable_default {
            handlers.push(Arc::new(LogExceptionHandler));
        }
        ExceptionHandlers { handlers }
    }

    /// Append a handler after the ones already registered
    pub fn push(&mut self, handler: Arc<dyn ExceptionHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the chain in order until a handler stops it. Returns how many ran.
    pub async fn run(&self, job: &Job, kind: FailureKind, error: &str) -> usize {
        let mut ran = 0;
        for handler in &self.handlers {
            ran += 1;
            if handler.handle(job, kind, error).await == HandlerFlow::Stop {
                debug!("Exception handler {} stopped the chain for job {}", ran, job.id);
                break;
            }
        }
        ran
    }
}

impl Default for ExceptionHandlers {
    fn default() -> Self {
        Self::new(false)
    }
}
