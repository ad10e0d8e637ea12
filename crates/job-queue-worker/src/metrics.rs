use axum::{extract::State, routing::get, Router};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

/// Prometheus metrics for one worker process
pub struct WorkerMetrics {
    pub registry: Registry,

    // Executed jobs by queue and outcome
    pub jobs_total: IntCounterVec,

    pub job_duration: HistogramVec,

    // Listen phases that found every queue empty
    pub dequeue_misses: IntCounter,
}

impl WorkerMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new("jq_jobs_total", "Jobs executed by queue and outcome"),
            &["queue", "outcome"],
        )?;
        registry.register(Box::new(jobs_total.clone()))?;

        let job_duration = HistogramVec::new(
            HistogramOpts::new("jq_job_duration_seconds", "Job execution duration in seconds"),
            &["queue"],
        )?;
        registry.register(Box::new(job_duration.clone()))?;

        let dequeue_misses = IntCounter::new("jq_dequeue_misses_total", "Dequeue attempts that found no job")?;
        registry.register(Box::new(dequeue_misses.clone()))?;

        Ok(WorkerMetrics {
            registry,
            jobs_total,
            job_duration,
            dequeue_misses,
        })
    }

    pub fn record_job(&self, queue: &str, outcome: &str, duration: Duration) {
        self.jobs_total.with_label_values(&[queue, outcome]).inc();
        self.job_duration
            .with_label_values(&[queue])
            .observe(duration.as_secs_f64());
    }

    /// Text exposition format of every registered metric
    pub fn gather_text(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

async fn metrics_handler(State(metrics): State<Arc<WorkerMetrics>>) -> String {
    match metrics.gather_text() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            String::new()
        }
    }
}

/// Serve `/metrics` on `port` until the process exits
pub async fn serve_metrics(metrics: Arc<WorkerMetrics>, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Metrics server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_jobs_are_exported() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.record_job("default", "success", Duration::from_millis(250));
        metrics.record_job("default", "timeout", Duration::from_secs(1));
        metrics.dequeue_misses.inc();

        let text = metrics.gather_text().unwrap();
        assert!(text.contains(r#"jq_jobs_total{outcome="success",queue="default"} 1"#));
        assert!(text.contains(r#"jq_jobs_total{outcome="timeout",queue="default"} 1"#));
        assert!(text.contains("jq_dequeue_misses_total 1"));
        assert!(text.contains("jq_job_duration_seconds_count{queue=\"default\"} 2"));
    }
}
