//! Work horse side: decode the payload, call the function, report back.

use crate::handler::HandlerRegistry;
use crate::Result;
use futures::{SinkExt, StreamExt};
use job_queue_core::{serializer_by_name, Invocation, Job, Serializer};
use job_queue_protocol::{Frame, HorseCodec, HorseReport, ProtocolError};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info};

/// Run one job to completion inside the current process
pub async fn perform_job(registry: &HandlerRegistry, job: &Job, serializer: &dyn Serializer) -> HorseReport {
    let invocation = match Invocation::decode(&job.payload, serializer) {
        Ok(invocation) => invocation,
        Err(e) => {
            return HorseReport::Invalid {
                error: format!("cannot decode payload of job {}: {}", job.id, e),
            }
        }
    };

    let Some(handler) = registry.get(&invocation.function) else {
        return HorseReport::Invalid {
            error: format!("unknown function: {}", invocation.function),
        };
    };

    debug!("Calling {} for job {}", invocation.function, job.id);
    match handler.call(invocation.args).await {
        Ok(value) => match serializer.encode(&value) {
            Ok(result) => HorseReport::Success { result },
            Err(e) => HorseReport::Raised {
                error: format!("cannot encode result: {}", e),
            },
        },
        Err(error) => HorseReport::Raised { error },
    }
}

/// Entry point of the `horse` subcommand.
///
/// Reads one request frame from stdin, runs it, and writes one report frame
/// to stdout. SIGTERM ends the job early with an `Interrupted` report.
pub async fn run_horse(registry: &HandlerRegistry) -> Result<()> {
    let mut reader = FramedRead::new(tokio::io::stdin(), HorseCodec);
    let request = match reader.next().await {
        Some(Ok(Frame::Request(request))) => request,
        Some(Ok(Frame::Report(_))) => {
            return Err(ProtocolError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "expected a request frame",
            ))
            .into())
        }
        Some(Err(e)) => return Err(e.into()),
        None => {
            return Err(ProtocolError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stdin closed before a request arrived",
            ))
            .into())
        }
    };

    let job = request.job;
    info!("Work horse {} running job {}", std::process::id(), job.id);

    let mut sigterm = signal(SignalKind::terminate())?;
    let report = match serializer_by_name(&request.serializer) {
        Some(serializer) => {
            tokio::select! {
                report = perform_job(registry, &job, serializer.as_ref()) => report,
                _ = sigterm.recv() => {
                    info!("Work horse interrupted while running job {}", job.id);
                    HorseReport::Interrupted
                }
            }
        }
        None => HorseReport::Invalid {
            error: format!("unknown serializer: {}", request.serializer),
        },
    };

    let mut writer = FramedWrite::new(tokio::io::stdout(), HorseCodec);
    writer.send(Frame::Report(report)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::default_registry;
    use job_queue_core::JsonSerializer;
    use serde_json::json;

    fn job_calling(function: &str, args: serde_json::Value) -> Job {
        Job::for_call("default", &Invocation::new(function, args), &JsonSerializer)
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_is_encoded() {
        let registry = default_registry();
        let report = perform_job(&registry, &job_calling("echo", json!({"a": 1})), &JsonSerializer).await;
        assert_eq!(
            report,
            HorseReport::Success {
                result: br#"{"a":1}"#.to_vec()
            }
        );
    }

    #[tokio::test]
    async fn test_application_error_is_raised() {
        let registry = default_registry();
        let report = perform_job(&registry, &job_calling("fail", json!("boom")), &JsonSerializer).await;
        assert_eq!(report, HorseReport::Raised { error: "boom".into() });
    }

    #[tokio::test]
    async fn test_unknown_function_and_bad_payload_are_invalid() {
        let registry = default_registry();
        let report = perform_job(&registry, &job_calling("nope", json!(null)), &JsonSerializer).await;
        assert!(matches!(report, HorseReport::Invalid { .. }));

        let garbage = Job::new("default", "garbage", b"\xff\x00".to_vec()).unwrap();
        let report = perform_job(&registry, &garbage, &JsonSerializer).await;
        assert!(matches!(report, HorseReport::Invalid { .. }));
    }
}
