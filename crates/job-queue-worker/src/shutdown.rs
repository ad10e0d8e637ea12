//! Process signals: SIGINT and SIGTERM both count as shutdown signals.

use crate::control::WorkerControl;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::info;

/// Relay SIGINT/SIGTERM into `control` for the lifetime of the process
pub fn install_signal_handlers(control: Arc<WorkerControl>) -> std::io::Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                received = interrupt.recv() => match received {
                    Some(()) => "SIGINT",
                    None => break,
                },
                received = terminate.recv() => match received {
                    Some(()) => "SIGTERM",
                    None => break,
                },
            };
            info!("Received {}", name);
            control.on_signal();
        }
    }))
}
