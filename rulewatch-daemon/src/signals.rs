use std::io;

use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::logging::LogHandle;

/// Cancel `cancel` on SIGINT or SIGTERM and reopen the log on SIGHUP.
///
/// `on_hangup` runs after the log was reopened; the parent uses it to pass
/// SIGHUP on to its tenant processes.
pub fn spawn_listener<F>(
    cancel: CancellationToken,
    log: LogHandle,
    on_hangup: F,
) -> io::Result<JoinHandle<()>>
where
    F: Fn() + Send + 'static,
{
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    cancel.cancel();
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    cancel.cancel();
                }
                _ = sighup.recv() => {
                    match log.reopen() {
                        Ok(()) => info!(path = ?log.file_path(), "reopened log file"),
                        Err(err) => warn!(error = %err, "failed to reopen log file"),
                    }
                    on_hangup();
                }
            }
        }
    }))
}
