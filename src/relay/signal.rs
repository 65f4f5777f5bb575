//! Operator interrupt listener

use std::future::Future;

use tracing::info;

/// Register for the operator interrupt right away and return a future that
/// resolves once it arrives
///
/// Registration happens before this returns, so an interrupt that lands while
/// the handshake is still in progress is not lost.
#[cfg(unix)]
pub fn interrupt() -> std::io::Result<impl Future<Output = ()> + Send + 'static> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT interrupt signal. Closing all pending connections");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal. Closing all pending connections");
            }
        }
    })
}

#[cfg(not(unix))]
pub fn interrupt() -> std::io::Result<impl Future<Output = ()> + Send + 'static> {
    use tracing::warn;

    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt signal. Closing all pending connections"),
            Err(e) => {
                warn!("Failed to listen for interrupt signal: {}", e);
                std::future::pending::<()>().await;
            }
        }
    })
}
