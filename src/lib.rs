//! HookRelay Listener Library
//!
//! A local agent that subscribes to a relay server over a persistent
//! WebSocket connection and forwards every received event to an HTTP
//! service running on this machine.

pub mod cli;
pub mod config;
pub mod forward;
pub mod relay;

use std::path::Path;

use anyhow::{Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;

/// Initialize tracing subscriber for logging
///
/// With a log file the returned guard must stay alive until exit so buffered
/// lines get flushed.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow!("log file path has no file name: {}", path.display()))?;
            std::fs::create_dir_all(directory)?;

            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("hookrelay={}", level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}
