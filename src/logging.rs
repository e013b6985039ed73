//! Logging setup for the worker and library consumers.
//!
//! Logs go to systemd's journal on Linux when it is reachable, otherwise to a
//! daily rolling file.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the filter directive, e.g. `FACEKIT_LOG=facekit=debug`.
pub const LOG_ENV: &str = "FACEKIT_LOG";

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the global subscriber.
///
/// Defaults to `info` when `FACEKIT_LOG` is unset or invalid. `log_dir`
/// overrides the file backend location.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer.with_syslog_identifier("facekit".to_string()))
                .try_init()?;

            tracing::info!(backend = "journald", "Logging initialized");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facekit")
            .join("logs")
    });

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "facekit.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard stops the writer thread.
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()?;

    tracing::info!(backend = "file", dir = %log_dir.display(), "Logging initialized");
    Ok(())
}
