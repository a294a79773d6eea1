//! Daemon log initialization.

use crate::layout::FilesystemLayout;
use arca_shared::{ArcaError, ArcaResult};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize tracing for the bridge.
///
/// Writes a daily-rotated `bridge.log` under the data root and honors
/// `ARCA_LOG` (falling back to `info`) for per-module filtering. Safe to
/// call more than once; later calls are no-ops.
pub fn init_logging_for(layout: &FilesystemLayout) -> ArcaResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let appender = tracing_appender::rolling::daily(layout.data_root(), "bridge.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_env("ARCA_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    // A subscriber installed by the embedding process wins; keep using it.
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .is_ok()
    {
        LOG_GUARD
            .set(guard)
            .map_err(|_| ArcaError::Internal("logging initialized twice".into()))?;
    }
    Ok(())
}
