//! File logging for the storage engine.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use vmstor_shared::errors::{VmstorError, VmstorResult};

use super::register_to_tracing;

/// Prefix of the daily-rolled log files (`vmstor.log.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "vmstor.log";

/// Route `tracing` output to a daily-rolling file under `dir`.
///
/// `filter` overrides `RUST_LOG`; with neither set the level is `info`.
/// Keep the returned guard alive for as long as logs should be flushed.
/// A subscriber that is already installed is left in place.
pub fn init_file_logging(dir: &Path, filter: Option<&str>) -> VmstorResult<WorkerGuard> {
    std::fs::create_dir_all(dir).map_err(|e| {
        VmstorError::Storage(format!(
            "Failed to create log directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    let env_filter = match filter {
        Some(directives) => EnvFilter::try_new(directives).map_err(|e| {
            VmstorError::Config(format!("Invalid log filter '{}': {}", directives, e))
        })?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    register_to_tracing(non_blocking, env_filter);

    tracing::debug!(log_dir = %dir.display(), "File logging initialized");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_invalid_filter_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = init_file_logging(dir.path(), Some("vmstor=notalevel")).unwrap_err();
        assert!(matches!(err, VmstorError::Config(_)));
    }

    #[test]
    fn test_creates_log_directory() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("nested").join("logs");
        let _guard = init_file_logging(&logs, Some("debug")).unwrap();
        assert!(logs.is_dir());
    }
}
