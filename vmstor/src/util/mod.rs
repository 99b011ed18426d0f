use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::NonBlocking;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use vmstor_shared::errors::{VmstorError, VmstorResult};

mod key_file;
pub mod logging;
pub mod poll;
pub mod process;

pub use key_file::KeyFile;
pub(crate) use key_file::temp_document;
pub use poll::{BoundedPoll, CancelToken, PollOutcome};
pub use process::{ToolOutput, run_tool};

/// Environment variable listing an extra directory searched for scripts.
pub const SCRIPTS_DIR_ENV: &str = "VMSTOR_SCRIPTS_DIR";

/// Find an executable script or binary.
///
/// Searches, in order: each of `search_dirs`, the directory named by
/// `VMSTOR_SCRIPTS_DIR`, then every entry of `PATH`.
///
/// # Returns
/// * `Ok(PathBuf)` - Path to the first existing candidate
/// * `Err(Config)` - Not found in any location; lists every searched path
pub fn find_binary(binary_name: &str, search_dirs: &[&Path]) -> VmstorResult<PathBuf> {
    let mut candidates: Vec<PathBuf> = search_dirs.iter().map(|d| d.join(binary_name)).collect();

    if let Ok(dir) = std::env::var(SCRIPTS_DIR_ENV) {
        candidates.push(PathBuf::from(dir).join(binary_name));
    }

    if let Some(path) = std::env::var_os("PATH") {
        candidates.extend(std::env::split_paths(&path).map(|d| d.join(binary_name)));
    }

    for candidate in &candidates {
        tracing::trace!("Finding binary {:?} in path: {:?}", binary_name, candidate);
        if candidate.is_file() {
            tracing::debug!(binary = %candidate.display(), "Found binary");
            return Ok(candidate.clone());
        }
    }

    let locations = candidates
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(VmstorError::Config(format!(
        "Binary '{}' not found.\nSearched locations:\n{}",
        binary_name, locations
    )))
}

pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}

/// Replace the last `/`-separated segment of `path` with `name`.
pub(crate) fn replace_last_segment(path: &str, name: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => format!("{}/{}", dir, name),
        None => name.to_string(),
    }
}
