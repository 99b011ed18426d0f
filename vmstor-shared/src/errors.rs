//! Error taxonomy shared by the storage engine and the agent layer.

use thiserror::Error;

use crate::constants::libvirt::OPERATION_NOT_SUPPORTED;

/// Result alias used by every fallible storage operation.
pub type VmstorResult<T> = Result<T, VmstorError>;

#[derive(Debug, Error)]
pub enum VmstorError {
    /// A required external tool or script is missing. Fatal to the processor.
    #[error("configuration error: {0}")]
    Config(String),

    /// Rejected before any external call was made.
    #[error("validation error: {0}")]
    Validation(String),

    /// An external process exited non-zero or produced an error result.
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// The hypervisor API refused or failed the request.
    #[error("libvirt error: {0}")]
    Libvirt(String),

    /// Object-store client failure carrying the backend's native error code.
    #[error("backend error {code}: {message} ({})", describe_code(.code))]
    Backend { code: i32, message: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VmstorError {
    /// True when the hypervisor rejected a live disk-only snapshot as unsupported.
    ///
    /// This is the only failure that triggers an in-process fallback.
    pub fn is_operation_not_supported(&self) -> bool {
        matches!(self, VmstorError::Libvirt(msg) if msg.contains(OPERATION_NOT_SUPPORTED))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VmstorError::NotFound(_))
    }
}

impl From<std::io::Error> for VmstorError {
    fn from(err: std::io::Error) -> Self {
        VmstorError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for VmstorError {
    fn from(err: serde_json::Error) -> Self {
        VmstorError::Validation(format!("malformed document: {}", err))
    }
}

fn describe_code(code: &i32) -> String {
    std::io::Error::from_raw_os_error(code.abs()).to_string()
}
