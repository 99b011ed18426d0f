//! External tool execution.
//!
//! Every storage tool (`qemu-img`, `virsh`, `rbd`, the management scripts)
//! runs through [`run_tool`]: one child process, bounded by a timeout, with
//! the child killed if the timeout fires.

use std::process::Stdio;
use std::time::Duration;

use vmstor_shared::errors::{VmstorError, VmstorResult};

/// Captured result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code; `None` when the child was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Text describing a failure: stderr if present, otherwise stdout.
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }

    /// Convert a non-zero exit into `ExternalTool`.
    pub fn into_result(self, program: &str) -> VmstorResult<ToolOutput> {
        if self.success() {
            return Ok(self);
        }
        Err(VmstorError::ExternalTool(format!(
            "{} exited with {}: {}",
            program,
            self.code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            self.error_text()
        )))
    }
}

/// Run `program` with `args`, waiting at most `timeout`.
///
/// The engine is synchronous; this drives the child on a private
/// current-thread runtime so the calling worker thread blocks for the
/// duration of the call. Must not be called from inside a tokio runtime.
pub fn run_tool(program: &str, args: &[String], timeout: Duration) -> VmstorResult<ToolOutput> {
    tracing::debug!(command = %program, args = ?args, timeout_ms = timeout.as_millis() as u64, "Executing tool");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| VmstorError::Internal(format!("Failed to build process runtime: {}", e)))?;

    runtime.block_on(async {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            VmstorError::ExternalTool(format!("Failed to execute {}: {}", program, e))
        })?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let result = ToolOutput {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                };
                if !result.success() {
                    tracing::debug!(command = %program, code = ?result.code, stderr = %result.stderr.trim(), "Tool exited with failure");
                }
                Ok(result)
            }
            Ok(Err(e)) => Err(VmstorError::ExternalTool(format!(
                "Failed to wait for {}: {}",
                program, e
            ))),
            Err(_) => {
                tracing::warn!(command = %program, "Tool timed out, killing child");
                Err(VmstorError::Timeout(format!(
                    "{} did not finish within {} ms",
                    program,
                    timeout.as_millis()
                )))
            }
        }
    })
}
