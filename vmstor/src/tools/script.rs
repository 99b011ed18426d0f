use std::path::Path;
use std::time::Duration;

use vmstor_shared::errors::{VmstorError, VmstorResult};

use super::ScriptRunner;
use crate::util::run_tool;

/// Runs storage scripts as child processes.
pub struct ShellScripts;

impl ScriptRunner for ShellScripts {
    fn run(&self, script: &Path, args: &[String], timeout: Duration) -> VmstorResult<()> {
        let program = script.to_str().ok_or_else(|| {
            VmstorError::Config(format!("Script path is not valid UTF-8: {}", script.display()))
        })?;
        run_tool(program, args, timeout)?.into_result(program)?;
        Ok(())
    }
}
