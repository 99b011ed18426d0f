use std::time::Duration;

use vmstor_shared::errors::VmstorResult;

use super::{BlockCommit, MergeTool};
use crate::util::run_tool;

/// `virsh blockcommit --active --pivot`.
pub struct VirshBlockCommit {
    binary: String,
    timeout: Duration,
}

impl VirshBlockCommit {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

fn commit_args(req: &BlockCommit<'_>) -> Vec<String> {
    let mut args = vec![
        "blockcommit".to_string(),
        req.vm_name.to_string(),
        req.disk_label.to_string(),
        "--base".to_string(),
        req.base_path.to_string(),
        "--active".to_string(),
        "--wait".to_string(),
    ];
    if req.delete_overlay {
        args.push("--delete".into());
    }
    args.push("--pivot".into());
    args
}

impl MergeTool for VirshBlockCommit {
    fn block_commit(&self, req: &BlockCommit<'_>) -> VmstorResult<()> {
        tracing::debug!(
            vm = %req.vm_name,
            disk = %req.disk_label,
            base = %req.base_path,
            delete = req.delete_overlay,
            "Committing overlay"
        );
        run_tool(&self.binary, &commit_args(req), self.timeout)?.into_result(&self.binary)?;
        Ok(())
    }
}
