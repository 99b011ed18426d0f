use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use vmstor::pool::PoolInfo;
use vmstor::tools::{BlockCommit, ConvertRequest, DeviceMapper, ImageConverter, MergeTool, ScriptRunner};
use vmstor_shared::descriptor::ImageFormat;
use vmstor_shared::errors::{VmstorError, VmstorResult};

use crate::hypervisor::FakeHypervisor;
use crate::write_qcow2_stub;

/// One `convert` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertRecord {
    pub src: String,
    pub src_format: ImageFormat,
    pub dst: String,
    pub dst_format: ImageFormat,
    pub src_snapshot: Option<String>,
    pub src_secret: bool,
    pub force_share: bool,
}

/// Writes the destination file (a qcow2 stub for qcow2 output) and records
/// the request.
pub struct FakeConverter {
    calls: Mutex<Vec<ConvertRecord>>,
    fail: AtomicBool,
    virtual_size: AtomicU64,
}

impl Default for FakeConverter {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            virtual_size: AtomicU64::new(1 << 30),
        }
    }
}

impl FakeConverter {
    /// Fail after writing part of the destination, like an interrupted copy.
    pub fn set_fail(&self, value: bool) {
        self.fail.store(value, Ordering::SeqCst);
    }

    /// Virtual size stamped into qcow2 output.
    pub fn set_virtual_size(&self, bytes: u64) {
        self.virtual_size.store(bytes, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ConvertRecord> {
        self.calls.lock().clone()
    }
}

impl ImageConverter for FakeConverter {
    fn convert(&self, req: &ConvertRequest<'_>) -> VmstorResult<()> {
        self.calls.lock().push(ConvertRecord {
            src: req.src.path.clone(),
            src_format: req.src.format,
            dst: req.dst.path.clone(),
            dst_format: req.dst.format,
            src_snapshot: req.src_snapshot.map(str::to_string),
            src_secret: req.src_secret.is_some(),
            force_share: req.force_share,
        });

        let dst = Path::new(&req.dst.path);
        let written = match req.dst.format {
            ImageFormat::Qcow2 => write_qcow2_stub(dst, self.virtual_size.load(Ordering::SeqCst)),
            _ => std::fs::write(dst, b"raw"),
        };
        written.map_err(|e| VmstorError::ExternalTool(format!("qemu-img convert to {} failed: {}", req.dst.path, e)))?;

        if self.fail.load(Ordering::SeqCst) {
            return Err(VmstorError::ExternalTool(format!(
                "qemu-img convert to {} failed: No space left on device",
                req.dst.path
            )));
        }
        Ok(())
    }
}

/// One `block_commit` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub vm_name: String,
    pub disk_label: String,
    pub base_path: String,
    pub delete_overlay: bool,
}

/// Pivots the fake domain's disk back onto the base path and, when asked to,
/// deletes the overlay it was writing to.
pub struct FakeMergeTool {
    hypervisor: Arc<FakeHypervisor>,
    calls: Mutex<Vec<CommitRecord>>,
    fail: AtomicBool,
}

impl FakeMergeTool {
    pub fn new(hypervisor: Arc<FakeHypervisor>) -> Self {
        Self {
            hypervisor,
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_fail(&self, value: bool) {
        self.fail.store(value, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<CommitRecord> {
        self.calls.lock().clone()
    }
}

impl MergeTool for FakeMergeTool {
    fn block_commit(&self, req: &BlockCommit<'_>) -> VmstorResult<()> {
        self.calls.lock().push(CommitRecord {
            vm_name: req.vm_name.to_string(),
            disk_label: req.disk_label.to_string(),
            base_path: req.base_path.to_string(),
            delete_overlay: req.delete_overlay,
        });
        if self.fail.load(Ordering::SeqCst) {
            return Err(VmstorError::ExternalTool(format!(
                "blockcommit of {} on {} failed",
                req.disk_label, req.vm_name
            )));
        }

        let domain = self
            .hypervisor
            .domain(req.vm_name)
            .ok_or_else(|| VmstorError::NotFound(format!("domain {} not found", req.vm_name)))?;
        let overlay = domain.pivot(req.disk_label, req.base_path);
        if req.delete_overlay {
            if let Some(overlay) = overlay.filter(|o| o != req.base_path) {
                let _ = std::fs::remove_file(overlay);
            }
        }
        Ok(())
    }
}

/// Records script invocations.
///
/// A call carrying `-t <dir> -n <file>` (the template export script) writes
/// a qcow2 stub at `<dir>/<file>`.
#[derive(Default)]
pub struct FakeScripts {
    calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
    fail: AtomicBool,
}

impl FakeScripts {
    pub fn set_fail(&self, value: bool) {
        self.fail.store(value, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.calls.lock().clone()
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

impl ScriptRunner for FakeScripts {
    fn run(&self, script: &Path, args: &[String], _timeout: Duration) -> VmstorResult<()> {
        self.calls.lock().push((script.to_path_buf(), args.to_vec()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(VmstorError::ExternalTool(format!(
                "{} exited with status 1",
                script.display()
            )));
        }
        if let (Some(dir), Some(file)) = (flag_value(args, "-t"), flag_value(args, "-n")) {
            write_qcow2_stub(&Path::new(dir).join(file), 1 << 30)
                .map_err(|e| VmstorError::ExternalTool(format!("{} failed: {}", script.display(), e)))?;
        }
        Ok(())
    }
}

/// Maps images to `/dev/rbd/<pool>/<image>`.
#[derive(Default)]
pub struct FakeMapper {
    mapped: Mutex<Vec<String>>,
    unmapped: Mutex<Vec<String>>,
}

impl FakeMapper {
    pub fn mapped(&self) -> Vec<String> {
        self.mapped.lock().clone()
    }

    pub fn unmapped(&self) -> Vec<String> {
        self.unmapped.lock().clone()
    }
}

impl DeviceMapper for FakeMapper {
    fn map(&self, pool: &PoolInfo, image: &str, _dedup: bool) -> VmstorResult<String> {
        self.mapped.lock().push(image.to_string());
        let name = image.rsplit('/').next().unwrap_or(image);
        Ok(format!("/dev/rbd/{}/{}", pool.source_dir, name))
    }

    fn unmap(&self, _pool: &PoolInfo, image: &str, _dedup: bool) -> VmstorResult<()> {
        self.unmapped.lock().push(image.to_string());
        Ok(())
    }
}
