//! External tool interfaces and their process-backed implementations.
//!
//! - `ImageConverter` - format-aware image copy (`qemu-img convert`)
//! - `MergeTool` - live overlay commit and pivot (`virsh blockcommit`)
//! - `ScriptRunner` - storage management scripts
//! - `ObjectStoreClient` / `ObjectStoreSession` - native object-store operations (`rbd`)
//! - `DeviceMapper` - host-side block device mapping of object-store images

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use vmstor_shared::descriptor::ImageFormat;
use vmstor_shared::errors::VmstorResult;
use vmstor_shared::secret::Passphrase;

use crate::hypervisor::{Hypervisor, VirshHypervisor};
use crate::options::StorageOptions;
use crate::pool::{PoolInfo, PoolManager};

mod qemu_img;
mod rbd;
mod script;
mod virsh;

pub use qemu_img::QemuImg;
pub use rbd::RbdCli;
pub use script::ShellScripts;
pub use virsh::VirshBlockCommit;

/// A file (or URI) together with the format it is read or written as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub path: String,
    pub format: ImageFormat,
}

impl ImageFile {
    pub fn new(path: impl Into<String>, format: ImageFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }
}

pub struct ConvertRequest<'a> {
    pub src: ImageFile,
    pub dst: ImageFile,
    /// Passphrase of an encrypted source.
    pub src_secret: Option<&'a Passphrase>,
    /// Read this internal snapshot of `src` instead of its active layer.
    pub src_snapshot: Option<&'a str>,
    /// Open the source without taking its write lock (it is in use by a VM).
    pub force_share: bool,
    pub timeout: Duration,
}

pub trait ImageConverter: Send + Sync {
    fn convert(&self, req: &ConvertRequest<'_>) -> VmstorResult<()>;
}

pub struct BlockCommit<'a> {
    pub vm_name: &'a str,
    pub disk_label: &'a str,
    pub base_path: &'a str,
    /// Let the tool delete the overlay once it is merged.
    pub delete_overlay: bool,
}

pub trait MergeTool: Send + Sync {
    /// Commit the active overlay of `disk_label` into `base_path` and pivot onto it.
    fn block_commit(&self, req: &BlockCommit<'_>) -> VmstorResult<()>;
}

pub trait ScriptRunner: Send + Sync {
    /// Run `script`; any non-zero exit is an `ExternalTool` error.
    fn run(&self, script: &Path, args: &[String], timeout: Duration) -> VmstorResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSnapshot {
    pub name: String,
    pub protected: bool,
}

/// Connected handle to one object-store pool. Image names are relative to it.
///
/// Failures are reported as `Backend` errors carrying the store's native code.
pub trait ObjectStoreSession: Send {
    fn snapshot_create(&self, image: &str, snapshot: &str) -> VmstorResult<()>;
    fn snapshot_list(&self, image: &str) -> VmstorResult<Vec<ObjectSnapshot>>;
    fn snapshot_protect(&self, image: &str, snapshot: &str) -> VmstorResult<()>;
    fn snapshot_unprotect(&self, image: &str, snapshot: &str) -> VmstorResult<()>;
    fn snapshot_remove(&self, image: &str, snapshot: &str) -> VmstorResult<()>;
    /// Copy-on-write clone of a protected snapshot into `dest_image`.
    fn clone_snapshot(&self, image: &str, snapshot: &str, dest_image: &str) -> VmstorResult<()>;
    /// Images cloned from `image@snapshot`.
    fn children(&self, image: &str, snapshot: &str) -> VmstorResult<Vec<String>>;
    fn flatten(&self, image: &str) -> VmstorResult<()>;
    fn resize(&self, image: &str, size: u64) -> VmstorResult<()>;
}

pub trait ObjectStoreClient: Send + Sync {
    fn connect(&self, pool: &PoolInfo) -> VmstorResult<Box<dyn ObjectStoreSession>>;
}

pub trait DeviceMapper: Send + Sync {
    /// Map `image` to a host block device and return its node path.
    fn map(&self, pool: &PoolInfo, image: &str, dedup: bool) -> VmstorResult<String>;
    fn unmap(&self, pool: &PoolInfo, image: &str, dedup: bool) -> VmstorResult<()>;
}

/// Every external collaborator the engine calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub pools: Arc<dyn PoolManager>,
    pub converter: Arc<dyn ImageConverter>,
    pub merge: Arc<dyn MergeTool>,
    pub scripts: Arc<dyn ScriptRunner>,
    pub object_store: Arc<dyn ObjectStoreClient>,
    pub mapper: Arc<dyn DeviceMapper>,
}

impl Collaborators {
    /// Process-backed tools configured from `options`; the pool manager is
    /// always supplied by the host agent.
    pub fn system(pools: Arc<dyn PoolManager>, options: &StorageOptions) -> Self {
        let timeout = options.command_timeout();
        let rbd = Arc::new(RbdCli::new(
            options.rbd_binary.clone(),
            timeout,
            Duration::from_secs(options.object_store_mount_timeout_secs),
        ));
        Self {
            hypervisor: Arc::new(VirshHypervisor::new(options.virsh_binary.clone(), timeout)),
            pools,
            converter: Arc::new(QemuImg::new(options.qemu_img_binary.clone())),
            merge: Arc::new(VirshBlockCommit::new(options.virsh_binary.clone(), timeout)),
            scripts: Arc::new(ShellScripts),
            object_store: rbd.clone(),
            mapper: rbd,
        }
    }
}
