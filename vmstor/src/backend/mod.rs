//! Per-pool-type strategy table.
//!
//! Each storage pool type maps to exactly one [`PoolBackend`]. Components ask
//! the backend how to describe a disk to the hypervisor, how to recognise it
//! in the live device list, and which snapshot algorithms apply, instead of
//! branching on the pool type themselves.

use vmstor_shared::constants::snapshot::NAME_SEPARATOR;
use vmstor_shared::descriptor::{ImageFormat, SnapshotStrategy, StoragePoolType, VolumeDescriptor};
use vmstor_shared::errors::VmstorResult;

use crate::format::PoolCapabilities;
use crate::hypervisor::DiskSource;
use crate::pool::{PhysicalDisk, PoolInfo};
use crate::tools::DeviceMapper;

mod block;
mod file;
mod gluster;
mod object_store;

pub use block::{ClusteredBlockBackend, ManagedBlockBackend};
pub use file::{LocalFileBackend, ManagedFileBackend, SharedMountBackend};
pub use gluster::GlusterBackend;
pub use object_store::ObjectStoreBackend;

/// Everything a backend needs to describe one disk.
pub struct DiskContext<'a> {
    pub pool: &'a PoolInfo,
    pub disk: &'a PhysicalDisk,
    pub volume: &'a VolumeDescriptor,
    pub mapper: &'a dyn DeviceMapper,
}

impl DiskContext<'_> {
    /// Directory of kernel-mapped object-store images, when the pool uses them.
    pub fn mapped_device_dir(&self) -> Option<&str> {
        self.volume
            .store
            .primary()
            .and_then(|p| p.mapped_device_dir.as_deref())
    }
}

/// How a snapshot artifact is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotRemoval {
    /// Unprotect (if needed) and remove the object-store snapshot.
    NativeObjectStore,
    /// Delete the snapshot file.
    DeleteFile,
    Unsupported,
}

pub trait PoolBackend: Send + Sync {
    /// Source element for attaching `ctx.disk`. May map a host device.
    fn attach_source(&self, ctx: &DiskContext<'_>) -> VmstorResult<DiskSource>;

    /// Source element used to find and detach `ctx.disk`. Failing to resolve
    /// it is fatal to the detach.
    fn detach_source(&self, ctx: &DiskContext<'_>) -> VmstorResult<DiskSource> {
        self.attach_source(ctx)
    }

    /// Format the hypervisor should open the disk as.
    fn device_format(&self, disk: &PhysicalDisk) -> ImageFormat {
        disk.format
    }

    /// Whether a live device path refers to this disk.
    fn matches_live(&self, live_path: &str, source: &DiskSource, _ctx: &DiskContext<'_>) -> bool {
        live_path == source.path()
    }

    /// Undo host-side setup done by [`PoolBackend::attach_source`]. Runs once
    /// a detach is confirmed, or after a failed attach.
    fn release_source(&self, _ctx: &DiskContext<'_>) -> VmstorResult<()> {
        Ok(())
    }

    /// Strategy for a snapshot that cannot (or need not) be taken live.
    fn offline_strategy(&self) -> SnapshotStrategy {
        SnapshotStrategy::DirectFileCopy
    }

    /// Destination of a direct file copy snapshot.
    fn direct_copy_path(&self, pool: &PoolInfo, snapshot_dir: &str, disk_name: &str, snapshot: &str) -> String {
        format!(
            "{}/{}/{}{}{}",
            pool.local_path.trim_end_matches('/'),
            snapshot_dir,
            disk_name,
            NAME_SEPARATOR,
            snapshot
        )
    }

    fn snapshot_removal(&self) -> SnapshotRemoval {
        SnapshotRemoval::Unsupported
    }
}

static OBJECT_STORE: ObjectStoreBackend = ObjectStoreBackend;
static GLUSTER: GlusterBackend = GlusterBackend;
static MANAGED_BLOCK: ManagedBlockBackend = ManagedBlockBackend;
static CLUSTERED_BLOCK: ClusteredBlockBackend = ClusteredBlockBackend;
static LOCAL_FILE: LocalFileBackend = LocalFileBackend;
static SHARED_MOUNT: SharedMountBackend = SharedMountBackend;
static MANAGED_FILE: ManagedFileBackend = ManagedFileBackend;

pub fn backend_for(pool_type: StoragePoolType) -> &'static dyn PoolBackend {
    use StoragePoolType::*;

    match pool_type {
        Rbd => &OBJECT_STORE,
        Gluster => &GLUSTER,
        PowerFlex => &MANAGED_BLOCK,
        Clvm => &CLUSTERED_BLOCK,
        Filesystem | NetworkFilesystem => &LOCAL_FILE,
        SharedMountPoint => &SHARED_MOUNT,
        Linstor | Iscsi => &MANAGED_FILE,
    }
}

/// Running VMs on pools without their own snapshot mechanism get the live
/// external snapshot; everything else uses the backend's offline strategy.
pub fn select_snapshot_strategy(
    pool_type: StoragePoolType,
    caps: &PoolCapabilities,
    running: bool,
) -> SnapshotStrategy {
    if running && !caps.external_snapshot {
        SnapshotStrategy::LiveExternal
    } else {
        backend_for(pool_type).offline_strategy()
    }
}

/// File or block definition chosen from the disk's format.
fn format_based_source(disk: &PhysicalDisk) -> DiskSource {
    match disk.format {
        ImageFormat::Raw => DiskSource::Block {
            dev: disk.path.clone(),
        },
        ImageFormat::Qcow2 | ImageFormat::Dir => DiskSource::File {
            path: disk.path.clone(),
        },
    }
}

/// A source prepared by [`PoolBackend::attach_source`]. Released again on
/// drop unless [`HeldSource::keep`] is called.
pub struct HeldSource<'c, 'a> {
    backend: &'static dyn PoolBackend,
    ctx: &'c DiskContext<'a>,
    source: DiskSource,
    armed: bool,
}

impl<'c, 'a> HeldSource<'c, 'a> {
    pub fn acquire(backend: &'static dyn PoolBackend, ctx: &'c DiskContext<'a>) -> VmstorResult<Self> {
        let source = backend.attach_source(ctx)?;
        Ok(Self {
            backend,
            ctx,
            source,
            armed: true,
        })
    }

    pub fn source(&self) -> &DiskSource {
        &self.source
    }

    /// Leave the source in place (the device now uses it).
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for HeldSource<'_, '_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.backend.release_source(self.ctx) {
            tracing::warn!(path = %self.source.path(), error = %e, "Failed to release disk source");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatNegotiator;

    #[test]
    fn test_strategy_selection() {
        let cases = [
            (StoragePoolType::NetworkFilesystem, true, SnapshotStrategy::LiveExternal),
            (StoragePoolType::NetworkFilesystem, false, SnapshotStrategy::DirectFileCopy),
            (StoragePoolType::Rbd, true, SnapshotStrategy::NativeObjectStore),
            (StoragePoolType::Rbd, false, SnapshotStrategy::NativeObjectStore),
            (StoragePoolType::Clvm, true, SnapshotStrategy::ScriptManaged),
            (StoragePoolType::Clvm, false, SnapshotStrategy::ScriptManaged),
            (StoragePoolType::SharedMountPoint, true, SnapshotStrategy::DirectFileCopy),
            (StoragePoolType::Gluster, true, SnapshotStrategy::LiveExternal),
        ];
        for (pool_type, running, expected) in cases {
            let caps = FormatNegotiator::capabilities(pool_type);
            assert_eq!(
                select_snapshot_strategy(pool_type, &caps, running),
                expected,
                "{} running={}",
                pool_type,
                running
            );
        }
    }

    #[test]
    fn test_snapshot_removal_table() {
        use StoragePoolType::*;

        assert_eq!(backend_for(Rbd).snapshot_removal(), SnapshotRemoval::NativeObjectStore);
        for pool_type in [Filesystem, NetworkFilesystem, SharedMountPoint] {
            assert_eq!(backend_for(pool_type).snapshot_removal(), SnapshotRemoval::DeleteFile);
        }
        for pool_type in [Clvm, Gluster, PowerFlex, Linstor, Iscsi] {
            assert_eq!(backend_for(pool_type).snapshot_removal(), SnapshotRemoval::Unsupported);
        }
    }

    #[test]
    fn test_direct_copy_paths() {
        let nfs = PoolInfo::new(StoragePoolType::NetworkFilesystem, "p1", "/mnt/p1/");
        assert_eq!(
            backend_for(StoragePoolType::NetworkFilesystem).direct_copy_path(&nfs, "snapshots", "vol.qcow2", "s1"),
            "/mnt/p1/snapshots/vol.qcow2@s1"
        );

        let smp = PoolInfo::new(StoragePoolType::SharedMountPoint, "p2", "/shared");
        assert_eq!(
            backend_for(StoragePoolType::SharedMountPoint).direct_copy_path(&smp, "snapshots", "vol.qcow2", "s1"),
            "/shared/vol.qcow2@s1"
        );
    }
}
