use vmstor_shared::constants::snapshot::NAME_SEPARATOR;
use vmstor_shared::errors::VmstorResult;

use super::{DiskContext, PoolBackend, SnapshotRemoval, format_based_source};
use crate::hypervisor::DiskSource;
use crate::pool::PoolInfo;

/// Local directory and NFS pools.
pub struct LocalFileBackend;

impl PoolBackend for LocalFileBackend {
    fn attach_source(&self, ctx: &DiskContext<'_>) -> VmstorResult<DiskSource> {
        Ok(format_based_source(ctx.disk))
    }

    fn snapshot_removal(&self) -> SnapshotRemoval {
        SnapshotRemoval::DeleteFile
    }
}

/// Operator-provided shared mount point. Snapshots sit next to the disks.
pub struct SharedMountBackend;

impl PoolBackend for SharedMountBackend {
    fn attach_source(&self, ctx: &DiskContext<'_>) -> VmstorResult<DiskSource> {
        Ok(format_based_source(ctx.disk))
    }

    fn direct_copy_path(&self, pool: &PoolInfo, _snapshot_dir: &str, disk_name: &str, snapshot: &str) -> String {
        format!(
            "{}/{}{}{}",
            pool.local_path.trim_end_matches('/'),
            disk_name,
            NAME_SEPARATOR,
            snapshot
        )
    }

    fn snapshot_removal(&self) -> SnapshotRemoval {
        SnapshotRemoval::DeleteFile
    }
}

/// Externally managed SAN-like stores (Linstor, iSCSI) reached through the
/// connect/disconnect handshake.
pub struct ManagedFileBackend;

impl PoolBackend for ManagedFileBackend {
    fn attach_source(&self, ctx: &DiskContext<'_>) -> VmstorResult<DiskSource> {
        Ok(format_based_source(ctx.disk))
    }
}
