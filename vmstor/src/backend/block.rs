use vmstor_shared::descriptor::{ImageFormat, SnapshotStrategy};
use vmstor_shared::errors::VmstorResult;

use super::{DiskContext, PoolBackend, format_based_source};
use crate::hypervisor::DiskSource;
use crate::pool::PhysicalDisk;

/// Block-addressable managed storage (PowerFlex).
pub struct ManagedBlockBackend;

impl PoolBackend for ManagedBlockBackend {
    fn attach_source(&self, ctx: &DiskContext<'_>) -> VmstorResult<DiskSource> {
        Ok(DiskSource::Block {
            dev: ctx.disk.path.clone(),
        })
    }

    fn device_format(&self, disk: &PhysicalDisk) -> ImageFormat {
        match disk.format {
            ImageFormat::Qcow2 => ImageFormat::Qcow2,
            _ => ImageFormat::Raw,
        }
    }
}

/// Clustered LVM. Snapshots are delegated to the management script.
pub struct ClusteredBlockBackend;

impl PoolBackend for ClusteredBlockBackend {
    fn attach_source(&self, ctx: &DiskContext<'_>) -> VmstorResult<DiskSource> {
        Ok(format_based_source(ctx.disk))
    }

    fn offline_strategy(&self) -> SnapshotStrategy {
        SnapshotStrategy::ScriptManaged
    }
}
