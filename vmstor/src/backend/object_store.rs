use vmstor_shared::constants::object_store::DEFAULT_MON_PORT;
use vmstor_shared::descriptor::{ImageFormat, SnapshotStrategy};
use vmstor_shared::errors::VmstorResult;

use super::{DiskContext, PoolBackend, SnapshotRemoval};
use crate::hypervisor::{DiskSource, NetworkAuth, NetworkProtocol};
use crate::pool::PhysicalDisk;

/// Distributed object store (RBD).
///
/// Images are attached as network disks, or as host block devices when the
/// pool maps them through the kernel.
pub struct ObjectStoreBackend;

impl ObjectStoreBackend {
    fn mapped_source(&self, ctx: &DiskContext<'_>, dir: &str) -> VmstorResult<DiskSource> {
        let node = ctx.mapper.map(ctx.pool, &ctx.disk.path, ctx.volume.dedup)?;
        let dev = if ctx.volume.dedup {
            node
        } else {
            format!("{}/{}", dir.trim_end_matches('/'), ctx.disk.path)
        };
        Ok(DiskSource::Block { dev })
    }
}

impl PoolBackend for ObjectStoreBackend {
    fn attach_source(&self, ctx: &DiskContext<'_>) -> VmstorResult<DiskSource> {
        if let Some(dir) = ctx.mapped_device_dir() {
            return self.mapped_source(ctx, dir);
        }

        let port = if ctx.pool.source_port > 0 {
            ctx.pool.source_port
        } else {
            DEFAULT_MON_PORT
        };
        let auth = ctx.pool.auth_user.as_ref().map(|user| NetworkAuth {
            username: user.clone(),
            secret_uuid: ctx.pool.uuid.clone(),
        });
        Ok(DiskSource::Network {
            protocol: NetworkProtocol::Rbd,
            name: ctx.disk.path.clone(),
            hosts: vec![(ctx.pool.source_host.clone(), port)],
            auth,
        })
    }

    /// Only deduplicated images need a mapping to learn their node; the
    /// rest sit at a fixed path under the mapped device directory.
    fn detach_source(&self, ctx: &DiskContext<'_>) -> VmstorResult<DiskSource> {
        match ctx.mapped_device_dir() {
            Some(_) if ctx.volume.dedup => self.attach_source(ctx),
            Some(dir) => Ok(DiskSource::Block {
                dev: format!("{}/{}", dir.trim_end_matches('/'), ctx.disk.path),
            }),
            None => self.attach_source(ctx),
        }
    }

    fn device_format(&self, _disk: &PhysicalDisk) -> ImageFormat {
        ImageFormat::Raw
    }

    fn matches_live(&self, live_path: &str, source: &DiskSource, ctx: &DiskContext<'_>) -> bool {
        if ctx.volume.dedup {
            let name = ctx.disk.name.replace('-', "");
            return live_path.contains(&name);
        }
        live_path == source.path()
    }

    fn release_source(&self, ctx: &DiskContext<'_>) -> VmstorResult<()> {
        if ctx.mapped_device_dir().is_some() {
            ctx.mapper.unmap(ctx.pool, &ctx.disk.path, ctx.volume.dedup)?;
        }
        Ok(())
    }

    fn offline_strategy(&self) -> SnapshotStrategy {
        SnapshotStrategy::NativeObjectStore
    }

    fn snapshot_removal(&self) -> SnapshotRemoval {
        SnapshotRemoval::NativeObjectStore
    }
}
