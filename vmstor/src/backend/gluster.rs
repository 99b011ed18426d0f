use vmstor_shared::errors::VmstorResult;

use super::{DiskContext, PoolBackend};
use crate::hypervisor::{DiskSource, NetworkProtocol};

/// Distributed filesystem reached over the network.
pub struct GlusterBackend;

impl GlusterBackend {
    /// `<volume>/<path relative to the local mount>`
    fn network_name(ctx: &DiskContext<'_>) -> String {
        let volume = ctx.pool.source_dir.replace('/', "");
        let relative = ctx.disk.path.replace(ctx.pool.local_path.as_str(), "");
        format!("{}{}", volume, relative)
    }
}

impl PoolBackend for GlusterBackend {
    fn attach_source(&self, ctx: &DiskContext<'_>) -> VmstorResult<DiskSource> {
        Ok(DiskSource::Network {
            protocol: NetworkProtocol::Gluster,
            name: Self::network_name(ctx),
            hosts: vec![(ctx.pool.source_host.clone(), ctx.pool.source_port)],
            auth: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use vmstor_shared::descriptor::{DataStore, ImageFormat, PoolRef, StoragePoolType, VolumeDescriptor};

    use super::*;
    use crate::backend::test_support::RecordingMapper;
    use crate::pool::{PhysicalDisk, PoolInfo};

    #[test]
    fn test_network_name_is_relative_to_volume() {
        let mut pool = PoolInfo::new(StoragePoolType::Gluster, "g1", "/mnt/g1");
        pool.source_dir = "/gv0".into();
        pool.source_host = "gluster-1".into();
        pool.source_port = 24007;
        let disk = PhysicalDisk {
            name: "vol.qcow2".into(),
            path: "/mnt/g1/vol.qcow2".into(),
            pool: pool.clone(),
            format: ImageFormat::Qcow2,
            virtual_size: 0,
            size: 0,
            encrypt_format: None,
            backing: None,
        };
        let volume = VolumeDescriptor::new(
            "vol",
            DataStore::Primary(PoolRef::new(StoragePoolType::Gluster, "g1")),
        );
        let mapper = RecordingMapper::default();
        let ctx = DiskContext {
            pool: &pool,
            disk: &disk,
            volume: &volume,
            mapper: &mapper,
        };

        let source = GlusterBackend.attach_source(&ctx).unwrap();
        assert_eq!(source.path(), "gv0/vol.qcow2");
        assert!(GlusterBackend.matches_live("gv0/vol.qcow2", &source, &ctx));
        assert!(!GlusterBackend.matches_live("/mnt/g1/vol.qcow2", &source, &ctx));
    }
}
