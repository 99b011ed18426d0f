use vmstor_shared::command::ResultObject;
use vmstor_shared::descriptor::{
    DataStore, EncryptFormat, ImageFormat, PoolRef, SnapshotDescriptor, StoragePoolType,
    VolumeDescriptor, VolumeType,
};
use vmstor_shared::errors::{VmstorError, VmstorResult};

use super::VolumeProvisioner;
use crate::pool::{ConnectedPath, CopyDisk, MountedStore, PhysicalDisk, PoolInfo, StoragePool};

impl VolumeProvisioner {
    /// Copy a volume between two primary pools.
    pub fn copy_volume(&self, src: &VolumeDescriptor, dst: &VolumeDescriptor) -> VmstorResult<ResultObject> {
        let manager = self.collab.pools.as_ref();
        let src_ref = src.pool()?;
        let dst_ref = dst.pool()?;
        tracing::debug!(
            src = %src.uuid,
            src_path = %src.path,
            src_pool = %src_ref.uuid,
            dst = %dst.uuid,
            dst_pool = %dst_ref.uuid,
            "Copying volume between primary pools"
        );

        let _src_conn = if src_ref.managed {
            Some(ConnectedPath::connect(
                manager,
                src_ref.pool_type,
                &src_ref.uuid,
                &src.path,
                &src.details,
            )?)
        } else {
            None
        };

        let mut disk = manager.physical_disk(src_ref.pool_type, &src_ref.uuid, &src.path)?;
        if let Some(format) = src.format {
            disk.format = format;
        }
        let dest_format = dst.format.unwrap_or(disk.format);

        let (_dst_conn, dest_name) = if dst_ref.managed {
            let conn = ConnectedPath::connect(
                manager,
                dst_ref.pool_type,
                &dst_ref.uuid,
                &dst.path,
                &dst.details,
            )?;
            let name = dst.managed_path().unwrap_or(&dst.path).to_string();
            (Some(conn), name)
        } else {
            (None, dst.derived_file_name(dest_format))
        };

        let dest_pool = manager.storage_pool(dst_ref.pool_type, &dst_ref.uuid)?;
        let luks = src.is_encrypted() && matches!(src.volume_type, VolumeType::Root | VolumeType::DataDisk);
        let req = if luks {
            disk.encrypt_format = Some(EncryptFormat::Luks);
            CopyDisk {
                src: &disk,
                dest_name: &dest_name,
                dest_pool: dest_pool.as_ref(),
                timeout: self.options.command_timeout(),
                src_secret: src.passphrase.as_ref(),
                dest_secret: dst.passphrase.as_ref(),
                provisioning: Some(src.provisioning),
                dest_format: dst.format,
            }
        } else {
            CopyDisk {
                src: &disk,
                dest_name: &dest_name,
                dest_pool: dest_pool.as_ref(),
                timeout: self.options.command_timeout(),
                src_secret: None,
                dest_secret: None,
                provisioning: None,
                dest_format: dst.format,
            }
        };
        manager.copy_physical_disk(&req).map_err(|e| {
            VmstorError::Storage(format!(
                "Failed to copy volume {} to pool {}: {}",
                src.uuid, dst_ref.uuid, e
            ))
        })?;

        let path = if dst_ref.managed {
            dest_name
        } else {
            format!("{}/{}", dst.path.trim_end_matches('/'), dest_name)
        };
        tracing::info!(src = %src.uuid, dst = %dst.uuid, path = %path, "Copied volume");

        let mut result = ResultObject::at(path);
        result.format = Some(dest_format);
        result.encrypt_format = dst.encrypt_format;
        Ok(result)
    }

    pub fn create_volume_from_snapshot(
        &self,
        snapshot: &SnapshotDescriptor,
        dst: &VolumeDescriptor,
    ) -> VmstorResult<ResultObject> {
        let dst_ref = dst.pool()?;
        let (dir, name) = snapshot.split_path();

        let disk = match &snapshot.store {
            DataStore::Secondary { url } => self.from_secondary(url, dir, name, snapshot, dst, dst_ref)?,
            DataStore::Primary(src_ref) if src_ref.pool_type == StoragePoolType::Rbd => {
                if dst_ref.pool_type == StoragePoolType::Rbd {
                    self.object_store_clone(src_ref, name, snapshot, dst, dst_ref)?
                } else {
                    self.from_object_store_snapshot(src_ref, name, snapshot, dst, dst_ref)?
                }
            }
            DataStore::Primary(src_ref) if dst_ref.pool_type == StoragePoolType::SharedMountPoint => {
                self.from_shared_mount(src_ref, name, snapshot, dst, dst_ref)?
            }
            DataStore::Primary(src_ref) => {
                return Err(VmstorError::Unsupported(format!(
                    "Could not create volume from snapshot on {} pool into {} pool",
                    src_ref.pool_type, dst_ref.pool_type
                )));
            }
        };

        tracing::info!(snapshot = %snapshot.path, volume = %dst.uuid, disk = %disk.name, "Created volume from snapshot");
        let mut result = ResultObject::at(disk.name.clone());
        result.size = Some(disk.virtual_size);
        result.format = Some(disk.format);
        Ok(result)
    }

    fn from_secondary(
        &self,
        url: &str,
        dir: &str,
        name: &str,
        snapshot: &SnapshotDescriptor,
        dst: &VolumeDescriptor,
        dst_ref: &PoolRef,
    ) -> VmstorResult<PhysicalDisk> {
        let manager = self.collab.pools.as_ref();
        let store = MountedStore::mount(manager, &format!("{}/{}", url.trim_end_matches('/'), dir))?;
        let mut snapshot_disk = store.pool().physical_disk(name)?;
        if let Some(format @ (ImageFormat::Raw | ImageFormat::Qcow2)) = snapshot.volume.format {
            snapshot_disk.format = format;
        }
        let dest_pool = manager.storage_pool(dst_ref.pool_type, &dst_ref.uuid)?;
        self.copy_into(&snapshot_disk, dst, dst_ref, dest_pool.as_ref())
    }

    fn from_shared_mount(
        &self,
        src_ref: &PoolRef,
        name: &str,
        snapshot: &SnapshotDescriptor,
        dst: &VolumeDescriptor,
        dst_ref: &PoolRef,
    ) -> VmstorResult<PhysicalDisk> {
        let manager = self.collab.pools.as_ref();
        let src_pool = manager.storage_pool(src_ref.pool_type, &src_ref.uuid)?;
        let mut snapshot_disk = src_pool.physical_disk(name)?;
        if snapshot.volume.format == Some(ImageFormat::Qcow2) {
            snapshot_disk.format = ImageFormat::Qcow2;
        }
        let dest_pool = manager.storage_pool(dst_ref.pool_type, &dst_ref.uuid)?;
        self.copy_into(&snapshot_disk, dst, dst_ref, dest_pool.as_ref())
    }

    fn from_object_store_snapshot(
        &self,
        src_ref: &PoolRef,
        name: &str,
        snapshot: &SnapshotDescriptor,
        dst: &VolumeDescriptor,
        dst_ref: &PoolRef,
    ) -> VmstorResult<PhysicalDisk> {
        let manager = self.collab.pools.as_ref();
        let src_pool = manager.storage_pool(src_ref.pool_type, &src_ref.uuid)?;
        let mut snapshot_disk = src_pool.physical_disk(&snapshot.volume.path)?;
        snapshot_disk.path = format!("{}@{}", snapshot_disk.path, name);
        let dest_pool = manager.storage_pool(dst_ref.pool_type, &dst_ref.uuid)?;
        self.copy_into(&snapshot_disk, dst, dst_ref, dest_pool.as_ref())
    }

    /// Copy `src` into `dst`, connecting the destination path around the copy.
    fn copy_into(
        &self,
        src: &PhysicalDisk,
        dst: &VolumeDescriptor,
        dst_ref: &PoolRef,
        dest_pool: &dyn StoragePool,
    ) -> VmstorResult<PhysicalDisk> {
        let manager = self.collab.pools.as_ref();
        let target = destination_target(dst);
        let _conn = match target {
            Some(path) => Some(ConnectedPath::connect(
                manager,
                dst_ref.pool_type,
                &dst_ref.uuid,
                path,
                &dst.details,
            )?),
            None => None,
        };

        manager.copy_physical_disk(&CopyDisk {
            src,
            dest_name: target.unwrap_or(&dst.uuid),
            dest_pool,
            timeout: self.options.command_timeout(),
            src_secret: None,
            dest_secret: None,
            provisioning: None,
            dest_format: None,
        })
    }

    /// Native copy-on-write clone of an object-store snapshot.
    fn object_store_clone(
        &self,
        src_ref: &PoolRef,
        name: &str,
        snapshot: &SnapshotDescriptor,
        dst: &VolumeDescriptor,
        dst_ref: &PoolRef,
    ) -> VmstorResult<PhysicalDisk> {
        let manager = self.collab.pools.as_ref();
        let src_pool = manager.storage_pool(src_ref.pool_type, &src_ref.uuid)?;
        let source = src_pool.physical_disk(&snapshot.volume.path)?;
        let dest_pool = manager.storage_pool(dst_ref.pool_type, &dst_ref.uuid)?;

        let session = self.collab.object_store.connect(src_pool.info())?;
        let Some(found) = session
            .snapshot_list(&source.name)?
            .into_iter()
            .find(|s| s.name == name)
        else {
            return Err(VmstorError::NotFound(format!(
                "Could not find snapshot {} of {}",
                name, source.name
            )));
        };
        if !found.protected {
            session.snapshot_protect(&source.name, name)?;
        }

        tracing::debug!(image = %source.name, snapshot = %name, clone = %dst.uuid, "Cloning object-store snapshot");
        session.clone_snapshot(&source.name, name, &dst.uuid)?;

        let size = dst.size.max(source.virtual_size);
        if size > source.virtual_size {
            session.resize(&dst.uuid, size)?;
        }

        Ok(cloned_disk(dest_pool.info(), &dst.uuid, size))
    }
}

/// Path the destination volume is addressed by: its own path, then the
/// managed `path` / `iqn` detail.
fn destination_target(dst: &VolumeDescriptor) -> Option<&str> {
    if !dst.path.is_empty() {
        return Some(dst.path.as_str());
    }
    dst.managed_path()
}

fn cloned_disk(pool: &PoolInfo, name: &str, size: u64) -> PhysicalDisk {
    PhysicalDisk {
        name: name.to_string(),
        path: format!("{}/{}", pool.source_dir, name),
        pool: pool.clone(),
        format: ImageFormat::Raw,
        virtual_size: size,
        size,
        encrypt_format: None,
        backing: None,
    }
}
