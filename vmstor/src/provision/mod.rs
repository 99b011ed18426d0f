//! Volume provisioning: new disks, template clones, copies and template export.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use vmstor_shared::command::ResultObject;
use vmstor_shared::descriptor::{
    CloneType, DataStore, ImageFormat, MigrationOptions, ScopeType, StoragePoolType,
    TemplateDescriptor, VolumeDescriptor,
};
use vmstor_shared::errors::{VmstorError, VmstorResult};

use crate::format::FormatNegotiator;
use crate::options::StorageOptions;
use crate::pool::{
    ConnectedPath, CopyDisk, DiskFromTemplate, MountedStore, NewDisk, PhysicalDisk, StoragePool,
};
use crate::tools::Collaborators;

mod copy;
mod template;

/// Budget for duplicating a linked-clone template into the destination pool.
const TEMPLATE_COPY_TIMEOUT: Duration = Duration::from_secs(10_000);

/// Marker of a legacy template path that embeds the pool mount point.
const LEGACY_MOUNT_PREFIX: &str = "/mnt";

pub struct VolumeProvisioner {
    collab: Collaborators,
    options: Arc<StorageOptions>,
    create_template_script: PathBuf,
}

/// Answer object for a disk that now backs `volume`.
pub fn volume_result(disk: &PhysicalDisk, size: u64) -> ResultObject {
    ResultObject {
        path: disk.name.clone(),
        name: None,
        format: Some(disk.format),
        size: Some(size),
        physical_size: None,
        encrypt_format: disk.encrypt_format,
    }
}

impl VolumeProvisioner {
    pub fn new(collab: Collaborators, options: Arc<StorageOptions>, create_template_script: PathBuf) -> Self {
        Self {
            collab,
            options,
            create_template_script,
        }
    }

    pub fn create_volume(
        &self,
        volume: &VolumeDescriptor,
        migration: Option<&MigrationOptions>,
    ) -> VmstorResult<PhysicalDisk> {
        let pool_ref = volume.pool()?;
        let pool = self
            .collab
            .pools
            .storage_pool(pool_ref.pool_type, &pool_ref.uuid)?;
        let format = FormatNegotiator::resolve_format(volume.format, pool_ref.pool_type, volume.shareable);

        let disk = match migration {
            Some(migration) if migration.clone_type == CloneType::LinkedClone => {
                self.linked_clone(pool.clone(), volume, migration, format)?
            }
            Some(migration) => {
                tracing::debug!(
                    volume = %volume.uuid,
                    src_pool = %migration.src_pool_uuid,
                    size = volume.size,
                    format = %format,
                    "Creating empty stub disk for full clone"
                );
                self.new_disk(pool.as_ref(), volume, format)?
            }
            None => self.new_disk(pool.as_ref(), volume, format)?,
        };

        tracing::info!(volume = %volume.uuid, disk = %disk.name, format = %disk.format, "Created volume");
        Ok(disk)
    }

    fn new_disk(&self, pool: &dyn StoragePool, volume: &VolumeDescriptor, format: ImageFormat) -> VmstorResult<PhysicalDisk> {
        pool.create_physical_disk(&NewDisk {
            name: &volume.uuid,
            format,
            provisioning: volume.provisioning,
            size: volume.size,
            passphrase: volume.passphrase.as_ref(),
        })
    }

    fn linked_clone(
        &self,
        pool: Arc<dyn StoragePool>,
        volume: &VolumeDescriptor,
        migration: &MigrationOptions,
        format: ImageFormat,
    ) -> VmstorResult<PhysicalDisk> {
        let src_pool = match migration.scope {
            ScopeType::Host => pool.clone(),
            ScopeType::Cluster | ScopeType::Zone => self
                .collab
                .pools
                .storage_pool(migration.src_pool_type, &migration.src_pool_uuid)?,
        };
        let src_template = src_pool.physical_disk(&migration.src_backing_path)?;

        let template = if migration.copy_src_template {
            let copied = self.collab.pools.copy_physical_disk(&CopyDisk {
                src: &src_template,
                dest_name: &src_template.name,
                dest_pool: pool.as_ref(),
                timeout: TEMPLATE_COPY_TIMEOUT,
                src_secret: None,
                dest_secret: None,
                provisioning: None,
                dest_format: None,
            })?;
            tracing::debug!(template = %copied.path, "Duplicated template into destination pool");
            pool.physical_disk(&copied.path)?
        } else {
            pool.physical_disk(&migration.src_backing_path)?
        };

        self.collab
            .pools
            .create_disk_with_template_backing(&DiskFromTemplate {
                template: &template,
                name: &volume.uuid,
                format,
                provisioning: volume.provisioning,
                size: volume.size,
                dest_pool: pool.as_ref(),
                timeout: Duration::from_millis(migration.timeout_ms),
                passphrase: volume.passphrase.as_ref(),
            })
    }

    pub fn clone_volume_from_base_template(
        &self,
        template: &TemplateDescriptor,
        volume: &VolumeDescriptor,
    ) -> VmstorResult<PhysicalDisk> {
        let pool_ref = volume.pool()?;
        let manager = self.collab.pools.as_ref();
        let pool = manager.storage_pool(pool_ref.pool_type, &pool_ref.uuid)?;
        let caps = pool.info().capabilities();
        let timeout = self.options.command_timeout();

        let disk = if pool_ref.pool_type == StoragePoolType::Clvm {
            self.clone_from_secondary(template, volume, pool.as_ref())?
        } else if caps.physical_disk_copy {
            let dest_path = volume.managed_path().unwrap_or(&volume.uuid);

            let _template_conn = ConnectedPath::connect(
                manager,
                pool_ref.pool_type,
                &pool_ref.uuid,
                &template.path,
                &volume.details,
            )?;
            let base = pool.physical_disk(&template.path)?;
            let _dest_conn = ConnectedPath::connect(
                manager,
                pool_ref.pool_type,
                &pool_ref.uuid,
                dest_path,
                &volume.details,
            )?;

            manager.copy_physical_disk(&CopyDisk {
                src: &base,
                dest_name: dest_path,
                dest_pool: pool.as_ref(),
                timeout,
                src_secret: None,
                dest_secret: volume.passphrase.as_ref(),
                provisioning: Some(volume.provisioning),
                dest_format: None,
            })?
        } else {
            let template_path = normalize_template_path(&template.path);
            let base = pool.physical_disk(template_path)?;
            manager.create_disk_from_template(&DiskFromTemplate {
                template: &base,
                name: &volume.uuid,
                format: base.format,
                provisioning: volume.provisioning,
                size: volume.size,
                dest_pool: pool.as_ref(),
                timeout,
                passphrase: volume.passphrase.as_ref(),
            })?
        };

        tracing::info!(template = %template.uuid, volume = %volume.uuid, disk = %disk.name, "Cloned volume from template");
        Ok(disk)
    }

    /// Copy a template straight from secondary storage onto a clustered-block pool.
    fn clone_from_secondary(
        &self,
        template: &TemplateDescriptor,
        volume: &VolumeDescriptor,
        pool: &dyn StoragePool,
    ) -> VmstorResult<PhysicalDisk> {
        let DataStore::Secondary { url } = &template.store else {
            return Err(VmstorError::Validation(format!(
                "Template {} must live on secondary storage",
                template.uuid
            )));
        };
        let full = format!("{}/{}", url.trim_end_matches('/'), template.path);
        let (mount_point, name) = full.rsplit_once('/').unwrap_or((full.as_str(), ""));
        if name.is_empty() {
            return Err(VmstorError::Validation(format!(
                "Template path {} does not name a file",
                full
            )));
        }

        let store = MountedStore::mount(self.collab.pools.as_ref(), mount_point)?;
        let mut template_disk = store.pool().physical_disk(name)?;
        if volume.size > template_disk.size {
            tracing::debug!(size = volume.size, "Overriding template size with requested size");
            template_disk.size = volume.size;
            template_disk.virtual_size = volume.size;
        }

        self.collab.pools.copy_physical_disk(&CopyDisk {
            src: &template_disk,
            dest_name: &volume.uuid,
            dest_pool: pool,
            timeout: self.options.command_timeout(),
            src_secret: None,
            dest_secret: None,
            provisioning: None,
            dest_format: None,
        })
    }

    /// Succeeds when the disk is already gone.
    pub fn delete_volume(&self, volume: &VolumeDescriptor) -> VmstorResult<()> {
        let pool_ref = volume.pool()?;
        let pool = self
            .collab
            .pools
            .storage_pool(pool_ref.pool_type, &pool_ref.uuid)?;

        if let Err(e) = pool.physical_disk(&volume.path) {
            tracing::debug!(volume = %volume.uuid, path = %volume.path, error = %e, "Volume not found, nothing to delete");
            return Ok(());
        }

        pool.delete_physical_disk(&volume.path, volume.format)?;
        tracing::info!(volume = %volume.uuid, path = %volume.path, "Deleted volume");
        Ok(())
    }
}

/// Older template records carry the full mount path; only the last segment
/// names the disk in the pool.
fn normalize_template_path(path: &str) -> &str {
    if path.contains(LEGACY_MOUNT_PREFIX) {
        path.rsplit('/').next().unwrap_or(path)
    } else {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_template_path() {
        assert_eq!(
            normalize_template_path("/mnt/2fe8/9a1c-4e4b.qcow2"),
            "9a1c-4e4b.qcow2"
        );
        assert_eq!(normalize_template_path("9a1c-4e4b"), "9a1c-4e4b");
    }

    #[test]
    fn test_volume_result_uses_disk_name() {
        use vmstor_shared::descriptor::EncryptFormat;

        use crate::pool::PoolInfo;

        let disk = PhysicalDisk {
            name: "v-1.qcow2".into(),
            path: "/mnt/p1/v-1.qcow2".into(),
            pool: PoolInfo::new(StoragePoolType::NetworkFilesystem, "p1", "/mnt/p1"),
            format: ImageFormat::Qcow2,
            virtual_size: 1 << 30,
            size: 0,
            encrypt_format: Some(EncryptFormat::Luks),
            backing: None,
        };
        let result = volume_result(&disk, 2 << 30);
        assert_eq!(result.path, "v-1.qcow2");
        assert_eq!(result.size, Some(2 << 30));
        assert_eq!(result.encrypt_format, Some(EncryptFormat::Luks));
    }
}
