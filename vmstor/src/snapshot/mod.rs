//! Snapshot creation, deletion and flattening.
//!
//! One of four algorithms is chosen per request:
//! - live external (running VM on a pool without its own snapshot mechanism)
//! - native object-store snapshot
//! - clustered-block management script
//! - direct file conversion into the snapshot directory

use std::path::PathBuf;
use std::sync::Arc;

use vmstor_shared::command::ResultObject;
use vmstor_shared::constants::snapshot::MIN_AVAILABLE_TO_DISK_RATIO;
use vmstor_shared::descriptor::{ImageFormat, SnapshotDescriptor, SnapshotStrategy};
use vmstor_shared::errors::{VmstorError, VmstorResult};

use crate::backend::{SnapshotRemoval, backend_for, select_snapshot_strategy};
use crate::hypervisor::{Domain, DomainState};
use crate::metrics::StorageMetricsStorage;
use crate::options::StorageOptions;
use crate::pool::{PhysicalDisk, StoragePool};
use crate::tools::{Collaborators, ConvertRequest, ImageFile};

mod artifact;
mod flatten;
mod live;

pub use artifact::PartialArtifact;
pub use flatten::FlattenOutcome;

pub struct SnapshotEngine {
    collab: Collaborators,
    options: Arc<StorageOptions>,
    manage_snapshot_script: PathBuf,
    metrics: StorageMetricsStorage,
}

/// Reject when the pool cannot hold another copy of the disk plus 5%.
///
/// Follows IEEE float division: a zero-sized disk always passes.
pub fn check_capacity(available: u64, disk_size: u64) -> VmstorResult<()> {
    let ratio = available as f64 / disk_size as f64;
    if ratio < MIN_AVAILABLE_TO_DISK_RATIO {
        return Err(VmstorError::Validation(format!(
            "Pool has {} bytes available for a {} byte disk; at least {:.2}x the disk size is required",
            available, disk_size, MIN_AVAILABLE_TO_DISK_RATIO
        )));
    }
    Ok(())
}

impl SnapshotEngine {
    pub fn new(
        collab: Collaborators,
        options: Arc<StorageOptions>,
        manage_snapshot_script: PathBuf,
        metrics: StorageMetricsStorage,
    ) -> Self {
        Self {
            collab,
            options,
            manage_snapshot_script,
            metrics,
        }
    }

    pub fn create_snapshot(&self, snapshot: &SnapshotDescriptor) -> VmstorResult<ResultObject> {
        let volume = &snapshot.volume;
        let pool_ref = volume.pool()?;
        let pool = self
            .collab
            .pools
            .storage_pool(pool_ref.pool_type, &pool_ref.uuid)?;
        let disk = pool.physical_disk(&volume.path)?;
        let name = snapshot
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // A VM that is not defined on this host leaves the disk offline.
        let domain = match volume.vm_name.as_deref() {
            Some(vm) => match self.collab.hypervisor.lookup_domain(vm) {
                Ok(d) => Some(d),
                Err(e) if e.is_not_found() => {
                    tracing::debug!(vm = %vm, volume = %volume.uuid, "VM not defined on this host, snapshotting offline");
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };
        let running = match &domain {
            Some(d) => match d.state() {
                Ok(state) => state == DomainState::Running,
                Err(e) => {
                    tracing::warn!(vm = %d.name(), error = %e, "Unable to read VM state, treating it as stopped");
                    false
                }
            },
            None => false,
        };

        if running && volume.is_encrypted() {
            return Err(VmstorError::Validation(format!(
                "Snapshots of encrypted volume {} are not supported while its VM is running",
                volume.uuid
            )));
        }

        let caps = pool.info().capabilities();
        let strategy = select_snapshot_strategy(pool_ref.pool_type, &caps, running);
        tracing::debug!(
            volume = %volume.uuid,
            snapshot = %name,
            pool_type = %pool_ref.pool_type,
            running,
            strategy = ?strategy,
            "Creating snapshot"
        );

        let mut result = match (strategy, &domain) {
            (SnapshotStrategy::LiveExternal, Some(domain)) => {
                check_capacity(pool.available()?, disk.virtual_size)?;
                let path = self.live_snapshot(domain.as_ref(), pool.as_ref(), &disk, volume, &name)?;
                file_result(path)
            }
            (SnapshotStrategy::LiveExternal, None) => {
                return Err(VmstorError::Internal(
                    "live snapshot selected without a domain".to_string(),
                ));
            }
            (SnapshotStrategy::NativeObjectStore, _) => {
                self.native_snapshot(pool.as_ref(), &disk, &name)?;
                ResultObject::at(format!("{}/{}", disk.path, name))
            }
            (SnapshotStrategy::ScriptManaged, _) => {
                self.script_snapshot(&disk, &name)?;
                ResultObject::at(format!("{}/{}", disk.path, name))
            }
            (SnapshotStrategy::DirectFileCopy, _) => {
                let path = self.direct_copy(pool.as_ref(), &disk, snapshot, &name, running)?;
                file_result(path)
            }
        };
        result.name = Some(name.clone());

        if let Some(domain) = &domain {
            resume_if_paused(domain.as_ref());
        }

        StorageMetricsStorage::incr(&self.metrics.snapshots_created);
        tracing::info!(volume = %volume.uuid, snapshot = %name, path = %result.path, strategy = ?strategy, "Created snapshot");
        Ok(result)
    }

    pub fn delete_snapshot(&self, snapshot: &SnapshotDescriptor) -> VmstorResult<()> {
        let pool_ref = snapshot.volume.pool()?;
        let backend = backend_for(pool_ref.pool_type);

        match backend.snapshot_removal() {
            SnapshotRemoval::NativeObjectStore => {
                let pool = self
                    .collab
                    .pools
                    .storage_pool(pool_ref.pool_type, &pool_ref.uuid)?;
                let (image, name) = object_snapshot_ref(snapshot);
                let session = self.collab.object_store.connect(pool.info())?;

                let protected = session
                    .snapshot_list(image)?
                    .iter()
                    .any(|s| s.name == name && s.protected);
                if protected {
                    tracing::debug!(image = %image, snapshot = %name, "Unprotecting snapshot");
                    session.snapshot_unprotect(image, name)?;
                }
                session.snapshot_remove(image, name)?;
                tracing::info!(image = %image, snapshot = %name, "Removed object-store snapshot");
                Ok(())
            }
            SnapshotRemoval::DeleteFile => {
                let path = std::path::Path::new(&snapshot.path);
                match std::fs::remove_file(path) {
                    Ok(()) => {
                        tracing::info!(path = %path.display(), "Deleted snapshot file");
                        Ok(())
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tracing::warn!(path = %path.display(), "Snapshot file already gone");
                        Ok(())
                    }
                    Err(e) => Err(VmstorError::Storage(format!(
                        "Failed to delete snapshot {}: {}",
                        path.display(),
                        e
                    ))),
                }
            }
            SnapshotRemoval::Unsupported => Err(VmstorError::Unsupported(format!(
                "Operation not implemented for storage pool type of {}",
                pool_ref.pool_type
            ))),
        }
    }

    fn native_snapshot(&self, pool: &dyn StoragePool, disk: &PhysicalDisk, name: &str) -> VmstorResult<()> {
        let session = self.collab.object_store.connect(pool.info())?;
        session.snapshot_create(&disk.path, name).inspect_err(|e| {
            // No rollback: the VM was never touched.
            tracing::error!(image = %disk.path, snapshot = %name, error = %e, "Object-store snapshot failed");
        })
    }

    fn script_snapshot(&self, disk: &PhysicalDisk, name: &str) -> VmstorResult<()> {
        let args = vec![
            "-c".to_string(),
            disk.path.clone(),
            "-n".to_string(),
            name.to_string(),
        ];
        self.collab
            .scripts
            .run(&self.manage_snapshot_script, &args, self.options.command_timeout())
    }

    fn direct_copy(
        &self,
        pool: &dyn StoragePool,
        disk: &PhysicalDisk,
        snapshot: &SnapshotDescriptor,
        name: &str,
        in_use: bool,
    ) -> VmstorResult<String> {
        let snapshot_dir = &self.options.snapshot_dir;
        let backend = backend_for(pool.info().pool_type);
        let dest = backend.direct_copy_path(pool.info(), snapshot_dir, &disk.name, name);
        pool.create_folder(snapshot_dir)?;

        let artifact = PartialArtifact::new(&dest);
        self.collab.converter.convert(&ConvertRequest {
            src: ImageFile::new(disk.path.clone(), disk.format),
            dst: ImageFile::new(dest.clone(), ImageFormat::Qcow2),
            src_secret: snapshot.volume.passphrase.as_ref(),
            src_snapshot: None,
            force_share: in_use,
            timeout: self.options.command_timeout(),
        })?;
        artifact.persist();
        Ok(dest)
    }
}

/// `(image, snapshot)` of an object-store snapshot descriptor.
fn object_snapshot_ref(snapshot: &SnapshotDescriptor) -> (&str, &str) {
    let (dir, base) = snapshot.split_path();
    let name = snapshot.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(base);
    let image = if dir.is_empty() {
        snapshot.volume.path.as_str()
    } else {
        dir
    };
    (image, name)
}

fn file_result(path: String) -> ResultObject {
    let mut result = ResultObject::at(path);
    result.format = Some(ImageFormat::Qcow2);
    result.physical_size = std::fs::metadata(&result.path).ok().map(|m| m.len());
    result
}

fn resume_if_paused(domain: &dyn Domain) {
    match domain.state() {
        Ok(DomainState::Paused) => {
            tracing::info!(vm = %domain.name(), "Resuming domain paused by snapshot");
            if let Err(e) = domain.resume() {
                tracing::warn!(vm = %domain.name(), error = %e, "Failed to resume domain");
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(vm = %domain.name(), error = %e, "Unable to read domain state"),
    }
}
