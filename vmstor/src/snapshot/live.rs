//! Live external snapshot of one disk of a running VM.
//!
//! The disk is frozen behind a fresh overlay, the frozen base is converted
//! into the snapshot directory, and the overlay is committed back so the VM
//! ends up writing to the same file it started with.

use std::path::Path;

use vmstor_shared::constants::libvirt::BLOCKCOMMIT_DELETE_MIN_VERSION;
use vmstor_shared::descriptor::{ImageFormat, VolumeDescriptor};
use vmstor_shared::errors::{VmstorError, VmstorResult};

use super::{PartialArtifact, SnapshotEngine};
use crate::attach::other_disk_labels;
use crate::backend::{DiskContext, backend_for};
use crate::hypervisor::{DeviceKind, Domain, DomainSnapshotSpec};
use crate::metrics::StorageMetricsStorage;
use crate::pool::{PhysicalDisk, StoragePool};
use crate::tools::{BlockCommit, ConvertRequest, ImageFile};
use crate::util::replace_last_segment;

impl SnapshotEngine {
    /// Returns the path of the durable snapshot artifact.
    pub(super) fn live_snapshot(
        &self,
        domain: &dyn Domain,
        pool: &dyn StoragePool,
        disk: &PhysicalDisk,
        volume: &VolumeDescriptor,
        name: &str,
    ) -> VmstorResult<String> {
        let pool_info = pool.info();
        let backend = backend_for(pool_info.pool_type);
        let ctx = DiskContext {
            pool: pool_info,
            disk,
            volume,
            mapper: self.collab.mapper.as_ref(),
        };
        let source = backend.detach_source(&ctx)?;

        let live = domain.live_disks()?;
        let mut matches = live.iter().filter(|d| {
            d.device == DeviceKind::Disk
                && d.path
                    .as_deref()
                    .is_some_and(|p| backend.matches_live(p, &source, &ctx))
        });
        let (label, live_path) = match (matches.next(), matches.next()) {
            (Some(entry), None) => (
                entry.label.clone(),
                entry.path.clone().unwrap_or_else(|| disk.path.clone()),
            ),
            (None, _) => {
                return Err(VmstorError::Validation(format!(
                    "Disk {} is not attached to {}",
                    source.path(),
                    domain.name()
                )));
            }
            (Some(_), Some(_)) => {
                return Err(VmstorError::Validation(format!(
                    "Disk {} appears more than once on {}",
                    source.path(),
                    domain.name()
                )));
            }
        };

        let snapshot_dir = &self.options.snapshot_dir;
        pool.create_folder(snapshot_dir)?;
        let dest = format!(
            "{}/{}/{}",
            pool.info().local_path.trim_end_matches('/'),
            snapshot_dir,
            name
        );

        let overlay = replace_last_segment(&disk.path, name);
        let spec = DomainSnapshotSpec::DiskOnly {
            name: name.to_string(),
            disk_label: label.clone(),
            overlay_path: overlay.clone(),
            excluded_labels: other_disk_labels(&live, &label),
        };
        tracing::debug!(vm = %domain.name(), disk = %label, overlay = %overlay, "Taking disk-only snapshot");

        match domain.create_snapshot(&spec) {
            Ok(()) => {}
            Err(e) if e.is_operation_not_supported() => {
                tracing::warn!(vm = %domain.name(), error = %e, "Disk-only snapshot unsupported, falling back to full VM snapshot");
                StorageMetricsStorage::incr(&self.metrics.snapshot_fallbacks);
                return self.full_vm_snapshot(domain, disk, name, &dest);
            }
            Err(e) => return Err(e),
        }

        // The overlay must be merged back even when the copy failed.
        let artifact = PartialArtifact::new(&dest);
        let converted = self.collab.converter.convert(&ConvertRequest {
            src: ImageFile::new(disk.path.clone(), disk.format),
            dst: ImageFile::new(dest.clone(), ImageFormat::Qcow2),
            src_secret: None,
            src_snapshot: None,
            force_share: true,
            timeout: self.options.command_timeout(),
        });
        // Commit into the base as the hypervisor names it.
        let merged = self.merge_back(domain.name(), &label, &live_path, &overlay);

        converted?;
        merged?;
        artifact.persist();
        Ok(dest)
    }

    fn merge_back(&self, vm_name: &str, label: &str, base_path: &str, overlay: &str) -> VmstorResult<()> {
        let version = self.collab.hypervisor.libvirt_version().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Unable to read libvirt version");
            0
        });
        let delete_overlay = version >= BLOCKCOMMIT_DELETE_MIN_VERSION;

        self.collab.merge.block_commit(&BlockCommit {
            vm_name,
            disk_label: label,
            base_path,
            delete_overlay,
        })?;
        tracing::debug!(vm = %vm_name, disk = %label, base = %base_path, "Merged overlay back into base");

        if !delete_overlay {
            remove_overlay(overlay)?;
        }
        Ok(())
    }

    fn full_vm_snapshot(
        &self,
        domain: &dyn Domain,
        disk: &PhysicalDisk,
        name: &str,
        dest: &str,
    ) -> VmstorResult<String> {
        let spec = DomainSnapshotSpec::FullVm {
            name: name.to_string(),
            domain_uuid: domain.uuid()?,
        };
        domain.create_snapshot(&spec)?;

        let artifact = PartialArtifact::new(dest);
        let converted = self.collab.converter.convert(&ConvertRequest {
            src: ImageFile::new(disk.path.clone(), disk.format),
            dst: ImageFile::new(dest.to_string(), disk.format),
            src_secret: None,
            src_snapshot: Some(name),
            force_share: true,
            timeout: self.options.command_timeout(),
        });

        if let Err(e) = domain.delete_snapshot(name) {
            tracing::warn!(vm = %domain.name(), snapshot = %name, error = %e, "Failed to delete full VM snapshot");
        }

        converted?;
        artifact.persist();
        Ok(dest.to_string())
    }
}

/// Remove a merged overlay if it is still there.
fn remove_overlay(overlay: &str) -> VmstorResult<()> {
    let path = Path::new(overlay);
    if !path.exists() {
        return Ok(());
    }
    std::fs::remove_file(path).map_err(|e| {
        VmstorError::Storage(format!("Failed to remove overlay {}: {}", path.display(), e))
    })?;
    tracing::debug!(overlay = %path.display(), "Removed merged overlay");
    Ok(())
}
