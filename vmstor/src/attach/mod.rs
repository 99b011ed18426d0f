//! Live disk attach and detach.
//!
//! Every edit of a domain's live device list happens under [`DEVICE_LOCK`],
//! a single host-wide mutex. The critical section spans reading the live
//! list, choosing the bus, building the definition, issuing the
//! attach/detach and, for detach, confirming removal.

use std::time::Duration;

use parking_lot::Mutex;
use vmstor_shared::command::DiskAttachment;
use vmstor_shared::constants::details;
use vmstor_shared::descriptor::{DiskBus, VolumeDescriptor};
use vmstor_shared::errors::{VmstorError, VmstorResult};

use crate::backend::{DiskContext, HeldSource, backend_for};
use crate::format::FormatNegotiator;
use crate::hypervisor::{DeviceKind, DiskDef, Domain, LiveDisk, device_label};
use crate::metrics::StorageMetricsStorage;
use crate::pool::{ConnectedPath, PhysicalDisk, StoragePool};
use crate::tools::Collaborators;
use crate::util::{BoundedPoll, CancelToken, PollOutcome};

mod decorate;

use decorate::{choose_bus, disk_serial, io_policy, wants_discard};

/// Serializes all live device list edits, for every VM on the host.
static DEVICE_LOCK: Mutex<()> = Mutex::new(());

pub struct DiskAttachmentController {
    collab: Collaborators,
    poll_interval: Duration,
    cancel: CancelToken,
    metrics: StorageMetricsStorage,
}

impl DiskAttachmentController {
    pub fn new(
        collab: Collaborators,
        poll_interval: Duration,
        cancel: CancelToken,
        metrics: StorageMetricsStorage,
    ) -> Self {
        Self {
            collab,
            poll_interval,
            cancel,
            metrics,
        }
    }

    /// Connect (if managed), decorate and hot-plug the volume into `vm_name`.
    ///
    /// A managed path connected here, and any host device mapped for the
    /// source, is released again if a later step fails.
    pub fn attach(&self, vm_name: &str, attachment: &DiskAttachment) -> VmstorResult<DiskDef> {
        let volume = &attachment.volume;
        let pool_ref = volume.pool()?;
        let pool = self
            .collab
            .pools
            .storage_pool(pool_ref.pool_type, &pool_ref.uuid)?;
        let name = disk_name(volume);

        let connected = if pool_ref.managed {
            Some(ConnectedPath::connect(
                self.collab.pools.as_ref(),
                pool_ref.pool_type,
                &pool_ref.uuid,
                name,
                &volume.details,
            )?)
        } else {
            None
        };

        let disk = pool.physical_disk(name)?;
        let backend = backend_for(pool_ref.pool_type);
        let ctx = DiskContext {
            pool: pool.info(),
            disk: &disk,
            volume,
            mapper: self.collab.mapper.as_ref(),
        };

        let def = {
            let _guard = DEVICE_LOCK.lock();

            let domain = self.collab.hypervisor.lookup_domain(vm_name)?;
            let live = domain.live_disks()?;
            let held = HeldSource::acquire(backend, &ctx)?;

            if live
                .iter()
                .any(|d| d.path.as_deref() == Some(held.source().path()))
            {
                return Err(VmstorError::Validation(format!(
                    "device already allocated: {} is already attached to {}",
                    held.source().path(),
                    vm_name
                )));
            }

            let bus = choose_bus(&live, attachment.bus_hint);
            let target = device_label(bus, attachment.device_id);
            let def = self.decorate(
                DiskDef::new(held.source().clone(), target, bus, backend.device_format(&disk)),
                &ctx,
            )?;

            tracing::debug!(vm = %vm_name, path = %def.source_path(), target = %def.target_dev, bus = %bus.as_str(), "Attaching disk");
            if let Err(e) = domain.attach_device(&def) {
                tracing::debug!(vm = %vm_name, xml = %def.to_xml(), error = %e, "Attach rejected");
                return Err(e);
            }
            held.keep();
            def
        };

        if let Some(connected) = connected {
            connected.keep();
        }
        StorageMetricsStorage::incr(&self.metrics.attaches);
        tracing::info!(vm = %vm_name, path = %def.source_path(), target = %def.target_dev, "Attached disk");
        Ok(def)
    }

    /// Hot-unplug the volume and wait until the domain no longer lists it.
    ///
    /// A volume that is not attached is treated as already detached.
    pub fn detach(&self, vm_name: &str, attachment: &DiskAttachment, wait_timeout_ms: u64) -> VmstorResult<()> {
        let volume = &attachment.volume;
        let pool_ref = volume.pool()?;
        let pool = self
            .collab
            .pools
            .storage_pool(pool_ref.pool_type, &pool_ref.uuid)?;
        let disk = resolve_disk(pool.as_ref(), volume)?;
        let backend = backend_for(pool_ref.pool_type);
        let ctx = DiskContext {
            pool: pool.info(),
            disk: &disk,
            volume,
            mapper: self.collab.mapper.as_ref(),
        };

        {
            let guard = DEVICE_LOCK.lock();

            let domain = self.collab.hypervisor.lookup_domain(vm_name)?;
            let source = backend.detach_source(&ctx)?;
            let live = domain.live_disks()?;

            let Some(current) = find_live(&live, |p| backend.matches_live(p, &source, &ctx)) else {
                tracing::warn!(vm = %vm_name, path = %source.path(), "Disk not attached, nothing to detach");
                drop(guard);
                backend.release_source(&ctx)?;
                self.disconnect_managed(volume, &disk.path);
                return Ok(());
            };

            let mut def = DiskDef::new(source.clone(), current.label.clone(), current.bus, backend.device_format(&disk));
            def.serial = Some(disk_serial(volume));

            tracing::debug!(vm = %vm_name, path = %source.path(), target = %current.label, "Detaching disk");
            domain.detach_device(&def)?;
            self.confirm_detached(domain.as_ref(), wait_timeout_ms, |p| backend.matches_live(p, &source, &ctx))?;
        }

        backend.release_source(&ctx)?;
        self.disconnect_managed(volume, &disk.path);

        StorageMetricsStorage::incr(&self.metrics.detaches);
        tracing::info!(vm = %vm_name, path = %disk.path, "Detached disk");
        Ok(())
    }

    fn confirm_detached<F>(&self, domain: &dyn Domain, wait_timeout_ms: u64, matches: F) -> VmstorResult<()>
    where
        F: Fn(&str) -> bool,
    {
        let poll = BoundedPoll::new(self.poll_interval, Duration::from_millis(wait_timeout_ms))
            .with_cancel(self.cancel.clone());
        let outcome = poll.run(|| Ok(find_live(&domain.live_disks()?, &matches).is_none()))?;

        match outcome {
            PollOutcome::Done => Ok(()),
            PollOutcome::TimedOut => {
                StorageMetricsStorage::incr(&self.metrics.detach_timeouts);
                if let Ok(xml) = domain.xml_desc() {
                    tracing::debug!(vm = %domain.name(), xml = %xml, "Live definition after detach timeout");
                }
                Err(VmstorError::Timeout(format!(
                    "Could not detach volume after {} milliseconds from {}",
                    wait_timeout_ms,
                    domain.name()
                )))
            }
        }
    }

    fn decorate(&self, mut def: DiskDef, ctx: &DiskContext<'_>) -> VmstorResult<DiskDef> {
        let volume = ctx.volume;
        let caps = ctx.pool.capabilities();

        def.format = FormatNegotiator::resolve_format(Some(def.format), ctx.pool.pool_type, volume.shareable);
        def.shareable = volume.shareable;
        def.dedup = volume.dedup;
        def.serial = Some(disk_serial(volume));
        def.cache_mode = volume.cache_mode;
        def.io_limits = volume.io_limits;
        def.io_policy = io_policy(volume.details.get(details::IO_POLICY).map(String::as_str));
        def.logical_block_size = ctx.pool.logical_block_size.filter(|s| *s > 0);
        def.physical_block_size = ctx.pool.physical_block_size.filter(|s| *s > 0);

        let hypervisor = &self.collab.hypervisor;
        def.discard_unmap = wants_discard(def.bus, caps.discard_safe, def.format, || {
            hypervisor.qemu_version().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Unable to read QEMU version, assuming discard is unsafe");
                0
            })
        });

        if let Some(passphrase) = volume.passphrase.as_ref().filter(|p| !p.is_empty()) {
            def.encryption_secret = Some(hypervisor.define_volume_secret(&volume.uuid, passphrase)?);
        }
        Ok(def)
    }

    fn disconnect_managed(&self, volume: &VolumeDescriptor, path: &str) {
        let Some(pool_ref) = volume.store.primary().filter(|p| p.managed) else {
            return;
        };
        let path = volume.managed_path().unwrap_or(path);
        match self
            .collab
            .pools
            .disconnect_physical_disk(pool_ref.pool_type, &pool_ref.uuid, path)
        {
            Ok(true) => tracing::debug!(path = %path, "Disconnected physical disk"),
            Ok(false) => tracing::warn!(path = %path, "Pool manager reported disconnect failure"),
            Err(e) => tracing::warn!(path = %path, error = %e, "Failed to disconnect physical disk"),
        }
    }
}

/// Name the pool knows the volume by: managed path, else the volume path.
fn disk_name(volume: &VolumeDescriptor) -> &str {
    match volume.store.primary() {
        Some(pool) if pool.managed => volume.managed_path().unwrap_or(&volume.path),
        _ => &volume.path,
    }
}

/// The pool's view of the disk, or one reconstructed from the descriptor
/// when the pool no longer lists it.
fn resolve_disk(pool: &dyn StoragePool, volume: &VolumeDescriptor) -> VmstorResult<PhysicalDisk> {
    let name = disk_name(volume);
    match pool.physical_disk(name) {
        Ok(disk) => Ok(disk),
        Err(e) if e.is_not_found() => {
            tracing::debug!(path = %name, "Disk not listed by pool, using descriptor");
            let info = pool.info().clone();
            Ok(PhysicalDisk {
                name: name.rsplit('/').next().unwrap_or(name).to_string(),
                path: name.to_string(),
                format: volume
                    .format
                    .unwrap_or_else(|| FormatNegotiator::default_format(info.pool_type)),
                pool: info,
                virtual_size: volume.size,
                size: 0,
                encrypt_format: volume.encrypt_format,
                backing: None,
            })
        }
        Err(e) => Err(e),
    }
}

fn find_live<F>(live: &[LiveDisk], matches: F) -> Option<&LiveDisk>
where
    F: Fn(&str) -> bool,
{
    live.iter().find(|d| {
        d.device == DeviceKind::Disk && d.path.as_deref().is_some_and(|p| !p.is_empty() && matches(p))
    })
}

/// Labels of every other disk on the domain, used to exclude them from a
/// disk-only snapshot.
pub(crate) fn other_disk_labels(live: &[LiveDisk], label: &str) -> Vec<String> {
    live.iter()
        .filter(|d| d.device == DeviceKind::Disk && d.label != label)
        .map(|d| d.label.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(label: &str, path: Option<&str>, device: DeviceKind) -> LiveDisk {
        LiveDisk {
            label: label.into(),
            path: path.map(str::to_string),
            device,
            bus: DiskBus::Virtio,
        }
    }

    #[test]
    fn test_find_live_skips_empty_and_non_disk() {
        let devices = [
            live("hdc", Some("/iso/tools.iso"), DeviceKind::Cdrom),
            live("vda", Some(""), DeviceKind::Disk),
            live("vdb", Some("/mnt/p1/data"), DeviceKind::Disk),
            live("vdc", None, DeviceKind::Disk),
        ];
        assert_eq!(find_live(&devices, |p| p == "/mnt/p1/data").unwrap().label, "vdb");
        assert!(find_live(&devices, |p| p == "/iso/tools.iso").is_none());
        assert!(find_live(&devices, |p| p.is_empty()).is_none());
    }

    #[test]
    fn test_other_disk_labels() {
        let devices = [
            live("vda", Some("/a"), DeviceKind::Disk),
            live("vdb", Some("/b"), DeviceKind::Disk),
            live("hdc", None, DeviceKind::Cdrom),
        ];
        assert_eq!(other_disk_labels(&devices, "vdb"), vec!["vda"]);
    }
}
