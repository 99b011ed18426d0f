use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use vmstor::hypervisor::{
    DeviceKind, DiskDef, Domain, DomainSnapshotSpec, DomainState, Hypervisor, LiveDisk,
};
use vmstor_shared::constants::libvirt::OPERATION_NOT_SUPPORTED;
use vmstor_shared::descriptor::DiskBus;
use vmstor_shared::errors::{VmstorError, VmstorResult};
use vmstor_shared::secret::Passphrase;

/// A hypervisor holding a fixed set of domains.
pub struct FakeHypervisor {
    domains: Mutex<HashMap<String, Arc<FakeDomain>>>,
    libvirt_version: AtomicU64,
    qemu_version: AtomicU64,
    secrets: Mutex<Vec<String>>,
    reject_secrets: AtomicBool,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self {
            domains: Mutex::new(HashMap::new()),
            libvirt_version: AtomicU64::new(8_000_000),
            qemu_version: AtomicU64::new(6_002_000),
            secrets: Mutex::new(Vec::new()),
            reject_secrets: AtomicBool::new(false),
        }
    }
}

impl FakeHypervisor {
    /// Register a running domain with no disks.
    pub fn add_domain(&self, name: &str) -> Arc<FakeDomain> {
        let domain = Arc::new(FakeDomain::new(name));
        self.domains.lock().insert(name.to_string(), domain.clone());
        domain
    }

    pub fn domain(&self, name: &str) -> Option<Arc<FakeDomain>> {
        self.domains.lock().get(name).cloned()
    }

    pub fn set_libvirt_version(&self, version: u64) {
        self.libvirt_version.store(version, Ordering::SeqCst);
    }

    pub fn set_qemu_version(&self, version: u64) {
        self.qemu_version.store(version, Ordering::SeqCst);
    }

    pub fn set_reject_secrets(&self, value: bool) {
        self.reject_secrets.store(value, Ordering::SeqCst);
    }

    /// Usage names of every secret defined so far.
    pub fn secrets(&self) -> Vec<String> {
        self.secrets.lock().clone()
    }
}

impl Hypervisor for FakeHypervisor {
    fn lookup_domain(&self, vm_name: &str) -> VmstorResult<Arc<dyn Domain>> {
        match self.domains.lock().get(vm_name) {
            Some(domain) => Ok(domain.clone()),
            None => Err(VmstorError::NotFound(format!("domain {} not found", vm_name))),
        }
    }

    fn libvirt_version(&self) -> VmstorResult<u64> {
        Ok(self.libvirt_version.load(Ordering::SeqCst))
    }

    fn qemu_version(&self) -> VmstorResult<u64> {
        Ok(self.qemu_version.load(Ordering::SeqCst))
    }

    fn define_volume_secret(&self, usage: &str, _passphrase: &Passphrase) -> VmstorResult<String> {
        if self.reject_secrets.load(Ordering::SeqCst) {
            return Err(VmstorError::Libvirt(format!("failed to define secret for {}", usage)));
        }
        let mut secrets = self.secrets.lock();
        secrets.push(usage.to_string());
        Ok(format!("secret-{}", secrets.len()))
    }
}

/// A domain whose live device list is edited by attach/detach calls.
///
/// A disk-only snapshot swaps the disk's live path to the overlay (and
/// creates the overlay file); [`crate::FakeMergeTool`] pivots it back.
pub struct FakeDomain {
    name: String,
    uuid: String,
    state: Mutex<DomainState>,
    disks: Mutex<Vec<LiveDisk>>,
    disk_only_unsupported: AtomicBool,
    ignore_detach: AtomicBool,
    reject_attach: AtomicBool,
    snapshots: Mutex<Vec<DomainSnapshotSpec>>,
    deleted_snapshots: Mutex<Vec<String>>,
    attached: Mutex<Vec<DiskDef>>,
    resumes: AtomicUsize,
    live_disk_reads: AtomicUsize,
    attach_hold: Mutex<Option<(Arc<Barrier>, Arc<Barrier>)>>,
}

impl FakeDomain {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            uuid: format!("{}-uuid", name),
            state: Mutex::new(DomainState::Running),
            disks: Mutex::new(Vec::new()),
            disk_only_unsupported: AtomicBool::new(false),
            ignore_detach: AtomicBool::new(false),
            reject_attach: AtomicBool::new(false),
            snapshots: Mutex::new(Vec::new()),
            deleted_snapshots: Mutex::new(Vec::new()),
            attached: Mutex::new(Vec::new()),
            resumes: AtomicUsize::new(0),
            live_disk_reads: AtomicUsize::new(0),
            attach_hold: Mutex::new(None),
        }
    }

    /// Put a disk on the live list as if it had been attached at boot.
    pub fn plug(&self, label: &str, path: &str, bus: DiskBus) {
        self.disks.lock().push(LiveDisk {
            label: label.to_string(),
            path: Some(path.to_string()),
            device: DeviceKind::Disk,
            bus,
        });
    }

    pub fn set_state(&self, state: DomainState) {
        *self.state.lock() = state;
    }

    /// Reject disk-only snapshots the way pre-1.x hypervisors do.
    pub fn set_disk_only_unsupported(&self, value: bool) {
        self.disk_only_unsupported.store(value, Ordering::SeqCst);
    }

    /// Accept detach requests but never remove the device.
    pub fn set_ignore_detach(&self, value: bool) {
        self.ignore_detach.store(value, Ordering::SeqCst);
    }

    pub fn set_reject_attach(&self, value: bool) {
        self.reject_attach.store(value, Ordering::SeqCst);
    }

    /// Source paths of the live disk devices, in list order.
    pub fn disk_paths(&self) -> Vec<String> {
        self.disks
            .lock()
            .iter()
            .filter(|d| d.device == DeviceKind::Disk)
            .filter_map(|d| d.path.clone())
            .collect()
    }

    pub fn disks(&self) -> Vec<LiveDisk> {
        self.disks.lock().clone()
    }

    pub fn snapshots(&self) -> Vec<DomainSnapshotSpec> {
        self.snapshots.lock().clone()
    }

    pub fn deleted_snapshots(&self) -> Vec<String> {
        self.deleted_snapshots.lock().clone()
    }

    /// Definitions passed to successful `attach_device` calls.
    pub fn attached(&self) -> Vec<DiskDef> {
        self.attached.lock().clone()
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    /// Number of `live_disks` calls so far.
    pub fn live_disk_reads(&self) -> usize {
        self.live_disk_reads.load(Ordering::SeqCst)
    }

    /// Make the next `attach_device` wait on `entered`, then block on
    /// `release` before it edits the device list.
    pub fn hold_next_attach(&self, entered: Arc<Barrier>, release: Arc<Barrier>) {
        *self.attach_hold.lock() = Some((entered, release));
    }

    /// Point the live entry `label` at `path`; returns the previous path.
    pub(crate) fn pivot(&self, label: &str, path: &str) -> Option<String> {
        let mut disks = self.disks.lock();
        let disk = disks.iter_mut().find(|d| d.label == label)?;
        disk.path.replace(path.to_string())
    }
}

impl Domain for FakeDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn uuid(&self) -> VmstorResult<String> {
        Ok(self.uuid.clone())
    }

    fn state(&self) -> VmstorResult<DomainState> {
        Ok(*self.state.lock())
    }

    fn live_disks(&self) -> VmstorResult<Vec<LiveDisk>> {
        self.live_disk_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.disks.lock().clone())
    }

    fn xml_desc(&self) -> VmstorResult<String> {
        Ok(format!("<domain><name>{}</name></domain>", self.name))
    }

    fn attach_device(&self, def: &DiskDef) -> VmstorResult<()> {
        let hold = self.attach_hold.lock().take();
        if let Some((entered, release)) = hold {
            entered.wait();
            release.wait();
        }
        if self.reject_attach.load(Ordering::SeqCst) {
            return Err(VmstorError::Libvirt(format!(
                "internal error: unable to execute QEMU command 'device_add' for {}",
                def.target_dev
            )));
        }
        self.disks.lock().push(LiveDisk {
            label: def.target_dev.clone(),
            path: Some(def.source_path().to_string()),
            device: DeviceKind::Disk,
            bus: def.bus,
        });
        self.attached.lock().push(def.clone());
        Ok(())
    }

    fn detach_device(&self, def: &DiskDef) -> VmstorResult<()> {
        if self.ignore_detach.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.disks.lock().retain(|d| d.label != def.target_dev);
        Ok(())
    }

    fn create_snapshot(&self, spec: &DomainSnapshotSpec) -> VmstorResult<()> {
        if let DomainSnapshotSpec::DiskOnly {
            disk_label,
            overlay_path,
            ..
        } = spec
        {
            if self.disk_only_unsupported.load(Ordering::SeqCst) {
                return Err(VmstorError::Libvirt(format!(
                    "{}: live disk snapshot not supported with this QEMU binary",
                    OPERATION_NOT_SUPPORTED
                )));
            }
            std::fs::write(overlay_path, b"")
                .map_err(|e| VmstorError::Libvirt(format!("cannot create overlay {}: {}", overlay_path, e)))?;
            self.pivot(disk_label, overlay_path);
        }
        self.snapshots.lock().push(spec.clone());
        Ok(())
    }

    fn delete_snapshot(&self, name: &str) -> VmstorResult<()> {
        self.deleted_snapshots.lock().push(name.to_string());
        Ok(())
    }

    fn resume(&self) -> VmstorResult<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = DomainState::Running;
        Ok(())
    }
}
