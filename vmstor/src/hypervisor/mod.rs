//! Hypervisor collaborator interface.

use std::sync::Arc;

use vmstor_shared::descriptor::DiskBus;
use vmstor_shared::errors::VmstorResult;
use vmstor_shared::secret::Passphrase;

mod disk_def;
mod snapshot_xml;
mod virsh;

pub use disk_def::{DiskDef, DiskSource, NetworkAuth, NetworkProtocol, device_label};
pub use snapshot_xml::DomainSnapshotSpec;
pub use virsh::{VirshDomain, VirshHypervisor, parse_version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Paused,
    Shutoff,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Disk,
    Cdrom,
    Floppy,
    Lun,
}

/// One entry of a domain's live block device list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDisk {
    /// Target device label (`vda`, `sdb`).
    pub label: String,
    /// Source path; `None` for empty drives.
    pub path: Option<String>,
    pub device: DeviceKind,
    pub bus: DiskBus,
}

pub trait Domain: Send + Sync {
    fn name(&self) -> &str;

    fn uuid(&self) -> VmstorResult<String>;

    fn state(&self) -> VmstorResult<DomainState>;

    /// Current live block devices, re-read on every call.
    fn live_disks(&self) -> VmstorResult<Vec<LiveDisk>>;

    /// Live definition, used for diagnostics.
    fn xml_desc(&self) -> VmstorResult<String>;

    fn attach_device(&self, def: &DiskDef) -> VmstorResult<()>;

    fn detach_device(&self, def: &DiskDef) -> VmstorResult<()>;

    fn create_snapshot(&self, spec: &DomainSnapshotSpec) -> VmstorResult<()>;

    fn delete_snapshot(&self, name: &str) -> VmstorResult<()>;

    fn resume(&self) -> VmstorResult<()>;
}

pub trait Hypervisor: Send + Sync {
    /// Fails with `NotFound` for unknown VMs.
    fn lookup_domain(&self, vm_name: &str) -> VmstorResult<Arc<dyn Domain>>;

    /// `major * 1_000_000 + minor * 1_000 + micro`
    fn libvirt_version(&self) -> VmstorResult<u64>;

    /// Same encoding as [`Hypervisor::libvirt_version`].
    fn qemu_version(&self) -> VmstorResult<u64>;

    /// Register a volume encryption passphrase and return its secret UUID.
    fn define_volume_secret(&self, usage: &str, passphrase: &Passphrase) -> VmstorResult<String>;
}
