use vmstor_shared::constants::libvirt::SNAPSHOT_CREATE_DISK_ONLY;

use super::disk_def::escape;

/// A domain-level snapshot request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainSnapshotSpec {
    /// External snapshot of a single disk; every other disk is excluded.
    DiskOnly {
        name: String,
        disk_label: String,
        overlay_path: String,
        excluded_labels: Vec<String>,
    },
    /// Internal snapshot of the whole VM (memory and disks).
    FullVm { name: String, domain_uuid: String },
}

impl DomainSnapshotSpec {
    pub fn name(&self) -> &str {
        match self {
            DomainSnapshotSpec::DiskOnly { name, .. } => name,
            DomainSnapshotSpec::FullVm { name, .. } => name,
        }
    }

    /// Snapshot creation flags passed to the hypervisor.
    pub fn flags(&self) -> u32 {
        match self {
            DomainSnapshotSpec::DiskOnly { .. } => SNAPSHOT_CREATE_DISK_ONLY,
            DomainSnapshotSpec::FullVm { .. } => 0,
        }
    }

    pub fn is_disk_only(&self) -> bool {
        matches!(self, DomainSnapshotSpec::DiskOnly { .. })
    }

    pub fn to_xml(&self) -> String {
        match self {
            DomainSnapshotSpec::DiskOnly {
                name,
                disk_label,
                overlay_path,
                excluded_labels,
            } => {
                let excluded: String = excluded_labels
                    .iter()
                    .map(|label| format!("<disk name='{}' snapshot='no' />", escape(label)))
                    .collect();
                format!(
                    "<domainsnapshot><name>{}</name><disks><disk name='{}' snapshot='external'><source file='{}'/></disk>{}</disks></domainsnapshot>",
                    escape(name),
                    escape(disk_label),
                    escape(overlay_path),
                    excluded
                )
            }
            DomainSnapshotSpec::FullVm { name, domain_uuid } => format!(
                "<domainsnapshot><name>{}</name><domain><uuid>{}</uuid></domain></domainsnapshot>",
                escape(name),
                escape(domain_uuid)
            ),
        }
    }
}
