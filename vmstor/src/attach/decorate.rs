//! Device definition decoration: bus choice, serial, discard and I/O policy.

use vmstor_shared::constants::attach::SERIAL_MAX_LEN;
use vmstor_shared::descriptor::{DiskBus, ImageFormat, VolumeDescriptor};

use crate::hypervisor::{DeviceKind, LiveDisk};

/// First QEMU release whose virtio-blk handles discard correctly.
pub(crate) const VIRTIO_DISCARD_MIN_QEMU: u64 = 4_000_000;

const IO_POLICIES: [&str; 3] = ["native", "threads", "io_uring"];

/// Reuse SCSI when any attached disk already sits on it; otherwise honour
/// the hint, defaulting to virtio.
pub(crate) fn choose_bus(live: &[LiveDisk], hint: Option<DiskBus>) -> DiskBus {
    let scsi_in_use = live
        .iter()
        .any(|d| d.device == DeviceKind::Disk && d.bus == DiskBus::Scsi);
    if scsi_in_use {
        DiskBus::Scsi
    } else {
        hint.unwrap_or_default()
    }
}

/// Guest-visible serial: UUID (or path for shareable volumes) without dashes.
pub(crate) fn disk_serial(volume: &VolumeDescriptor) -> String {
    let source = if volume.shareable && !volume.path.is_empty() {
        volume.path.as_str()
    } else {
        volume.uuid.as_str()
    };
    source
        .chars()
        .filter(|c| *c != '-')
        .take(SERIAL_MAX_LEN)
        .collect()
}

pub(crate) fn wants_discard(
    bus: DiskBus,
    discard_safe: bool,
    format: ImageFormat,
    qemu_version: impl FnOnce() -> u64,
) -> bool {
    if bus == DiskBus::Scsi {
        return true;
    }
    if !discard_safe || format != ImageFormat::Raw {
        return false;
    }
    bus != DiskBus::Virtio || qemu_version() >= VIRTIO_DISCARD_MIN_QEMU
}

/// `io.policy` detail, when it names a policy the hypervisor understands.
pub(crate) fn io_policy(raw: Option<&str>) -> Option<String> {
    let raw = raw?.trim().to_ascii_lowercase();
    if IO_POLICIES.contains(&raw.as_str()) {
        Some(raw)
    } else {
        tracing::warn!(policy = %raw, "Ignoring unknown io policy");
        None
    }
}
