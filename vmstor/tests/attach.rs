//! Integration tests for live disk attach and detach.
//!
//! Every test drives the facade against in-memory collaborators and
//! checks the domain's live device list afterwards.

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use vmstor::pool::{PhysicalDisk, PoolInfo, StoragePool};
use vmstor_shared::descriptor::{
    DataStore, DiskBus, ImageFormat, PoolRef, StoragePoolType, VolumeDescriptor,
};
use vmstor_shared::{Command, DiskAttachment, Passphrase};
use vmstor_test_utils::TestHost;

const GIB: u64 = 1024 * 1024 * 1024;

fn nfs_volume(uuid: &str, path: &str) -> VolumeDescriptor {
    let mut volume = VolumeDescriptor::new(
        uuid,
        DataStore::Primary(PoolRef::new(StoragePoolType::NetworkFilesystem, "nfs-1")),
    );
    volume.path = path.to_string();
    volume
}

fn attach(volume: VolumeDescriptor, device_id: u32) -> Command {
    attach_to("i-2-10-VM", volume, device_id)
}

fn attach_to(vm_name: &str, volume: VolumeDescriptor, device_id: u32) -> Command {
    Command::AttachVolume {
        attachment: DiskAttachment {
            volume,
            device_id,
            bus_hint: None,
        },
        vm_name: vm_name.to_string(),
    }
}

fn detach(volume: VolumeDescriptor, wait_timeout_ms: u64) -> Command {
    Command::DetachVolume {
        attachment: DiskAttachment {
            volume,
            device_id: 1,
            bus_hint: None,
        },
        vm_name: "i-2-10-VM".to_string(),
        wait_timeout_ms,
    }
}

fn path_set(paths: Vec<String>) -> BTreeSet<String> {
    paths.into_iter().collect()
}

#[test]
fn attach_then_detach_restores_device_list() {
    let host = TestHost::new();
    let pool = host.add_pool(StoragePoolType::NetworkFilesystem, "nfs-1");
    let root = pool.add_disk("root-1", ImageFormat::Qcow2, 8 * GIB);
    let data = pool.add_disk("data-1", ImageFormat::Qcow2, 4 * GIB);
    let domain = host.hypervisor.add_domain("i-2-10-VM");
    domain.plug("vda", &root.path, DiskBus::Virtio);
    let before = path_set(domain.disk_paths());

    let facade = host.facade();
    let answer = facade.handle(attach(nfs_volume("data-1", "data-1"), 1));
    assert!(answer.success, "attach failed: {:?}", answer.message);

    let attached = domain.disks();
    let entry = attached.iter().find(|d| d.path.as_deref() == Some(data.path.as_str())).unwrap();
    assert_eq!(entry.label, "vdb");
    assert_eq!(entry.bus, DiskBus::Virtio);

    let answer = facade.handle(detach(nfs_volume("data-1", "data-1"), 1000));
    assert!(answer.success, "detach failed: {:?}", answer.message);
    assert_eq!(path_set(domain.disk_paths()), before);

    let metrics = facade.metrics();
    assert_eq!(metrics.attaches_total(), 1);
    assert_eq!(metrics.detaches_total(), 1);
}

#[test]
fn attach_rejects_disk_already_on_domain() {
    let host = TestHost::new();
    let pool = host.add_pool(StoragePoolType::NetworkFilesystem, "nfs-1");
    let data = pool.add_disk("data-1", ImageFormat::Qcow2, 4 * GIB);
    let domain = host.hypervisor.add_domain("i-2-10-VM");
    domain.plug("vdb", &data.path, DiskBus::Virtio);

    let answer = host.facade().handle(attach(nfs_volume("data-1", "data-1"), 2));
    assert!(!answer.success);
    assert!(answer.message.unwrap().contains("device already allocated"));
    assert_eq!(domain.disk_paths(), vec![data.path]);
}

#[test]
fn detach_of_unattached_volume_is_noop() {
    let host = TestHost::new();
    let pool = host.add_pool(StoragePoolType::NetworkFilesystem, "nfs-1");
    let root = pool.add_disk("root-1", ImageFormat::Qcow2, 8 * GIB);
    pool.add_disk("data-1", ImageFormat::Qcow2, 4 * GIB);
    let domain = host.hypervisor.add_domain("i-2-10-VM");
    domain.plug("vda", &root.path, DiskBus::Virtio);

    let facade = host.facade();
    let answer = facade.handle(detach(nfs_volume("data-1", "data-1"), 1000));
    assert!(answer.success, "detach failed: {:?}", answer.message);
    assert_eq!(domain.disk_paths(), vec![root.path]);
    assert_eq!(facade.metrics().detaches_total(), 0);
}

#[test]
fn detach_of_volume_missing_from_pool_uses_descriptor() {
    let host = TestHost::new();
    host.add_pool(StoragePoolType::NetworkFilesystem, "nfs-1");
    host.hypervisor.add_domain("i-2-10-VM");

    let answer = host.facade().handle(detach(nfs_volume("gone-1", "gone-1"), 1000));
    assert!(answer.success, "detach failed: {:?}", answer.message);
}

#[test]
fn detach_times_out_when_device_stays() {
    let host = TestHost::new();
    let pool = host.add_pool(StoragePoolType::NetworkFilesystem, "nfs-1");
    let data = pool.add_disk("data-1", ImageFormat::Qcow2, 4 * GIB);
    let domain = host.hypervisor.add_domain("i-2-10-VM");
    domain.plug("vdb", &data.path, DiskBus::Virtio);
    domain.set_ignore_detach(true);

    let facade = host.facade();
    let answer = facade.handle(detach(nfs_volume("data-1", "data-1"), 50));
    assert!(!answer.success);
    let message = answer.message.unwrap();
    assert!(
        message.contains("Could not detach volume after 50 milliseconds from i-2-10-VM"),
        "unexpected message: {}",
        message
    );
    assert_eq!(domain.disk_paths(), vec![data.path]);
    assert_eq!(facade.metrics().detach_timeouts_total(), 1);
}

#[test]
fn zero_wait_uses_configured_default() {
    let host = TestHost::new();
    let pool = host.add_pool(StoragePoolType::NetworkFilesystem, "nfs-1");
    let data = pool.add_disk("data-1", ImageFormat::Qcow2, 4 * GIB);
    let domain = host.hypervisor.add_domain("i-2-10-VM");
    domain.plug("vdb", &data.path, DiskBus::Virtio);

    let answer = host.facade().handle(detach(nfs_volume("data-1", "data-1"), 0));
    assert!(answer.success, "detach failed: {:?}", answer.message);
    assert!(domain.disk_paths().is_empty());
}

#[test]
fn shareable_volume_is_attached_raw() {
    let host = TestHost::new();
    let pool = host.add_pool(StoragePoolType::NetworkFilesystem, "nfs-1");
    pool.add_disk("shared-1", ImageFormat::Raw, 10 * GIB);
    let domain = host.hypervisor.add_domain("i-2-10-VM");

    let mut volume = nfs_volume("7f0e-41c2", "shared-1");
    volume.shareable = true;
    let answer = host.facade().handle(attach(volume, 1));
    assert!(answer.success, "attach failed: {:?}", answer.message);

    let defs = domain.attached();
    assert_eq!(defs.len(), 1);
    let def = &defs[0];
    assert_eq!(def.format, ImageFormat::Raw);
    assert!(def.shareable);
    assert_eq!(def.serial.as_deref(), Some("shared1"));
    assert!(!def.discard_unmap);
}

#[test]
fn scsi_bus_is_reused_once_present() {
    let host = TestHost::new();
    let pool = host.add_pool(StoragePoolType::NetworkFilesystem, "nfs-1");
    let root = pool.add_disk("root-1", ImageFormat::Qcow2, 8 * GIB);
    pool.add_disk("data-1", ImageFormat::Qcow2, 4 * GIB);
    let domain = host.hypervisor.add_domain("i-2-10-VM");
    domain.plug("sda", &root.path, DiskBus::Scsi);

    let answer = host.facade().handle(attach(nfs_volume("data-1", "data-1"), 1));
    assert!(answer.success, "attach failed: {:?}", answer.message);

    let defs = domain.attached();
    let def = &defs[0];
    assert_eq!(def.bus, DiskBus::Scsi);
    assert_eq!(def.target_dev, "sdb");
    assert!(def.discard_unmap);
}

#[test]
fn encrypted_volume_gets_a_secret() {
    let host = TestHost::new();
    let pool = host.add_pool(StoragePoolType::NetworkFilesystem, "nfs-1");
    pool.add_disk("data-1", ImageFormat::Qcow2, 4 * GIB);
    let domain = host.hypervisor.add_domain("i-2-10-VM");

    let mut volume = nfs_volume("data-1", "data-1");
    volume.passphrase = Some(Passphrase::from("s3cret"));
    let answer = host.facade().handle(attach(volume, 1));
    assert!(answer.success, "attach failed: {:?}", answer.message);

    assert_eq!(host.hypervisor.secrets(), vec!["data-1"]);
    assert_eq!(domain.attached()[0].encryption_secret.as_deref(), Some("secret-1"));
}

fn managed_fixture(host: &TestHost) -> VolumeDescriptor {
    let pool = host.add_pool(StoragePoolType::Linstor, "linstor-1");
    pool.insert(PhysicalDisk {
        name: "drbd1000".to_string(),
        path: "/dev/drbd1000".to_string(),
        pool: pool.info().clone(),
        format: ImageFormat::Raw,
        virtual_size: 4 * GIB,
        size: 4 * GIB,
        encrypt_format: None,
        backing: None,
    });

    let mut pool_ref = PoolRef::new(StoragePoolType::Linstor, "linstor-1");
    pool_ref.managed = true;
    let mut volume = VolumeDescriptor::new("c4d2-9b1e", DataStore::Primary(pool_ref));
    volume.details.insert("path".into(), "/dev/drbd1000".into());
    volume
}

#[test]
fn managed_attach_keeps_connection_and_detach_releases_it() {
    let host = TestHost::new();
    let volume = managed_fixture(&host);
    let domain = host.hypervisor.add_domain("i-2-10-VM");

    let facade = host.facade();
    let answer = facade.handle(attach(volume.clone(), 1));
    assert!(answer.success, "attach failed: {:?}", answer.message);
    assert_eq!(host.pools.connected(), vec!["/dev/drbd1000"]);
    assert!(host.pools.disconnected().is_empty());
    assert_eq!(domain.disk_paths(), vec!["/dev/drbd1000"]);

    let answer = facade.handle(detach(volume, 1000));
    assert!(answer.success, "detach failed: {:?}", answer.message);
    assert_eq!(host.pools.disconnected(), vec!["/dev/drbd1000"]);
    assert!(domain.disk_paths().is_empty());
}

#[test]
fn failed_managed_attach_disconnects() {
    let host = TestHost::new();
    let volume = managed_fixture(&host);
    let domain = host.hypervisor.add_domain("i-2-10-VM");
    domain.set_reject_attach(true);

    let answer = host.facade().handle(attach(volume, 1));
    assert!(!answer.success);
    assert_eq!(host.pools.connected(), vec!["/dev/drbd1000"]);
    assert_eq!(host.pools.disconnected(), vec!["/dev/drbd1000"]);
    assert!(domain.disk_paths().is_empty());
}

#[test]
fn failed_connect_stops_attach() {
    let host = TestHost::new();
    let volume = managed_fixture(&host);
    let domain = host.hypervisor.add_domain("i-2-10-VM");
    host.pools.set_connect_fails(true);

    let answer = host.facade().handle(attach(volume, 1));
    assert!(!answer.success);
    assert!(domain.attached().is_empty());
}

fn rbd_fixture(host: &TestHost, mapped: Option<&str>) -> VolumeDescriptor {
    let mut info = PoolInfo::new(StoragePoolType::Rbd, "ceph-1", "/");
    info.source_dir = "cloudstack".into();
    info.source_host = "10.0.0.5".into();
    info.auth_user = Some("admin".into());
    let pool = host.add_pool_with(info);
    pool.add_disk("vol-1", ImageFormat::Raw, 4 * GIB);

    let mut pool_ref = PoolRef::new(StoragePoolType::Rbd, "ceph-1");
    pool_ref.mapped_device_dir = mapped.map(str::to_string);
    let mut volume = VolumeDescriptor::new("vol-1", DataStore::Primary(pool_ref));
    volume.path = "vol-1".into();
    volume
}

#[test]
fn object_store_volume_attaches_as_network_disk() {
    let host = TestHost::new();
    let volume = rbd_fixture(&host, None);
    let domain = host.hypervisor.add_domain("i-2-10-VM");

    let facade = host.facade();
    let answer = facade.handle(attach(volume.clone(), 1));
    assert!(answer.success, "attach failed: {:?}", answer.message);
    assert_eq!(domain.disk_paths(), vec!["cloudstack/vol-1"]);
    assert_eq!(domain.attached()[0].format, ImageFormat::Raw);
    assert!(domain.attached()[0].discard_unmap);

    let answer = facade.handle(detach(volume, 1000));
    assert!(answer.success, "detach failed: {:?}", answer.message);
    assert!(domain.disk_paths().is_empty());
    assert!(host.mapper.mapped().is_empty());
}

#[test]
fn old_qemu_gets_no_discard_on_virtio() {
    let host = TestHost::new();
    let volume = rbd_fixture(&host, None);
    let domain = host.hypervisor.add_domain("i-2-10-VM");
    host.hypervisor.set_qemu_version(2_012_000);

    let answer = host.facade().handle(attach(volume, 1));
    assert!(answer.success, "attach failed: {:?}", answer.message);
    let defs = domain.attached();
    assert_eq!(defs[0].bus, DiskBus::Virtio);
    assert!(!defs[0].discard_unmap);
}

#[test]
fn mapped_object_store_volume_is_unmapped_after_detach() {
    let host = TestHost::new();
    let volume = rbd_fixture(&host, Some("/dev/rbd"));
    let domain = host.hypervisor.add_domain("i-2-10-VM");

    let facade = host.facade();
    let answer = facade.handle(attach(volume.clone(), 1));
    assert!(answer.success, "attach failed: {:?}", answer.message);
    assert_eq!(domain.disk_paths(), vec!["/dev/rbd/cloudstack/vol-1"]);
    assert_eq!(host.mapper.mapped(), vec!["cloudstack/vol-1"]);

    let answer = facade.handle(detach(volume, 1000));
    assert!(answer.success, "detach failed: {:?}", answer.message);
    assert_eq!(host.mapper.unmapped(), vec!["cloudstack/vol-1"]);
    assert_eq!(host.mapper.mapped().len(), host.mapper.unmapped().len());
}

#[test]
fn already_attached_mapped_volume_releases_its_mapping() {
    let host = TestHost::new();
    let volume = rbd_fixture(&host, Some("/dev/rbd"));
    let domain = host.hypervisor.add_domain("i-2-10-VM");
    domain.plug("vdb", "/dev/rbd/cloudstack/vol-1", DiskBus::Virtio);

    let answer = host.facade().handle(attach(volume, 2));
    assert!(!answer.success);
    assert!(answer.message.unwrap().contains("device already allocated"));
    assert!(domain.attached().is_empty());
    assert_eq!(host.mapper.mapped(), vec!["cloudstack/vol-1"]);
    assert_eq!(host.mapper.unmapped(), vec!["cloudstack/vol-1"]);
}

#[test]
fn failed_secret_definition_releases_mapping() {
    let host = TestHost::new();
    let mut volume = rbd_fixture(&host, Some("/dev/rbd"));
    volume.passphrase = Some(Passphrase::from("s3cret"));
    let domain = host.hypervisor.add_domain("i-2-10-VM");
    host.hypervisor.set_reject_secrets(true);

    let answer = host.facade().handle(attach(volume, 1));
    assert!(!answer.success);
    assert!(domain.disk_paths().is_empty());
    assert_eq!(host.mapper.mapped(), vec!["cloudstack/vol-1"]);
    assert_eq!(host.mapper.unmapped(), vec!["cloudstack/vol-1"]);
}

#[test]
fn attach_to_unknown_vm_fails() {
    let host = TestHost::new();
    let pool = host.add_pool(StoragePoolType::NetworkFilesystem, "nfs-1");
    pool.add_disk("data-1", ImageFormat::Qcow2, 4 * GIB);

    let answer = host.facade().handle(attach(nfs_volume("data-1", "data-1"), 1));
    assert!(!answer.success);
    assert!(answer.message.unwrap().starts_with("not found:"));
}

// ============================================================================
// DEVICE LOCK
// ============================================================================

#[test]
fn attaches_to_different_vms_are_serialized() {
    let host = TestHost::new();
    let pool = host.add_pool(StoragePoolType::NetworkFilesystem, "nfs-1");
    pool.add_disk("data-1", ImageFormat::Qcow2, 4 * GIB);
    let data = pool.add_disk("data-2", ImageFormat::Qcow2, 4 * GIB);
    let first = host.hypervisor.add_domain("i-2-10-VM");
    let second = host.hypervisor.add_domain("i-3-20-VM");

    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    first.hold_next_attach(entered.clone(), release.clone());

    let facade = Arc::new(host.facade());
    let first_attach = {
        let facade = facade.clone();
        thread::spawn(move || facade.handle(attach(nfs_volume("data-1", "data-1"), 1)))
    };
    // The first attach is now inside attach_device with the lock held.
    entered.wait();

    let second_attach = {
        let facade = facade.clone();
        thread::spawn(move || facade.handle(attach_to("i-3-20-VM", nfs_volume("data-2", "data-2"), 1)))
    };
    thread::sleep(Duration::from_millis(100));
    assert_eq!(second.live_disk_reads(), 0);
    assert!(second.disk_paths().is_empty());

    release.wait();
    let answer = first_attach.join().unwrap();
    assert!(answer.success, "first attach failed: {:?}", answer.message);
    let answer = second_attach.join().unwrap();
    assert!(answer.success, "second attach failed: {:?}", answer.message);

    assert_eq!(second.live_disk_reads(), 1);
    assert_eq!(second.disk_paths(), vec![data.path]);
    assert_eq!(first.attached().len(), 1);
}
