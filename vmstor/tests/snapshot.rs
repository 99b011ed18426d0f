//! Integration tests for snapshot creation, deletion and flattening.

use std::path::Path;

use vmstor::hypervisor::{DomainSnapshotSpec, DomainState};
use vmstor::pool::PoolInfo;
use vmstor_shared::descriptor::{
    DataStore, DiskBus, ImageFormat, PoolRef, SnapshotDescriptor, StoragePoolType, VolumeDescriptor,
};
use vmstor_shared::{Command, Passphrase};
use vmstor_test_utils::{FakeDomain, FakePool, TestHost};

const GIB: u64 = 1024 * 1024 * 1024;
const VM: &str = "i-2-10-VM";

// ============================================================================
// FIXTURES
// ============================================================================

/// NFS pool with one qcow2 root disk attached as `vda` to a running VM.
struct LiveFixture {
    host: TestHost,
    pool: std::sync::Arc<FakePool>,
    domain: std::sync::Arc<FakeDomain>,
    disk_path: String,
}

impl LiveFixture {
    fn new(virtual_size: u64) -> Self {
        let host = TestHost::new();
        let pool = host.add_pool(StoragePoolType::NetworkFilesystem, "nfs-1");
        let disk = pool.add_disk("root-1", ImageFormat::Qcow2, virtual_size);
        let domain = host.hypervisor.add_domain(VM);
        domain.plug("vda", &disk.path, DiskBus::Virtio);
        domain.plug("vdb", &format!("{}/data-9", host.mount_point("nfs-1")), DiskBus::Virtio);
        Self {
            host,
            pool,
            domain,
            disk_path: disk.path,
        }
    }

    fn snapshot(&self, name: Option<&str>) -> SnapshotDescriptor {
        let pool_ref = PoolRef::new(StoragePoolType::NetworkFilesystem, "nfs-1");
        let mut volume = VolumeDescriptor::new("root-1", DataStore::Primary(pool_ref.clone()));
        volume.path = "root-1".into();
        volume.vm_name = Some(VM.into());
        let mut snapshot = SnapshotDescriptor::new(volume, DataStore::Primary(pool_ref));
        snapshot.name = name.map(str::to_string);
        snapshot
    }

    fn snapshot_dir(&self) -> String {
        format!("{}/snapshots", self.host.mount_point("nfs-1"))
    }

    fn overlay(&self) -> String {
        format!("{}/snap-1", self.host.mount_point("nfs-1"))
    }
}

fn create(snapshot: SnapshotDescriptor) -> Command {
    Command::CreateSnapshot { snapshot }
}

fn dir_entries(dir: &str) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

// ============================================================================
// LIVE EXTERNAL SNAPSHOTS
// ============================================================================

#[test]
fn live_snapshot_returns_vm_to_original_disk() {
    let fx = LiveFixture::new(10 * GIB);

    let answer = fx.host.facade().handle(create(fx.snapshot(Some("snap-1"))));
    assert!(answer.success, "snapshot failed: {:?}", answer.message);

    let object = answer.object.unwrap();
    let expected = format!("{}/snap-1", fx.snapshot_dir());
    assert_eq!(object.path, expected);
    assert_eq!(object.name.as_deref(), Some("snap-1"));
    assert_eq!(object.format, Some(ImageFormat::Qcow2));
    assert!(Path::new(&expected).exists());

    assert_eq!(fx.domain.disk_paths()[0], fx.disk_path);
    assert!(!Path::new(&fx.overlay()).exists());

    let specs = fx.domain.snapshots();
    assert_eq!(specs.len(), 1);
    match &specs[0] {
        DomainSnapshotSpec::DiskOnly {
            disk_label,
            overlay_path,
            excluded_labels,
            ..
        } => {
            assert_eq!(disk_label, "vda");
            assert_eq!(overlay_path, &fx.overlay());
            assert_eq!(excluded_labels, &vec!["vdb".to_string()]);
        }
        other => panic!("expected disk-only snapshot, got {:?}", other),
    }

    let converts = fx.host.converter.calls();
    assert_eq!(converts.len(), 1);
    assert_eq!(converts[0].src, fx.disk_path);
    assert_eq!(converts[0].dst_format, ImageFormat::Qcow2);

    let commits = fx.host.merge.calls();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].base_path, fx.disk_path);
    assert!(commits[0].delete_overlay);
}

#[test]
fn old_hypervisor_overlay_is_removed_after_merge() {
    let fx = LiveFixture::new(10 * GIB);
    fx.host.hypervisor.set_libvirt_version(5_006_000);

    let answer = fx.host.facade().handle(create(fx.snapshot(Some("snap-1"))));
    assert!(answer.success, "snapshot failed: {:?}", answer.message);

    assert!(!fx.host.merge.calls()[0].delete_overlay);
    assert!(!Path::new(&fx.overlay()).exists());
    assert_eq!(fx.domain.disk_paths()[0], fx.disk_path);
}

#[test]
fn insufficient_capacity_is_rejected_before_any_snapshot() {
    let fx = LiveFixture::new(19 * GIB + GIB / 2);
    fx.pool.set_available(20 * GIB);

    let answer = fx.host.facade().handle(create(fx.snapshot(Some("snap-1"))));
    assert!(!answer.success);
    assert!(answer.message.unwrap().starts_with("validation error"));
    assert!(fx.domain.snapshots().is_empty());
    assert!(fx.host.converter.calls().is_empty());
    assert!(dir_entries(&fx.snapshot_dir()).is_empty());
}

#[test]
fn capacity_at_ratio_is_accepted() {
    let fx = LiveFixture::new(19 * GIB);
    fx.pool.set_available(20 * GIB);

    let answer = fx.host.facade().handle(create(fx.snapshot(Some("snap-1"))));
    assert!(answer.success, "snapshot failed: {:?}", answer.message);
}

#[test]
fn unsupported_disk_only_snapshot_falls_back_to_full_vm() {
    let fx = LiveFixture::new(10 * GIB);
    fx.domain.set_disk_only_unsupported(true);

    let facade = fx.host.facade();
    let answer = facade.handle(create(fx.snapshot(Some("snap-1"))));
    assert!(answer.success, "snapshot failed: {:?}", answer.message);

    assert_eq!(dir_entries(&fx.snapshot_dir()), vec!["snap-1"]);
    assert_eq!(fx.domain.deleted_snapshots(), vec!["snap-1"]);
    assert!(fx.host.merge.calls().is_empty());

    let specs = fx.domain.snapshots();
    assert_eq!(
        specs,
        vec![DomainSnapshotSpec::FullVm {
            name: "snap-1".into(),
            domain_uuid: format!("{}-uuid", VM),
        }]
    );

    let converts = fx.host.converter.calls();
    assert_eq!(converts.len(), 1);
    assert_eq!(converts[0].src_snapshot.as_deref(), Some("snap-1"));
    assert_eq!(converts[0].dst_format, ImageFormat::Qcow2);
    assert_eq!(facade.metrics().snapshot_fallbacks_total(), 1);
}

#[test]
fn failed_copy_still_merges_and_leaves_no_artifact() {
    let fx = LiveFixture::new(10 * GIB);
    fx.host.converter.set_fail(true);

    let answer = fx.host.facade().handle(create(fx.snapshot(Some("snap-1"))));
    assert!(!answer.success);
    assert!(answer.message.unwrap().contains("No space left on device"));

    assert_eq!(fx.host.merge.calls().len(), 1);
    assert_eq!(fx.domain.disk_paths()[0], fx.disk_path);
    assert!(dir_entries(&fx.snapshot_dir()).is_empty());
}

#[test]
fn failed_merge_fails_the_snapshot() {
    let fx = LiveFixture::new(10 * GIB);
    fx.host.merge.set_fail(true);

    let answer = fx.host.facade().handle(create(fx.snapshot(Some("snap-1"))));
    assert!(!answer.success);
    assert!(dir_entries(&fx.snapshot_dir()).is_empty());
}

#[test]
fn encrypted_volume_on_running_vm_is_rejected() {
    let fx = LiveFixture::new(10 * GIB);
    let mut snapshot = fx.snapshot(Some("snap-1"));
    snapshot.volume.passphrase = Some(Passphrase::from("s3cret"));

    let answer = fx.host.facade().handle(create(snapshot));
    assert!(!answer.success);
    assert!(fx.domain.snapshots().is_empty());
}

#[test]
fn unnamed_snapshot_gets_a_generated_name() {
    let fx = LiveFixture::new(10 * GIB);

    let answer = fx.host.facade().handle(create(fx.snapshot(None)));
    assert!(answer.success, "snapshot failed: {:?}", answer.message);
    let name = answer.object.unwrap().name.unwrap();
    assert_eq!(name.len(), 36);
}

#[test]
fn live_conversions_share_the_running_disk() {
    let fx = LiveFixture::new(10 * GIB);

    let answer = fx.host.facade().handle(create(fx.snapshot(Some("snap-1"))));
    assert!(answer.success, "snapshot failed: {:?}", answer.message);
    assert!(fx.host.converter.calls()[0].force_share);

    let fallback = LiveFixture::new(10 * GIB);
    fallback.domain.set_disk_only_unsupported(true);
    let answer = fallback.host.facade().handle(create(fallback.snapshot(Some("snap-1"))));
    assert!(answer.success, "snapshot failed: {:?}", answer.message);
    assert!(fallback.host.converter.calls()[0].force_share);
}

#[test]
fn gluster_disk_is_found_by_network_name() {
    let host = TestHost::new();
    let mut info = PoolInfo::new(StoragePoolType::Gluster, "g1", host.mount_point("g1"));
    info.source_dir = "/gv0".into();
    info.source_host = "gluster-1".into();
    info.source_port = 24007;
    let pool = host.add_pool_with(info);
    let disk = pool.add_disk("root-1", ImageFormat::Qcow2, 10 * GIB);
    let domain = host.hypervisor.add_domain(VM);
    domain.plug("vda", "gv0/root-1", DiskBus::Virtio);

    let pool_ref = PoolRef::new(StoragePoolType::Gluster, "g1");
    let mut volume = VolumeDescriptor::new("root-1", DataStore::Primary(pool_ref.clone()));
    volume.path = "root-1".into();
    volume.vm_name = Some(VM.into());
    let mut snapshot = SnapshotDescriptor::new(volume, DataStore::Primary(pool_ref));
    snapshot.name = Some("snap-1".into());

    let answer = host.facade().handle(create(snapshot));
    assert!(answer.success, "snapshot failed: {:?}", answer.message);
    assert_eq!(
        answer.object.unwrap().path,
        format!("{}/snapshots/snap-1", host.mount_point("g1"))
    );

    match &domain.snapshots()[0] {
        DomainSnapshotSpec::DiskOnly { disk_label, .. } => assert_eq!(disk_label, "vda"),
        other => panic!("expected disk-only snapshot, got {:?}", other),
    }
    assert_eq!(host.converter.calls()[0].src, disk.path);
    assert_eq!(host.merge.calls()[0].base_path, "gv0/root-1");
    assert_eq!(domain.disk_paths(), vec!["gv0/root-1"]);
}

#[test]
fn disk_missing_from_domain_is_rejected() {
    let fx = LiveFixture::new(10 * GIB);
    let mut snapshot = fx.snapshot(Some("snap-1"));
    fx.pool.add_disk("loose-1", ImageFormat::Qcow2, GIB);
    snapshot.volume.path = "loose-1".into();

    let answer = fx.host.facade().handle(create(snapshot));
    assert!(!answer.success);
    assert!(answer.message.unwrap().contains("is not attached"));
    assert!(fx.domain.snapshots().is_empty());
}

// ============================================================================
// OFFLINE SNAPSHOTS
// ============================================================================

#[test]
fn stopped_vm_snapshot_is_a_direct_copy() {
    let fx = LiveFixture::new(10 * GIB);
    fx.domain.set_state(DomainState::Shutoff);

    let answer = fx.host.facade().handle(create(fx.snapshot(Some("snap-1"))));
    assert!(answer.success, "snapshot failed: {:?}", answer.message);

    let expected = format!("{}/root-1@snap-1", fx.snapshot_dir());
    assert_eq!(answer.object.unwrap().path, expected);
    assert!(Path::new(&expected).exists());
    assert!(fx.domain.snapshots().is_empty());
    assert_eq!(fx.host.converter.calls()[0].dst_format, ImageFormat::Qcow2);
}

#[test]
fn vm_not_defined_on_host_snapshot_is_a_direct_copy() {
    let fx = LiveFixture::new(10 * GIB);
    let mut snapshot = fx.snapshot(Some("snap-1"));
    snapshot.volume.vm_name = Some("i-2-11-VM".into());

    let answer = fx.host.facade().handle(create(snapshot));
    assert!(answer.success, "snapshot failed: {:?}", answer.message);

    let expected = format!("{}/root-1@snap-1", fx.snapshot_dir());
    assert_eq!(answer.object.unwrap().path, expected);
    assert!(Path::new(&expected).exists());
    assert!(fx.domain.snapshots().is_empty());

    let converts = fx.host.converter.calls();
    assert_eq!(converts.len(), 1);
    assert!(!converts[0].force_share);
}

#[test]
fn paused_vm_is_resumed_after_snapshot() {
    let fx = LiveFixture::new(10 * GIB);
    fx.domain.set_state(DomainState::Paused);

    let answer = fx.host.facade().handle(create(fx.snapshot(Some("snap-1"))));
    assert!(answer.success, "snapshot failed: {:?}", answer.message);
    assert_eq!(fx.domain.resumes(), 1);
}

#[test]
fn delete_file_snapshot_is_idempotent() {
    let fx = LiveFixture::new(10 * GIB);
    fx.domain.set_state(DomainState::Shutoff);
    let facade = fx.host.facade();

    let created = facade.handle(create(fx.snapshot(Some("snap-1"))));
    let path = created.object.unwrap().path;

    let mut snapshot = fx.snapshot(Some("snap-1"));
    snapshot.path = path.clone();
    let answer = facade.handle(Command::DeleteSnapshot {
        snapshot: snapshot.clone(),
    });
    assert!(answer.success, "delete failed: {:?}", answer.message);
    assert!(!Path::new(&path).exists());

    let answer = facade.handle(Command::DeleteSnapshot { snapshot });
    assert!(answer.success);
}

// ============================================================================
// OBJECT-STORE AND CLUSTERED-BLOCK SNAPSHOTS
// ============================================================================

fn rbd_host() -> TestHost {
    let host = TestHost::new();
    let mut info = PoolInfo::new(StoragePoolType::Rbd, "ceph-1", "/");
    info.source_dir = "cloudstack".into();
    let pool = host.add_pool_with(info);
    pool.add_disk("vol-1", ImageFormat::Raw, 4 * GIB);
    host.object_store.add_image("vol-1", 4 * GIB);
    host
}

fn rbd_snapshot(name: &str) -> SnapshotDescriptor {
    let pool_ref = PoolRef::new(StoragePoolType::Rbd, "ceph-1");
    let mut volume = VolumeDescriptor::new("vol-1", DataStore::Primary(pool_ref.clone()));
    volume.path = "vol-1".into();
    let mut snapshot = SnapshotDescriptor::new(volume, DataStore::Primary(pool_ref));
    snapshot.name = Some(name.to_string());
    snapshot
}

fn snapshot_names(host: &TestHost, image: &str) -> Vec<String> {
    host.object_store
        .image(image)
        .unwrap()
        .snapshots
        .into_iter()
        .map(|s| s.name)
        .collect()
}

#[test]
fn object_store_snapshot_is_native() {
    let host = rbd_host();
    let domain = host.hypervisor.add_domain(VM);
    domain.plug("vda", "cloudstack/vol-1", DiskBus::Virtio);
    let mut snapshot = rbd_snapshot("snap-1");
    snapshot.volume.vm_name = Some(VM.into());

    let answer = host.facade().handle(create(snapshot));
    assert!(answer.success, "snapshot failed: {:?}", answer.message);
    assert_eq!(answer.object.unwrap().path, "cloudstack/vol-1/snap-1");
    assert_eq!(snapshot_names(&host, "vol-1"), vec!["snap-1"]);
    assert!(domain.snapshots().is_empty());
}

#[test]
fn protected_object_store_snapshot_is_unprotected_then_removed() {
    let host = rbd_host();
    host.object_store.add_snapshot("vol-1", "snap-1", true);

    let mut snapshot = rbd_snapshot("snap-1");
    snapshot.path = "cloudstack/vol-1/snap-1".into();
    let answer = host.facade().handle(Command::DeleteSnapshot { snapshot });
    assert!(answer.success, "delete failed: {:?}", answer.message);
    assert!(snapshot_names(&host, "vol-1").is_empty());
}

#[test]
fn missing_object_store_snapshot_reports_backend_code() {
    let host = rbd_host();

    let mut snapshot = rbd_snapshot("snap-404");
    snapshot.path = "cloudstack/vol-1/snap-404".into();
    let answer = host.facade().handle(Command::DeleteSnapshot { snapshot });
    assert!(!answer.success);
    assert!(answer.message.unwrap().starts_with("backend error 2"));
}

#[test]
fn clustered_block_snapshot_runs_management_script() {
    let host = TestHost::new();
    let pool = host.add_pool(StoragePoolType::Clvm, "clvm-1");
    let disk = pool.add_disk("lv-1", ImageFormat::Raw, 4 * GIB);
    let domain = host.hypervisor.add_domain(VM);
    domain.plug("vda", &disk.path, DiskBus::Virtio);

    let pool_ref = PoolRef::new(StoragePoolType::Clvm, "clvm-1");
    let mut volume = VolumeDescriptor::new("lv-1", DataStore::Primary(pool_ref.clone()));
    volume.path = "lv-1".into();
    volume.vm_name = Some(VM.into());
    let mut snapshot = SnapshotDescriptor::new(volume, DataStore::Primary(pool_ref));
    snapshot.name = Some("snap-1".into());

    let answer = host.facade().handle(create(snapshot.clone()));
    assert!(answer.success, "snapshot failed: {:?}", answer.message);
    assert_eq!(answer.object.unwrap().path, format!("{}/snap-1", disk.path));

    let calls = host.scripts.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, host.scripts().manage_snapshot);
    assert_eq!(calls[0].1, vec!["-c", disk.path.as_str(), "-n", "snap-1"]);
    assert!(domain.snapshots().is_empty());

    let answer = host.facade().handle(Command::DeleteSnapshot { snapshot });
    assert!(!answer.success);
    assert!(answer.message.unwrap().contains("Operation not implemented"));
}

// ============================================================================
// FLATTEN
// ============================================================================

fn flatten(host: &TestHost) -> vmstor_shared::Answer {
    let mut snapshot = rbd_snapshot("snap-1");
    snapshot.path = "cloudstack/vol-1/snap-1".into();
    host.facade().handle(Command::FlattenFromSnapshot { snapshot })
}

#[test]
fn flatten_detaches_clones_one_at_a_time() {
    let host = rbd_host();
    host.object_store.add_snapshot("vol-1", "snap-1", true);
    host.object_store.add_clone("vol-1", "snap-1", "vol-2");
    host.object_store.add_clone("vol-1", "snap-1", "vol-3");

    let answer = flatten(&host);
    assert!(!answer.success);
    assert!(answer.message.unwrap().contains("still has dependent clones"));
    assert_eq!(host.object_store.image("vol-2").unwrap().parent, None);
    assert_eq!(snapshot_names(&host, "vol-1"), vec!["snap-1"]);

    let answer = flatten(&host);
    assert!(answer.success, "flatten failed: {:?}", answer.message);
    assert_eq!(host.object_store.image("vol-3").unwrap().parent, None);
    assert!(snapshot_names(&host, "vol-1").is_empty());
}

#[test]
fn flatten_without_clones_is_final() {
    let host = rbd_host();
    host.object_store.add_snapshot("vol-1", "snap-1", false);

    let answer = flatten(&host);
    assert!(answer.success);
    assert_eq!(snapshot_names(&host, "vol-1"), vec!["snap-1"]);
}

#[test]
fn flatten_of_missing_snapshot_is_final() {
    let host = rbd_host();
    assert!(flatten(&host).success);
}

#[test]
fn flatten_is_object_store_only() {
    let fx = LiveFixture::new(GIB);
    let answer = fx.host.facade().handle(Command::FlattenFromSnapshot {
        snapshot: fx.snapshot(Some("snap-1")),
    });
    assert!(!answer.success);
    assert!(answer.message.unwrap().contains("Flatten is not supported"));
}
