//! Self-contained descriptors for volumes, snapshots, templates and pools.
//!
//! The engine never persists metadata: every operation receives one of these
//! descriptors and returns a result built from it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::details;
use crate::errors::{VmstorError, VmstorResult};
use crate::secret::Passphrase;

// ============================================================================
// Enumerations
// ============================================================================

/// On-disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Dir,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Dir => "dir",
        }
    }

    /// File extension used when a disk name is derived from its UUID.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Dir => "",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = VmstorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(ImageFormat::Raw),
            "qcow2" => Ok(ImageFormat::Qcow2),
            "dir" => Ok(ImageFormat::Dir),
            other => Err(VmstorError::Validation(format!(
                "unknown image format '{}'",
                other
            ))),
        }
    }
}

/// Storage pool type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePoolType {
    /// Host-local directory pool
    Filesystem,
    /// NFS-backed pool
    NetworkFilesystem,
    /// Operator-provided shared mount point
    SharedMountPoint,
    /// Distributed filesystem reached over the network
    Gluster,
    /// Distributed object store with native snapshots
    Rbd,
    /// Clustered LVM block storage
    Clvm,
    PowerFlex,
    Linstor,
    Iscsi,
}

impl StoragePoolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoragePoolType::Filesystem => "Filesystem",
            StoragePoolType::NetworkFilesystem => "NetworkFilesystem",
            StoragePoolType::SharedMountPoint => "SharedMountPoint",
            StoragePoolType::Gluster => "Gluster",
            StoragePoolType::Rbd => "RBD",
            StoragePoolType::Clvm => "CLVM",
            StoragePoolType::PowerFlex => "PowerFlex",
            StoragePoolType::Linstor => "Linstor",
            StoragePoolType::Iscsi => "Iscsi",
        }
    }
}

impl fmt::Display for StoragePoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thin/thick allocation strategy for new disks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningType {
    #[default]
    Thin,
    Sparse,
    Fat,
}

impl ProvisioningType {
    /// `preallocation=` value understood by `qemu-img`.
    pub fn preallocation(&self) -> &'static str {
        match self {
            ProvisioningType::Thin => "metadata",
            ProvisioningType::Sparse => "off",
            ProvisioningType::Fat => "falloc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptFormat {
    Luks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeType {
    Root,
    DataDisk,
    #[default]
    Other,
}

/// Hypervisor cache mode for an attached disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    None,
    Writeback,
    Writethrough,
    Directsync,
    Unsafe,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::None => "none",
            CacheMode::Writeback => "writeback",
            CacheMode::Writethrough => "writethrough",
            CacheMode::Directsync => "directsync",
            CacheMode::Unsafe => "unsafe",
        }
    }
}

/// Guest-visible disk bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    #[default]
    Virtio,
    Scsi,
    Sata,
    Ide,
}

impl DiskBus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "virtio",
            DiskBus::Scsi => "scsi",
            DiskBus::Sata => "sata",
            DiskBus::Ide => "ide",
        }
    }

    /// Target device name prefix (`vd`, `sd`, `hd`).
    pub fn device_prefix(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "vd",
            DiskBus::Scsi | DiskBus::Sata => "sd",
            DiskBus::Ide => "hd",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneType {
    LinkedClone,
    FullClone,
}

/// Scope of the pool a migration reads its template from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Host,
    #[default]
    Cluster,
    Zone,
}

/// Algorithm used to produce a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStrategy {
    /// Disk-only external snapshot of a running VM, merged back afterwards
    LiveExternal,
    /// Point-in-time copy made by the object store itself
    NativeObjectStore,
    /// Delegated to the clustered-block management script
    ScriptManaged,
    /// Plain file conversion into the snapshot directory
    DirectFileCopy,
}

// ============================================================================
// Pools and stores
// ============================================================================

/// Reference to a primary storage pool, resolved per call by the pool manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRef {
    pub pool_type: StoragePoolType,
    pub uuid: String,

    /// Volumes on this pool need a connect/disconnect handshake.
    #[serde(default)]
    pub managed: bool,

    /// Object-store pools whose images are mapped through the host kernel
    /// expose them as block devices under this directory.
    #[serde(default)]
    pub mapped_device_dir: Option<String>,
}

impl PoolRef {
    pub fn new(pool_type: StoragePoolType, uuid: impl Into<String>) -> Self {
        Self {
            pool_type,
            uuid: uuid.into(),
            managed: false,
            mapped_device_dir: None,
        }
    }
}

/// Where a descriptor's bytes live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum DataStore {
    Primary(PoolRef),
    /// Secondary storage reached by URL (e.g. `nfs://host/export`)
    Secondary { url: String },
}

impl DataStore {
    pub fn primary(&self) -> Option<&PoolRef> {
        match self {
            DataStore::Primary(pool) => Some(pool),
            DataStore::Secondary { .. } => None,
        }
    }

    pub fn require_primary(&self) -> VmstorResult<&PoolRef> {
        self.primary().ok_or_else(|| {
            VmstorError::Validation("operation requires a primary storage pool".to_string())
        })
    }
}

// ============================================================================
// Rate limits
// ============================================================================

/// One direction of an I/O throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default)]
    pub rate: Option<u64>,
    #[serde(default)]
    pub max: Option<u64>,
    /// Seconds the burst `max` may be sustained.
    #[serde(default)]
    pub max_length: Option<u64>,
}

impl RateLimit {
    pub fn is_empty(&self) -> bool {
        positive(self.rate).is_none()
            && positive(self.max).is_none()
            && positive(self.max_length).is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IoLimits {
    #[serde(default)]
    pub bytes_read: RateLimit,
    #[serde(default)]
    pub bytes_write: RateLimit,
    #[serde(default)]
    pub iops_read: RateLimit,
    #[serde(default)]
    pub iops_write: RateLimit,
}

impl IoLimits {
    pub fn is_empty(&self) -> bool {
        self.bytes_read.is_empty()
            && self.bytes_write.is_empty()
            && self.iops_read.is_empty()
            && self.iops_write.is_empty()
    }
}

/// Keep a value only when it is present and strictly positive.
pub fn positive(value: Option<u64>) -> Option<u64> {
    value.filter(|v| *v > 0)
}

// ============================================================================
// Volumes, snapshots, templates
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    /// Backend path or identifier; empty for volumes not created yet.
    #[serde(default)]
    pub path: String,
    pub store: DataStore,
    /// Requested virtual size in bytes.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub format: Option<ImageFormat>,
    #[serde(default)]
    pub provisioning: ProvisioningType,
    #[serde(default)]
    pub volume_type: VolumeType,
    #[serde(default)]
    pub vm_name: Option<String>,
    #[serde(default)]
    pub shareable: bool,
    /// Backed by a deduplicating device mapping on the host.
    #[serde(default)]
    pub dedup: bool,
    #[serde(default)]
    pub cache_mode: Option<CacheMode>,
    #[serde(default)]
    pub io_limits: IoLimits,
    #[serde(default, skip_serializing)]
    pub passphrase: Option<Passphrase>,
    #[serde(default)]
    pub encrypt_format: Option<EncryptFormat>,
    #[serde(default)]
    pub details: HashMap<String, String>,
}

impl VolumeDescriptor {
    pub fn new(uuid: impl Into<String>, store: DataStore) -> Self {
        Self {
            uuid: uuid.into(),
            name: String::new(),
            path: String::new(),
            store,
            size: 0,
            format: None,
            provisioning: ProvisioningType::default(),
            volume_type: VolumeType::default(),
            vm_name: None,
            shareable: false,
            dedup: false,
            cache_mode: None,
            io_limits: IoLimits::default(),
            passphrase: None,
            encrypt_format: None,
            details: HashMap::new(),
        }
    }

    pub fn pool(&self) -> VmstorResult<&PoolRef> {
        self.store.require_primary()
    }

    pub fn is_encrypted(&self) -> bool {
        self.passphrase.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// Drop (and zero) the passphrase now instead of at end of scope.
    pub fn clear_passphrase(&mut self) {
        self.passphrase = None;
    }

    /// Path of a managed volume as advertised in `details` (`path`, then `iqn`).
    pub fn managed_path(&self) -> Option<&str> {
        self.details
            .get(details::PATH)
            .or_else(|| self.details.get(details::IQN))
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }

    /// File name derived from the UUID and format (`<uuid>.<ext>`).
    pub fn derived_file_name(&self, format: ImageFormat) -> String {
        match format.extension() {
            "" => self.uuid.clone(),
            ext => format!("{}.{}", self.uuid, ext),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    /// Snapshot name; a fresh UUID is used when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Backend path once the snapshot exists.
    #[serde(default)]
    pub path: String,
    pub volume: VolumeDescriptor,
    pub store: DataStore,
    #[serde(default)]
    pub strategy: Option<SnapshotStrategy>,
    #[serde(default)]
    pub physical_size: Option<u64>,
    #[serde(default)]
    pub details: HashMap<String, String>,
}

impl SnapshotDescriptor {
    pub fn new(volume: VolumeDescriptor, store: DataStore) -> Self {
        Self {
            name: None,
            path: String::new(),
            volume,
            store,
            strategy: None,
            physical_size: None,
            details: HashMap::new(),
        }
    }

    pub fn clear_passphrase(&mut self) {
        self.volume.clear_passphrase();
    }

    /// Split `path` into its directory and final component.
    pub fn split_path(&self) -> (&str, &str) {
        match self.path.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", self.path.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDescriptor {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    pub store: DataStore,
    #[serde(default)]
    pub format: Option<ImageFormat>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub physical_size: Option<u64>,
}

impl TemplateDescriptor {
    pub fn new(uuid: impl Into<String>, store: DataStore) -> Self {
        Self {
            uuid: uuid.into(),
            name: String::new(),
            path: String::new(),
            store,
            format: None,
            size: 0,
            physical_size: None,
        }
    }
}

fn default_migration_timeout_ms() -> u64 {
    3 * 60 * 60 * 1000
}

/// Caller-supplied cloning instructions for `CreateVolume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationOptions {
    pub clone_type: CloneType,
    pub src_pool_type: StoragePoolType,
    pub src_pool_uuid: String,
    /// Path of the backing template inside the source pool.
    pub src_backing_path: String,
    /// Duplicate the template into the destination pool before using it.
    #[serde(default)]
    pub copy_src_template: bool,
    #[serde(default)]
    pub scope: ScopeType,
    #[serde(default = "default_migration_timeout_ms")]
    pub timeout_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rbd_volume() -> VolumeDescriptor {
        VolumeDescriptor::new(
            "7c1a4a57-0b1f-4a7b-9e0a-2a3f9b5b7d11",
            DataStore::Primary(PoolRef::new(StoragePoolType::Rbd, "pool-1")),
        )
    }

    #[test]
    fn test_image_format_parses_case_insensitively() {
        assert_eq!("QCOW2".parse::<ImageFormat>().unwrap(), ImageFormat::Qcow2);
        assert_eq!("raw".parse::<ImageFormat>().unwrap(), ImageFormat::Raw);
        assert!("vmdk".parse::<ImageFormat>().is_err());
    }

    #[test]
    fn test_managed_path_prefers_path_detail() {
        let mut volume = rbd_volume();
        assert_eq!(volume.managed_path(), None);

        volume.details.insert("iqn".into(), "iqn.2010-01.com:vol".into());
        assert_eq!(volume.managed_path(), Some("iqn.2010-01.com:vol"));

        volume.details.insert("path".into(), "/dev/disk/by-id/x".into());
        assert_eq!(volume.managed_path(), Some("/dev/disk/by-id/x"));
    }

    #[test]
    fn test_passphrase_is_never_serialized() {
        let mut volume = rbd_volume();
        volume.passphrase = Some(Passphrase::from("secret-key"));
        assert!(volume.is_encrypted());

        let json = serde_json::to_string(&volume).unwrap();
        assert!(!json.contains("secret-key"));
        assert!(!json.contains("passphrase"));

        volume.clear_passphrase();
        assert!(!volume.is_encrypted());
    }

    #[test]
    fn test_descriptor_deserializes_with_defaults() {
        let json = r#"{
            "uuid": "v-1",
            "store": { "role": "primary", "pool_type": "filesystem", "uuid": "p-1" },
            "passphrase": "abc"
        }"#;
        let volume: VolumeDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(volume.pool().unwrap().pool_type, StoragePoolType::Filesystem);
        assert_eq!(volume.provisioning, ProvisioningType::Thin);
        assert!(volume.io_limits.is_empty());
        assert!(volume.is_encrypted());
    }

    #[test]
    fn test_snapshot_split_path() {
        let mut snapshot = SnapshotDescriptor::new(
            rbd_volume(),
            DataStore::Secondary {
                url: "nfs://10.0.0.2/export".into(),
            },
        );
        snapshot.path = "snapshots/2/15/snap-a".into();
        assert_eq!(snapshot.split_path(), ("snapshots/2/15", "snap-a"));

        snapshot.path = "bare".into();
        assert_eq!(snapshot.split_path(), ("", "bare"));
    }

    #[test]
    fn test_rate_limit_ignores_zero_values() {
        let limit = RateLimit {
            rate: Some(0),
            max: None,
            max_length: Some(0),
        };
        assert!(limit.is_empty());
        assert_eq!(positive(Some(5)), Some(5));
        assert_eq!(positive(Some(0)), None);
    }
}
