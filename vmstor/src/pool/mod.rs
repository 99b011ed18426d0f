//! Storage pool collaborator interface.
//!
//! Pools are owned by the host agent's pool manager and resolved per call;
//! this crate only holds them for the duration of one operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use vmstor_shared::descriptor::{EncryptFormat, ImageFormat, ProvisioningType, StoragePoolType};
use vmstor_shared::errors::VmstorResult;
use vmstor_shared::secret::Passphrase;

use crate::format::{FormatNegotiator, PoolCapabilities};

mod guard;

pub use guard::{ConnectedPath, MountedStore};

/// Connection facts about a resolved pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolInfo {
    pub pool_type: StoragePoolType,
    pub uuid: String,
    /// Mount point or device directory on this host.
    pub local_path: String,
    pub source_host: String,
    pub source_port: u16,
    /// Remote directory, volume or object-store pool name.
    pub source_dir: String,
    pub auth_user: Option<String>,
    pub auth_secret: Option<Passphrase>,
    pub logical_block_size: Option<u32>,
    pub physical_block_size: Option<u32>,
}

impl PoolInfo {
    pub fn new(pool_type: StoragePoolType, uuid: impl Into<String>, local_path: impl Into<String>) -> Self {
        Self {
            pool_type,
            uuid: uuid.into(),
            local_path: local_path.into(),
            source_host: String::new(),
            source_port: 0,
            source_dir: String::new(),
            auth_user: None,
            auth_secret: None,
            logical_block_size: None,
            physical_block_size: None,
        }
    }

    pub fn capabilities(&self) -> PoolCapabilities {
        FormatNegotiator::capabilities(self.pool_type)
    }
}

/// A disk as the pool manager sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalDisk {
    pub name: String,
    pub path: String,
    pub pool: PoolInfo,
    pub format: ImageFormat,
    pub virtual_size: u64,
    /// Allocated bytes.
    pub size: u64,
    pub encrypt_format: Option<EncryptFormat>,
    /// Backing file of a linked clone.
    pub backing: Option<String>,
}

/// Parameters for a disk created from scratch.
pub struct NewDisk<'a> {
    pub name: &'a str,
    pub format: ImageFormat,
    pub provisioning: ProvisioningType,
    pub size: u64,
    pub passphrase: Option<&'a Passphrase>,
}

/// Parameters for a pool-to-pool disk copy.
pub struct CopyDisk<'a> {
    pub src: &'a PhysicalDisk,
    pub dest_name: &'a str,
    pub dest_pool: &'a dyn StoragePool,
    pub timeout: Duration,
    pub src_secret: Option<&'a Passphrase>,
    pub dest_secret: Option<&'a Passphrase>,
    pub provisioning: Option<ProvisioningType>,
    /// Override the destination format (defaults to the source format).
    pub dest_format: Option<ImageFormat>,
}

/// Parameters for a disk derived from a template.
pub struct DiskFromTemplate<'a> {
    pub template: &'a PhysicalDisk,
    pub name: &'a str,
    pub format: ImageFormat,
    pub provisioning: ProvisioningType,
    pub size: u64,
    pub dest_pool: &'a dyn StoragePool,
    pub timeout: Duration,
    pub passphrase: Option<&'a Passphrase>,
}

pub trait StoragePool: Send + Sync {
    fn info(&self) -> &PoolInfo;

    /// Free bytes.
    fn available(&self) -> VmstorResult<u64>;

    /// Fails with `NotFound` if the pool holds no disk by that name.
    fn physical_disk(&self, name: &str) -> VmstorResult<PhysicalDisk>;

    fn create_physical_disk(&self, spec: &NewDisk<'_>) -> VmstorResult<PhysicalDisk>;

    fn delete_physical_disk(&self, name: &str, format: Option<ImageFormat>) -> VmstorResult<()>;

    /// Create `relative` under the pool's local path if missing.
    fn create_folder(&self, relative: &str) -> VmstorResult<()>;
}

pub trait PoolManager: Send + Sync {
    fn storage_pool(&self, pool_type: StoragePoolType, uuid: &str) -> VmstorResult<Arc<dyn StoragePool>>;

    /// Mount a secondary-storage URL as a temporary pool.
    fn storage_pool_by_uri(&self, uri: &str) -> VmstorResult<Arc<dyn StoragePool>>;

    /// Tear down a pool obtained from [`PoolManager::storage_pool_by_uri`].
    fn release_storage_pool(&self, pool_type: StoragePoolType, uuid: &str) -> VmstorResult<bool>;

    fn connect_physical_disk(
        &self,
        pool_type: StoragePoolType,
        uuid: &str,
        path: &str,
        details: &HashMap<String, String>,
    ) -> VmstorResult<bool>;

    fn disconnect_physical_disk(
        &self,
        pool_type: StoragePoolType,
        uuid: &str,
        path: &str,
    ) -> VmstorResult<bool>;

    fn copy_physical_disk(&self, req: &CopyDisk<'_>) -> VmstorResult<PhysicalDisk>;

    /// Linked clone: a new overlay whose backing file is `req.template`.
    fn create_disk_with_template_backing(&self, req: &DiskFromTemplate<'_>) -> VmstorResult<PhysicalDisk>;

    /// Full copy of a template, performed by the pool itself.
    fn create_disk_from_template(&self, req: &DiskFromTemplate<'_>) -> VmstorResult<PhysicalDisk>;

    /// Convenience lookup of a disk by pool reference.
    fn physical_disk(
        &self,
        pool_type: StoragePoolType,
        uuid: &str,
        name: &str,
    ) -> VmstorResult<PhysicalDisk> {
        self.storage_pool(pool_type, uuid)?.physical_disk(name)
    }
}
