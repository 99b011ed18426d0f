use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use vmstor::pool::{
    CopyDisk, DiskFromTemplate, NewDisk, PhysicalDisk, PoolInfo, PoolManager, StoragePool,
};
use vmstor_shared::descriptor::{ImageFormat, StoragePoolType};
use vmstor_shared::errors::{VmstorError, VmstorResult};

use crate::write_qcow2_stub;

/// A pool backed by a directory. Disks are tracked in memory; file-based
/// formats also get a file under the pool's local path.
pub struct FakePool {
    info: PoolInfo,
    available: AtomicU64,
    disks: Mutex<HashMap<String, PhysicalDisk>>,
    deleted: Mutex<Vec<String>>,
}

impl FakePool {
    pub fn new(info: PoolInfo) -> Self {
        Self {
            info,
            available: AtomicU64::new(u64::MAX / 2),
            disks: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn set_available(&self, bytes: u64) {
        self.available.store(bytes, Ordering::SeqCst);
    }

    /// Register an existing disk named `name` at `<local_path>/<name>`.
    pub fn add_disk(&self, name: &str, format: ImageFormat, virtual_size: u64) -> PhysicalDisk {
        let disk = self.disk_record(name, format, virtual_size, None);
        self.insert(disk.clone());
        disk
    }

    /// Track `disk`; disks under the pool's local path also get a file.
    pub fn insert(&self, disk: PhysicalDisk) {
        if self.owns_file(&disk.path) {
            touch(&disk);
        }
        self.disks.lock().insert(disk.name.clone(), disk);
    }

    pub fn disk(&self, name: &str) -> Option<PhysicalDisk> {
        self.lookup(name)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    fn owns_file(&self, path: &str) -> bool {
        self.info.pool_type != StoragePoolType::Rbd
            && Path::new(&self.info.local_path).is_dir()
            && Path::new(path).starts_with(&self.info.local_path)
    }

    fn disk_record(&self, name: &str, format: ImageFormat, virtual_size: u64, backing: Option<String>) -> PhysicalDisk {
        let path = match self.info.pool_type {
            StoragePoolType::Rbd => format!("{}/{}", self.info.source_dir, name),
            _ => format!("{}/{}", self.info.local_path.trim_end_matches('/'), name),
        };
        PhysicalDisk {
            name: name.to_string(),
            path,
            pool: self.info.clone(),
            format,
            virtual_size,
            size: 0,
            encrypt_format: None,
            backing,
        }
    }

    fn lookup(&self, name: &str) -> Option<PhysicalDisk> {
        let disks = self.disks.lock();
        disks
            .get(name)
            .or_else(|| disks.values().find(|d| d.path == name))
            .cloned()
    }

    fn remove(&self, name: &str) -> Option<PhysicalDisk> {
        let mut disks = self.disks.lock();
        let key = if disks.contains_key(name) {
            name.to_string()
        } else {
            disks.values().find(|d| d.path == name)?.name.clone()
        };
        disks.remove(&key)
    }
}

fn touch(disk: &PhysicalDisk) {
    let path = Path::new(&disk.path);
    if path.exists() {
        return;
    }
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = match disk.format {
        ImageFormat::Qcow2 => write_qcow2_stub(path, disk.virtual_size),
        ImageFormat::Raw => std::fs::write(path, b""),
        ImageFormat::Dir => std::fs::create_dir_all(path),
    };
}

impl StoragePool for FakePool {
    fn info(&self) -> &PoolInfo {
        &self.info
    }

    fn available(&self) -> VmstorResult<u64> {
        Ok(self.available.load(Ordering::SeqCst))
    }

    fn physical_disk(&self, name: &str) -> VmstorResult<PhysicalDisk> {
        self.lookup(name).ok_or_else(|| {
            VmstorError::NotFound(format!("disk {} not found in pool {}", name, self.info.uuid))
        })
    }

    fn create_physical_disk(&self, spec: &NewDisk<'_>) -> VmstorResult<PhysicalDisk> {
        let disk = self.disk_record(spec.name, spec.format, spec.size, None);
        self.insert(disk.clone());
        Ok(disk)
    }

    fn delete_physical_disk(&self, name: &str, _format: Option<ImageFormat>) -> VmstorResult<()> {
        let disk = self.remove(name).ok_or_else(|| {
            VmstorError::NotFound(format!("disk {} not found in pool {}", name, self.info.uuid))
        })?;
        if self.owns_file(&disk.path) {
            let _ = std::fs::remove_file(&disk.path);
        }
        self.deleted.lock().push(disk.name);
        Ok(())
    }

    fn create_folder(&self, relative: &str) -> VmstorResult<()> {
        let dir = Path::new(&self.info.local_path).join(relative);
        std::fs::create_dir_all(&dir)
            .map_err(|e| VmstorError::Storage(format!("Failed to create {}: {}", dir.display(), e)))
    }
}

/// One `copy_physical_disk` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRecord {
    pub src_path: String,
    pub dest_name: String,
    pub dest_pool: String,
    pub dest_format: ImageFormat,
    pub src_secret: bool,
    pub dest_secret: bool,
}

/// Primary pools keyed by UUID plus secondary stores keyed by URI.
#[derive(Default)]
pub struct FakePoolManager {
    pools: Mutex<HashMap<String, Arc<FakePool>>>,
    secondary: Mutex<HashMap<String, Arc<FakePool>>>,
    connect_fails: AtomicBool,
    connected: Mutex<Vec<String>>,
    disconnected: Mutex<Vec<String>>,
    mounted: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
    copies: Mutex<Vec<CopyRecord>>,
}

impl FakePoolManager {
    pub fn add_pool(&self, info: PoolInfo) -> Arc<FakePool> {
        let pool = Arc::new(FakePool::new(info));
        self.pools.lock().insert(pool.info.uuid.clone(), pool.clone());
        pool
    }

    /// Serve `uri` from a pool rooted at `local_path`.
    pub fn add_secondary(&self, uri: &str, local_path: &str) -> Arc<FakePool> {
        let uuid = format!("secondary-{}", self.secondary.lock().len());
        let pool = Arc::new(FakePool::new(PoolInfo::new(
            StoragePoolType::NetworkFilesystem,
            uuid,
            local_path,
        )));
        self.secondary.lock().insert(uri.to_string(), pool.clone());
        pool
    }

    pub fn pool(&self, uuid: &str) -> Option<Arc<FakePool>> {
        self.pools.lock().get(uuid).cloned()
    }

    /// Make every connect report failure.
    pub fn set_connect_fails(&self, value: bool) {
        self.connect_fails.store(value, Ordering::SeqCst);
    }

    pub fn connected(&self) -> Vec<String> {
        self.connected.lock().clone()
    }

    pub fn disconnected(&self) -> Vec<String> {
        self.disconnected.lock().clone()
    }

    pub fn mounted(&self) -> Vec<String> {
        self.mounted.lock().clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }

    pub fn copies(&self) -> Vec<CopyRecord> {
        self.copies.lock().clone()
    }

    fn find(&self, uuid: &str) -> VmstorResult<Arc<FakePool>> {
        if let Some(pool) = self.pools.lock().get(uuid) {
            return Ok(pool.clone());
        }
        self.secondary
            .lock()
            .values()
            .find(|p| p.info.uuid == uuid)
            .cloned()
            .ok_or_else(|| VmstorError::NotFound(format!("pool {} not found", uuid)))
    }
}

impl PoolManager for FakePoolManager {
    fn storage_pool(&self, _pool_type: StoragePoolType, uuid: &str) -> VmstorResult<Arc<dyn StoragePool>> {
        Ok(self.find(uuid)?)
    }

    fn storage_pool_by_uri(&self, uri: &str) -> VmstorResult<Arc<dyn StoragePool>> {
        let pool = self
            .secondary
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| VmstorError::NotFound(format!("secondary storage {} not found", uri)))?;
        self.mounted.lock().push(uri.to_string());
        Ok(pool)
    }

    fn release_storage_pool(&self, _pool_type: StoragePoolType, uuid: &str) -> VmstorResult<bool> {
        self.released.lock().push(uuid.to_string());
        Ok(true)
    }

    fn connect_physical_disk(
        &self,
        _pool_type: StoragePoolType,
        _uuid: &str,
        path: &str,
        _details: &HashMap<String, String>,
    ) -> VmstorResult<bool> {
        if self.connect_fails.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.connected.lock().push(path.to_string());
        Ok(true)
    }

    fn disconnect_physical_disk(&self, _pool_type: StoragePoolType, _uuid: &str, path: &str) -> VmstorResult<bool> {
        self.disconnected.lock().push(path.to_string());
        Ok(true)
    }

    fn copy_physical_disk(&self, req: &CopyDisk<'_>) -> VmstorResult<PhysicalDisk> {
        let dest = self.find(&req.dest_pool.info().uuid)?;
        let format = req.dest_format.unwrap_or(req.src.format);
        self.copies.lock().push(CopyRecord {
            src_path: req.src.path.clone(),
            dest_name: req.dest_name.to_string(),
            dest_pool: dest.info.uuid.clone(),
            dest_format: format,
            src_secret: req.src_secret.is_some(),
            dest_secret: req.dest_secret.is_some(),
        });

        let disk = dest.disk_record(req.dest_name, format, req.src.virtual_size, None);
        dest.insert(disk.clone());
        Ok(disk)
    }

    fn create_disk_with_template_backing(&self, req: &DiskFromTemplate<'_>) -> VmstorResult<PhysicalDisk> {
        let dest = self.find(&req.dest_pool.info().uuid)?;
        let size = req.size.max(req.template.virtual_size);
        let disk = dest.disk_record(req.name, req.format, size, Some(req.template.path.clone()));
        dest.insert(disk.clone());
        Ok(disk)
    }

    fn create_disk_from_template(&self, req: &DiskFromTemplate<'_>) -> VmstorResult<PhysicalDisk> {
        let dest = self.find(&req.dest_pool.info().uuid)?;
        let size = req.size.max(req.template.virtual_size);
        let disk = dest.disk_record(req.name, req.format, size, None);
        dest.insert(disk.clone());
        Ok(disk)
    }
}
