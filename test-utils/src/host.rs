use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use vmstor::pool::PoolInfo;
use vmstor::tools::Collaborators;
use vmstor::{ResolvedScripts, StorageOperationFacade, StorageOptions};
use vmstor_shared::descriptor::StoragePoolType;

use crate::hypervisor::FakeHypervisor;
use crate::object_store::FakeObjectStore;
use crate::pool::{FakePool, FakePoolManager};
use crate::tools::{FakeConverter, FakeMapper, FakeMergeTool, FakeScripts};

/// A host with every collaborator faked and a scratch directory for pool
/// mount points. Dropping it removes the directory.
pub struct TestHost {
    pub hypervisor: Arc<FakeHypervisor>,
    pub pools: Arc<FakePoolManager>,
    pub converter: Arc<FakeConverter>,
    pub merge: Arc<FakeMergeTool>,
    pub scripts: Arc<FakeScripts>,
    pub object_store: Arc<FakeObjectStore>,
    pub mapper: Arc<FakeMapper>,
    temp_dir: TempDir,
}

impl TestHost {
    pub fn new() -> Self {
        let hypervisor = Arc::new(FakeHypervisor::default());
        Self {
            merge: Arc::new(FakeMergeTool::new(hypervisor.clone())),
            hypervisor,
            pools: Arc::new(FakePoolManager::default()),
            converter: Arc::new(FakeConverter::default()),
            scripts: Arc::new(FakeScripts::default()),
            object_store: Arc::new(FakeObjectStore::default()),
            mapper: Arc::new(FakeMapper::default()),
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.temp_dir.path().to_path_buf()
    }

    /// Register a primary pool mounted at `<root>/<uuid>`.
    pub fn add_pool(&self, pool_type: StoragePoolType, uuid: &str) -> Arc<FakePool> {
        self.add_pool_with(PoolInfo::new(pool_type, uuid, self.mount_point(uuid)))
    }

    pub fn add_pool_with(&self, info: PoolInfo) -> Arc<FakePool> {
        if info.pool_type != StoragePoolType::Rbd {
            std::fs::create_dir_all(&info.local_path).expect("Failed to create pool mount point");
        }
        self.pools.add_pool(info)
    }

    /// Serve secondary storage `uri` from a directory under `<root>/secondary`.
    pub fn add_secondary(&self, uri: &str) -> Arc<FakePool> {
        let name: String = uri
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let dir = self.temp_dir.path().join("secondary").join(name);
        std::fs::create_dir_all(&dir).expect("Failed to create secondary mount point");
        self.pools.add_secondary(uri, &dir.display().to_string())
    }

    pub fn mount_point(&self, uuid: &str) -> String {
        self.temp_dir.path().join(uuid).display().to_string()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            hypervisor: self.hypervisor.clone(),
            pools: self.pools.clone(),
            converter: self.converter.clone(),
            merge: self.merge.clone(),
            scripts: self.scripts.clone(),
            object_store: self.object_store.clone(),
            mapper: self.mapper.clone(),
        }
    }

    /// Options with a fast detach poll, suitable for tests.
    pub fn options(&self) -> StorageOptions {
        StorageOptions {
            detach_poll_interval_ms: 5,
            default_detach_wait_ms: 200,
            ..Default::default()
        }
    }

    pub fn scripts(&self) -> ResolvedScripts {
        ResolvedScripts {
            manage_snapshot: self.temp_dir.path().join("managesnapshot.sh"),
            create_template: self.temp_dir.path().join("createtmplt.sh"),
        }
    }

    pub fn facade(&self) -> StorageOperationFacade {
        self.facade_with(self.options())
    }

    pub fn facade_with(&self, options: StorageOptions) -> StorageOperationFacade {
        StorageOperationFacade::with_resolved_scripts(self.collaborators(), options, self.scripts())
    }
}

impl Default for TestHost {
    fn default() -> Self {
        Self::new()
    }
}
