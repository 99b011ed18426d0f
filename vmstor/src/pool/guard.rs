//! Scoped pool acquisitions.
//!
//! Both guards release what they acquired when dropped, so every exit path
//! of an operation (success, early return, `?`) disconnects or unmounts.

use std::collections::HashMap;
use std::sync::Arc;

use vmstor_shared::descriptor::StoragePoolType;
use vmstor_shared::errors::{VmstorError, VmstorResult};

use super::{PoolManager, StoragePool};

/// A managed path connected through the pool manager.
///
/// Disconnects on drop unless [`ConnectedPath::keep`] is called.
pub struct ConnectedPath<'m> {
    manager: &'m dyn PoolManager,
    pool_type: StoragePoolType,
    pool_uuid: String,
    path: String,
    armed: bool,
}

impl<'m> ConnectedPath<'m> {
    pub fn connect(
        manager: &'m dyn PoolManager,
        pool_type: StoragePoolType,
        pool_uuid: &str,
        path: &str,
        details: &HashMap<String, String>,
    ) -> VmstorResult<Self> {
        let connected = manager.connect_physical_disk(pool_type, pool_uuid, path, details)?;
        if !connected {
            return Err(VmstorError::Storage(format!(
                "Unable to connect {} on {} pool {}",
                path, pool_type, pool_uuid
            )));
        }
        tracing::debug!(pool = %pool_uuid, path = %path, "Connected physical disk");
        Ok(Self {
            manager,
            pool_type,
            pool_uuid: pool_uuid.to_string(),
            path: path.to_string(),
            armed: true,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Leave the path connected (e.g. after a successful attach).
    pub fn keep(mut self) -> String {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ConnectedPath<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self
            .manager
            .disconnect_physical_disk(self.pool_type, &self.pool_uuid, &self.path)
        {
            Ok(true) => {
                tracing::debug!(pool = %self.pool_uuid, path = %self.path, "Disconnected physical disk")
            }
            Ok(false) => {
                tracing::warn!(pool = %self.pool_uuid, path = %self.path, "Pool manager reported disconnect failure")
            }
            Err(e) => {
                tracing::warn!(pool = %self.pool_uuid, path = %self.path, error = %e, "Failed to disconnect physical disk")
            }
        }
    }
}

/// Secondary storage mounted as a temporary pool. Released on drop.
pub struct MountedStore<'m> {
    manager: &'m dyn PoolManager,
    pool: Arc<dyn StoragePool>,
}

impl<'m> MountedStore<'m> {
    pub fn mount(manager: &'m dyn PoolManager, uri: &str) -> VmstorResult<Self> {
        let pool = manager.storage_pool_by_uri(uri)?;
        tracing::debug!(uri = %uri, local_path = %pool.info().local_path, "Mounted secondary storage");
        Ok(Self { manager, pool })
    }

    pub fn pool(&self) -> &dyn StoragePool {
        self.pool.as_ref()
    }
}

impl Drop for MountedStore<'_> {
    fn drop(&mut self) {
        let info = self.pool.info();
        if let Err(e) = self.manager.release_storage_pool(info.pool_type, &info.uuid) {
            tracing::warn!(pool = %info.uuid, error = %e, "Failed to release secondary storage");
        } else {
            tracing::debug!(pool = %info.uuid, "Released secondary storage");
        }
    }
}
