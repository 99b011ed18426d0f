use vmstor_shared::descriptor::{SnapshotDescriptor, StoragePoolType};
use vmstor_shared::errors::{VmstorError, VmstorResult};

use super::{SnapshotEngine, object_snapshot_ref};

/// Result of one flatten pass over a snapshot's clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlattenOutcome {
    /// The snapshot has no dependent clones left.
    Final,
    /// More clones remain; the caller should flatten again.
    Partial,
}

impl SnapshotEngine {
    /// Detach clones from an object-store snapshot so it can be removed.
    pub fn flatten_from_snapshot(&self, snapshot: &SnapshotDescriptor) -> VmstorResult<FlattenOutcome> {
        let pool_ref = snapshot.volume.pool()?;
        if pool_ref.pool_type != StoragePoolType::Rbd {
            return Err(VmstorError::Unsupported(format!(
                "Flatten is not supported for storage pool type of {}",
                pool_ref.pool_type
            )));
        }

        let pool = self
            .collab
            .pools
            .storage_pool(pool_ref.pool_type, &pool_ref.uuid)?;
        let (image, name) = object_snapshot_ref(snapshot);
        let session = self.collab.object_store.connect(pool.info())?;

        let snapshots = session.snapshot_list(image)?;
        let Some(found) = snapshots.iter().find(|s| s.name == name) else {
            tracing::warn!(image = %image, snapshot = %name, "Snapshot not found, nothing to flatten");
            return Ok(FlattenOutcome::Final);
        };

        let children = session.children(image, name)?;
        match children.as_slice() {
            [] => {
                tracing::debug!(image = %image, snapshot = %name, "Snapshot has no clones");
                Ok(FlattenOutcome::Final)
            }
            [child] => {
                session.flatten(child)?;
                if found.protected {
                    session.snapshot_unprotect(image, name)?;
                }
                session.snapshot_remove(image, name)?;
                tracing::info!(image = %image, snapshot = %name, child = %child, "Flattened last clone and removed snapshot");
                Ok(FlattenOutcome::Final)
            }
            [first, rest @ ..] => {
                session.flatten(first)?;
                tracing::info!(
                    image = %image,
                    snapshot = %name,
                    child = %first,
                    remaining = rest.len(),
                    "Flattened clone; more remain"
                );
                Ok(FlattenOutcome::Partial)
            }
        }
    }
}
