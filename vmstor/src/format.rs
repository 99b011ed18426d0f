//! Pool capability table and image format negotiation.

use vmstor_shared::descriptor::{ImageFormat, StoragePoolType};

/// Static facts about a pool type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCapabilities {
    /// Snapshots are taken by the backend (or a script), never through the
    /// hypervisor's live external snapshot.
    pub external_snapshot: bool,
    /// Template clones go through connect, copy, disconnect.
    pub physical_disk_copy: bool,
    pub default_format: ImageFormat,
    /// Requested formats are ignored; the default is always used.
    pub forces_default_format: bool,
    /// The backend honours guest UNMAP requests safely.
    pub discard_safe: bool,
}

/// Pure mapping from pool type to format and capabilities.
pub struct FormatNegotiator;

impl FormatNegotiator {
    pub fn capabilities(pool_type: StoragePoolType) -> PoolCapabilities {
        use StoragePoolType::*;

        let default_format = Self::default_format(pool_type);
        PoolCapabilities {
            external_snapshot: matches!(pool_type, Clvm | Rbd | SharedMountPoint),
            physical_disk_copy: matches!(pool_type, PowerFlex | Linstor),
            default_format,
            forces_default_format: matches!(pool_type, Rbd),
            discard_safe: matches!(pool_type, Rbd | Linstor),
        }
    }

    /// Object-store, clustered-block and managed SAN pools are RAW; the rest QCOW2.
    pub fn default_format(pool_type: StoragePoolType) -> ImageFormat {
        use StoragePoolType::*;

        match pool_type {
            Rbd | Clvm | PowerFlex | Linstor | Iscsi => ImageFormat::Raw,
            Filesystem | NetworkFilesystem | SharedMountPoint | Gluster => ImageFormat::Qcow2,
        }
    }

    pub fn resolve_format(
        requested: Option<ImageFormat>,
        pool_type: StoragePoolType,
        shareable: bool,
    ) -> ImageFormat {
        if shareable {
            return ImageFormat::Raw;
        }
        let caps = Self::capabilities(pool_type);
        if caps.forces_default_format {
            return caps.default_format;
        }
        requested.unwrap_or(caps.default_format)
    }
}
