//! vmstor shared types
//!
//! Error taxonomy, descriptors and command/answer shapes used by both the
//! storage engine (`vmstor`) and the agent layer that carries commands to it.

pub mod command;
pub mod constants;
pub mod descriptor;
pub mod errors;
pub mod secret;

pub use command::{Answer, Command, DiskAttachment, ResultObject, TemplateSource};
pub use descriptor::{
    CacheMode, CloneType, DataStore, DiskBus, EncryptFormat, ImageFormat, IoLimits,
    MigrationOptions, PoolRef, ProvisioningType, RateLimit, ScopeType, SnapshotDescriptor,
    SnapshotStrategy, StoragePoolType, TemplateDescriptor, VolumeDescriptor, VolumeType,
};
pub use errors::{VmstorError, VmstorResult};
pub use secret::Passphrase;
