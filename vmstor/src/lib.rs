//! vmstor - storage-operation engine for KVM host agents
//!
//! Attaches and detaches disks on running VMs, takes and merges snapshots,
//! and provisions volumes across object-store, clustered-block, shared
//! filesystem and managed SAN pools.
//!
//! The entry point is [`StorageOperationFacade`]: hand it a
//! [`Command`](vmstor_shared::Command), get back an
//! [`Answer`](vmstor_shared::Answer).

pub mod attach;
pub mod backend;
pub mod disk;
pub mod facade;
pub mod format;
pub mod hypervisor;
pub mod metrics;
pub mod options;
pub mod pool;
pub mod provision;
pub mod snapshot;
pub mod tools;
pub mod util;

pub use attach::DiskAttachmentController;
pub use facade::StorageOperationFacade;
pub use format::{FormatNegotiator, PoolCapabilities};
pub use metrics::{StorageMetrics, StorageMetricsStorage};
pub use options::{ResolvedScripts, StorageOptions};
pub use provision::VolumeProvisioner;
pub use snapshot::{FlattenOutcome, SnapshotEngine};
pub use tools::Collaborators;

pub use vmstor_shared::{Answer, Command, VmstorError, VmstorResult};
