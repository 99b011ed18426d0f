//! Storage constants shared between the engine and the agent layer.
//!
//! These values appear in on-disk layouts and hypervisor requests, so both
//! sides must agree on them.

/// Snapshot placement and capacity rules
pub mod snapshot {
    /// Directory (relative to the pool's local path) holding snapshot artifacts
    pub const ROOT_DIR: &str = "snapshots";

    /// Required ratio of free pool space to disk size before a live snapshot
    pub const MIN_AVAILABLE_TO_DISK_RATIO: f64 = 1.05;

    /// Separator between disk name and snapshot name in file artifacts
    pub const NAME_SEPARATOR: char = '@';
}

/// Hypervisor (libvirt) interaction
pub mod libvirt {
    /// Error text reported by older hypervisors for disk-only live snapshots
    pub const OPERATION_NOT_SUPPORTED: &str = "Operation not supported";

    /// `VIR_DOMAIN_SNAPSHOT_CREATE_DISK_ONLY`
    pub const SNAPSHOT_CREATE_DISK_ONLY: u32 = 16;

    /// First version (major * 1_000_000 + minor * 1_000 + micro) whose
    /// `blockcommit` accepts `--delete`
    pub const BLOCKCOMMIT_DELETE_MIN_VERSION: u64 = 6_000_000;
}

/// Detach confirmation polling
pub mod detach {
    /// Interval between live device list re-reads
    pub const POLL_INTERVAL_MS: u64 = 1000;

    /// Wait budget used when the command does not carry one
    pub const DEFAULT_WAIT_MS: u64 = 10_000;
}

/// Device attachment
pub mod attach {
    /// Maximum length of a disk serial exposed to the guest
    pub const SERIAL_MAX_LEN: usize = 20;
}

/// Keys in descriptor `details` maps
pub mod details {
    /// Managed volume IQN
    pub const IQN: &str = "iqn";

    /// Managed volume path
    pub const PATH: &str = "path";

    /// I/O policy override (`native`, `threads`, `io_uring`)
    pub const IO_POLICY: &str = "io.policy";
}

/// Object-store connection defaults
pub mod object_store {
    /// Seconds before a monitor connection attempt is abandoned
    pub const CLIENT_MOUNT_TIMEOUT_SECS: u64 = 30;

    /// Default monitor port
    pub const DEFAULT_MON_PORT: u16 = 6789;
}

/// Template artifacts written to secondary storage
pub mod template {
    /// Metadata file written next to an exported template
    pub const PROPERTIES_FILE: &str = "template.properties";

    /// Date stamp appended to the source name in `template.properties`
    pub const DATE_FORMAT: &str = "%m_%d_%Y";
}
