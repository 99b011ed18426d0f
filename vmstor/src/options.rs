//! Configuration for the storage engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vmstor_shared::constants::{detach, object_store, snapshot};
use vmstor_shared::errors::{VmstorError, VmstorResult};

use crate::util::find_binary;

/// Environment variables read by [`StorageOptions::from_env`].
pub mod envs {
    pub const SCRIPTS_DIR: &str = "VMSTOR_SCRIPTS_DIR";
    pub const COMMAND_TIMEOUT_MS: &str = "VMSTOR_COMMAND_TIMEOUT_MS";
    pub const DETACH_POLL_INTERVAL_MS: &str = "VMSTOR_DETACH_POLL_INTERVAL_MS";
    pub const DETACH_WAIT_MS: &str = "VMSTOR_DETACH_WAIT_MS";
    pub const QEMU_IMG: &str = "VMSTOR_QEMU_IMG";
    pub const VIRSH: &str = "VMSTOR_VIRSH";
    pub const RBD: &str = "VMSTOR_RBD";
}

/// Engine configuration.
///
/// Every field has a default, so a partial JSON document (or none at all)
/// yields a usable configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Directory holding the storage management scripts.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    /// Script that creates/destroys clustered-block snapshots.
    #[serde(default = "default_manage_snapshot_script")]
    pub manage_snapshot_script: String,

    /// Script that exports a volume as a template.
    #[serde(default = "default_create_template_script")]
    pub create_template_script: String,

    /// Upper bound for any single external tool invocation.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Tick between live device list re-reads while confirming a detach.
    #[serde(default = "default_detach_poll_interval_ms")]
    pub detach_poll_interval_ms: u64,

    #[serde(default = "default_detach_wait_ms")]
    pub default_detach_wait_ms: u64,

    /// Snapshot directory under a pool's local path.
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,

    #[serde(default = "default_qemu_img_binary")]
    pub qemu_img_binary: String,

    #[serde(default = "default_virsh_binary")]
    pub virsh_binary: String,

    #[serde(default = "default_rbd_binary")]
    pub rbd_binary: String,

    #[serde(default = "default_object_store_mount_timeout_secs")]
    pub object_store_mount_timeout_secs: u64,
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("/usr/share/vmstor/scripts/storage")
}

fn default_manage_snapshot_script() -> String {
    "managesnapshot.sh".to_string()
}

fn default_create_template_script() -> String {
    "createtmplt.sh".to_string()
}

fn default_command_timeout_ms() -> u64 {
    7_200_000
}

fn default_detach_poll_interval_ms() -> u64 {
    detach::POLL_INTERVAL_MS
}

fn default_detach_wait_ms() -> u64 {
    detach::DEFAULT_WAIT_MS
}

fn default_snapshot_dir() -> String {
    snapshot::ROOT_DIR.to_string()
}

fn default_qemu_img_binary() -> String {
    "qemu-img".to_string()
}

fn default_virsh_binary() -> String {
    "virsh".to_string()
}

fn default_rbd_binary() -> String {
    "rbd".to_string()
}

fn default_object_store_mount_timeout_secs() -> u64 {
    object_store::CLIENT_MOUNT_TIMEOUT_SECS
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            scripts_dir: default_scripts_dir(),
            manage_snapshot_script: default_manage_snapshot_script(),
            create_template_script: default_create_template_script(),
            command_timeout_ms: default_command_timeout_ms(),
            detach_poll_interval_ms: default_detach_poll_interval_ms(),
            default_detach_wait_ms: default_detach_wait_ms(),
            snapshot_dir: default_snapshot_dir(),
            qemu_img_binary: default_qemu_img_binary(),
            virsh_binary: default_virsh_binary(),
            rbd_binary: default_rbd_binary(),
            object_store_mount_timeout_secs: default_object_store_mount_timeout_secs(),
        }
    }
}

/// Absolute paths of the scripts the engine shells out to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedScripts {
    pub manage_snapshot: PathBuf,
    pub create_template: PathBuf,
}

impl StorageOptions {
    /// Defaults overlaid with `VMSTOR_*` environment variables.
    pub fn from_env() -> VmstorResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> VmstorResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        if let Some(dir) = lookup(envs::SCRIPTS_DIR) {
            options.scripts_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup(envs::COMMAND_TIMEOUT_MS) {
            options.command_timeout_ms = parse_ms(envs::COMMAND_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(envs::DETACH_POLL_INTERVAL_MS) {
            options.detach_poll_interval_ms = parse_ms(envs::DETACH_POLL_INTERVAL_MS, &v)?;
        }
        if let Some(v) = lookup(envs::DETACH_WAIT_MS) {
            options.default_detach_wait_ms = parse_ms(envs::DETACH_WAIT_MS, &v)?;
        }
        if let Some(v) = lookup(envs::QEMU_IMG) {
            options.qemu_img_binary = v;
        }
        if let Some(v) = lookup(envs::VIRSH) {
            options.virsh_binary = v;
        }
        if let Some(v) = lookup(envs::RBD) {
            options.rbd_binary = v;
        }

        Ok(options)
    }

    pub fn from_json_file(path: &Path) -> VmstorResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            VmstorError::Config(format!(
                "Failed to read options file {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            VmstorError::Config(format!(
                "Invalid options file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Locate every required script. A missing script is fatal.
    pub fn resolve_scripts(&self) -> VmstorResult<ResolvedScripts> {
        let dirs = [self.scripts_dir.as_path()];
        Ok(ResolvedScripts {
            manage_snapshot: find_binary(&self.manage_snapshot_script, &dirs)?,
            create_template: find_binary(&self.create_template_script, &dirs)?,
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn detach_poll_interval(&self) -> Duration {
        Duration::from_millis(self.detach_poll_interval_ms)
    }
}

fn parse_ms(key: &str, value: &str) -> VmstorResult<u64> {
    value.trim().parse::<u64>().map_err(|e| {
        VmstorError::Config(format!("{} must be a number of milliseconds, got '{}': {}", key, value, e))
    })
}
