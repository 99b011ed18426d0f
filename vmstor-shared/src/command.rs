//! Command and answer shapes exchanged with the agent layer.
//!
//! Only the shape is defined here; the transport that carries them is owned
//! by the caller.

use serde::{Deserialize, Serialize};

use crate::constants::detach::DEFAULT_WAIT_MS;
use crate::descriptor::{
    DiskBus, EncryptFormat, ImageFormat, MigrationOptions, SnapshotDescriptor, TemplateDescriptor,
    VolumeDescriptor,
};
use crate::errors::VmstorResult;

/// A disk to attach, plus where and how the guest should see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskAttachment {
    pub volume: VolumeDescriptor,
    /// Device slot; 0 maps to `vda`/`sda`.
    pub device_id: u32,
    #[serde(default)]
    pub bus_hint: Option<DiskBus>,
}

/// Source of a template export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemplateSource {
    Volume(VolumeDescriptor),
    Snapshot(SnapshotDescriptor),
}

fn default_wait_ms() -> u64 {
    DEFAULT_WAIT_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    CreateVolume {
        volume: VolumeDescriptor,
        #[serde(default)]
        migration: Option<MigrationOptions>,
    },
    DeleteVolume {
        volume: VolumeDescriptor,
    },
    CloneVolumeFromTemplate {
        template: TemplateDescriptor,
        volume: VolumeDescriptor,
    },
    CreateSnapshot {
        snapshot: SnapshotDescriptor,
    },
    DeleteSnapshot {
        snapshot: SnapshotDescriptor,
    },
    AttachVolume {
        attachment: DiskAttachment,
        vm_name: String,
    },
    DetachVolume {
        attachment: DiskAttachment,
        vm_name: String,
        #[serde(default = "default_wait_ms")]
        wait_timeout_ms: u64,
    },
    CopyVolume {
        src: VolumeDescriptor,
        dst: VolumeDescriptor,
    },
    CreateVolumeFromSnapshot {
        snapshot: SnapshotDescriptor,
        dst: VolumeDescriptor,
    },
    CreateTemplateFromVolumeOrSnapshot {
        source: TemplateSource,
        dst: TemplateDescriptor,
    },
    FlattenFromSnapshot {
        snapshot: SnapshotDescriptor,
    },
}

impl Command {
    pub fn from_json(raw: &str) -> VmstorResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Short operation name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateVolume { .. } => "create_volume",
            Command::DeleteVolume { .. } => "delete_volume",
            Command::CloneVolumeFromTemplate { .. } => "clone_volume_from_template",
            Command::CreateSnapshot { .. } => "create_snapshot",
            Command::DeleteSnapshot { .. } => "delete_snapshot",
            Command::AttachVolume { .. } => "attach_volume",
            Command::DetachVolume { .. } => "detach_volume",
            Command::CopyVolume { .. } => "copy_volume",
            Command::CreateVolumeFromSnapshot { .. } => "create_volume_from_snapshot",
            Command::CreateTemplateFromVolumeOrSnapshot { .. } => "create_template",
            Command::FlattenFromSnapshot { .. } => "flatten_from_snapshot",
        }
    }
}

/// The disk (or snapshot, or template) an operation produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultObject {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ImageFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt_format: Option<EncryptFormat>,
}

impl ResultObject {
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Outcome of one command. Either fully successful or failed with a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ResultObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Answer {
    pub fn ok() -> Self {
        Self {
            success: true,
            object: None,
            message: None,
        }
    }

    pub fn with_object(object: ResultObject) -> Self {
        Self {
            success: true,
            object: Some(object),
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            object: None,
            message: Some(message.into()),
        }
    }

    pub fn to_json(&self) -> VmstorResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detach_command_defaults_wait_budget() {
        let raw = r#"{
            "type": "detach_volume",
            "vm_name": "i-2-10-VM",
            "attachment": {
                "device_id": 1,
                "volume": {
                    "uuid": "v-1",
                    "path": "/mnt/p1/v-1",
                    "store": { "role": "primary", "pool_type": "network_filesystem", "uuid": "p1" }
                }
            }
        }"#;
        let cmd = Command::from_json(raw).unwrap();
        assert_eq!(cmd.name(), "detach_volume");
        match cmd {
            Command::DetachVolume {
                wait_timeout_ms,
                attachment,
                ..
            } => {
                assert_eq!(wait_timeout_ms, DEFAULT_WAIT_MS);
                assert_eq!(attachment.bus_hint, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_failed_answer_has_no_object() {
        let answer = Answer::failed("pool is out of space");
        assert!(!answer.success);
        let json = answer.to_json().unwrap();
        assert!(!json.contains("object"));
        assert!(json.contains("pool is out of space"));
    }
}
