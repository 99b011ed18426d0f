//! `rbd` CLI client for the distributed object store.

use std::time::Duration;

use serde_json::Value;
use vmstor_shared::errors::{VmstorError, VmstorResult};

use super::{DeviceMapper, ObjectSnapshot, ObjectStoreClient, ObjectStoreSession};
use crate::pool::PoolInfo;
use crate::util::{KeyFile, run_tool};

/// Exit code reported when the child was killed by a signal.
const SIGNALLED: i32 = 4; // EINTR

#[derive(Debug, Clone)]
pub struct RbdCli {
    binary: String,
    timeout: Duration,
    mount_timeout: Duration,
}

impl RbdCli {
    pub fn new(binary: impl Into<String>, timeout: Duration, mount_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            mount_timeout,
        }
    }

    fn open(&self, pool: &PoolInfo) -> VmstorResult<RbdSession> {
        let key = match &pool.auth_secret {
            Some(secret) if !secret.is_empty() => Some(KeyFile::write(secret)?),
            _ => None,
        };
        let auth = auth_args(pool, key.as_ref().map(|k| k.path().display().to_string()), self.mount_timeout);
        Ok(RbdSession {
            cli: self.clone(),
            pool_name: pool.source_dir.clone(),
            auth,
            _key: key,
        })
    }
}

fn auth_args(pool: &PoolInfo, key_path: Option<String>, mount_timeout: Duration) -> Vec<String> {
    let mut args = Vec::new();
    if !pool.source_host.is_empty() {
        args.push("--mon-host".to_string());
        args.push(if pool.source_port > 0 {
            format!("{}:{}", pool.source_host, pool.source_port)
        } else {
            pool.source_host.clone()
        });
    }
    if let Some(user) = &pool.auth_user {
        args.push("--id".to_string());
        args.push(user.clone());
    }
    if let Some(path) = key_path {
        args.push("--keyfile".to_string());
        args.push(path);
    }
    args.push("--client_mount_timeout".to_string());
    args.push(mount_timeout.as_secs().to_string());
    args
}

pub struct RbdSession {
    cli: RbdCli,
    pool_name: String,
    auth: Vec<String>,
    _key: Option<KeyFile>,
}

impl RbdSession {
    fn image_spec(&self, image: &str) -> String {
        // Disk paths already carry the pool prefix.
        if image.contains('/') {
            image.to_string()
        } else {
            format!("{}/{}", self.pool_name, image)
        }
    }

    fn snap_spec(&self, image: &str, snapshot: &str) -> String {
        format!("{}@{}", self.image_spec(image), snapshot)
    }

    fn run(&self, args: &[&str]) -> VmstorResult<String> {
        let mut all: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        all.extend(self.auth.iter().cloned());

        let output = run_tool(&self.cli.binary, &all, self.cli.timeout)?;
        if output.success() {
            return Ok(output.stdout);
        }
        Err(VmstorError::Backend {
            code: output.code.unwrap_or(SIGNALLED),
            message: format!("rbd {} failed: {}", args.join(" "), output.error_text()),
        })
    }

    fn run_json(&self, args: &[&str]) -> VmstorResult<Value> {
        let out = self.run(args)?;
        serde_json::from_str(&out).map_err(|e| {
            VmstorError::Internal(format!("Unparseable rbd output for {}: {}", args.join(" "), e))
        })
    }
}

impl ObjectStoreSession for RbdSession {
    fn snapshot_create(&self, image: &str, snapshot: &str) -> VmstorResult<()> {
        self.run(&["snap", "create", &self.snap_spec(image, snapshot)])?;
        Ok(())
    }

    fn snapshot_list(&self, image: &str) -> VmstorResult<Vec<ObjectSnapshot>> {
        let value = self.run_json(&["snap", "ls", &self.image_spec(image), "--format", "json"])?;
        Ok(parse_snapshots(&value))
    }

    fn snapshot_protect(&self, image: &str, snapshot: &str) -> VmstorResult<()> {
        self.run(&["snap", "protect", &self.snap_spec(image, snapshot)])?;
        Ok(())
    }

    fn snapshot_unprotect(&self, image: &str, snapshot: &str) -> VmstorResult<()> {
        self.run(&["snap", "unprotect", &self.snap_spec(image, snapshot)])?;
        Ok(())
    }

    fn snapshot_remove(&self, image: &str, snapshot: &str) -> VmstorResult<()> {
        self.run(&["snap", "rm", &self.snap_spec(image, snapshot)])?;
        Ok(())
    }

    fn clone_snapshot(&self, image: &str, snapshot: &str, dest_image: &str) -> VmstorResult<()> {
        self.run(&[
            "clone",
            &self.snap_spec(image, snapshot),
            &self.image_spec(dest_image),
        ])?;
        Ok(())
    }

    fn children(&self, image: &str, snapshot: &str) -> VmstorResult<Vec<String>> {
        let value = self.run_json(&[
            "children",
            &self.snap_spec(image, snapshot),
            "--format",
            "json",
        ])?;
        Ok(parse_children(&value))
    }

    fn flatten(&self, image: &str) -> VmstorResult<()> {
        self.run(&["flatten", &self.image_spec(image)])?;
        Ok(())
    }

    fn resize(&self, image: &str, size: u64) -> VmstorResult<()> {
        let mib = size.div_ceil(1024 * 1024);
        self.run(&[
            "resize",
            &self.image_spec(image),
            "--size",
            &format!("{}M", mib),
        ])?;
        Ok(())
    }
}

impl ObjectStoreClient for RbdCli {
    fn connect(&self, pool: &PoolInfo) -> VmstorResult<Box<dyn ObjectStoreSession>> {
        Ok(Box::new(self.open(pool)?))
    }
}

impl DeviceMapper for RbdCli {
    fn map(&self, pool: &PoolInfo, image: &str, dedup: bool) -> VmstorResult<String> {
        let session = self.open(pool)?;
        let spec = session.image_spec(image);
        let out = session.run(&["device", "map", &spec])?;
        let node = if dedup {
            dedup_node(image)
        } else {
            out.trim().to_string()
        };
        tracing::debug!(image = %spec, node = %node, "Mapped image");
        Ok(node)
    }

    fn unmap(&self, pool: &PoolInfo, image: &str, _dedup: bool) -> VmstorResult<()> {
        let session = self.open(pool)?;
        let spec = session.image_spec(image);
        session.run(&["device", "unmap", &spec])?;
        tracing::debug!(image = %spec, "Unmapped image");
        Ok(())
    }
}

/// Device-mapper node of a deduplicated mapping.
pub(crate) fn dedup_node(image: &str) -> String {
    let base = image.rsplit('/').next().unwrap_or(image);
    format!("/dev/mapper/{}", base.replace('-', ""))
}

fn parse_snapshots(value: &Value) -> Vec<ObjectSnapshot> {
    value
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let name = entry.get("name")?.as_str()?.to_string();
                    let protected = match entry.get("protected") {
                        Some(Value::Bool(b)) => *b,
                        Some(Value::String(s)) => s == "true",
                        _ => false,
                    };
                    Some(ObjectSnapshot { name, protected })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Accepts both `["pool/image"]` and `[{"pool": .., "image": ..}]`.
fn parse_children(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| match entry {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(_) => {
                        let image = entry.get("image")?.as_str()?;
                        match entry.get("pool").and_then(Value::as_str) {
                            Some(pool) => Some(format!("{}/{}", pool, image)),
                            None => Some(image.to_string()),
                        }
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}
