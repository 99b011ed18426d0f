//! `qemu-img convert` wrapper.

use vmstor_shared::descriptor::ImageFormat;
use vmstor_shared::errors::VmstorResult;

use super::{ConvertRequest, ImageConverter};
use crate::util::{KeyFile, run_tool};

const SECRET_ID: &str = "sec0";

pub struct QemuImg {
    binary: String,
}

impl QemuImg {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

/// Arguments for one conversion. `key_file` holds the source passphrase when
/// the source is encrypted.
fn convert_args(req: &ConvertRequest<'_>, key_file: Option<&str>) -> Vec<String> {
    let mut args = vec!["convert".to_string()];
    if req.force_share {
        args.push("-U".into());
    }
    args.push("-O".into());
    args.push(req.dst.format.as_str().to_string());

    match key_file {
        Some(key) => {
            args.push("--object".into());
            args.push(format!("secret,id={},file={},format=raw", SECRET_ID, key));
            args.push("--image-opts".into());
            let opts = match req.src.format {
                ImageFormat::Qcow2 => format!(
                    "driver=qcow2,encrypt.key-secret={},file.filename={}",
                    SECRET_ID, req.src.path
                ),
                _ => format!(
                    "driver=luks,key-secret={},file.filename={}",
                    SECRET_ID, req.src.path
                ),
            };
            args.push(opts);
        }
        None => {
            if let Some(snapshot) = req.src_snapshot {
                args.push("-l".into());
                args.push(format!("snapshot.name={}", snapshot));
            }
            args.push("-f".into());
            args.push(req.src.format.as_str().to_string());
            args.push(req.src.path.clone());
        }
    }

    args.push(req.dst.path.clone());
    args
}

impl ImageConverter for QemuImg {
    fn convert(&self, req: &ConvertRequest<'_>) -> VmstorResult<()> {
        tracing::info!(
            src = %req.src.path,
            dst = %req.dst.path,
            src_format = %req.src.format,
            dst_format = %req.dst.format,
            "Converting disk image"
        );

        let key = match req.src_secret {
            Some(secret) if !secret.is_empty() => Some(KeyFile::write(secret)?),
            _ => None,
        };
        let key_path = key.as_ref().map(|k| k.path().display().to_string());
        let args = convert_args(req, key_path.as_deref());

        run_tool(&self.binary, &args, req.timeout)?.into_result(&self.binary)?;
        Ok(())
    }
}
