//! Short-lived key files handed to external tools.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use vmstor_shared::errors::{VmstorError, VmstorResult};
use vmstor_shared::secret::Passphrase;

/// A passphrase written to a private temporary file.
///
/// The file is created mode 0600 and removed when the guard drops.
pub struct KeyFile {
    file: NamedTempFile,
}

impl KeyFile {
    pub fn write(passphrase: &Passphrase) -> VmstorResult<Self> {
        let mut file = NamedTempFile::new()
            .map_err(|e| VmstorError::Storage(format!("Failed to create key file: {}", e)))?;
        file.write_all(passphrase.expose())
            .and_then(|_| file.flush())
            .map_err(|e| {
                VmstorError::Storage(format!(
                    "Failed to write key file {}: {}",
                    file.path().display(),
                    e
                ))
            })?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Write `contents` to a temporary file that lives as long as the returned handle.
pub(crate) fn temp_document(contents: &str) -> VmstorResult<NamedTempFile> {
    let mut file = NamedTempFile::new()
        .map_err(|e| VmstorError::Storage(format!("Failed to create temp file: {}", e)))?;
    file.write_all(contents.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| {
            VmstorError::Storage(format!(
                "Failed to write temp file {}: {}",
                file.path().display(),
                e
            ))
        })?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_file_removed_on_drop() {
        let passphrase = Passphrase::from("s3cret");
        let key = KeyFile::write(&passphrase).unwrap();
        let path = key.path().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), b"s3cret");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o077, 0);
        }

        drop(key);
        assert!(!path.exists());
    }

    #[test]
    fn test_temp_document() {
        let doc = temp_document("<disk/>").unwrap();
        assert_eq!(std::fs::read_to_string(doc.path()).unwrap(), "<disk/>");
    }
}
