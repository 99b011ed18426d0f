//! Qcow2 header probe.
//!
//! Only the fixed part of the header is read; it is enough to learn the
//! virtual size and backing file of a template written by `qemu-img`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use vmstor_shared::errors::{VmstorError, VmstorResult};

/// "QFI\xfb"
const QCOW2_MAGIC: u32 = 0x514649fb;

/// Size of the version 2 header; version 3 headers are longer but share it.
const V2_HEADER_LEN: usize = 72;

/// Longest backing file name qemu accepts.
const MAX_BACKING_NAME_LEN: usize = 1023;

/// Parsed fixed header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qcow2Header {
    pub version: u32,
    pub size: u64,
    pub cluster_bits: u32,
    pub backing_file: Option<String>,
}

impl Qcow2Header {
    pub fn read(path: &Path) -> VmstorResult<Self> {
        let mut file = File::open(path).map_err(|e| {
            VmstorError::Storage(format!("Failed to open {}: {}", path.display(), e))
        })?;

        let mut header = [0u8; V2_HEADER_LEN];
        file.read_exact(&mut header).map_err(|e| {
            VmstorError::Storage(format!(
                "Failed to read header from {}: {}",
                path.display(),
                e
            ))
        })?;

        let magic = be_u32(&header, 0);
        if magic != QCOW2_MAGIC {
            return Err(VmstorError::Storage(format!(
                "Invalid qcow2 magic in {}: 0x{:08x}",
                path.display(),
                magic
            )));
        }

        let backing_offset = be_u64(&header, 8);
        let backing_len = be_u32(&header, 16) as usize;
        if backing_len > MAX_BACKING_NAME_LEN {
            return Err(VmstorError::Storage(format!(
                "Backing file name in {} is {} bytes, longer than {}",
                path.display(),
                backing_len,
                MAX_BACKING_NAME_LEN
            )));
        }
        let backing_file = if backing_offset > 0 && backing_len > 0 {
            let mut name = vec![0u8; backing_len];
            file.seek(SeekFrom::Start(backing_offset))
                .and_then(|_| file.read_exact(&mut name))
                .map_err(|e| {
                    VmstorError::Storage(format!(
                        "Failed to read backing file name from {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            Some(String::from_utf8_lossy(&name).into_owned())
        } else {
            None
        };

        Ok(Self {
            version: be_u32(&header, 4),
            size: be_u64(&header, 24),
            cluster_bits: be_u32(&header, 20),
            backing_file,
        })
    }
}

/// Virtual size in bytes of the qcow2 image at `path`.
pub fn qcow2_virtual_size(path: &Path) -> VmstorResult<u64> {
    Ok(Qcow2Header::read(path)?.size)
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn be_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_header(path: &Path, size: u64, backing: Option<&str>) {
        let mut buf = vec![0u8; 512];
        buf[0..4].copy_from_slice(&QCOW2_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&3u32.to_be_bytes());
        buf[20..24].copy_from_slice(&16u32.to_be_bytes());
        buf[24..32].copy_from_slice(&size.to_be_bytes());
        if let Some(name) = backing {
            buf[8..16].copy_from_slice(&256u64.to_be_bytes());
            buf[16..20].copy_from_slice(&(name.len() as u32).to_be_bytes());
            buf[256..256 + name.len()].copy_from_slice(name.as_bytes());
        }
        std::fs::write(path, buf).unwrap();
    }

    #[test]
    fn test_reads_virtual_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tmpl.qcow2");
        write_header(&path, 10 << 30, None);

        let header = Qcow2Header::read(&path).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.cluster_bits, 16);
        assert_eq!(header.backing_file, None);
        assert_eq!(qcow2_virtual_size(&path).unwrap(), 10 << 30);
    }

    #[test]
    fn test_reads_backing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("child.qcow2");
        write_header(&path, 1 << 30, Some("/mnt/p1/base.qcow2"));

        let header = Qcow2Header::read(&path).unwrap();
        assert_eq!(header.backing_file.as_deref(), Some("/mnt/p1/base.qcow2"));
    }

    #[test]
    fn test_rejects_oversized_backing_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("child.qcow2");
        write_header(&path, 1 << 30, Some("base"));
        let mut buf = std::fs::read(&path).unwrap();
        buf[16..20].copy_from_slice(&u32::MAX.to_be_bytes());
        std::fs::write(&path, buf).unwrap();

        let err = Qcow2Header::read(&path).unwrap_err();
        assert!(matches!(err, VmstorError::Storage(_)));
        assert!(err.to_string().contains("longer than 1023"));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk.raw");
        std::fs::write(&path, vec![0u8; 512]).unwrap();
        assert!(matches!(
            Qcow2Header::read(&path),
            Err(VmstorError::Storage(msg)) if msg.contains("Invalid qcow2 magic")
        ));
    }

    #[test]
    fn test_short_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short");
        std::fs::write(&path, b"QFI").unwrap();
        assert!(Qcow2Header::read(&path).is_err());
    }
}
