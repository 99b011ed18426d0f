//! In-memory collaborators for exercising the storage engine without a
//! hypervisor, pool manager or object store.
//!
//! Every fake records the calls it receives so tests can assert on the
//! exact sequence of external side effects.

mod host;
mod hypervisor;
mod object_store;
mod pool;
mod tools;

pub use host::TestHost;
pub use hypervisor::{FakeDomain, FakeHypervisor};
pub use object_store::{FakeImage, FakeObjectStore};
pub use pool::{CopyRecord, FakePool, FakePoolManager};
pub use tools::{CommitRecord, ConvertRecord, FakeConverter, FakeMapper, FakeMergeTool, FakeScripts};

use std::path::Path;

/// Write a minimal qcow2 (v3) header describing an image of `virtual_size` bytes.
pub fn write_qcow2_stub(path: &Path, virtual_size: u64) -> std::io::Result<()> {
    let mut buf = vec![0u8; 512];
    buf[0..4].copy_from_slice(&0x514649fbu32.to_be_bytes());
    buf[4..8].copy_from_slice(&3u32.to_be_bytes());
    buf[20..24].copy_from_slice(&16u32.to_be_bytes());
    buf[24..32].copy_from_slice(&virtual_size.to_be_bytes());
    std::fs::write(path, buf)
}
