//! On-disk image inspection.

mod qcow2;

pub use qcow2::{Qcow2Header, qcow2_virtual_size};
