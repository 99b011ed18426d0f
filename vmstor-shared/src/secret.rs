//! Scoped encryption passphrase.
//!
//! A [`Passphrase`] owns its key bytes and overwrites them with zeros when it
//! is dropped, so a descriptor that goes out of scope on any exit path takes
//! its key material with it.

use std::fmt;
use std::sync::atomic::{compiler_fence, Ordering};

use serde::{Deserialize, Deserializer};

pub struct Passphrase {
    bytes: Vec<u8>,
}

impl Passphrase {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Borrow the raw key bytes. Callers must not copy them into
    /// longer-lived buffers.
    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

impl From<&str> for Passphrase {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes().to_vec())
    }
}

impl Clone for Passphrase {
    fn clone(&self) -> Self {
        Self::new(self.bytes.clone())
    }
}

impl PartialEq for Passphrase {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

impl<'de> Deserialize<'de> for Passphrase {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(raw.into_bytes()))
    }
}

impl Drop for Passphrase {
    fn drop(&mut self) {
        wipe(&mut self.bytes);
    }
}

fn wipe(buf: &mut [u8]) {
    for byte in buf.iter_mut() {
        // SAFETY: `byte` is a valid, exclusively borrowed u8.
        unsafe { std::ptr::write_volatile(byte, 0) };
    }
    compiler_fence(Ordering::SeqCst);
}
