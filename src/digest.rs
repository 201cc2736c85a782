//! Content digests, chain IDs and legacy layer IDs
//!
//! Chain IDs follow Docker's layer store exactly:
//!
//! ```text
//! ChainID(L0)    = DiffID(L0)
//! ChainID(L0..n) = sha256(ChainID(L0..n-1) + " " + DiffID(Ln))
//! ```
//!
//! `docker load` recomputes the same values from the manifest, so any
//! deviation here makes the archive unloadable.

use sha2::{Digest, Sha256};
use std::io::{self, Write};

/// Creation time stamped into every legacy layer descriptor
pub const LEGACY_CREATED: &str = "1970-01-01T00:00:00Z";

/// `sha256:<hex>` digest of a byte slice
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

/// Chain ID of a layer given its parent's chain ID
pub fn chain_id(parent: Option<&str>, diff_id: &str) -> String {
    match parent {
        None => diff_id.to_string(),
        Some(parent) => sha256_digest(format!("{} {}", parent, diff_id).as_bytes()),
    }
}

/// Chain IDs for every prefix of an ordered diff ID list
pub fn chain_ids<S: AsRef<str>>(diff_ids: &[S]) -> Vec<String> {
    let mut chain: Vec<String> = Vec::with_capacity(diff_ids.len());
    for diff_id in diff_ids {
        let next = chain_id(chain.last().map(String::as_str), diff_id.as_ref());
        chain.push(next);
    }
    chain
}

/// Legacy (v1) layer ID used as the layer directory name inside an archive
///
/// Derived from the canonical JSON of the layer descriptor, so it depends
/// only on the chain ID and the parent's legacy ID.
pub fn legacy_layer_id(chain_id: &str, parent: Option<&str>) -> String {
    let mut descriptor = serde_json::Map::new();
    descriptor.insert("created".to_string(), LEGACY_CREATED.into());
    descriptor.insert("layer_id".to_string(), chain_id.into());
    if let Some(parent) = parent {
        descriptor.insert("parent".to_string(), parent.into());
    }

    // serde_json::Map keeps keys sorted without the preserve_order feature
    let canonical = serde_json::Value::Object(descriptor).to_string();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

/// Writer that hashes everything passing through it
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Return the inner writer, the `sha256:` digest and the byte count
    pub fn finish(self) -> (W, String, u64) {
        let digest = format!("sha256:{:x}", self.hasher.finalize());
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
