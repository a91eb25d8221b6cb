//! The meta server admits a chunk server only if it recognizes the digest of the running binary.
//!  This identifies nodes that missed a binary update, or that run a version the meta server
//!  does not know about.

use std::fmt::Write;
use std::path::Path;

use anyhow::Context;
use sha2::{Digest, Sha256};

pub fn checksum_of_bytes(data: &[u8]) -> String {
    let mut sha256 = Sha256::default();
    sha256.update(data);

    let digest = sha256.finalize();
    let mut result = String::with_capacity(2 * digest.len());
    for b in digest.iter() {
        let _ = write!(result, "{:02x}", b);
    }
    result
}

pub fn checksum_of_file(path: impl AsRef<Path>) -> anyhow::Result<String> {
    let path = path.as_ref();
    let data = std::fs::read(path)
        .with_context(|| format!("reading {:?} for build checksum", path))?;
    Ok(checksum_of_bytes(&data))
}

pub fn checksum_of_current_exe() -> anyhow::Result<String> {
    checksum_of_file(std::env::current_exe()?)
}
