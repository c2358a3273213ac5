//! Content hashing.
//!
//! Files are streamed through SHA-256 in fixed-size blocks and reported as
//! lowercase hex. Another process may hold a file open while it is being
//! written, so [`hash_file_with_retry`] retries transient failures with a
//! fixed backoff before giving up.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const BLOCK_SIZE: usize = 8192;

/// Bounded retry for hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 15,
            backoff_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// SHA-256 hex digest of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 hex digest of a file's contents.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; BLOCK_SIZE];
    loop {
        let read = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// [`hash_file`] with bounded retries. A missing file is reported at once;
/// it will not reappear by waiting. Blocks the calling thread between
/// attempts.
pub fn hash_file_with_retry(path: &Path, policy: &RetryPolicy) -> std::io::Result<String> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match hash_file(path) {
            Ok(digest) => return Ok(digest),
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(err),
            Err(err) if attempt >= attempts => return Err(err),
            Err(_) => {
                attempt += 1;
                std::thread::sleep(policy.backoff());
            }
        }
    }
}
