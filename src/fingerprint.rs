//! Content fingerprinting.
//!
//! A fingerprint is the SHA-256 of a file's bytes plus its modification time
//! and size. Modification times are truncated to microseconds so that a value
//! read from disk compares equal to the same value read back from SQLite.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::SystemTime;

use crate::error::Result;
use crate::models::{ContentHash, FileFingerprint};

/// Fingerprint the file at `path`. Fails with `IngestError::Io` if the file
/// cannot be read.
pub fn compute(path: &Path) -> Result<FileFingerprint> {
    compute_with_contents(path).map(|(fp, _)| fp)
}

/// Fingerprint the file at `path` and hand back its bytes so callers that go
/// on to chunk the file do not read it twice.
pub fn compute_with_contents(path: &Path) -> Result<(FileFingerprint, Vec<u8>)> {
    let metadata = std::fs::metadata(path)?;
    let bytes = std::fs::read(path)?;
    let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

    let fp = FileFingerprint {
        path: path.to_string_lossy().to_string(),
        content_hash: hash_bytes(&bytes),
        modified_time: truncate_to_micros(DateTime::<Utc>::from(modified)),
        size_bytes: bytes.len() as u64,
    };
    Ok((fp, bytes))
}

pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}
