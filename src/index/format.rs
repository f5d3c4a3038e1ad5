//! Persisted index layout.
//!
//! Two blobs make up one committed index:
//!
//! ```text
//! index.json          manifest: generation, dims, metric, next_id, count,
//!                     vector file name + SHA-256, both id maps, metadata
//! vectors.<gen>.bin   "IHVX" | version u32 | dims u32 | count u64 |
//!                     count × (internal_id u64 | dims × f32), little-endian
//! ```
//!
//! The manifest is written last; its rename is the commit point. A vector
//! file is only trusted when its digest matches the one in the manifest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::backend::Metric;
use crate::error::{IngestError, Result};
use crate::models::Metadata;

pub const MANIFEST_NAME: &str = "index.json";
pub const FORMAT_VERSION: u32 = 1;

const MAGIC: &[u8; 4] = b"IHVX";
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

pub fn vectors_file_name(generation: u64) -> String {
    format!("vectors.{}.bin", generation)
}

pub fn is_vectors_file(name: &str) -> bool {
    name.starts_with("vectors.") && name.ends_with(".bin")
}

/// Generation named by a vector file, `None` for any other name.
pub fn generation_of(name: &str) -> Option<u64> {
    name.strip_prefix("vectors.")?
        .strip_suffix(".bin")?
        .parse()
        .ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub generation: u64,
    pub dims: usize,
    pub metric: Metric,
    pub next_id: u64,
    pub count: u64,
    pub vectors_file: String,
    pub vectors_sha256: String,
    pub id_to_chunk: BTreeMap<u64, String>,
    pub chunk_to_id: BTreeMap<String, u64>,
    pub entries: BTreeMap<u64, Metadata>,
    pub saved_at: DateTime<Utc>,
}

/// Encode `(internal_id, vector)` rows. Rows must already be in id order.
pub fn encode_vectors(dims: usize, rows: &[(u64, Vec<f32>)]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + rows.len() * (8 + dims * 4));
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(dims as u32).to_le_bytes());
    bytes.extend_from_slice(&(rows.len() as u64).to_le_bytes());
    for (id, vector) in rows {
        bytes.extend_from_slice(&id.to_le_bytes());
        for v in vector {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
    }
    bytes
}

fn corrupt(msg: impl Into<String>) -> IngestError {
    IngestError::CorruptIndex(msg.into())
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Decode a vector file, checking it against the expected dims.
pub fn decode_vectors(bytes: &[u8], expected_dims: usize) -> Result<Vec<(u64, Vec<f32>)>> {
    if bytes.len() < HEADER_LEN {
        return Err(corrupt(format!(
            "vector file truncated: {} bytes, header needs {}",
            bytes.len(),
            HEADER_LEN
        )));
    }
    if &bytes[0..4] != MAGIC {
        return Err(corrupt("vector file has bad magic"));
    }
    let version = read_u32(bytes, 4);
    if version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported vector file version {}", version)));
    }
    let dims = read_u32(bytes, 8) as usize;
    if dims != expected_dims {
        return Err(corrupt(format!(
            "vector file dims {} != manifest dims {}",
            dims, expected_dims
        )));
    }
    let count = read_u64(bytes, 12) as usize;
    let row_len = 8 + dims * 4;
    let expected_len = count
        .checked_mul(row_len)
        .and_then(|n| n.checked_add(HEADER_LEN))
        .ok_or_else(|| corrupt("vector file count overflows"))?;
    if bytes.len() != expected_len {
        return Err(corrupt(format!(
            "vector file is {} bytes, header promises {}",
            bytes.len(),
            expected_len
        )));
    }

    let mut rows = Vec::with_capacity(count);
    let mut at = HEADER_LEN;
    for _ in 0..count {
        let id = read_u64(bytes, at);
        at += 8;
        let vector: Vec<f32> = bytes[at..at + dims * 4]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        at += dims * 4;
        rows.push((id, vector));
    }
    Ok(rows)
}
