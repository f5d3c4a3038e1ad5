//! Core data models used throughout the ingestion engine.
//!
//! These types represent observed file states, index entries, ledger records,
//! and the fixed-shape summaries handed back to the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A SHA-256 content digest.
pub type ContentHash = [u8; 32];

/// Observed state of a file at scan time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    pub path: String,
    pub content_hash: ContentHash,
    pub modified_time: DateTime<Utc>,
    pub size_bytes: u64,
}

impl FileFingerprint {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.content_hash)
    }
}

/// Result of comparing a candidate fingerprint with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Modified,
    Unchanged,
}

impl ChangeKind {
    pub fn needs_processing(self) -> bool {
        !matches!(self, ChangeKind::Unchanged)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::New => "new",
            ChangeKind::Modified => "modified",
            ChangeKind::Unchanged => "unchanged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(ChangeKind::New),
            "modified" => Some(ChangeKind::Modified),
            "unchanged" => Some(ChangeKind::Unchanged),
            _ => None,
        }
    }
}

/// A scalar stored in per-entry index metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Str(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Str(s)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Float(v)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

pub type Metadata = BTreeMap<String, MetaValue>;

/// Metadata key naming the file a chunk was cut from.
pub const META_SOURCE_PATH: &str = "source_path";

/// One vector in the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub internal_id: u64,
    pub external_chunk_id: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
}

/// A nearest-neighbour search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub internal_id: u64,
    pub distance: f32,
    pub source_path: Option<String>,
}

/// Outcome of one file in one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileStatus {
    Processed,
    Skipped,
    Failed,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Processed => "PROCESSED",
            FileStatus::Skipped => "SKIPPED",
            FileStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROCESSED" => Some(FileStatus::Processed),
            "SKIPPED" => Some(FileStatus::Skipped),
            "FAILED" => Some(FileStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ledger record before the ledger has assigned its sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerRecord {
    pub scan_id: String,
    pub file_path: String,
    pub status: FileStatus,
    /// `None` when the file could not be read far enough to classify.
    pub change: Option<ChangeKind>,
    pub chunks_written: u64,
    pub score: f64,
    pub size_bytes: u64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An immutable, appended ledger record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerRecord {
    pub sequence: i64,
    pub scan_id: String,
    pub file_path: String,
    pub status: FileStatus,
    pub change: Option<ChangeKind>,
    pub chunks_written: u64,
    pub score: f64,
    pub size_bytes: u64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One page of the ledger in most-recent-first order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerPage {
    pub records: Vec<LedgerRecord>,
    pub total_files: u64,
    pub total_pages: u64,
    pub current_page: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

/// Per-status record totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub processed: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.processed + self.skipped + self.failed
    }
}

/// Dry-run answer to "what would a scan do".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewSummary {
    pub total_found: u64,
    pub new_or_modified: u64,
    pub already_processed: u64,
    pub unreadable: u64,
    pub efficiency_ratio: f64,
}

/// Terminal result of a scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSummary {
    pub scan_id: String,
    pub new_files: u64,
    pub already_processed: u64,
    pub total_found: u64,
    pub failed: u64,
    pub chunks_written: u64,
    pub efficiency_ratio: f64,
    pub cancelled: bool,
    pub dry_run: bool,
}

/// `numerator / denominator`, defined as 0 for an empty denominator.
pub fn efficiency_ratio(already_processed: u64, total_found: u64) -> f64 {
    if total_found == 0 {
        0.0
    } else {
        already_processed as f64 / total_found as f64
    }
}
