//! Dry-run preview.
//!
//! Answers "what would a scan do" from fingerprints alone. Never embeds,
//! never touches the index, never writes fingerprints or ledger records.

use std::path::PathBuf;
use tracing::debug;

use crate::change::ChangeDetector;
use crate::error::Result;
use crate::fingerprint;
use crate::models::{efficiency_ratio, ChangeKind, PreviewSummary};

#[derive(Clone)]
pub struct PreviewEngine {
    detector: ChangeDetector,
}

impl PreviewEngine {
    pub fn new(detector: ChangeDetector) -> Self {
        Self { detector }
    }

    pub async fn preview(&self, files: &[PathBuf]) -> Result<PreviewSummary> {
        let mut new_or_modified = 0u64;
        let mut already_processed = 0u64;
        let mut unreadable = 0u64;

        for path in files {
            let fp = match fingerprint::compute(path) {
                Ok(fp) => fp,
                Err(e) if e.is_per_file() => {
                    debug!(path = %path.display(), "unreadable in preview: {}", e);
                    unreadable += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match self.detector.inspect(&fp).await? {
                ChangeKind::Unchanged => already_processed += 1,
                ChangeKind::New | ChangeKind::Modified => new_or_modified += 1,
            }
        }

        let total_found = files.len() as u64;
        Ok(PreviewSummary {
            total_found,
            new_or_modified,
            already_processed,
            unreadable,
            efficiency_ratio: efficiency_ratio(already_processed, total_found),
        })
    }
}
