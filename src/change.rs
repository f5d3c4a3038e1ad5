//! Change detection against the persisted fingerprint history.
//!
//! The content hash is authoritative. A modification time that moved while
//! the bytes stayed the same is still UNCHANGED; [`ChangeDetector::classify`]
//! records a refreshed row so the next scan sees a matching mtime.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::Result;
use crate::models::{ChangeKind, FileFingerprint};

/// The current stored fingerprint for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFingerprint {
    pub content_hash: String,
    pub modified_time: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Outcome of comparing a candidate against its stored fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub kind: ChangeKind,
    /// Bytes match but the mtime moved; a refreshed row should be recorded.
    pub refresh_mtime: bool,
}

/// Pure classification rule shared by `classify` and `inspect`.
pub fn decide(stored: Option<&StoredFingerprint>, candidate: &FileFingerprint) -> Decision {
    match stored {
        None => Decision {
            kind: ChangeKind::New,
            refresh_mtime: false,
        },
        Some(stored) if stored.content_hash != candidate.hash_hex() => Decision {
            kind: ChangeKind::Modified,
            refresh_mtime: false,
        },
        Some(stored) => Decision {
            kind: ChangeKind::Unchanged,
            refresh_mtime: stored.modified_time != candidate.modified_time,
        },
    }
}

#[derive(Clone)]
pub struct ChangeDetector {
    pool: SqlitePool,
}

impl ChangeDetector {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn stored(&self, path: &str) -> Result<Option<StoredFingerprint>> {
        let row = sqlx::query(
            "SELECT content_hash, modified_time, size_bytes FROM file_fingerprints \
             WHERE path = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let micros: i64 = row.get("modified_time");
            let size: i64 = row.get("size_bytes");
            StoredFingerprint {
                content_hash: row.get("content_hash"),
                modified_time: DateTime::from_timestamp_micros(micros).unwrap_or_default(),
                size_bytes: size.max(0) as u64,
            }
        }))
    }

    /// Read-only classification.
    pub async fn inspect(&self, candidate: &FileFingerprint) -> Result<ChangeKind> {
        let stored = self.stored(&candidate.path).await?;
        Ok(decide(stored.as_ref(), candidate).kind)
    }

    /// Classify and, for an UNCHANGED file whose mtime drifted, record the
    /// refreshed fingerprint.
    pub async fn classify(&self, candidate: &FileFingerprint) -> Result<ChangeKind> {
        let stored = self.stored(&candidate.path).await?;
        let decision = decide(stored.as_ref(), candidate);
        if decision.refresh_mtime {
            debug!(path = %candidate.path, "content unchanged, refreshing mtime");
            self.record(candidate).await?;
        }
        debug!(path = %candidate.path, change = decision.kind.as_str(), "classified");
        Ok(decision.kind)
    }

    /// Insert a superseding fingerprint row.
    pub async fn record(&self, fingerprint: &FileFingerprint) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        record_in(&mut conn, fingerprint).await
    }

    pub async fn history_len(&self, path: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_fingerprints WHERE path = ?")
            .bind(path)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}

/// Insert a fingerprint row on an existing connection or transaction.
pub async fn record_in(conn: &mut SqliteConnection, fingerprint: &FileFingerprint) -> Result<()> {
    sqlx::query(
        "INSERT INTO file_fingerprints (path, content_hash, modified_time, size_bytes, recorded_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&fingerprint.path)
    .bind(fingerprint.hash_hex())
    .bind(fingerprint.modified_time.timestamp_micros())
    .bind(fingerprint.size_bytes as i64)
    .bind(Utc::now().timestamp_micros())
    .execute(&mut *conn)
    .await?;
    Ok(())
}
