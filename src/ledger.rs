//! Append-only ingestion ledger.
//!
//! One record per file per scan. Sequences come from SQLite `AUTOINCREMENT`
//! and are never reused. Pages are windows over `sequence DESC`; the count and
//! the slice are read inside one transaction so a concurrent append cannot
//! make a page disagree with its totals.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::error::{IngestError, Result};
use crate::models::{
    ChangeKind, FileStatus, LedgerPage, LedgerRecord, NewLedgerRecord, StatusCounts,
};

#[derive(Clone)]
pub struct IngestionLedger {
    pool: SqlitePool,
}

impl IngestionLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, record: NewLedgerRecord) -> Result<LedgerRecord> {
        let mut conn = self.pool.acquire().await?;
        append_in(&mut conn, record).await
    }

    /// Append every record or none of them.
    pub async fn append_batch(&self, records: Vec<NewLedgerRecord>) -> Result<Vec<LedgerRecord>> {
        let mut tx = self.pool.begin().await?;
        let mut stored = Vec::with_capacity(records.len());
        for record in records {
            stored.push(append_in(&mut tx, record).await?);
        }
        tx.commit().await?;
        Ok(stored)
    }

    pub async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingest_ledger")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    pub async fn page(&self, page_number: u64, page_size: u64) -> Result<LedgerPage> {
        if page_number == 0 {
            return Err(IngestError::InvalidArgument(
                "page number must be >= 1".to_string(),
            ));
        }
        if page_size == 0 {
            return Err(IngestError::InvalidArgument(
                "page size must be >= 1".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingest_ledger")
            .fetch_one(&mut *tx)
            .await?;
        let total_files = total as u64;
        let total_pages = total_files.div_ceil(page_size);

        let records = if page_number > total_pages {
            Vec::new()
        } else {
            let offset = (page_number - 1) * page_size;
            sqlx::query(
                "SELECT sequence, scan_id, file_path, status, change, chunks_written, score, \
                 size_bytes, error, timestamp FROM ingest_ledger \
                 ORDER BY sequence DESC LIMIT ? OFFSET ?",
            )
            .bind(page_size as i64)
            .bind(offset as i64)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>>>()?
        };
        tx.commit().await?;

        Ok(LedgerPage {
            records,
            total_files,
            total_pages,
            current_page: page_number,
            has_next: page_number < total_pages,
            has_prev: page_number > 1,
        })
    }

    /// Per-status totals, for one scan or for the whole ledger.
    pub async fn status_counts(&self, scan_id: Option<&str>) -> Result<StatusCounts> {
        let rows = match scan_id {
            Some(scan_id) => {
                sqlx::query(
                    "SELECT status, COUNT(*) AS n FROM ingest_ledger WHERE scan_id = ? GROUP BY status",
                )
                .bind(scan_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT status, COUNT(*) AS n FROM ingest_ledger GROUP BY status")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match FileStatus::parse(&status) {
                Some(FileStatus::Processed) => counts.processed += n as u64,
                Some(FileStatus::Skipped) => counts.skipped += n as u64,
                Some(FileStatus::Failed) => counts.failed += n as u64,
                None => {}
            }
        }
        Ok(counts)
    }
}

/// Append one record on an existing connection or transaction.
pub async fn append_in(conn: &mut SqliteConnection, record: NewLedgerRecord) -> Result<LedgerRecord> {
    let result = sqlx::query(
        "INSERT INTO ingest_ledger (scan_id, file_path, status, change, chunks_written, score, \
         size_bytes, error, timestamp) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.scan_id)
    .bind(&record.file_path)
    .bind(record.status.as_str())
    .bind(record.change.map(|c| c.as_str()))
    .bind(record.chunks_written as i64)
    .bind(record.score)
    .bind(record.size_bytes as i64)
    .bind(&record.error)
    .bind(record.timestamp.timestamp_micros())
    .execute(&mut *conn)
    .await?;

    Ok(LedgerRecord {
        sequence: result.last_insert_rowid(),
        scan_id: record.scan_id,
        file_path: record.file_path,
        status: record.status,
        change: record.change,
        chunks_written: record.chunks_written,
        score: record.score,
        size_bytes: record.size_bytes,
        error: record.error,
        timestamp: record.timestamp,
    })
}

fn row_to_record(row: &SqliteRow) -> Result<LedgerRecord> {
    let status: String = row.get("status");
    let status = FileStatus::parse(&status).ok_or_else(|| {
        IngestError::InvalidArgument(format!("unknown ledger status '{}'", status))
    })?;
    let change: Option<String> = row.get("change");
    let chunks: i64 = row.get("chunks_written");
    let size: i64 = row.get("size_bytes");
    let ts: i64 = row.get("timestamp");

    Ok(LedgerRecord {
        sequence: row.get("sequence"),
        scan_id: row.get("scan_id"),
        file_path: row.get("file_path"),
        status,
        change: change.as_deref().and_then(ChangeKind::parse),
        chunks_written: chunks.max(0) as u64,
        score: row.get("score"),
        size_bytes: size.max(0) as u64,
        error: row.get("error"),
        timestamp: DateTime::<Utc>::from_timestamp_micros(ts).unwrap_or_default(),
    })
}
