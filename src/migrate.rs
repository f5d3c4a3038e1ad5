use sqlx::SqlitePool;

use crate::error::Result;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Fingerprint history. Rows are never updated; the highest id per path
    // is the current fingerprint.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_fingerprints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            modified_time INTEGER NOT NULL,
            size_bytes INTEGER NOT NULL,
            recorded_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-file outcomes. AUTOINCREMENT so sequences are never reused.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_ledger (
            sequence INTEGER PRIMARY KEY AUTOINCREMENT,
            scan_id TEXT NOT NULL,
            file_path TEXT NOT NULL,
            status TEXT NOT NULL,
            change TEXT,
            chunks_written INTEGER NOT NULL DEFAULT 0,
            score REAL NOT NULL DEFAULT 0,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            timestamp INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_file_fingerprints_path ON file_fingerprints(path, id DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_ingest_ledger_scan_id ON ingest_ledger(scan_id)")
        .execute(pool)
        .await?;

    Ok(())
}
