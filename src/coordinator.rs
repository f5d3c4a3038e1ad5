//! Scan orchestration.
//!
//! Coordinates one scan end to end: discovery → change detection →
//! chunking → embedding → index mutation → batched commit. Per-file failures
//! become FAILED ledger records and the scan continues; store-level failures
//! abort the scan and roll the in-memory index back to its last committed
//! state.
//!
//! Commit order for each batch is fixed: persist the index first, then record
//! the batch's fingerprints and ledger records in one SQLite transaction. A
//! crash between the two leaves files that look NEW or MODIFIED on the next
//! scan, never files that look UNCHANGED with their chunks missing.
//!
//! A scan holds the storage writer lock from start to finish and reloads the
//! committed index under it, so coordinators in different processes sharing
//! one index directory never persist over each other's generations.

use chrono::Utc;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::change::{self, ChangeDetector};
use crate::chunk::{chunk_id, chunk_text, file_score};
use crate::config::{Config, FilesystemConnectorConfig};
use crate::connector_fs::{self, DiscoverOptions};
use crate::db;
use crate::embedding::{embed_query, DisabledEmbedder, Embedder};
use crate::error::{IngestError, Result};
use crate::fingerprint::{self, truncate_to_micros};
use crate::index::VectorIndexStore;
use crate::ledger::{self, IngestionLedger};
use crate::models::{
    efficiency_ratio, ChangeKind, FileFingerprint, FileStatus, LedgerPage, MetaValue, Metadata,
    NewLedgerRecord, PreviewSummary, ScanSummary, SearchHit, META_SOURCE_PATH,
};
use crate::preview::PreviewEngine;
use crate::progress::{NoProgress, ScanProgressEvent, ScanProgressReporter};
use crate::storage::{FsStorage, MemoryStorage, StorageBackend};

/// Shared cancellation signal, checked between files.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The parts of [`Config`] a coordinator needs after construction.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_tokens: usize,
    pub embed_batch_size: usize,
    pub persist_every: usize,
    pub default_page_size: u64,
    pub max_page_size: u64,
    pub connector: Option<FilesystemConnectorConfig>,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_tokens: config.chunking.max_tokens,
            embed_batch_size: config.embedding.batch_size.max(1),
            persist_every: config.ingest.persist_every.max(1),
            default_page_size: config.stats.page_size as u64,
            max_page_size: config.stats.max_page_size as u64,
            connector: config.connectors.filesystem.clone(),
        }
    }
}

/// One file's outcome, waiting for the next commit.
struct FileOutcome {
    record: NewLedgerRecord,
    /// Set only for files whose new chunks are now in the index.
    fingerprint: Option<FileFingerprint>,
}

#[derive(Default)]
struct PendingBatch {
    outcomes: Vec<FileOutcome>,
}

impl PendingBatch {
    fn len(&self) -> usize {
        self.outcomes.len()
    }
}

#[derive(Default)]
struct ScanCounts {
    new_files: u64,
    already_processed: u64,
    failed: u64,
    chunks_written: u64,
}

pub struct IngestionCoordinator {
    pool: SqlitePool,
    detector: ChangeDetector,
    ledger: IngestionLedger,
    preview: PreviewEngine,
    /// `None` when no embedding provider is configured; scan and search are
    /// unavailable then, stats and preview still work.
    index: Option<Arc<RwLock<VectorIndexStore>>>,
    storage: Arc<dyn StorageBackend>,
    embedder: Arc<dyn Embedder>,
    settings: CoordinatorSettings,
    scan_lock: Mutex<()>,
    cancel: CancelFlag,
    progress: Box<dyn ScanProgressReporter>,
}

impl IngestionCoordinator {
    /// Open the database and index named by `config`.
    pub async fn open(config: &Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let pool = db::open(&config.db.path).await?;
        let storage: Arc<dyn StorageBackend> = Arc::new(FsStorage::new(config.index.dir.clone())?);
        Self::new(pool, storage, embedder, config)
    }

    /// Open only the database: `preview` and `get_stats` work, `scan` and
    /// `search` report a configuration error. Neither the embedder nor the
    /// vector index is touched.
    pub async fn open_without_index(config: &Config) -> Result<Self> {
        let pool = db::open(&config.db.path).await?;
        Ok(Self::assemble(
            pool,
            None,
            Arc::new(MemoryStorage::new()),
            Arc::new(DisabledEmbedder),
            config,
        ))
    }

    /// Build a coordinator over an already-migrated pool and an index storage.
    pub fn new(
        pool: SqlitePool,
        storage: Arc<dyn StorageBackend>,
        embedder: Arc<dyn Embedder>,
        config: &Config,
    ) -> Result<Self> {
        let index = if embedder.dims() > 0 {
            let store = VectorIndexStore::open(
                storage.clone(),
                embedder.dims(),
                config.index.metric,
                config.index.backend,
            )?;
            Some(Arc::new(RwLock::new(store)))
        } else {
            None
        };
        Ok(Self::assemble(pool, index, storage, embedder, config))
    }

    fn assemble(
        pool: SqlitePool,
        index: Option<Arc<RwLock<VectorIndexStore>>>,
        storage: Arc<dyn StorageBackend>,
        embedder: Arc<dyn Embedder>,
        config: &Config,
    ) -> Self {
        let detector = ChangeDetector::new(pool.clone());
        Self {
            ledger: IngestionLedger::new(pool.clone()),
            preview: PreviewEngine::new(detector.clone()),
            detector,
            pool,
            index,
            storage,
            embedder,
            settings: CoordinatorSettings::from_config(config),
            scan_lock: Mutex::new(()),
            cancel: CancelFlag::new(),
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ScanProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Handle that cancels the running scan between files.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub fn ledger(&self) -> &IngestionLedger {
        &self.ledger
    }

    pub fn index(&self) -> Option<Arc<RwLock<VectorIndexStore>>> {
        self.index.clone()
    }

    fn require_index(&self) -> Result<&Arc<RwLock<VectorIndexStore>>> {
        self.index.as_ref().ok_or_else(|| {
            IngestError::Config(
                "no embedding provider configured; set [embedding] provider".to_string(),
            )
        })
    }

    fn discover(&self, source: &Path, file_types: &[String]) -> Result<Vec<PathBuf>> {
        let options = DiscoverOptions::resolve(
            source.to_path_buf(),
            self.settings.connector.as_ref(),
            file_types,
        );
        connector_fs::discover(&options)
    }

    pub async fn preview(&self, source: &Path, file_types: &[String]) -> Result<PreviewSummary> {
        let files = self.discover(source, file_types)?;
        self.preview.preview(&files).await
    }

    pub async fn get_stats(&self, page: u64, page_size: Option<u64>) -> Result<LedgerPage> {
        let page_size = page_size.unwrap_or(self.settings.default_page_size);
        if page_size > self.settings.max_page_size {
            return Err(IngestError::InvalidArgument(format!(
                "page size {} exceeds maximum {}",
                page_size, self.settings.max_page_size
            )));
        }
        self.ledger.page(page, page_size).await
    }

    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        let index = self.require_index()?;
        let vector = embed_query(self.embedder.as_ref(), query).await?;
        let index = index.read().await;
        index.search(&vector, k)
    }

    pub async fn scan(
        &self,
        source: &Path,
        file_types: &[String],
        dry_run: bool,
    ) -> Result<ScanSummary> {
        let scan_id = Uuid::new_v4().to_string();

        if dry_run {
            let preview = self.preview(source, file_types).await?;
            return Ok(ScanSummary {
                scan_id,
                new_files: preview.new_or_modified,
                already_processed: preview.already_processed,
                total_found: preview.total_found,
                failed: preview.unreadable,
                chunks_written: 0,
                efficiency_ratio: preview.efficiency_ratio,
                cancelled: false,
                dry_run: true,
            });
        }

        let index = self.require_index()?.clone();
        let _guard = self.scan_lock.lock().await;
        let storage = self.storage.clone();
        let _writer = tokio::task::spawn_blocking(move || storage.lock_writer())
            .await
            .map_err(|e| IngestError::Io(std::io::Error::other(e)))??;
        // Another process may have committed since this index was loaded.
        index.write().await.load()?;
        self.cancel.reset();

        let source_label = source.display().to_string();
        self.progress.report(ScanProgressEvent::Discovering {
            source: source_label.clone(),
        });
        let files = self.discover(source, file_types)?;
        let total_found = files.len() as u64;
        info!(scan_id = %scan_id, source = %source_label, files = total_found, "scan started");

        let mut counts = ScanCounts::default();
        let mut batch = PendingBatch::default();
        let mut cancelled = false;

        for (n, path) in files.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let outcome = match self.process_file(&index, &scan_id, path).await {
                Ok(outcome) => outcome,
                Err(e) => return Err(self.abort(&index, e).await),
            };
            match outcome.record.status {
                FileStatus::Processed => {
                    counts.new_files += 1;
                    counts.chunks_written += outcome.record.chunks_written;
                }
                FileStatus::Skipped => counts.already_processed += 1,
                FileStatus::Failed => counts.failed += 1,
            }
            batch.outcomes.push(outcome);

            self.progress.report(ScanProgressEvent::Ingesting {
                source: source_label.clone(),
                n: n as u64 + 1,
                total: total_found,
            });

            if batch.len() >= self.settings.persist_every {
                if let Err(e) = self.commit(&index, &mut batch).await {
                    return Err(self.abort(&index, e).await);
                }
            }
        }

        if cancelled {
            info!(scan_id = %scan_id, "scan cancelled, flushing pending batch");
        }
        if let Err(e) = self.commit(&index, &mut batch).await {
            return Err(self.abort(&index, e).await);
        }

        let summary = ScanSummary {
            scan_id,
            new_files: counts.new_files,
            already_processed: counts.already_processed,
            total_found,
            failed: counts.failed,
            chunks_written: counts.chunks_written,
            efficiency_ratio: efficiency_ratio(counts.already_processed, total_found),
            cancelled,
            dry_run: false,
        };
        info!(
            scan_id = %summary.scan_id,
            new_files = summary.new_files,
            already_processed = summary.already_processed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "scan finished"
        );
        Ok(summary)
    }

    /// Classify and, if needed, ingest one file. `Err` only for store-level
    /// failures; per-file failures come back as a FAILED outcome.
    async fn process_file(
        &self,
        index: &RwLock<VectorIndexStore>,
        scan_id: &str,
        path: &Path,
    ) -> Result<FileOutcome> {
        let path_str = path.to_string_lossy().to_string();

        let (fp, bytes) = match fingerprint::compute_with_contents(path) {
            Ok(found) => found,
            Err(e) if e.is_per_file() => {
                warn!(path = %path_str, "cannot fingerprint: {}", e);
                return Ok(FileOutcome {
                    record: record(scan_id, &path_str, FileStatus::Failed, None, 0, 0.0, 0, Some(e)),
                    fingerprint: None,
                });
            }
            Err(e) => return Err(e),
        };

        let change = self.detector.classify(&fp).await?;
        if !change.needs_processing() {
            return Ok(FileOutcome {
                record: record(
                    scan_id,
                    &fp.path,
                    FileStatus::Skipped,
                    Some(change),
                    0,
                    0.0,
                    fp.size_bytes,
                    None,
                ),
                fingerprint: None,
            });
        }

        match self.ingest_file(index, &fp, &bytes).await {
            Ok((chunks_written, score)) => {
                debug!(path = %fp.path, chunks = chunks_written, "indexed");
                Ok(FileOutcome {
                    record: record(
                        scan_id,
                        &fp.path,
                        FileStatus::Processed,
                        Some(change),
                        chunks_written,
                        score,
                        fp.size_bytes,
                        None,
                    ),
                    fingerprint: Some(fp),
                })
            }
            Err(e) if e.is_per_file() => {
                warn!(path = %fp.path, "ingest failed: {}", e);
                Ok(FileOutcome {
                    record: record(
                        scan_id,
                        &fp.path,
                        FileStatus::Failed,
                        Some(change),
                        0,
                        0.0,
                        fp.size_bytes,
                        Some(e),
                    ),
                    fingerprint: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Chunk and embed `fp`'s contents, then swap its index entries. The
    /// index is only touched once every chunk has a vector of the right size.
    async fn ingest_file(
        &self,
        index: &RwLock<VectorIndexStore>,
        fp: &FileFingerprint,
        bytes: &[u8],
    ) -> Result<(u64, f64)> {
        let text = String::from_utf8_lossy(bytes);
        let chunks = chunk_text(&text, self.settings.max_tokens);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.settings.embed_batch_size) {
            let embedded = self.embedder.embed(batch).await?;
            if embedded.len() != batch.len() {
                return Err(IngestError::Embedding(format!(
                    "embedder returned {} vectors for {} chunks",
                    embedded.len(),
                    batch.len()
                )));
            }
            vectors.extend(embedded);
        }

        let score = file_score(&chunks);
        let hash_hex = fp.hash_hex();
        let indexed_at = Utc::now().to_rfc3339();

        let mut index = index.write().await;
        if let Some(bad) = vectors.iter().find(|v| v.len() != index.dims()) {
            return Err(IngestError::DimensionMismatch {
                expected: index.dims(),
                actual: bad.len(),
            });
        }

        let removed = index.remove_source(&fp.path)?;
        if removed > 0 {
            debug!(path = %fp.path, removed, "removed previous entries");
        }
        for (chunk, vector) in chunks.iter().zip(vectors) {
            let mut metadata = Metadata::new();
            metadata.insert(META_SOURCE_PATH.to_string(), MetaValue::from(fp.path.as_str()));
            metadata.insert("chunk_index".to_string(), MetaValue::Int(chunk.index as i64));
            metadata.insert("chunk_offset".to_string(), MetaValue::Int(chunk.offset as i64));
            metadata.insert("content_hash".to_string(), MetaValue::from(hash_hex.as_str()));
            metadata.insert("score".to_string(), MetaValue::Float(score));
            metadata.insert("indexed_at".to_string(), MetaValue::from(indexed_at.as_str()));
            index.add(&chunk_id(&fp.path, chunk.index), vector, metadata)?;
        }

        Ok((chunks.len() as u64, score))
    }

    /// Persist the index, then record the batch in one transaction.
    async fn commit(
        &self,
        index: &RwLock<VectorIndexStore>,
        batch: &mut PendingBatch,
    ) -> Result<()> {
        if batch.outcomes.is_empty() {
            return Ok(());
        }

        let entries = {
            let mut index = index.write().await;
            index.persist()?;
            index.len() as u64
        };

        let mut tx = self.pool.begin().await?;
        for outcome in &batch.outcomes {
            if let Some(fp) = &outcome.fingerprint {
                change::record_in(&mut tx, fp).await?;
            }
        }
        let files = batch.len() as u64;
        for outcome in batch.outcomes.drain(..) {
            ledger::append_in(&mut tx, outcome.record).await?;
        }
        tx.commit().await?;

        info!(files, entries, "batch committed");
        self.progress
            .report(ScanProgressEvent::Committed { files, entries });
        Ok(())
    }

    /// Discard uncommitted index changes and hand `err` back.
    async fn abort(&self, index: &RwLock<VectorIndexStore>, err: IngestError) -> IngestError {
        error!("scan aborted: {}", err);
        let mut index = index.write().await;
        if let Err(reload_err) = index.load() {
            error!("could not reload last committed index: {}", reload_err);
        }
        err
    }
}

#[allow(clippy::too_many_arguments)]
fn record(
    scan_id: &str,
    path: &str,
    status: FileStatus,
    change: Option<ChangeKind>,
    chunks_written: u64,
    score: f64,
    size_bytes: u64,
    error: Option<IngestError>,
) -> NewLedgerRecord {
    NewLedgerRecord {
        scan_id: scan_id.to_string(),
        file_path: path.to_string(),
        status,
        change,
        chunks_written,
        score,
        size_bytes,
        error: error.map(|e| e.to_string()),
        timestamp: truncate_to_micros(Utc::now()),
    }
}
