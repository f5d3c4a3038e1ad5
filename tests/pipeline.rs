use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

use ingest_harness::config::Config;
use ingest_harness::coordinator::{CancelFlag, IngestionCoordinator};
use ingest_harness::db;
use ingest_harness::embedding::{Embedder, HashedEmbedder};
use ingest_harness::error::{IngestError, Result};
use ingest_harness::models::{ChangeKind, FileStatus};
use ingest_harness::storage::{FsStorage, MemoryStorage, StorageBackend, WriterLock};

const DIMS: usize = 32;

/// Hashed embeddings, except texts containing `POISON` fail.
struct PoisonEmbedder {
    inner: HashedEmbedder,
}

#[async_trait]
impl Embedder for PoisonEmbedder {
    fn model_name(&self) -> &str {
        "poison"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains("POISON")) {
            return Err(IngestError::Embedding("model rejected input".to_string()));
        }
        self.inner.embed(texts).await
    }
}

/// Returns vectors one element short for texts containing `SHORT`.
struct ShortVectorEmbedder;

#[async_trait]
impl Embedder for ShortVectorEmbedder {
    fn model_name(&self) -> &str {
        "short"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let len = if t.contains("SHORT") { DIMS - 1 } else { DIMS };
                vec![1.0; len]
            })
            .collect())
    }
}

/// Raises the cancel flag on its `after`-th call.
struct CancellingEmbedder {
    inner: HashedEmbedder,
    flag: Arc<OnceLock<CancelFlag>>,
    calls: AtomicUsize,
    after: usize,
}

#[async_trait]
impl Embedder for CancellingEmbedder {
    fn model_name(&self) -> &str {
        "cancelling"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.after {
            if let Some(flag) = self.flag.get() {
                flag.cancel();
            }
        }
        self.inner.embed(texts).await
    }
}

/// Memory storage whose manifest writes fail while `fail` is set.
struct FlakyStorage {
    inner: MemoryStorage,
    fail: Arc<AtomicBool>,
}

impl StorageBackend for FlakyStorage {
    fn read(&self, name: &str) -> std::io::Result<Option<Vec<u8>>> {
        self.inner.read(name)
    }
    fn write_atomic(&self, name: &str, bytes: &[u8]) -> std::io::Result<()> {
        if name == "index.json" && self.fail.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("simulated disk failure"));
        }
        self.inner.write_atomic(name, bytes)
    }
    fn remove(&self, name: &str) -> std::io::Result<()> {
        self.inner.remove(name)
    }
    fn list(&self) -> std::io::Result<Vec<String>> {
        self.inner.list()
    }
    fn lock_writer(&self) -> std::io::Result<Box<dyn WriterLock>> {
        self.inner.lock_writer()
    }
}

fn hashed() -> Arc<dyn Embedder> {
    Arc::new(HashedEmbedder::new(DIMS))
}

async fn coordinator(
    data_dir: &Path,
    embedder: Arc<dyn Embedder>,
    storage: Arc<dyn StorageBackend>,
    persist_every: usize,
) -> IngestionCoordinator {
    let mut config = Config::with_data_dir(data_dir);
    config.ingest.persist_every = persist_every;
    let pool = db::open(&config.db.path).await.unwrap();
    IngestionCoordinator::new(pool, storage, embedder, &config).unwrap()
}

fn write_docs(dir: &Path, n: usize) -> Vec<PathBuf> {
    fs::create_dir_all(dir).unwrap();
    (0..n)
        .map(|i| {
            let path = dir.join(format!("doc{:03}.md", i));
            fs::write(
                &path,
                format!("Document {} title\n\nBody of document number {}.", i, i),
            )
            .unwrap();
            path
        })
        .collect()
}

fn set_mtime(path: &Path, time: SystemTime) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(time).unwrap();
}

#[tokio::test]
async fn test_forty_one_file_scenario() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(tmp.path(), hashed(), Arc::new(MemoryStorage::new()), 8).await;
    let docs = tmp.path().join("docs");
    let files = write_docs(&docs, 41);

    let first = coord.scan(&docs, &[], false).await.unwrap();
    assert_eq!(first.new_files, 41);
    assert_eq!(first.already_processed, 0);
    assert_eq!(first.total_found, 41);

    let second = coord.scan(&docs, &[], false).await.unwrap();
    assert_eq!(second.new_files, 0);
    assert_eq!(second.already_processed, 41);
    assert_eq!(second.efficiency_ratio, 1.0);

    fs::write(&files[17], "Document 17 rewritten.").unwrap();
    let third = coord.scan(&docs, &[], false).await.unwrap();
    assert_eq!(
        (third.new_files, third.already_processed, third.total_found),
        (1, 40, 41)
    );

    // Every scan accounted for every discovered file.
    for summary in [&first, &second, &third] {
        let counts = coord
            .ledger()
            .status_counts(Some(&summary.scan_id))
            .await
            .unwrap();
        assert_eq!(counts.total(), 41);
    }

    let page = coord.get_stats(1, Some(1)).await.unwrap();
    let latest = &page.records[0];
    assert_eq!(latest.scan_id, third.scan_id);
}

#[tokio::test]
async fn test_empty_source_has_zero_ratio() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(tmp.path(), hashed(), Arc::new(MemoryStorage::new()), 8).await;
    let docs = tmp.path().join("empty");
    fs::create_dir_all(&docs).unwrap();

    let summary = coord.scan(&docs, &[], false).await.unwrap();
    assert_eq!(summary.total_found, 0);
    assert_eq!(summary.efficiency_ratio, 0.0);
}

#[tokio::test]
async fn test_touched_file_with_same_bytes_is_unchanged() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(tmp.path(), hashed(), Arc::new(MemoryStorage::new()), 8).await;
    let docs = tmp.path().join("docs");
    let files = write_docs(&docs, 3);

    coord.scan(&docs, &[], false).await.unwrap();
    set_mtime(&files[1], SystemTime::now() + Duration::from_secs(3600));

    let summary = coord.scan(&docs, &[], false).await.unwrap();
    assert_eq!(summary.new_files, 0);
    assert_eq!(summary.already_processed, 3);

    // The refreshed mtime was recorded, so the next pass needs no refresh.
    let path = files[1].canonicalize().unwrap().to_string_lossy().to_string();
    let history = coord.detector().history_len(&path).await.unwrap();
    coord.scan(&docs, &[], false).await.unwrap();
    assert_eq!(coord.detector().history_len(&path).await.unwrap(), history);
}

#[tokio::test]
async fn test_one_byte_change_with_same_mtime_is_modified() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(tmp.path(), hashed(), Arc::new(MemoryStorage::new()), 8).await;
    let docs = tmp.path().join("docs");
    let files = write_docs(&docs, 2);

    coord.scan(&docs, &[], false).await.unwrap();

    let mtime = fs::metadata(&files[0]).unwrap().modified().unwrap();
    let mut bytes = fs::read(&files[0]).unwrap();
    bytes[0] ^= 0x01;
    fs::write(&files[0], &bytes).unwrap();
    set_mtime(&files[0], mtime);

    let summary = coord.scan(&docs, &[], false).await.unwrap();
    assert_eq!(summary.new_files, 1);
    assert_eq!(summary.already_processed, 1);

    let page = coord.get_stats(1, Some(2)).await.unwrap();
    let modified = page
        .records
        .iter()
        .find(|r| r.status == FileStatus::Processed)
        .unwrap();
    assert_eq!(modified.change, Some(ChangeKind::Modified));
}

#[tokio::test]
async fn test_embedder_failure_is_recorded_and_scan_continues() {
    let tmp = TempDir::new().unwrap();
    let embedder = Arc::new(PoisonEmbedder {
        inner: HashedEmbedder::new(DIMS),
    });
    let coord = coordinator(tmp.path(), embedder, Arc::new(MemoryStorage::new()), 8).await;
    let docs = tmp.path().join("docs");
    write_docs(&docs, 4);
    let bad = docs.join("bad.md");
    fs::write(&bad, "this text is POISON for the model").unwrap();

    let summary = coord.scan(&docs, &[], false).await.unwrap();
    assert_eq!(summary.total_found, 5);
    assert_eq!(summary.new_files, 4);
    assert_eq!(summary.failed, 1);

    let bad_path = bad.canonicalize().unwrap().to_string_lossy().to_string();
    let page = coord.get_stats(1, Some(10)).await.unwrap();
    let failed = page
        .records
        .iter()
        .find(|r| r.file_path == bad_path)
        .unwrap();
    assert_eq!(failed.status, FileStatus::Failed);
    assert_eq!(failed.change, Some(ChangeKind::New));
    assert_eq!(failed.chunks_written, 0);
    assert!(failed.error.as_deref().unwrap().contains("model rejected input"));

    let index = coord.index().unwrap();
    assert!(index.read().await.chunk_ids_for_source(&bad_path).is_empty());

    // A failed file has no fingerprint, so it is retried.
    let again = coord.scan(&docs, &[], false).await.unwrap();
    assert_eq!(again.already_processed, 4);
    assert_eq!(again.failed, 1);
}

#[tokio::test]
async fn test_failed_modify_keeps_previous_entries() {
    let tmp = TempDir::new().unwrap();
    let embedder = Arc::new(PoisonEmbedder {
        inner: HashedEmbedder::new(DIMS),
    });
    let coord = coordinator(tmp.path(), embedder, Arc::new(MemoryStorage::new()), 8).await;
    let docs = tmp.path().join("docs");
    let files = write_docs(&docs, 1);

    coord.scan(&docs, &[], false).await.unwrap();
    let path = files[0].canonicalize().unwrap().to_string_lossy().to_string();
    let index = coord.index().unwrap();
    let before = index.read().await.chunk_ids_for_source(&path);
    assert!(!before.is_empty());

    fs::write(&files[0], "now POISON").unwrap();
    let summary = coord.scan(&docs, &[], false).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(index.read().await.chunk_ids_for_source(&path), before);
}

#[tokio::test]
async fn test_wrong_dimension_vectors_fail_the_file() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(
        tmp.path(),
        Arc::new(ShortVectorEmbedder),
        Arc::new(MemoryStorage::new()),
        8,
    )
    .await;
    let docs = tmp.path().join("docs");
    write_docs(&docs, 2);
    fs::write(docs.join("short.md"), "SHORT vector please").unwrap();

    let summary = coord.scan(&docs, &[], false).await.unwrap();
    assert_eq!(summary.new_files, 2);
    assert_eq!(summary.failed, 1);

    let page = coord.get_stats(1, Some(10)).await.unwrap();
    let failed = page
        .records
        .iter()
        .find(|r| r.status == FileStatus::Failed)
        .unwrap();
    assert!(failed.error.as_deref().unwrap().contains("dimension mismatch"));
}

#[tokio::test]
async fn test_preview_has_no_side_effects() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(tmp.path(), hashed(), Arc::new(MemoryStorage::new()), 8).await;
    let docs = tmp.path().join("docs");
    let files = write_docs(&docs, 5);
    coord.scan(&docs, &[], false).await.unwrap();

    fs::write(&files[0], "changed").unwrap();
    set_mtime(&files[1], SystemTime::now() + Duration::from_secs(7200));
    write_docs(&docs.join("more"), 2);

    let records_before = coord.ledger().count().await.unwrap();
    let entries_before = coord.index().unwrap().read().await.len();
    let touched = files[1].canonicalize().unwrap().to_string_lossy().to_string();
    let history_before = coord.detector().history_len(&touched).await.unwrap();

    let first = coord.preview(&docs, &[]).await.unwrap();
    let second = coord.preview(&docs, &[]).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.total_found, 7);
    assert_eq!(first.new_or_modified, 3);
    assert_eq!(first.already_processed, 4);

    assert_eq!(coord.ledger().count().await.unwrap(), records_before);
    assert_eq!(coord.index().unwrap().read().await.len(), entries_before);
    assert_eq!(
        coord.detector().history_len(&touched).await.unwrap(),
        history_before
    );
}

#[tokio::test]
async fn test_sixty_six_records_page_through() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(tmp.path(), hashed(), Arc::new(MemoryStorage::new()), 7).await;
    let docs = tmp.path().join("docs");
    write_docs(&docs, 66);
    coord.scan(&docs, &[], false).await.unwrap();

    let mut seen = Vec::new();
    for (page_number, expected) in [(1u64, 30usize), (2, 30), (3, 6)] {
        let page = coord.get_stats(page_number, Some(30)).await.unwrap();
        assert_eq!(page.records.len(), expected);
        assert_eq!(page.total_files, 66);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.has_prev, page_number > 1);
        assert_eq!(page.has_next, page_number < 3);
        seen.extend(page.records.iter().map(|r| r.sequence));
    }
    let mut sorted = seen.clone();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted.dedup();
    assert_eq!(sorted, seen);
    assert_eq!(seen.len(), 66);

    let past = coord.get_stats(4, Some(30)).await.unwrap();
    assert!(past.records.is_empty());
    assert!(!past.has_next);
}

#[tokio::test]
async fn test_cancelled_scan_flushes_and_resumes() {
    let tmp = TempDir::new().unwrap();
    let flag_slot = Arc::new(OnceLock::new());
    let embedder = Arc::new(CancellingEmbedder {
        inner: HashedEmbedder::new(DIMS),
        flag: flag_slot.clone(),
        calls: AtomicUsize::new(0),
        after: 4,
    });
    let coord = coordinator(tmp.path(), embedder, Arc::new(MemoryStorage::new()), 3).await;
    let _ = flag_slot.set(coord.cancel_flag());

    let docs = tmp.path().join("docs");
    write_docs(&docs, 10);

    let summary = coord.scan(&docs, &[], false).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.total_found, 10);
    assert_eq!(summary.new_files, 4);
    assert_eq!(coord.ledger().count().await.unwrap(), 4);
    assert!(!coord.index().unwrap().read().await.is_dirty());

    let resumed = coord.scan(&docs, &[], false).await.unwrap();
    assert!(!resumed.cancelled);
    assert_eq!(resumed.new_files, 6);
    assert_eq!(resumed.already_processed, 4);
}

#[tokio::test]
async fn test_persist_failure_aborts_and_rolls_back() {
    let tmp = TempDir::new().unwrap();
    let fail = Arc::new(AtomicBool::new(false));
    let storage = Arc::new(FlakyStorage {
        inner: MemoryStorage::new(),
        fail: fail.clone(),
    });
    let coord = coordinator(tmp.path(), hashed(), storage, 8).await;
    let docs = tmp.path().join("docs");
    write_docs(&docs, 3);
    coord.scan(&docs, &[], false).await.unwrap();
    let committed = coord.index().unwrap().read().await.len();

    write_docs(&docs.join("later"), 2);
    fail.store(true, Ordering::SeqCst);
    let err = coord.scan(&docs, &[], false).await.unwrap_err();
    assert!(matches!(err, IngestError::Io(_)), "got {:?}", err);

    // Nothing from the failed batch is visible.
    assert_eq!(coord.ledger().count().await.unwrap(), 3);
    let index = coord.index().unwrap();
    assert_eq!(index.read().await.len(), committed);
    assert!(!index.read().await.is_dirty());

    fail.store(false, Ordering::SeqCst);
    let retry = coord.scan(&docs, &[], false).await.unwrap();
    assert_eq!(retry.new_files, 2);
    assert_eq!(retry.already_processed, 3);
}

#[tokio::test]
async fn test_reopened_index_reproduces_search() {
    let tmp = TempDir::new().unwrap();
    let index_dir = tmp.path().join("index");
    let docs = tmp.path().join("docs");
    write_docs(&docs, 12);

    let before = {
        let storage = Arc::new(FsStorage::new(&index_dir).unwrap());
        let coord = coordinator(tmp.path(), hashed(), storage, 5).await;
        coord.scan(&docs, &[], false).await.unwrap();
        coord.search("body of document number 7", 5).await.unwrap()
    };
    assert_eq!(before.len(), 5);

    let storage = Arc::new(FsStorage::new(&index_dir).unwrap());
    let coord = coordinator(tmp.path(), hashed(), storage, 5).await;
    let after = coord.search("body of document number 7", 5).await.unwrap();
    assert_eq!(before, after);

    let summary = coord.scan(&docs, &[], false).await.unwrap();
    assert_eq!(summary.already_processed, 12);
}

async fn fs_coordinator(data_dir: &Path) -> IngestionCoordinator {
    let storage = Arc::new(FsStorage::new(data_dir.join("index")).unwrap());
    coordinator(data_dir, hashed(), storage, 4).await
}

#[tokio::test]
async fn test_coordinators_sharing_a_directory_keep_each_others_entries() {
    let tmp = TempDir::new().unwrap();
    let a = tmp.path().join("a");
    let b = tmp.path().join("b");
    write_docs(&a, 3);
    write_docs(&b, 3);

    // Both open before either has committed anything.
    let first = fs_coordinator(tmp.path()).await;
    let second = fs_coordinator(tmp.path()).await;
    assert_eq!(first.scan(&a, &[], false).await.unwrap().new_files, 3);
    assert_eq!(second.scan(&b, &[], false).await.unwrap().new_files, 3);
    drop((first, second));

    let reopened = fs_coordinator(tmp.path()).await;
    let index = reopened.index().unwrap();
    assert_eq!(index.read().await.len(), 6);
    for dir in [&a, &b] {
        let root = dir.canonicalize().unwrap();
        let path = root.join("doc000.md").to_string_lossy().to_string();
        assert!(!index.read().await.chunk_ids_for_source(&path).is_empty());
    }

    let rescan = reopened.scan(&a, &[], false).await.unwrap();
    assert_eq!(rescan.already_processed, 3);
    assert_eq!(rescan.new_files, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_scans_are_serialized() {
    let tmp = TempDir::new().unwrap();
    let a = tmp.path().join("a");
    let b = tmp.path().join("b");
    write_docs(&a, 10);
    write_docs(&b, 10);

    let first = fs_coordinator(tmp.path()).await;
    let second = fs_coordinator(tmp.path()).await;
    let (ra, rb) = tokio::join!(first.scan(&a, &[], false), second.scan(&b, &[], false));
    assert_eq!(ra.unwrap().new_files, 10);
    assert_eq!(rb.unwrap().new_files, 10);
    drop((first, second));

    let reopened = fs_coordinator(tmp.path()).await;
    assert_eq!(reopened.index().unwrap().read().await.len(), 20);
    assert_eq!(reopened.ledger().count().await.unwrap(), 20);

    for dir in [&a, &b] {
        let summary = reopened.scan(dir, &[], false).await.unwrap();
        assert_eq!(summary.already_processed, 10);
        assert_eq!(summary.new_files, 0);
    }
}
