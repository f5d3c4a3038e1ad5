//! Storage backends for the vector index.
//!
//! The index never touches the filesystem directly; it is handed a
//! [`StorageBackend`] and reads and writes named blobs through it. A backend
//! that encrypts at rest can wrap [`FsStorage`] without the index noticing.
//!
//! `write_atomic` must never leave a partially written blob readable under
//! `name`: [`FsStorage`] writes `<name>.tmp`, syncs it, then renames over the
//! target.
//!
//! Writers serialize through [`StorageBackend::lock_writer`]. For
//! [`FsStorage`] that is an exclusive `fs2` lock on `scan.lock` in the index
//! directory, so scans from separate processes sharing one directory run one
//! after the other.

use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, RwLock};

/// Suffix of in-flight temporary artifacts.
pub const TMP_SUFFIX: &str = ".tmp";

/// Lock file guarding writers of an [`FsStorage`] directory.
pub const LOCK_NAME: &str = "scan.lock";

/// Exclusive writer access; released on drop.
pub trait WriterLock: Send {}

pub trait StorageBackend: Send + Sync {
    /// Read a committed blob. `Ok(None)` if it does not exist.
    fn read(&self, name: &str) -> std::io::Result<Option<Vec<u8>>>;

    /// Replace `name` with `bytes` so that readers see either the old or the
    /// new contents, never a mix.
    fn write_atomic(&self, name: &str, bytes: &[u8]) -> std::io::Result<()>;

    /// Remove a committed blob. Removing a missing blob is not an error.
    fn remove(&self, name: &str) -> std::io::Result<()>;

    /// Names of committed blobs (temporary artifacts excluded).
    fn list(&self) -> std::io::Result<Vec<String>>;

    /// Block until no other writer holds this storage.
    fn lock_writer(&self) -> std::io::Result<Box<dyn WriterLock>>;
}

struct FileLock(File);

impl WriterLock for FileLock {}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

/// Directory-backed storage.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl StorageBackend for FsStorage {
    fn read(&self, name: &str) -> std::io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> std::io::Result<()> {
        let target = self.path_for(name);
        let tmp = self.path_for(&format!("{}{}", name, TMP_SUFFIX));
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &target)?;
        // Make the rename itself durable.
        #[cfg(unix)]
        if let Ok(dir) = std::fs::File::open(&self.root) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn remove(&self, name: &str) -> std::io::Result<()> {
        match std::fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn list(&self) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TMP_SUFFIX) || name == LOCK_NAME {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn lock_writer(&self) -> std::io::Result<Box<dyn WriterLock>> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.path_for(LOCK_NAME))?;
        file.lock_exclusive()?;
        Ok(Box::new(FileLock(file)))
    }
}

/// In-memory storage for tests and ephemeral indexes.
#[derive(Default)]
pub struct MemoryStorage {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
    writer: Arc<WriterGate>,
}

#[derive(Default)]
struct WriterGate {
    held: Mutex<bool>,
    released: Condvar,
}

struct GateLock(Arc<WriterGate>);

impl WriterLock for GateLock {}

impl Drop for GateLock {
    fn drop(&mut self) {
        if let Ok(mut held) = self.0.held.lock() {
            *held = false;
        }
        self.0.released.notify_one();
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> std::io::Error {
    std::io::Error::other("memory storage lock poisoned")
}

impl StorageBackend for MemoryStorage {
    fn read(&self, name: &str) -> std::io::Result<Option<Vec<u8>>> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        Ok(blobs.get(name).cloned())
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> std::io::Result<()> {
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        blobs.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, name: &str) -> std::io::Result<()> {
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        blobs.remove(name);
        Ok(())
    }

    fn list(&self) -> std::io::Result<Vec<String>> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        Ok(blobs.keys().cloned().collect())
    }

    fn lock_writer(&self) -> std::io::Result<Box<dyn WriterLock>> {
        let mut held = self.writer.held.lock().map_err(|_| poisoned())?;
        while *held {
            held = self.writer.released.wait(held).map_err(|_| poisoned())?;
        }
        *held = true;
        Ok(Box::new(GateLock(self.writer.clone())))
    }
}
