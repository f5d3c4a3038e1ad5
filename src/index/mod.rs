//! Durable vector index.
//!
//! [`VectorIndexStore`] owns the vectors (inside a [`SearchBackend`]), their
//! metadata, and the `external_chunk_id ↔ internal_id` bijection. Internal ids
//! are dense and assigned from a counter owned by the store; they are never
//! reused, even after removal.
//!
//! All persistence goes through the injected [`StorageBackend`]. See
//! [`format`] for the on-disk layout and the commit protocol.

pub mod backend;
pub mod format;

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use backend::{create_backend, BackendKind, Metric, SearchBackend};
use format::{Manifest, FORMAT_VERSION, MANIFEST_NAME};

use crate::error::{IngestError, Result};
use crate::fingerprint::hash_bytes;
use crate::models::{IndexEntry, Metadata, SearchHit, META_SOURCE_PATH};
use crate::storage::StorageBackend;

pub struct VectorIndexStore {
    storage: Arc<dyn StorageBackend>,
    dims: usize,
    metric: Metric,
    backend_kind: BackendKind,
    backend: Box<dyn SearchBackend>,
    id_to_chunk: BTreeMap<u64, String>,
    chunk_to_id: HashMap<String, u64>,
    metadata: BTreeMap<u64, Metadata>,
    next_id: u64,
    generation: u64,
    dirty: bool,
}

/// Validated contents of a committed index, ready to be swapped in.
struct LoadedState {
    backend: Box<dyn SearchBackend>,
    id_to_chunk: BTreeMap<u64, String>,
    chunk_to_id: HashMap<String, u64>,
    metadata: BTreeMap<u64, Metadata>,
    next_id: u64,
    generation: u64,
}

impl VectorIndexStore {
    /// An empty, unpersisted index.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        dims: usize,
        metric: Metric,
        backend_kind: BackendKind,
    ) -> Result<Self> {
        if dims == 0 {
            return Err(IngestError::InvalidArgument(
                "index dims must be > 0".to_string(),
            ));
        }
        Ok(Self {
            storage,
            dims,
            metric,
            backend_kind,
            backend: create_backend(backend_kind, dims),
            id_to_chunk: BTreeMap::new(),
            chunk_to_id: HashMap::new(),
            metadata: BTreeMap::new(),
            next_id: 0,
            generation: 0,
            dirty: false,
        })
    }

    /// Open the index committed in `storage`, or an empty one if nothing has
    /// been persisted yet.
    pub fn open(
        storage: Arc<dyn StorageBackend>,
        dims: usize,
        metric: Metric,
        backend_kind: BackendKind,
    ) -> Result<Self> {
        let mut store = Self::new(storage, dims, metric, backend_kind)?;
        store.load()?;
        Ok(store)
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.id_to_chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_chunk.is_empty()
    }

    /// True when in-memory state has changes not yet persisted.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn contains(&self, external_chunk_id: &str) -> bool {
        self.chunk_to_id.contains_key(external_chunk_id)
    }

    /// Store a vector under `external_chunk_id` and return its internal id.
    pub fn add(
        &mut self,
        external_chunk_id: &str,
        vector: Vec<f32>,
        metadata: Metadata,
    ) -> Result<u64> {
        if vector.len() != self.dims {
            return Err(IngestError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }
        if self.chunk_to_id.contains_key(external_chunk_id) {
            return Err(IngestError::DuplicateChunk(external_chunk_id.to_string()));
        }

        let id = self.next_id;
        self.next_id += 1;
        self.backend.insert(id, vector);
        self.id_to_chunk.insert(id, external_chunk_id.to_string());
        self.chunk_to_id.insert(external_chunk_id.to_string(), id);
        self.metadata.insert(id, metadata);
        self.dirty = true;
        Ok(id)
    }

    pub fn remove(&mut self, external_chunk_id: &str) -> Result<()> {
        let id = self
            .chunk_to_id
            .remove(external_chunk_id)
            .ok_or_else(|| IngestError::NotFound(external_chunk_id.to_string()))?;
        self.id_to_chunk.remove(&id);
        self.metadata.remove(&id);
        self.backend.remove(id);
        self.dirty = true;
        Ok(())
    }

    /// External ids of every entry cut from `source_path`, in id order.
    pub fn chunk_ids_for_source(&self, source_path: &str) -> Vec<String> {
        self.metadata
            .iter()
            .filter(|(_, meta)| {
                meta.get(META_SOURCE_PATH).and_then(|v| v.as_str()) == Some(source_path)
            })
            .filter_map(|(id, _)| self.id_to_chunk.get(id).cloned())
            .collect()
    }

    /// Remove every entry cut from `source_path`. Returns how many were removed.
    pub fn remove_source(&mut self, source_path: &str) -> Result<usize> {
        let ids = self.chunk_ids_for_source(source_path);
        for chunk_id in &ids {
            self.remove(chunk_id)?;
        }
        Ok(ids.len())
    }

    pub fn get(&self, external_chunk_id: &str) -> Option<IndexEntry> {
        let id = *self.chunk_to_id.get(external_chunk_id)?;
        Some(IndexEntry {
            internal_id: id,
            external_chunk_id: external_chunk_id.to_string(),
            vector: self.backend.get(id)?,
            metadata: self.metadata.get(&id).cloned().unwrap_or_default(),
        })
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dims {
            return Err(IngestError::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let ranked = self.backend.search(query, k, self.metric)?;
        let mut hits = Vec::with_capacity(ranked.len());
        for (id, distance) in ranked {
            let chunk_id = self.id_to_chunk.get(&id).ok_or_else(|| {
                IngestError::CorruptIndex(format!("backend returned unmapped id {}", id))
            })?;
            let source_path = self
                .metadata
                .get(&id)
                .and_then(|m| m.get(META_SOURCE_PATH))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            hits.push(SearchHit {
                chunk_id: chunk_id.clone(),
                internal_id: id,
                distance,
                source_path,
            });
        }
        Ok(hits)
    }

    /// Commit the in-memory state. A no-op when nothing changed.
    ///
    /// On error the previously committed state is untouched and the index
    /// stays dirty.
    pub fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let generation = self.generation + 1;
        let vectors_file = format::vectors_file_name(generation);
        let rows = self.backend.export();
        let vector_bytes = format::encode_vectors(self.dims, &rows);

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            generation,
            dims: self.dims,
            metric: self.metric,
            next_id: self.next_id,
            count: rows.len() as u64,
            vectors_file: vectors_file.clone(),
            vectors_sha256: hex::encode(hash_bytes(&vector_bytes)),
            id_to_chunk: self.id_to_chunk.clone(),
            chunk_to_id: self
                .chunk_to_id
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            entries: self.metadata.clone(),
            saved_at: Utc::now(),
        };
        let manifest_bytes = serde_json::to_vec(&manifest)?;

        self.storage.write_atomic(&vectors_file, &vector_bytes)?;
        self.storage.write_atomic(MANIFEST_NAME, &manifest_bytes)?;

        self.generation = generation;
        self.dirty = false;
        info!(
            generation,
            entries = rows.len(),
            "vector index persisted"
        );

        self.remove_stale_generations();
        Ok(())
    }

    /// Remove vector files older than the previous generation. The previous
    /// one stays so a reader that fetched the old manifest can still load it.
    fn remove_stale_generations(&self) {
        let keep_from = self.generation.saturating_sub(1);
        let names = match self.storage.list() {
            Ok(names) => names,
            Err(e) => {
                warn!("could not list index storage for cleanup: {}", e);
                return;
            }
        };
        for name in names.iter().filter(|n| {
            format::is_vectors_file(n)
                && format::generation_of(n).map_or(true, |g| g < keep_from)
        }) {
            if let Err(e) = self.storage.remove(name) {
                warn!("could not remove stale vector file {}: {}", name, e);
            }
        }
    }

    /// Replace in-memory state with the committed state, discarding any
    /// unpersisted changes. Fails with `CorruptIndex` if the committed files
    /// disagree with each other; in that case the in-memory state is kept.
    ///
    /// A writer in another process may commit while this reads. If validation
    /// fails and the manifest has changed since it was read, the load is
    /// retried once against the new manifest.
    pub fn load(&mut self) -> Result<()> {
        let mut retried = false;
        let state = loop {
            let Some(manifest_bytes) = self.storage.read(MANIFEST_NAME)? else {
                self.reset();
                return Ok(());
            };
            match self.validate(&manifest_bytes) {
                Err(IngestError::CorruptIndex(msg)) if !retried => {
                    let current = self.storage.read(MANIFEST_NAME)?;
                    if current.as_deref() == Some(manifest_bytes.as_slice()) {
                        return Err(IngestError::CorruptIndex(msg));
                    }
                    debug!("manifest replaced during load, retrying: {}", msg);
                    retried = true;
                }
                result => break result?,
            }
        };

        self.backend = state.backend;
        self.id_to_chunk = state.id_to_chunk;
        self.chunk_to_id = state.chunk_to_id;
        self.metadata = state.metadata;
        self.next_id = state.next_id;
        self.generation = state.generation;
        self.dirty = false;
        info!(
            generation = self.generation,
            entries = self.len(),
            "vector index loaded"
        );
        Ok(())
    }

    fn reset(&mut self) {
        debug!("no committed index found, starting empty");
        self.backend = create_backend(self.backend_kind, self.dims);
        self.id_to_chunk.clear();
        self.chunk_to_id.clear();
        self.metadata.clear();
        self.next_id = 0;
        self.generation = 0;
        self.dirty = false;
    }

    fn validate(&self, manifest_bytes: &[u8]) -> Result<LoadedState> {
        let corrupt = |msg: String| IngestError::CorruptIndex(msg);

        let manifest: Manifest = serde_json::from_slice(manifest_bytes)
            .map_err(|e| corrupt(format!("manifest unreadable: {}", e)))?;

        if manifest.format_version != FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported manifest version {}",
                manifest.format_version
            )));
        }
        if manifest.dims != self.dims {
            return Err(IngestError::Config(format!(
                "index was built with {} dims, current embedder produces {}",
                manifest.dims, self.dims
            )));
        }
        if manifest.metric != self.metric {
            return Err(IngestError::Config(format!(
                "index was built with metric {:?}, config asks for {:?}",
                manifest.metric, self.metric
            )));
        }

        let vector_bytes = self
            .storage
            .read(&manifest.vectors_file)?
            .ok_or_else(|| corrupt(format!("vector file {} is missing", manifest.vectors_file)))?;
        let digest = hex::encode(hash_bytes(&vector_bytes));
        if digest != manifest.vectors_sha256 {
            return Err(corrupt(format!(
                "vector file {} digest does not match manifest",
                manifest.vectors_file
            )));
        }

        let rows = format::decode_vectors(&vector_bytes, manifest.dims)?;
        if rows.len() as u64 != manifest.count {
            return Err(corrupt(format!(
                "vector file holds {} entries, manifest says {}",
                rows.len(),
                manifest.count
            )));
        }
        if manifest.id_to_chunk.len() != rows.len()
            || manifest.chunk_to_id.len() != rows.len()
            || manifest.entries.len() != rows.len()
        {
            return Err(corrupt(format!(
                "entry counts disagree: vectors {}, id map {}, chunk map {}, metadata {}",
                rows.len(),
                manifest.id_to_chunk.len(),
                manifest.chunk_to_id.len(),
                manifest.entries.len()
            )));
        }

        let mut seen = HashSet::with_capacity(rows.len());
        for (id, _) in &rows {
            if *id >= manifest.next_id {
                return Err(corrupt(format!(
                    "id {} is not below next_id {}",
                    id, manifest.next_id
                )));
            }
            if !seen.insert(*id) {
                return Err(corrupt(format!("id {} appears twice", id)));
            }
            let chunk = manifest
                .id_to_chunk
                .get(id)
                .ok_or_else(|| corrupt(format!("id {} has no chunk mapping", id)))?;
            if manifest.chunk_to_id.get(chunk) != Some(id) {
                return Err(corrupt(format!(
                    "chunk {} does not map back to id {}",
                    chunk, id
                )));
            }
            if !manifest.entries.contains_key(id) {
                return Err(corrupt(format!("id {} has no metadata", id)));
            }
        }

        let mut backend = create_backend(self.backend_kind, self.dims);
        for (id, vector) in rows {
            backend.insert(id, vector);
        }

        Ok(LoadedState {
            backend,
            chunk_to_id: manifest.chunk_to_id.into_iter().collect(),
            id_to_chunk: manifest.id_to_chunk,
            metadata: manifest.entries,
            next_id: manifest.next_id,
            generation: manifest.generation,
        })
    }
}
