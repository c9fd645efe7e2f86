//! Vector index abstraction.
//!
//! The index is an eventually-consistent mirror of the chunk store, keyed by
//! deterministic `chunk_id`. The reconciler only needs `list_ids`, `upsert`
//! and `delete`; `query` serves the `search` command and downstream
//! retrieval with equality/range filters on record metadata.
//!
//! [`InMemoryIndex`] backs tests and dry runs; [`SqliteIndex`](crate::sqlite_index::SqliteIndex)
//! is the durable backend.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::SyncError;
use crate::models::{IndexMetadata, IndexRecord};

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Ids of every record whose metadata `doc_id` matches.
    async fn list_ids(&self, doc_id: &str) -> Result<BTreeSet<String>, SyncError>;

    /// Insert-or-replace by `chunk_id`. Returns the number of records written.
    async fn upsert(&self, records: &[IndexRecord]) -> Result<usize, SyncError>;

    /// Delete by id; unknown ids are ignored. Returns the number removed.
    async fn delete(&self, ids: &[String]) -> Result<usize, SyncError>;

    /// Top `k` records by cosine similarity among those matching `filter`.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<SearchHit>, SyncError>;

    /// Number of records matching `filter`.
    async fn count(&self, filter: &IndexFilter) -> Result<usize, SyncError>;
}

/// Metadata filter. Unset fields match everything; ranges are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexFilter {
    pub doc_id: Option<String>,
    pub file_extension: Option<String>,
    pub timestamp_min: Option<i64>,
    pub timestamp_max: Option<i64>,
    pub page_min: Option<u32>,
    pub page_max: Option<u32>,
}

impl IndexFilter {
    pub fn for_doc(doc_id: &str) -> Self {
        Self {
            doc_id: Some(doc_id.to_string()),
            ..Self::default()
        }
    }

    /// Records without a page never match a page range.
    pub fn matches(&self, meta: &IndexMetadata) -> bool {
        if let Some(doc_id) = &self.doc_id {
            if &meta.doc_id != doc_id {
                return false;
            }
        }
        if let Some(ext) = &self.file_extension {
            if !meta.file_extension.eq_ignore_ascii_case(ext) {
                return false;
            }
        }
        if self.timestamp_min.is_some_and(|min| meta.timestamp < min)
            || self.timestamp_max.is_some_and(|max| meta.timestamp > max)
        {
            return false;
        }
        if self.page_min.is_some() || self.page_max.is_some() {
            let Some(page) = meta.page else {
                return false;
            };
            if self.page_min.is_some_and(|min| page < min)
                || self.page_max.is_some_and(|max| page > max)
            {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
    pub text: String,
    pub metadata: IndexMetadata,
}

/// Call and record counters, used to assert idempotence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub upsert_calls: usize,
    pub delete_calls: usize,
    pub records_upserted: usize,
    pub records_deleted: usize,
}

/// Brute-force in-memory index.
#[derive(Default)]
pub struct InMemoryIndex {
    records: RwLock<BTreeMap<String, IndexRecord>>,
    upsert_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    records_upserted: AtomicUsize,
    records_deleted: AtomicUsize,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            upsert_calls: self.upsert_calls.load(Ordering::SeqCst),
            delete_calls: self.delete_calls.load(Ordering::SeqCst),
            records_upserted: self.records_upserted.load(Ordering::SeqCst),
            records_deleted: self.records_deleted.load(Ordering::SeqCst),
        }
    }

    pub fn reset_stats(&self) {
        self.upsert_calls.store(0, Ordering::SeqCst);
        self.delete_calls.store(0, Ordering::SeqCst);
        self.records_upserted.store(0, Ordering::SeqCst);
        self.records_deleted.store(0, Ordering::SeqCst);
    }

    pub fn get(&self, chunk_id: &str) -> Option<IndexRecord> {
        self.records.read().ok()?.get(chunk_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> SyncError {
    SyncError::IndexWrite("in-memory index lock poisoned".to_string())
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn list_ids(&self, doc_id: &str) -> Result<BTreeSet<String>, SyncError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records
            .values()
            .filter(|r| r.metadata.doc_id == doc_id)
            .map(|r| r.chunk_id.clone())
            .collect())
    }

    async fn upsert(&self, records: &[IndexRecord]) -> Result<usize, SyncError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let mut stored = self.records.write().map_err(|_| poisoned())?;
        for record in records {
            stored.insert(record.chunk_id.clone(), record.clone());
        }
        self.records_upserted
            .fetch_add(records.len(), Ordering::SeqCst);
        Ok(records.len())
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, SyncError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut stored = self.records.write().map_err(|_| poisoned())?;
        let removed = ids.iter().filter(|id| stored.remove(*id).is_some()).count();
        self.records_deleted.fetch_add(removed, Ordering::SeqCst);
        Ok(removed)
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<SearchHit>, SyncError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let hits = records
            .values()
            .filter(|r| filter.matches(&r.metadata))
            .map(|r| SearchHit {
                chunk_id: r.chunk_id.clone(),
                score: cosine_similarity(vector, &r.vector),
                text: r.text.clone(),
                metadata: r.metadata.clone(),
            })
            .collect();
        Ok(top_k(hits, k))
    }

    async fn count(&self, filter: &IndexFilter) -> Result<usize, SyncError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.values().filter(|r| filter.matches(&r.metadata)).count())
    }
}

/// Highest score first; ties broken by `chunk_id` so results are stable.
pub fn top_k(mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(k);
    hits
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
