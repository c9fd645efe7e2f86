//! Durable chunk store and manifest.
//!
//! Layout under the store root:
//!
//! ```text
//! manifest.json            doc_id -> ManifestEntry
//! chunks/{doc_id}.jsonl    one DocumentChunk per line
//! failures.json            FailureInfo list from the most recent run
//! ```
//!
//! Every file is replaced atomically (write to a sibling temp file, fsync,
//! rename). The in-memory manifest sits behind a single async mutex; every
//! manifest mutation takes it, updates the map, and rewrites
//! `manifest.json` before releasing it, so concurrent documents never lose
//! each other's updates.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::SyncError;
use crate::models::{
    ChunkSettings, DocStatus, Document, DocumentChunk, FailureInfo, Manifest, ManifestEntry,
    NormalizationSummary,
};

const MANIFEST_FILE: &str = "manifest.json";
const FAILURES_FILE: &str = "failures.json";
const CHUNKS_DIR: &str = "chunks";

pub struct ChunkStore {
    root: PathBuf,
    chunks_dir: PathBuf,
    manifest: Mutex<Manifest>,
}

/// Manifest counts for `csync status`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct ManifestSummary {
    pub active: usize,
    pub removed: usize,
    pub pending_index: usize,
    pub chunks: usize,
}

impl ChunkStore {
    /// Open (or create) a store rooted at `root` and load its manifest.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, SyncError> {
        let root = root.as_ref().to_path_buf();
        let chunks_dir = root.join(CHUNKS_DIR);
        tokio::fs::create_dir_all(&chunks_dir).await?;

        let manifest_path = root.join(MANIFEST_FILE);
        let manifest = match tokio::fs::read(&manifest_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                SyncError::Storage(format!("corrupt manifest {}: {}", manifest_path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Manifest::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            root,
            chunks_dir,
            manifest: Mutex::new(manifest),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_path(&self, doc_id: &str) -> PathBuf {
        self.chunks_dir.join(format!("{}.jsonl", doc_id))
    }

    /// Copy of the current manifest.
    pub async fn manifest(&self) -> Manifest {
        self.manifest.lock().await.clone()
    }

    pub async fn entry(&self, doc_id: &str) -> Option<ManifestEntry> {
        self.manifest.lock().await.get(doc_id).cloned()
    }

    /// Replace a document's chunk file, then record it in the manifest.
    ///
    /// The new entry is not yet `indexed`; see [`ChunkStore::mark_indexed`].
    /// `settings` are recorded so a later run with different ones re-chunks.
    pub async fn persist(
        &self,
        doc: &Document,
        chunks: &[DocumentChunk],
        settings: &ChunkSettings,
        normalization: Option<NormalizationSummary>,
    ) -> Result<ManifestEntry, SyncError> {
        let mut body = Vec::new();
        for chunk in chunks {
            serde_json::to_writer(&mut body, chunk)?;
            body.push(b'\n');
        }
        write_atomic(&self.chunk_path(&doc.doc_id), &body).await?;

        let entry = ManifestEntry {
            doc_id: doc.doc_id.clone(),
            content_hash: doc.content_hash.clone(),
            chunk_count: chunks.len(),
            status: DocStatus::Active,
            ingestion_timestamp: Utc::now(),
            indexed: false,
            source_path: Some(doc.source_path.display().to_string()),
            relative_path: Some(doc.relative_path.clone()),
            file_extension: Some(doc.file_extension.clone()),
            chunking: Some(settings.clone()),
            normalization,
        };

        self.update_manifest(|manifest| {
            manifest.insert(entry.doc_id.clone(), entry.clone());
        })
        .await?;

        tracing::debug!(doc_id = %doc.doc_id, chunks = chunks.len(), "persisted chunks");
        Ok(entry)
    }

    /// Delete a removed document's chunk file and tombstone its entry.
    ///
    /// The tombstone stays unindexed until the index deletions succeed.
    pub async fn remove(&self, doc_id: &str) -> Result<Option<ManifestEntry>, SyncError> {
        match tokio::fs::remove_file(self.chunk_path(doc_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut tombstone = None;
        self.update_manifest(|manifest| {
            if let Some(entry) = manifest.get_mut(doc_id) {
                if entry.status == DocStatus::Active {
                    entry.status = DocStatus::Removed;
                    entry.chunk_count = 0;
                    entry.indexed = false;
                    entry.ingestion_timestamp = Utc::now();
                }
                tombstone = Some(entry.clone());
            }
        })
        .await?;
        Ok(tombstone)
    }

    /// Record that the index now mirrors this entry's chunk set.
    pub async fn mark_indexed(&self, doc_id: &str) -> Result<(), SyncError> {
        self.update_manifest(|manifest| {
            if let Some(entry) = manifest.get_mut(doc_id) {
                entry.indexed = true;
            }
        })
        .await
    }

    /// Read back a document's persisted chunks, in chunk order.
    pub async fn load_chunks(&self, doc_id: &str) -> Result<Vec<DocumentChunk>, SyncError> {
        let path = self.chunk_path(doc_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(SyncError::from))
            .collect()
    }

    /// Overwrite the failure report with this run's failures.
    pub async fn save_failures(&self, failures: &[FailureInfo]) -> Result<(), SyncError> {
        let body = serde_json::to_vec_pretty(failures)?;
        write_atomic(&self.root.join(FAILURES_FILE), &body).await
    }

    /// Failures from the most recent run; empty if none were recorded.
    pub async fn load_failures(&self) -> Result<Vec<FailureInfo>, SyncError> {
        match tokio::fs::read(self.root.join(FAILURES_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn summary(&self) -> ManifestSummary {
        let manifest = self.manifest.lock().await;
        let mut summary = ManifestSummary::default();
        for entry in manifest.values() {
            match entry.status {
                DocStatus::Active => {
                    summary.active += 1;
                    summary.chunks += entry.chunk_count;
                }
                DocStatus::Removed => summary.removed += 1,
            }
            if !entry.indexed {
                summary.pending_index += 1;
            }
        }
        summary
    }

    /// Single-writer manifest mutation: apply `f` and flush while locked.
    ///
    /// On a failed flush the in-memory manifest is rolled back.
    async fn update_manifest<F>(&self, f: F) -> Result<(), SyncError>
    where
        F: FnOnce(&mut Manifest),
    {
        let mut manifest = self.manifest.lock().await;
        let previous = manifest.clone();
        f(&mut manifest);
        let body = serde_json::to_vec_pretty(&*manifest)?;
        if let Err(e) = write_atomic(&self.root.join(MANIFEST_FILE), &body).await {
            *manifest = previous;
            return Err(e);
        }
        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SyncError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| SyncError::Storage(format!("invalid path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await.map_err(|e| {
        SyncError::Storage(format!("failed to replace {}: {}", path.display(), e))
    })
}
