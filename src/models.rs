//! Core data models used throughout the sync pipeline.
//!
//! These types represent the documents, chunks, manifest entries, and index
//! records that flow from discovery through reconciliation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// A file found by corpus discovery, before any bytes are read.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub doc_id: String,
    pub source_path: PathBuf,
    pub relative_path: String,
    pub file_extension: String,
    pub last_modified: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Extracted document, immutable for the rest of the run.
#[derive(Debug, Clone)]
pub struct Document {
    pub doc_id: String,
    pub source_path: PathBuf,
    pub relative_path: String,
    pub file_extension: String,
    pub content_hash: String,
    pub extracted_text: String,
    /// Format-specific facts (page_count, paragraph_count, ...).
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub last_modified: DateTime<Utc>,
}

/// One overlapping text window of a document.
///
/// Serialized as one JSON line in the document's chunk file; the field
/// order here is the on-disk order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: String,
    pub chunk_index: u32,
    pub doc_id: String,
    pub text: String,
    pub token_count: usize,
    pub paragraph_start: usize,
    pub paragraph_end: usize,
    pub page: Option<u32>,
    pub section: Option<String>,
    pub content_hash: String,
    pub timestamp: DateTime<Utc>,
}

/// Deterministic chunk identity: `{doc_id}::chunk-{index:04}`.
pub fn chunk_id(doc_id: &str, index: u32) -> String {
    format!("{}::chunk-{:04}", doc_id, index)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Active,
    Removed,
}

/// Summary of the normalization pass that produced a document's chunks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationSummary {
    pub preset: String,
    pub rules_applied: Vec<String>,
    pub bytes_before: usize,
    pub bytes_after: usize,
}

/// Settings that shaped a document's chunk sequence.
///
/// The same bytes chunked under different settings yield different chunks,
/// so a mismatch re-processes the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSettings {
    pub preset: String,
    pub target_tokens: usize,
    pub overlap_tokens: usize,
    pub tokenizer: String,
}

/// Manifest record for one `doc_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub doc_id: String,
    pub content_hash: String,
    pub chunk_count: usize,
    pub status: DocStatus,
    pub ingestion_timestamp: DateTime<Utc>,
    /// True once the vector index mirrors this entry's chunk set.
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub source_path: Option<String>,
    #[serde(default)]
    pub relative_path: Option<String>,
    #[serde(default)]
    pub file_extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunking: Option<ChunkSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalization: Option<NormalizationSummary>,
}

/// Durable ledger keyed by `doc_id`. Ordered so the JSON file is stable.
pub type Manifest = BTreeMap<String, ManifestEntry>;

/// Outcome of comparing a discovered document against the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Unchanged,
    Changed,
}

/// Last pipeline stage a document reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovered,
    Fingerprinted,
    Loaded,
    Normalized,
    Chunked,
    Persisted,
    Embedded,
    Reconciled,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Discovered => "discovered",
            Stage::Fingerprinted => "fingerprinted",
            Stage::Loaded => "loaded",
            Stage::Normalized => "normalized",
            Stage::Chunked => "chunked",
            Stage::Persisted => "persisted",
            Stage::Embedded => "embedded",
            Stage::Reconciled => "reconciled",
            Stage::Done => "done",
        };
        f.pad(s)
    }
}

/// One document-level failure, appended to the run's failure report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub source_path: String,
    #[serde(default)]
    pub doc_id: Option<String>,
    pub error_kind: ErrorKind,
    /// Last stage reached before the failure.
    pub stage: Stage,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Metadata stored next to each vector in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub doc_id: String,
    pub chunk_id: String,
    pub chunk_index: u32,
    pub source_path: String,
    pub relative_path: String,
    pub file_extension: String,
    pub page: Option<u32>,
    pub section: Option<String>,
    pub content_hash: String,
    /// Unix seconds; range-filterable.
    pub timestamp: i64,
    pub paragraph_start: usize,
    pub paragraph_end: usize,
    pub chunk_token_count: usize,
    #[serde(default)]
    pub acl_read: Vec<String>,
    #[serde(default)]
    pub acl_write: Vec<String>,
}

/// A vector plus its chunk metadata, as held by the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: IndexMetadata,
}

impl IndexRecord {
    /// Mirror a persisted chunk into an index record.
    pub fn from_chunk(doc: &SourceRef<'_>, chunk: &DocumentChunk, vector: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            vector,
            text: chunk.text.clone(),
            metadata: IndexMetadata {
                doc_id: chunk.doc_id.clone(),
                chunk_id: chunk.chunk_id.clone(),
                chunk_index: chunk.chunk_index,
                source_path: doc.source_path.to_string(),
                relative_path: doc.relative_path.to_string(),
                file_extension: doc.file_extension.to_string(),
                page: chunk.page,
                section: chunk.section.clone(),
                content_hash: chunk.content_hash.clone(),
                timestamp: chunk.timestamp.timestamp(),
                paragraph_start: chunk.paragraph_start,
                paragraph_end: chunk.paragraph_end,
                chunk_token_count: chunk.token_count,
                acl_read: Vec::new(),
                acl_write: Vec::new(),
            },
        }
    }
}

/// Borrowed source descriptors needed to build index metadata.
#[derive(Debug, Clone, Copy)]
pub struct SourceRef<'a> {
    pub source_path: &'a str,
    pub relative_path: &'a str,
    pub file_extension: &'a str,
}

/// Run-level summary produced by the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub failed: usize,
    pub chunks_written: usize,
    pub vectors_upserted: usize,
    pub vectors_deleted: usize,
    pub duration_ms: u64,
    /// Set when fail-fast stopped the run early.
    pub aborted: bool,
    pub failures: Vec<FailureInfo>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.aborted
    }
}
