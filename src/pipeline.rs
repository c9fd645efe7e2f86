//! Batch orchestration of the per-document sync state machine.
//!
//! Each discovered document runs
//! `Discovered → Fingerprinted → Loaded → Normalized → Chunked → Persisted →
//! Embedded → Reconciled → Done`, returning early when the fingerprint says
//! it is unchanged. Documents the manifest knows about but discovery no
//! longer sees are tombstoned and reconciled against an empty chunk set.
//!
//! Documents are processed concurrently by up to `workers` tasks. A failure
//! is recorded as a [`FailureInfo`] and the run continues, unless fail-fast
//! is set: then no new document starts once the first failure is seen, and
//! in-flight documents finish.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};

use crate::chunk::Chunker;
use crate::config::{Config, CorpusConfig, RunConfig};
use crate::connector_fs;
use crate::embedding::EmbeddingGateway;
use crate::error::SyncError;
use crate::extract::{DocumentLoader, FileLoader};
use crate::fingerprint;
use crate::index::VectorIndex;
use crate::models::{
    ChangeKind, ChunkSettings, Document, DocumentChunk, FailureInfo, IndexRecord, Manifest,
    NormalizationSummary, RunReport, SourceFile, SourceRef, Stage,
};
use crate::normalize::{NormalizationPreset, Normalizer};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::reconcile::Reconciler;
use crate::sqlite_index::SqliteIndex;
use crate::store::ChunkStore;

/// Run-scoped switches, usually taken from `[run]` plus CLI overrides.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub fail_fast: bool,
    pub retry_failed_only: bool,
    pub doc_id_filter: BTreeSet<String>,
    pub workers: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from(&RunConfig::default())
    }
}

impl From<&RunConfig> for RunOptions {
    fn from(run: &RunConfig) -> Self {
        Self {
            fail_fast: run.fail_fast,
            retry_failed_only: run.retry_failed_only,
            doc_id_filter: run.doc_id_filter.clone(),
            workers: run.workers,
        }
    }
}

impl RunOptions {
    /// Whether this run covers only part of the corpus.
    fn is_restricted(&self) -> bool {
        self.retry_failed_only || !self.doc_id_filter.is_empty()
    }
}

enum Work {
    Source(SourceFile),
    Removed(String),
}

impl Work {
    fn doc_id(&self) -> &str {
        match self {
            Work::Source(file) => &file.doc_id,
            Work::Removed(doc_id) => doc_id,
        }
    }
}

#[derive(Debug)]
enum DocOutcome {
    Unchanged,
    Synced {
        kind: ChangeKind,
        chunks: usize,
        upserted: usize,
        deleted: usize,
    },
    Removed {
        deleted: usize,
    },
    Failed(FailureInfo),
    /// Not started because fail-fast tripped.
    Skipped,
}

pub struct Orchestrator {
    store: Arc<ChunkStore>,
    loader: Arc<dyn DocumentLoader>,
    normalizer: Normalizer,
    preset: NormalizationPreset,
    chunker: Chunker,
    gateway: Option<EmbeddingGateway>,
    reconciler: Option<Reconciler>,
    options: RunOptions,
    progress: Box<dyn SyncProgressReporter>,
}

impl Orchestrator {
    /// An orchestrator that persists chunks but does not embed or index.
    pub fn new(
        store: Arc<ChunkStore>,
        chunker: Chunker,
        preset: NormalizationPreset,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            store,
            loader: Arc::new(FileLoader),
            normalizer: Normalizer::from_preset(preset)?,
            preset,
            chunker,
            gateway: None,
            reconciler: None,
            options: RunOptions::default(),
            progress: Box::new(NoProgress),
        })
    }

    /// Embed persisted chunks and mirror them into `index`.
    ///
    /// Index writes reuse the gateway's retry policy.
    pub fn with_embedding(mut self, gateway: EmbeddingGateway, index: Arc<dyn VectorIndex>) -> Self {
        self.reconciler = Some(Reconciler::new(index, gateway.policy()));
        self.gateway = Some(gateway);
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn DocumentLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Wire everything from a validated config.
    ///
    /// The SQLite index is only opened when an embedding provider is set.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = ChunkStore::open(&config.store.root)
            .await
            .with_context(|| format!("Failed to open chunk store at {}", config.store.root.display()))?;
        let chunker = Chunker::with_word_tokenizer(
            config.chunking.chunk_target_tokens,
            config.chunking.chunk_overlap_tokens,
        )?;
        let mut orchestrator = Self::new(Arc::new(store), chunker, config.normalization.preset)?
            .with_options(RunOptions::from(&config.run));

        if let Some(gateway) = EmbeddingGateway::from_config(&config.embedding)? {
            let index = SqliteIndex::open(&config.index.path)
                .await
                .with_context(|| format!("Failed to open index at {}", config.index.path.display()))?;
            orchestrator = orchestrator.with_embedding(gateway, Arc::new(index));
        }
        Ok(orchestrator)
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    fn indexing(&self) -> bool {
        self.reconciler.is_some()
    }

    /// Preset, limits and tokenizer this orchestrator chunks with.
    pub fn chunk_settings(&self) -> ChunkSettings {
        ChunkSettings {
            preset: self.preset.as_str().to_string(),
            target_tokens: self.chunker.target_tokens(),
            overlap_tokens: self.chunker.overlap_tokens(),
            tokenizer: self.chunker.tokenizer_name().to_string(),
        }
    }

    /// Sync the corpus once and report what happened.
    ///
    /// Only discovery and failure-report persistence fail the whole call;
    /// document-level errors land in [`RunReport::failures`].
    pub async fn run(&self, corpus: &CorpusConfig) -> Result<RunReport> {
        let started = Instant::now();
        self.progress.report(SyncProgressEvent::Discovering {
            root: corpus.root.display().to_string(),
        });

        let discovered = connector_fs::discover(corpus)?;
        let snapshot = self.store.manifest().await;
        let previous_failures = if self.options.is_restricted() {
            self.store.load_failures().await?
        } else {
            Vec::new()
        };
        let scope = self.scope(&discovered, &previous_failures);
        let in_scope = |doc_id: &str| scope.as_ref().map_or(true, |s| s.contains(doc_id));

        let discovered_ids: BTreeSet<String> = discovered.iter().map(|f| f.doc_id.clone()).collect();
        let removed: Vec<String> =
            fingerprint::removed_doc_ids(&snapshot, &discovered_ids, self.indexing())
                .into_iter()
                .filter(|id| in_scope(id.as_str()))
                .collect();
        let sources: Vec<SourceFile> = discovered
            .into_iter()
            .filter(|f| in_scope(f.doc_id.as_str()))
            .collect();

        tracing::info!(
            root = %corpus.root.display(),
            documents = sources.len(),
            removals = removed.len(),
            restricted = self.options.is_restricted(),
            "sync planned"
        );
        self.progress.report(SyncProgressEvent::Planned {
            documents: sources.len() as u64,
            removals: removed.len() as u64,
        });

        let work: Vec<Work> = sources
            .into_iter()
            .map(Work::Source)
            .chain(removed.into_iter().map(Work::Removed))
            .collect();
        let total = work.len() as u64;

        let abort_flag = AtomicBool::new(false);
        let done_count = AtomicU64::new(0);
        let abort = &abort_flag;
        let done = &done_count;
        let snapshot = &snapshot;

        let outcomes: Vec<(String, DocOutcome)> = stream::iter(work)
            .map(move |item| async move {
                let doc_id = item.doc_id().to_string();
                if self.options.fail_fast && abort.load(Ordering::SeqCst) {
                    return (doc_id, DocOutcome::Skipped);
                }
                let outcome = match item {
                    Work::Source(file) => self.sync_source(file, snapshot).await,
                    Work::Removed(doc_id) => self.sync_removed(&doc_id, snapshot).await,
                };
                if self.options.fail_fast && matches!(outcome, DocOutcome::Failed(_)) {
                    abort.store(true, Ordering::SeqCst);
                }
                let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                self.progress.report(SyncProgressEvent::Processing { n, total });
                (doc_id, outcome)
            })
            .buffer_unordered(self.options.workers.max(1))
            .collect()
            .await;

        let mut report = RunReport::default();
        let mut attempted = BTreeSet::new();
        for (doc_id, outcome) in outcomes {
            if !matches!(outcome, DocOutcome::Skipped) {
                attempted.insert(doc_id);
            }
            match outcome {
                DocOutcome::Unchanged => report.unchanged += 1,
                DocOutcome::Synced {
                    kind,
                    chunks,
                    upserted,
                    deleted,
                } => {
                    if kind == ChangeKind::New {
                        report.new += 1;
                    } else {
                        report.changed += 1;
                    }
                    report.chunks_written += chunks;
                    report.vectors_upserted += upserted;
                    report.vectors_deleted += deleted;
                }
                DocOutcome::Removed { deleted } => {
                    report.removed += 1;
                    report.vectors_deleted += deleted;
                }
                DocOutcome::Failed(failure) => {
                    report.failed += 1;
                    report.failures.push(failure);
                }
                DocOutcome::Skipped => report.aborted = true,
            }
        }
        if self.options.fail_fast && abort_flag.load(Ordering::SeqCst) {
            report.aborted = true;
        }
        report
            .failures
            .sort_by(|a, b| a.source_path.cmp(&b.source_path));

        let mut persisted = report.failures.clone();
        if self.options.is_restricted() {
            persisted.extend(previous_failures.into_iter().filter(|f| {
                f.doc_id
                    .as_deref()
                    .map_or(true, |id| !attempted.contains(id))
            }));
            persisted.sort_by(|a, b| a.source_path.cmp(&b.source_path));
        }
        self.store
            .save_failures(&persisted)
            .await
            .context("Failed to write failure report")?;

        report.duration_ms = duration_ms(started.elapsed());
        tracing::info!(
            new = report.new,
            changed = report.changed,
            unchanged = report.unchanged,
            removed = report.removed,
            failed = report.failed,
            aborted = report.aborted,
            duration_ms = report.duration_ms,
            "sync finished"
        );
        Ok(report)
    }

    /// Doc ids this run may touch, or `None` for the whole corpus.
    fn scope(
        &self,
        discovered: &[SourceFile],
        previous_failures: &[FailureInfo],
    ) -> Option<BTreeSet<String>> {
        let mut scope: Option<BTreeSet<String>> = None;

        if self.options.retry_failed_only {
            let mut ids: BTreeSet<String> = previous_failures
                .iter()
                .filter_map(|f| f.doc_id.clone())
                .collect();
            let paths: BTreeSet<&str> = previous_failures
                .iter()
                .filter(|f| f.doc_id.is_none())
                .map(|f| f.source_path.as_str())
                .collect();
            ids.extend(
                discovered
                    .iter()
                    .filter(|f| paths.contains(f.source_path.display().to_string().as_str()))
                    .map(|f| f.doc_id.clone()),
            );
            scope = Some(ids);
        }

        if !self.options.doc_id_filter.is_empty() {
            scope = Some(match scope {
                Some(ids) => ids
                    .intersection(&self.options.doc_id_filter)
                    .cloned()
                    .collect(),
                None => self.options.doc_id_filter.clone(),
            });
        }
        scope
    }

    async fn sync_source(&self, file: SourceFile, snapshot: &Manifest) -> DocOutcome {
        let mut stage = Stage::Discovered;
        match self.process_source(&file, snapshot, &mut stage).await {
            Ok(outcome) => outcome,
            Err(err) => DocOutcome::Failed(failure(
                file.source_path.display().to_string(),
                &file.doc_id,
                stage,
                err,
            )),
        }
    }

    async fn process_source(
        &self,
        file: &SourceFile,
        snapshot: &Manifest,
        stage: &mut Stage,
    ) -> Result<DocOutcome, SyncError> {
        let bytes = tokio::fs::read(&file.source_path).await.map_err(|e| {
            SyncError::Extraction(format!("cannot read {}: {}", file.source_path.display(), e))
        })?;
        let content_hash = fingerprint::content_hash(&bytes);
        *stage = Stage::Fingerprinted;

        let settings = self.chunk_settings();
        let kind = fingerprint::classify(
            snapshot,
            &file.doc_id,
            &content_hash,
            &settings,
            self.indexing(),
        );
        if kind == ChangeKind::Unchanged {
            tracing::debug!(doc_id = %file.doc_id, "unchanged, skipping");
            return Ok(DocOutcome::Unchanged);
        }

        let loader = Arc::clone(&self.loader);
        let source = file.clone();
        let extraction = tokio::task::spawn_blocking(move || loader.load(&source, &bytes))
            .await
            .map_err(|e| SyncError::Extraction(format!("loader task failed: {}", e)))??;
        *stage = Stage::Loaded;

        let mut metadata = extraction.metadata;
        metadata.insert("size_bytes".to_string(), serde_json::json!(file.size_bytes));
        let doc = Document {
            doc_id: file.doc_id.clone(),
            source_path: file.source_path.clone(),
            relative_path: file.relative_path.clone(),
            file_extension: file.file_extension.clone(),
            content_hash,
            extracted_text: extraction.text,
            metadata,
            last_modified: file.last_modified,
        };

        let normalized = self.normalizer.normalize(&doc.extracted_text)?;
        *stage = Stage::Normalized;

        let chunks: Vec<DocumentChunk> = self
            .chunker
            .chunk(
                &doc.doc_id,
                &doc.content_hash,
                doc.last_modified,
                &normalized.normalized_text,
            )
            .collect();
        *stage = Stage::Chunked;

        let summary = NormalizationSummary {
            preset: self.preset.as_str().to_string(),
            rules_applied: normalized.rules_applied,
            bytes_before: normalized.bytes_before,
            bytes_after: normalized.bytes_after,
        };
        self.store
            .persist(&doc, &chunks, &settings, Some(summary))
            .await?;
        *stage = Stage::Persisted;

        let (upserted, deleted) = match (&self.gateway, &self.reconciler) {
            (Some(gateway), Some(reconciler)) => {
                let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
                let vectors = gateway.embed_batch(&texts).await?;
                *stage = Stage::Embedded;

                let source_path = doc.source_path.display().to_string();
                let source = SourceRef {
                    source_path: &source_path,
                    relative_path: &doc.relative_path,
                    file_extension: &doc.file_extension,
                };
                let records: Vec<IndexRecord> = chunks
                    .iter()
                    .zip(vectors)
                    .map(|(chunk, vector)| IndexRecord::from_chunk(&source, chunk, vector))
                    .collect();
                let outcome = reconciler.reconcile(&doc.doc_id, &records).await?;
                *stage = Stage::Reconciled;

                self.store.mark_indexed(&doc.doc_id).await?;
                (outcome.upserted, outcome.deleted)
            }
            _ => (0, 0),
        };
        *stage = Stage::Done;

        tracing::info!(
            doc_id = %doc.doc_id,
            kind = ?kind,
            chunks = chunks.len(),
            upserted,
            deleted,
            "document synced"
        );
        Ok(DocOutcome::Synced {
            kind,
            chunks: chunks.len(),
            upserted,
            deleted,
        })
    }

    async fn sync_removed(&self, doc_id: &str, snapshot: &Manifest) -> DocOutcome {
        let source_path = snapshot
            .get(doc_id)
            .and_then(|e| e.source_path.clone())
            .unwrap_or_else(|| doc_id.to_string());
        let mut stage = Stage::Fingerprinted;
        match self.process_removed(doc_id, &mut stage).await {
            Ok(deleted) => {
                tracing::info!(doc_id, deleted, "document removed");
                DocOutcome::Removed { deleted }
            }
            Err(err) => DocOutcome::Failed(failure(source_path, doc_id, stage, err)),
        }
    }

    async fn process_removed(&self, doc_id: &str, stage: &mut Stage) -> Result<usize, SyncError> {
        self.store.remove(doc_id).await?;
        *stage = Stage::Persisted;

        let mut deleted = 0;
        if let Some(reconciler) = &self.reconciler {
            deleted = reconciler.reconcile(doc_id, &[]).await?.deleted;
            *stage = Stage::Reconciled;
            self.store.mark_indexed(doc_id).await?;
        }
        *stage = Stage::Done;
        Ok(deleted)
    }
}

fn failure(source_path: String, doc_id: &str, stage: Stage, err: SyncError) -> FailureInfo {
    tracing::warn!(
        doc_id,
        %stage,
        error_kind = %err.kind(),
        error = %err,
        "document failed"
    );
    FailureInfo {
        source_path,
        doc_id: Some(doc_id.to_string()),
        error_kind: err.kind(),
        stage,
        message: err.to_string(),
        timestamp: Utc::now(),
    }
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
