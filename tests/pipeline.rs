//! End-to-end orchestrator runs over temp corpora, an in-memory index, and
//! a scripted embedding backend.
//!
//! Covers idempotent re-runs, deterministic chunk ids, shrink and removal
//! cleanup, failure isolation, embedding retries, fail-fast, and
//! retry-failed runs.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use corpus_sync::chunk::Chunker;
use corpus_sync::config::CorpusConfig;
use corpus_sync::embedding::{EmbeddingBackend, EmbeddingGateway, RetryPolicy};
use corpus_sync::error::{ErrorKind, SyncError};
use corpus_sync::index::{InMemoryIndex, VectorIndex};
use corpus_sync::models::{chunk_id, DocStatus, Stage};
use corpus_sync::normalize::NormalizationPreset;
use corpus_sync::pipeline::{Orchestrator, RunOptions};
use corpus_sync::store::ChunkStore;

/// Replays scripted errors first, then embeds deterministically.
struct ScriptedBackend {
    script: Mutex<VecDeque<SyncError>>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn new(script: Vec<SyncError>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingBackend for ScriptedBackend {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(texts
            .iter()
            .map(|t| {
                vec![
                    t.len() as f32,
                    t.split_whitespace().count() as f32,
                    1.0,
                ]
            })
            .collect())
    }
}

struct Harness {
    tmp: TempDir,
    docs: PathBuf,
    index: Arc<InMemoryIndex>,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        fs::create_dir_all(&docs).unwrap();
        Self {
            tmp,
            docs,
            index: Arc::new(InMemoryIndex::new()),
        }
    }

    fn write(&self, name: &str, body: impl AsRef<[u8]>) {
        let path = self.docs.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, body).unwrap();
    }

    fn corpus(&self) -> CorpusConfig {
        CorpusConfig {
            root: self.docs.clone(),
            include_globs: vec!["**/*.md".into(), "**/*.txt".into(), "**/*.docx".into()],
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }

    fn store_root(&self) -> PathBuf {
        self.tmp.path().join("store")
    }

    async fn orchestrator(&self, backend: Arc<ScriptedBackend>, options: RunOptions) -> Orchestrator {
        build(&self.store_root(), Arc::clone(&self.index), backend, options).await
    }
}

async fn build(
    store_root: &Path,
    index: Arc<InMemoryIndex>,
    backend: Arc<ScriptedBackend>,
    options: RunOptions,
) -> Orchestrator {
    let chunker = Chunker::with_word_tokenizer(60, 12).unwrap();
    build_with(store_root, index, backend, options, chunker, NormalizationPreset::Minimal).await
}

async fn build_with(
    store_root: &Path,
    index: Arc<InMemoryIndex>,
    backend: Arc<ScriptedBackend>,
    options: RunOptions,
    chunker: Chunker,
    preset: NormalizationPreset,
) -> Orchestrator {
    let store = ChunkStore::open(store_root).await.unwrap();
    let gateway = EmbeddingGateway::new(
        backend,
        4,
        RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        },
        Duration::from_secs(5),
    );
    Orchestrator::new(Arc::new(store), chunker, preset)
        .unwrap()
        .with_embedding(gateway, index)
        .with_options(options)
}

/// `paragraphs` distinct paragraphs of 25 words each.
fn long_doc(tag: &str, paragraphs: usize) -> String {
    (0..paragraphs)
        .map(|p| {
            (0..25)
                .map(|w| format!("{}p{}w{}", tag, p, w))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn docx(paragraphs: &[&str]) -> Vec<u8> {
    use std::io::Write;
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    let xml = format!(
        "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
        body
    );
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

#[tokio::test]
async fn second_run_over_unchanged_corpus_is_a_no_op() {
    let h = Harness::new();
    h.write("alpha.md", long_doc("a", 6));
    h.write("notes/beta.txt", "Beta notes about deployment.\n\nKubernetes and Docker.");
    h.write("gamma.docx", docx(&["Gamma office text", "Second paragraph"]));
    let backend = ScriptedBackend::new(vec![]);
    let orch = h.orchestrator(Arc::clone(&backend), RunOptions::default()).await;

    let first = orch.run(&h.corpus()).await.unwrap();
    assert_eq!(first.new, 3, "{:?}", first.failures);
    assert!(first.is_success());
    assert!(first.vectors_upserted > 0);
    let manifest = orch.store().manifest().await;
    assert!(manifest.values().all(|e| e.indexed));

    h.index.reset_stats();
    let calls = backend.calls();
    let second = orch.run(&h.corpus()).await.unwrap();
    assert_eq!(second.unchanged, 3);
    assert_eq!(second.new + second.changed + second.removed + second.failed, 0);
    assert_eq!(h.index.stats().upsert_calls, 0);
    assert_eq!(h.index.stats().delete_calls, 0);
    assert_eq!(backend.calls(), calls);
    assert_eq!(orch.store().manifest().await, manifest);
}

#[tokio::test]
async fn chunk_ids_and_files_are_identical_across_stores() {
    let h = Harness::new();
    h.write("guide.md", long_doc("g", 8));

    let other_index = Arc::new(InMemoryIndex::new());
    let a = h.orchestrator(ScriptedBackend::new(vec![]), RunOptions::default()).await;
    let b = build(
        &h.tmp.path().join("store-b"),
        Arc::clone(&other_index),
        ScriptedBackend::new(vec![]),
        RunOptions::default(),
    )
    .await;
    a.run(&h.corpus()).await.unwrap();
    b.run(&h.corpus()).await.unwrap();

    let ids_a = h.index.list_ids("guide-md").await.unwrap();
    let ids_b = other_index.list_ids("guide-md").await.unwrap();
    assert!(ids_a.len() > 1);
    assert_eq!(ids_a, ids_b);
    let expected: BTreeSet<String> = (0..ids_a.len() as u32).map(|i| chunk_id("guide-md", i)).collect();
    assert_eq!(ids_a, expected);

    let file_a = fs::read(a.store().chunk_path("guide-md")).unwrap();
    let file_b = fs::read(b.store().chunk_path("guide-md")).unwrap();
    assert_eq!(file_a, file_b);
}

#[tokio::test]
async fn shrinking_a_document_deletes_exactly_the_orphans() {
    let h = Harness::new();
    h.write("report.md", long_doc("r", 12));
    let orch = h.orchestrator(ScriptedBackend::new(vec![]), RunOptions::default()).await;
    orch.run(&h.corpus()).await.unwrap();
    let n = h.index.list_ids("report-md").await.unwrap().len();

    h.write("report.md", long_doc("r", 4));
    let report = orch.run(&h.corpus()).await.unwrap();
    assert_eq!(report.changed, 1);
    let ids = h.index.list_ids("report-md").await.unwrap();
    let m = ids.len();
    assert!(m < n, "expected fewer chunks, {} vs {}", m, n);
    assert_eq!(report.vectors_deleted, n - m);
    let expected: BTreeSet<String> = (0..m as u32).map(|i| chunk_id("report-md", i)).collect();
    assert_eq!(ids, expected);
    assert_eq!(orch.store().entry("report-md").await.unwrap().chunk_count, m);
}

#[tokio::test]
async fn removed_document_leaves_no_index_records() {
    let h = Harness::new();
    h.write("keep.md", "Keep this document around.");
    h.write("drop.md", long_doc("d", 5));
    let orch = h.orchestrator(ScriptedBackend::new(vec![]), RunOptions::default()).await;
    orch.run(&h.corpus()).await.unwrap();
    assert!(!h.index.list_ids("drop-md").await.unwrap().is_empty());

    fs::remove_file(h.docs.join("drop.md")).unwrap();
    let report = orch.run(&h.corpus()).await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.unchanged, 1);
    assert!(h.index.list_ids("drop-md").await.unwrap().is_empty());
    assert!(!h.index.list_ids("keep-md").await.unwrap().is_empty());

    let tombstone = orch.store().entry("drop-md").await.unwrap();
    assert_eq!(tombstone.status, DocStatus::Removed);
    assert!(tombstone.indexed);

    h.index.reset_stats();
    let again = orch.run(&h.corpus()).await.unwrap();
    assert_eq!(again.removed, 0);
    assert_eq!(h.index.stats().delete_calls, 0);
}

#[tokio::test]
async fn one_bad_document_does_not_stop_the_other_nine() {
    let h = Harness::new();
    for i in 0..9 {
        h.write(
            &format!("doc{}.md", i),
            format!("Document {} talks about topic {}.", i, i * 7),
        );
    }
    h.write("broken.docx", b"this is not a zip archive");
    let orch = h.orchestrator(ScriptedBackend::new(vec![]), RunOptions::default()).await;

    let report = orch.run(&h.corpus()).await.unwrap();
    assert_eq!(report.new, 9);
    assert_eq!(report.failed, 1);
    assert!(!report.aborted);
    assert!(!report.is_success());

    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert!(failure.source_path.ends_with("broken.docx"));
    assert_eq!(failure.doc_id.as_deref(), Some("broken-docx"));
    assert_eq!(failure.error_kind, ErrorKind::Extraction);
    assert!(h.index.list_ids("broken-docx").await.unwrap().is_empty());
    assert!(orch.store().entry("broken-docx").await.is_none());
    for i in 0..9 {
        assert_eq!(h.index.list_ids(&format!("doc{}-md", i)).await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn transient_embedding_failures_are_retried_and_indexed_once() {
    let h = Harness::new();
    h.write("single.md", "One short paragraph to embed.");
    let backend = ScriptedBackend::new(vec![
        SyncError::embedding_retryable("HTTP 429"),
        SyncError::embedding_retryable("timed out"),
    ]);
    let orch = h.orchestrator(Arc::clone(&backend), RunOptions::default()).await;

    let report = orch.run(&h.corpus()).await.unwrap();
    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(backend.calls(), 3);
    assert_eq!(h.index.stats().upsert_calls, 1);
    assert_eq!(h.index.stats().records_upserted, 1);
    assert_eq!(h.index.len(), 1);
}

#[tokio::test]
async fn exhausted_retries_keep_chunks_persisted_but_unindexed() {
    let h = Harness::new();
    h.write("flaky.md", "Content that will not embed the first time.");
    let backend = ScriptedBackend::new(
        (0..4)
            .map(|_| SyncError::embedding_retryable("HTTP 503"))
            .collect(),
    );
    let orch = h.orchestrator(Arc::clone(&backend), RunOptions::default()).await;

    let report = orch.run(&h.corpus()).await.unwrap();
    assert_eq!(report.failed, 1);
    let failure = &report.failures[0];
    assert_eq!(failure.error_kind, ErrorKind::EmbeddingRetryable);
    assert_eq!(failure.stage, Stage::Persisted);
    assert_eq!(backend.calls(), 4);
    assert!(h.index.is_empty());

    let entry = orch.store().entry("flaky-md").await.unwrap();
    assert!(!entry.indexed);
    assert_eq!(orch.store().load_chunks("flaky-md").await.unwrap().len(), 1);

    let next = orch.run(&h.corpus()).await.unwrap();
    assert_eq!(next.changed, 1);
    assert!(next.is_success());
    assert_eq!(h.index.len(), 1);
    assert!(orch.store().entry("flaky-md").await.unwrap().indexed);
}

#[tokio::test]
async fn fatal_embedding_errors_are_not_retried() {
    let h = Harness::new();
    h.write("doc.md", "Some text.");
    let backend = ScriptedBackend::new(vec![SyncError::embedding_fatal("HTTP 400")]);
    let orch = h.orchestrator(Arc::clone(&backend), RunOptions::default()).await;

    let report = orch.run(&h.corpus()).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].error_kind, ErrorKind::EmbeddingFatal);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn fail_fast_aborts_after_first_failure() {
    let h = Harness::new();
    h.write("a-broken.docx", b"garbage");
    for i in 0..4 {
        h.write(&format!("doc{}.md", i), format!("Document number {}.", i));
    }
    let options = RunOptions {
        fail_fast: true,
        workers: 1,
        ..RunOptions::default()
    };
    let orch = h.orchestrator(ScriptedBackend::new(vec![]), options).await;

    let report = orch.run(&h.corpus()).await.unwrap();
    assert!(report.aborted);
    assert_eq!(report.failed, 1);
    assert_eq!(report.new, 0);
    assert!(h.index.is_empty());
}

#[tokio::test]
async fn retry_failed_runs_only_previous_failures() {
    let h = Harness::new();
    h.write("good.md", "Good document.");
    h.write("bad.docx", b"not a docx");
    let orch = h.orchestrator(ScriptedBackend::new(vec![]), RunOptions::default()).await;
    let first = orch.run(&h.corpus()).await.unwrap();
    assert_eq!(first.failed, 1);

    h.write("bad.docx", docx(&["Repaired document body"]));
    h.write("good.md", "Edited, but outside the retry scope.");
    let retry = h
        .orchestrator(
            ScriptedBackend::new(vec![]),
            RunOptions {
                retry_failed_only: true,
                ..RunOptions::default()
            },
        )
        .await;

    let report = retry.run(&h.corpus()).await.unwrap();
    assert_eq!(report.new, 1);
    assert_eq!(report.changed, 0);
    assert!(report.is_success());
    assert_eq!(h.index.list_ids("bad-docx").await.unwrap().len(), 1);
    assert!(retry.store().load_failures().await.unwrap().is_empty());
    assert_eq!(h.index.list_ids("good-md").await.unwrap().len(), 1);
}

#[tokio::test]
async fn doc_id_filter_limits_work_and_keeps_other_failures() {
    let h = Harness::new();
    h.write("one.md", "First.");
    h.write("two.md", "Second.");
    h.write("bad.docx", b"broken");
    let orch = h.orchestrator(ScriptedBackend::new(vec![]), RunOptions::default()).await;
    orch.run(&h.corpus()).await.unwrap();

    h.write("one.md", "First, edited.");
    h.write("two.md", "Second, edited.");
    let filtered = h
        .orchestrator(
            ScriptedBackend::new(vec![]),
            RunOptions {
                doc_id_filter: ["one-md".to_string()].into_iter().collect(),
                ..RunOptions::default()
            },
        )
        .await;
    let report = filtered.run(&h.corpus()).await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(report.failed, 0);

    let failures = filtered.store().load_failures().await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].doc_id.as_deref(), Some("bad-docx"));
}

/// Same store and index, smaller windows, aggressive normalization.
async fn small_aggressive(h: &Harness) -> Orchestrator {
    build_with(
        &h.store_root(),
        Arc::clone(&h.index),
        ScriptedBackend::new(vec![]),
        RunOptions::default(),
        Chunker::with_word_tokenizer(20, 4).unwrap(),
        NormalizationPreset::Aggressive,
    )
    .await
}

#[tokio::test]
async fn new_chunk_settings_reprocess_unchanged_bytes() {
    let h = Harness::new();
    h.write("manual.md", format!("{}\n\nPage 3\n\n{}", long_doc("m", 2), long_doc("n", 2)));
    let first = h.orchestrator(ScriptedBackend::new(vec![]), RunOptions::default()).await;
    let report = first.run(&h.corpus()).await.unwrap();
    assert_eq!(report.new, 1);
    let before = h.index.list_ids("manual-md").await.unwrap().len();
    let old_chunks = first.store().load_chunks("manual-md").await.unwrap();
    assert!(old_chunks.iter().any(|c| c.text.contains("Page 3")));

    let second = small_aggressive(&h).await;
    let report = second.run(&h.corpus()).await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(report.unchanged, 0);

    let new_chunks = second.store().load_chunks("manual-md").await.unwrap();
    assert!(new_chunks.len() > before);
    assert!(new_chunks.iter().all(|c| c.token_count <= 20));
    assert!(new_chunks.iter().all(|c| !c.text.contains("Page 3")));
    let ids = h.index.list_ids("manual-md").await.unwrap();
    let expected: BTreeSet<String> = (0..new_chunks.len() as u32).map(|i| chunk_id("manual-md", i)).collect();
    assert_eq!(ids, expected);

    let entry = second.store().entry("manual-md").await.unwrap();
    assert_eq!(entry.chunking, Some(second.chunk_settings()));

    h.index.reset_stats();
    let third = small_aggressive(&h).await;
    let report = third.run(&h.corpus()).await.unwrap();
    assert_eq!(report.unchanged, 1);
    assert_eq!(h.index.stats().upsert_calls, 0);
}
