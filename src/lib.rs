//! # corpus-sync
//!
//! Keeps a chunk store and a vector index converged with a corpus of
//! heterogeneous documents (PDF, DOCX, XLSX, Markdown, plain text).
//!
//! Each run discovers the corpus, skips documents whose raw bytes have not
//! changed, and for the rest extracts, normalizes, chunks, persists, embeds
//! and reconciles the index by chunk-id set difference. Documents that left
//! the corpus are tombstoned and their vectors deleted.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌───────────────┐   ┌─────────────┐
//! │ Discovery  │──▶│ Fingerprint │──▶│ Extract+Norm  │──▶│   Chunker   │
//! │ walk+glob  │   │  manifest   │   │  per format   │   │  overlapped │
//! └────────────┘   └─────────────┘   └───────────────┘   └──────┬──────┘
//!                                                               ▼
//!                  ┌─────────────┐   ┌───────────────┐   ┌─────────────┐
//!                  │ Vector index│◀──│  Reconciler   │◀──│ Chunk store │
//!                  │   SQLite    │   │ upsert+delete │   │  + embed    │
//!                  └─────────────┘   └───────────────┘   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! csync init                          # create store and index
//! csync sync                          # bring store and index up to date
//! csync sync --retry-failed           # re-run last run's failures only
//! csync status                        # manifest summary
//! csync search "deployment" -k 5      # query the index
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Typed pipeline errors and failure kinds |
//! | [`models`] | Core data types |
//! | [`connector_fs`] | Corpus discovery and doc id derivation |
//! | [`extract`] | Per-format text extraction |
//! | [`fingerprint`] | Content hashing and change classification |
//! | [`normalize`] | Preset-driven text normalization |
//! | [`tokenizer`] | Swappable token counting |
//! | [`chunk`] | Paragraph-aware overlapping chunker |
//! | [`store`] | Chunk files and manifest |
//! | [`embedding`] | Embedding providers, retry policy, gateway |
//! | [`index`] | Vector index abstraction |
//! | [`sqlite_index`] | SQLite-backed vector index |
//! | [`reconcile`] | Chunk-id set reconciliation |
//! | [`pipeline`] | Batch orchestrator and run report |
//! | [`search`] | Query embedding and index search |
//! | [`stats`] | Report, status, and failure output |
//! | [`progress`] | Progress reporting |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod connector_fs;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod index;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod reconcile;
pub mod search;
pub mod sqlite_index;
pub mod stats;
pub mod store;
pub mod tokenizer;
