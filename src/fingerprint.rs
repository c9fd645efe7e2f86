//! Content-addressed change detection against the manifest.
//!
//! The hash is taken over raw file bytes before any parsing, so an
//! unchanged document is skipped without extraction, chunking, embedding
//! or index work.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use crate::models::{ChangeKind, ChunkSettings, DocStatus, Manifest};

/// SHA-256 of the raw bytes, lower-case hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Classify a discovered document.
///
/// A matching hash is only `Unchanged` if the entry was chunked with
/// `settings`; otherwise the stored chunks no longer match what this run
/// would produce. With `require_indexed`, `Unchanged` also needs the entry's chunks to have
/// reached the index; a matching hash with a pending index mirror is
/// `Changed` so the next run finishes the work. Runs without an index pass
/// `false` and compare hashes only.
pub fn classify(
    manifest: &Manifest,
    doc_id: &str,
    content_hash: &str,
    settings: &ChunkSettings,
    require_indexed: bool,
) -> ChangeKind {
    match manifest.get(doc_id) {
        None => ChangeKind::New,
        Some(entry) if entry.status == DocStatus::Removed => ChangeKind::New,
        Some(entry)
            if entry.content_hash == content_hash
                && entry.chunking.as_ref() == Some(settings)
                && (entry.indexed || !require_indexed) =>
        {
            ChangeKind::Unchanged
        }
        Some(_) => ChangeKind::Changed,
    }
}

/// Doc ids in the manifest that discovery no longer sees.
///
/// With `require_indexed`, tombstones whose index deletions have not
/// succeeded yet are offered again.
pub fn removed_doc_ids(
    manifest: &Manifest,
    discovered: &BTreeSet<String>,
    require_indexed: bool,
) -> Vec<String> {
    manifest
        .values()
        .filter(|entry| !discovered.contains(&entry.doc_id))
        .filter(|entry| {
            entry.status == DocStatus::Active || (require_indexed && !entry.indexed)
        })
        .map(|entry| entry.doc_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ManifestEntry;
    use chrono::Utc;

    fn entry(doc_id: &str, hash: &str, status: DocStatus, indexed: bool) -> ManifestEntry {
        ManifestEntry {
            doc_id: doc_id.to_string(),
            content_hash: hash.to_string(),
            chunk_count: 1,
            status,
            ingestion_timestamp: Utc::now(),
            indexed,
            source_path: None,
            relative_path: None,
            file_extension: None,
            chunking: Some(settings()),
            normalization: None,
        }
    }

    fn settings() -> ChunkSettings {
        ChunkSettings {
            preset: "default".into(),
            target_tokens: 400,
            overlap_tokens: 80,
            tokenizer: "word".into(),
        }
    }

    fn manifest(entries: Vec<ManifestEntry>) -> Manifest {
        entries.into_iter().map(|e| (e.doc_id.clone(), e)).collect()
    }

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn classify_covers_each_outcome() {
        let m = manifest(vec![
            entry("same", "h1", DocStatus::Active, true),
            entry("pending", "h1", DocStatus::Active, false),
            entry("gone", "h1", DocStatus::Removed, true),
        ]);
        let s = settings();
        assert_eq!(classify(&m, "fresh", "h1", &s, true), ChangeKind::New);
        assert_eq!(classify(&m, "same", "h1", &s, true), ChangeKind::Unchanged);
        assert_eq!(classify(&m, "same", "h2", &s, true), ChangeKind::Changed);
        assert_eq!(classify(&m, "pending", "h1", &s, true), ChangeKind::Changed);
        assert_eq!(classify(&m, "pending", "h1", &s, false), ChangeKind::Unchanged);
        assert_eq!(classify(&m, "gone", "h1", &s, true), ChangeKind::New);
    }

    #[test]
    fn changed_settings_reprocess_same_bytes() {
        let mut legacy = entry("legacy", "h1", DocStatus::Active, true);
        legacy.chunking = None;
        let m = manifest(vec![entry("same", "h1", DocStatus::Active, true), legacy]);

        let smaller = ChunkSettings {
            target_tokens: 50,
            overlap_tokens: 10,
            ..settings()
        };
        let aggressive = ChunkSettings {
            preset: "aggressive".into(),
            ..settings()
        };
        let other_tokenizer = ChunkSettings {
            tokenizer: "bpe".into(),
            ..settings()
        };
        for changed in [&smaller, &aggressive, &other_tokenizer] {
            assert_eq!(classify(&m, "same", "h1", changed, false), ChangeKind::Changed);
        }
        assert_eq!(classify(&m, "legacy", "h1", &settings(), false), ChangeKind::Changed);
    }

    #[test]
    fn removed_excludes_settled_tombstones() {
        let m = manifest(vec![
            entry("kept", "h", DocStatus::Active, true),
            entry("deleted", "h", DocStatus::Active, true),
            entry("tombstone", "h", DocStatus::Removed, true),
            entry("tombstone-pending", "h", DocStatus::Removed, false),
        ]);
        let discovered: BTreeSet<String> = ["kept".to_string()].into_iter().collect();
        assert_eq!(
            removed_doc_ids(&m, &discovered, true),
            vec!["deleted".to_string(), "tombstone-pending".to_string()]
        );
        assert_eq!(removed_doc_ids(&m, &discovered, false), vec!["deleted".to_string()]);
    }
}
