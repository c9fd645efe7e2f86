//! Corpus discovery.
//!
//! Walks the corpus root, applies include/exclude globs, and turns each
//! matching file into a [`SourceFile`] with a path-derived `doc_id`.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

use crate::config::CorpusConfig;
use crate::models::SourceFile;

/// Discover every file under the corpus root, sorted by relative path.
///
/// Files that cannot be stat'ed are skipped with a warning; a missing root
/// fails the whole run.
pub fn discover(config: &CorpusConfig) -> Result<Vec<SourceFile>> {
    let root = &config.root;
    if !root.exists() {
        bail!("Corpus root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/~$*".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();

    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }

        match source_file(path, &rel_str) {
            Ok(file) => files.push(file),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping file"),
        }
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    assign_unique_ids(&mut files);

    tracing::debug!(count = files.len(), root = %root.display(), "discovery complete");
    Ok(files)
}

fn source_file(path: &Path, relative_path: &str) -> Result<SourceFile> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
    let modified_secs = modified
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    let file_extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    Ok(SourceFile {
        doc_id: slugify(relative_path),
        source_path: path.to_path_buf(),
        relative_path: relative_path.to_string(),
        file_extension,
        last_modified: DateTime::from_timestamp(modified_secs, 0).unwrap_or_default(),
        size_bytes: metadata.len(),
    })
}

/// Lowercase, collapse every run of non-alphanumerics to `-`, trim dashes.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "document".to_string()
    } else {
        slug
    }
}

/// Two paths can slugify to the same id (`a.md`, `a_md`). The first in
/// path order keeps the slug; later ones get a short path-hash suffix.
fn assign_unique_ids(files: &mut [SourceFile]) {
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    for file in files.iter_mut() {
        let count = seen.entry(file.doc_id.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            let digest = Sha256::digest(file.relative_path.as_bytes());
            let suffix: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
            tracing::warn!(
                path = %file.relative_path,
                doc_id = %file.doc_id,
                "doc_id collision, adding suffix"
            );
            file.doc_id = format!("{}-{}", file.doc_id, suffix);
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
