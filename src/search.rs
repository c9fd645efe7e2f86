//! Vector search over the index, used by `csync search`.
//!
//! The query is embedded with the configured provider and scored by cosine
//! similarity against index records that pass the metadata filter.

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::embedding::EmbeddingGateway;
use crate::error::SyncError;
use crate::index::{IndexFilter, SearchHit, VectorIndex};
use crate::sqlite_index::SqliteIndex;

/// Embed `query` and return the `k` best hits matching `filter`.
pub async fn search(
    gateway: &EmbeddingGateway,
    index: &dyn VectorIndex,
    query: &str,
    k: usize,
    filter: &IndexFilter,
) -> Result<Vec<SearchHit>, SyncError> {
    if query.trim().is_empty() || k == 0 {
        return Ok(Vec::new());
    }
    let vector = gateway.embed_query(query).await?;
    index.query(&vector, k, filter).await
}

pub async fn run_search(
    config: &Config,
    query: &str,
    k: usize,
    filter: IndexFilter,
    json: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    }
    let gateway = EmbeddingGateway::from_config(&config.embedding)?
        .context("Embedding provider is disabled")?;
    let index = SqliteIndex::open(&config.index.path)
        .await
        .with_context(|| format!("Failed to open index at {}", config.index.path.display()))?;

    let hits = search(&gateway, &index, query, k, &filter).await?;
    index.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let meta = &hit.metadata;
        let mut location = meta.relative_path.clone();
        if let Some(page) = meta.page {
            location.push_str(&format!("  p.{}", page));
        }
        if let Some(section) = &meta.section {
            location.push_str(&format!("  § {}", section));
        }
        println!("{}. [{:.3}] {}", i + 1, hit.score, location);
        println!("    chunk: {}", hit.chunk_id);
        println!("    {}", snippet(&hit.text, 200));
        println!();
    }
    Ok(())
}

/// First `max_chars` characters on one line.
fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingBackend, RetryPolicy};
    use crate::index::tests::record;
    use crate::index::InMemoryIndex;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    /// "north" points up, everything else points right.
    struct CompassBackend;

    #[async_trait]
    impl EmbeddingBackend for CompassBackend {
        fn model_name(&self) -> &str {
            "compass"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SyncError> {
            Ok(texts
                .iter()
                .map(|t| if t == "north" { vec![0.0, 1.0] } else { vec![1.0, 0.0] })
                .collect())
        }
    }

    fn gateway() -> EmbeddingGateway {
        EmbeddingGateway::new(
            Arc::new(CompassBackend),
            8,
            RetryPolicy::default(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn ranks_by_similarity_within_filter() {
        let index = InMemoryIndex::new();
        index
            .upsert(&[
                record("a", 0, vec![1.0, 0.0]),
                record("a", 1, vec![0.0, 1.0]),
                record("b", 0, vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = search(&gateway(), &index, "north", 2, &IndexFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.score > 0.99));

        let hits = search(&gateway(), &index, "north", 5, &IndexFilter::for_doc("a"))
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, "a::chunk-0001");
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn blank_query_returns_nothing() {
        let index = InMemoryIndex::new();
        index.upsert(&[record("a", 0, vec![1.0, 0.0])]).await.unwrap();
        assert!(search(&gateway(), &index, "   ", 3, &IndexFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn snippet_flattens_and_truncates() {
        assert_eq!(snippet("a\n\nb   c", 10), "a b c");
        assert_eq!(snippet("abcdef", 3), "abc...");
    }
}
