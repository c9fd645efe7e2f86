//! SQLite-backed [`VectorIndex`].
//!
//! One row per chunk in `index_records`; the filterable metadata fields are
//! real columns, the full [`IndexMetadata`] is kept as JSON, and the vector
//! is a little-endian f32 BLOB. Similarity is computed in process over the
//! rows that pass the SQL filter.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::db;
use crate::error::SyncError;
use crate::index::{blob_to_vec, cosine_similarity, top_k, vec_to_blob, IndexFilter, SearchHit, VectorIndex};
use crate::migrate;
use crate::models::{IndexMetadata, IndexRecord};

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    /// Open the database at `path`, creating it and its schema if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &IndexFilter) {
    if let Some(doc_id) = &filter.doc_id {
        qb.push(" AND doc_id = ").push_bind(doc_id.clone());
    }
    if let Some(ext) = &filter.file_extension {
        qb.push(" AND lower(file_extension) = lower(")
            .push_bind(ext.clone())
            .push(")");
    }
    if let Some(min) = filter.timestamp_min {
        qb.push(" AND timestamp >= ").push_bind(min);
    }
    if let Some(max) = filter.timestamp_max {
        qb.push(" AND timestamp <= ").push_bind(max);
    }
    if let Some(min) = filter.page_min {
        qb.push(" AND page >= ").push_bind(min as i64);
    }
    if let Some(max) = filter.page_max {
        qb.push(" AND page <= ").push_bind(max as i64);
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn list_ids(&self, doc_id: &str) -> Result<BTreeSet<String>, SyncError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT chunk_id FROM index_records WHERE doc_id = ?")
                .bind(doc_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }

    /// Rows whose payload is unchanged are left untouched and not counted.
    async fn upsert(&self, records: &[IndexRecord]) -> Result<usize, SyncError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;
        for record in records {
            let meta = &record.metadata;
            let metadata_json = serde_json::to_string(meta)?;
            let result = sqlx::query(
                r#"
                INSERT INTO index_records
                    (chunk_id, doc_id, chunk_index, file_extension, timestamp, page,
                     content_hash, text, metadata_json, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    doc_id = excluded.doc_id,
                    chunk_index = excluded.chunk_index,
                    file_extension = excluded.file_extension,
                    timestamp = excluded.timestamp,
                    page = excluded.page,
                    content_hash = excluded.content_hash,
                    text = excluded.text,
                    metadata_json = excluded.metadata_json,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                WHERE index_records.metadata_json IS NOT excluded.metadata_json
                   OR index_records.text IS NOT excluded.text
                   OR index_records.embedding IS NOT excluded.embedding
                "#,
            )
            .bind(&record.chunk_id)
            .bind(&meta.doc_id)
            .bind(meta.chunk_index as i64)
            .bind(&meta.file_extension)
            .bind(meta.timestamp)
            .bind(meta.page.map(|p| p as i64))
            .bind(&meta.content_hash)
            .bind(&record.text)
            .bind(&metadata_json)
            .bind(record.vector.len() as i64)
            .bind(vec_to_blob(&record.vector))
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, SyncError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0usize;
        for id in ids {
            let result = sqlx::query("DELETE FROM index_records WHERE chunk_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<SearchHit>, SyncError> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT chunk_id, text, metadata_json, embedding FROM index_records WHERE 1 = 1",
        );
        push_filter(&mut qb, filter);
        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("embedding");
            let metadata_json: String = row.get("metadata_json");
            let metadata: IndexMetadata = serde_json::from_str(&metadata_json)?;
            hits.push(SearchHit {
                chunk_id: row.get("chunk_id"),
                score: cosine_similarity(vector, &blob_to_vec(&blob)),
                text: row.get("text"),
                metadata,
            });
        }
        Ok(top_k(hits, k))
    }

    async fn count(&self, filter: &IndexFilter) -> Result<usize, SyncError> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) AS n FROM index_records WHERE 1 = 1");
        push_filter(&mut qb, filter);
        let row = qb.build().fetch_one(&self.pool).await?;
        let n: i64 = row.get("n");
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::record;
    use tempfile::TempDir;

    async fn open_temp() -> (TempDir, SqliteIndex) {
        let tmp = TempDir::new().unwrap();
        let index = SqliteIndex::open(&tmp.path().join("index.sqlite")).await.unwrap();
        (tmp, index)
    }

    #[tokio::test]
    async fn identical_upsert_is_a_no_op_write() {
        let (_tmp, index) = open_temp().await;
        let records = vec![record("a", 0, vec![1.0, 0.0]), record("a", 1, vec![0.0, 1.0])];
        assert_eq!(index.upsert(&records).await.unwrap(), 2);
        assert_eq!(index.upsert(&records).await.unwrap(), 0);

        let mut changed = records[1].clone();
        changed.text = "edited".into();
        assert_eq!(index.upsert(&[changed]).await.unwrap(), 1);
        assert_eq!(index.count(&IndexFilter::default()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn list_delete_and_query() {
        let (_tmp, index) = open_temp().await;
        index
            .upsert(&[
                record("a", 0, vec![1.0, 0.0]),
                record("a", 1, vec![0.6, 0.8]),
                record("b", 0, vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let ids = index.list_ids("a").await.unwrap();
        assert_eq!(
            ids.into_iter().collect::<Vec<_>>(),
            vec!["a::chunk-0000".to_string(), "a::chunk-0001".to_string()]
        );

        let hits = index
            .query(&[0.0, 1.0], 1, &IndexFilter::for_doc("a"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "a::chunk-0001");
        assert_eq!(hits[0].metadata.page, Some(2));

        let removed = index.delete(&["a::chunk-0000".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.count(&IndexFilter::for_doc("a")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn range_filters_push_down() {
        let (_tmp, index) = open_temp().await;
        index
            .upsert(&[record("a", 0, vec![1.0]), record("a", 1, vec![1.0]), record("a", 2, vec![1.0])])
            .await
            .unwrap();
        let filter = IndexFilter {
            timestamp_min: Some(1_001),
            page_max: Some(2),
            file_extension: Some("MD".into()),
            ..IndexFilter::default()
        };
        assert_eq!(index.count(&filter).await.unwrap(), 1);
    }
}
