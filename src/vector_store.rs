//! Vector index over chunk embeddings.
//!
//! Lives in its own SQLite database under the `vectors/` directory so the
//! whole index can be deleted and rebuilt from the catalog: losing the
//! vector store is recoverable, losing the catalog is not. Rows are keyed
//! by chunk id; vectors are little-endian f32 BLOBs.
//!
//! Queries are brute-force cosine over the candidate set. At single-host
//! scale (hundreds of thousands of chunks) this stays well inside the
//! control plane's latency budget, and it keeps the index trivially
//! rebuildable.
//!
//! # Reconciliation
//!
//! The catalog is the source of truth. A chunk is indexed iff its row
//! exists AND its vector exists. [`reconcile`] runs at startup: chunks of
//! indexed files lacking vectors are re-embedded; vectors whose chunk row
//! is gone are deleted.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tracing::info;

use crate::catalog::Catalog;
use crate::config::EmbeddingConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, embed_query, embed_texts, vec_to_blob};

#[derive(Clone)]
pub struct VectorStore {
    pool: SqlitePool,
}

/// One query hit: chunk id plus cosine score.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VectorHit {
    pub chunk_id: String,
    pub file_id: String,
    pub score: f32,
}

/// Outcome of a reconciliation pass, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reembedded: usize,
    pub orphans_removed: usize,
}

impl VectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, chunk_id: &str, file_id: &str, vector: &[f32]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, file_id, dims, embedding)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                file_id = excluded.file_id,
                dims = excluded.dims,
                embedding = excluded.embedding
            "#,
        )
        .bind(chunk_id)
        .bind(file_id)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove(&self, chunk_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn ids(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT chunk_id FROM chunk_vectors")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("chunk_id")).collect())
    }

    pub async fn count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn query_by_vector(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let rows = sqlx::query("SELECT chunk_id, file_id, embedding FROM chunk_vectors")
            .fetch_all(&self.pool)
            .await?;

        let mut hits: Vec<VectorHit> = rows
            .into_iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                VectorHit {
                    chunk_id: row.get("chunk_id"),
                    file_id: row.get("file_id"),
                    score: cosine_similarity(query, &vector),
                }
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    pub async fn query_by_text(
        &self,
        embedding: &EmbeddingConfig,
        text: &str,
        k: usize,
    ) -> Result<Vec<VectorHit>> {
        let query = embed_query(embedding, text).await?;
        self.query_by_vector(&query, k).await
    }

    /// Re-align this store with the catalog (both directions).
    pub async fn reconcile(
        &self,
        catalog: &Catalog,
        embedding: &EmbeddingConfig,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let chunks = catalog.indexed_chunks().await?;
        let vector_ids = self.ids().await?;

        // Chunks without vectors: re-embed in batches.
        let missing: Vec<&(String, String, String)> = chunks
            .iter()
            .filter(|(id, _, _)| !vector_ids.contains(id))
            .collect();

        if !missing.is_empty() && embedding.is_enabled() {
            for batch in missing.chunks(embedding.batch_size.max(1)) {
                let texts: Vec<String> = batch.iter().map(|(_, _, text)| text.clone()).collect();
                let vectors = embed_texts(embedding, &texts).await?;
                for ((chunk_id, file_id, _), vector) in batch.iter().zip(vectors.iter()) {
                    self.upsert(chunk_id, file_id, vector).await?;
                    report.reembedded += 1;
                }
            }
        }

        // Vectors whose chunk row is gone entirely: delete. A vector for a
        // chunk of a non-indexed file is not an orphan while the row exists.
        for vector_id in &vector_ids {
            if catalog.get_chunk(vector_id).await?.is_none() {
                self.remove(vector_id).await?;
                report.orphans_removed += 1;
            }
        }

        if report.reembedded > 0 || report.orphans_removed > 0 {
            info!(
                reembedded = report.reembedded,
                orphans_removed = report.orphans_removed,
                "vector store reconciled"
            );
        }

        Ok(report)
    }
}
