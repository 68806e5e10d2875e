//! Durable embedding index with diversity-aware search.
//!
//! Embedding records live in the `embeddings` table, scoped by a
//! collection name so several embedding spaces can share one database.
//! Each record keeps the chunk text and its page/document metadata next to
//! the vector, so search never needs to join back to the documents table.
//!
//! Search embeds the query, takes the `fetch_k` nearest records by cosine
//! similarity, then re-ranks them with maximal marginal relevance (MMR) to
//! return `k` results that are relevant to the query but dissimilar to
//! each other.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::debug;

use crate::embedding::{self, blob_to_vec, cosine_similarity, vec_to_blob, EmbeddingProvider};
use crate::error::IndexError;
use crate::models::Chunk;

/// A chunk returned by [`VectorIndex::search`].
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub id: String,
    pub document_id: String,
    pub page: u32,
    pub text: String,
    /// Cosine similarity to the query.
    pub score: f32,
}

pub struct VectorIndex {
    pool: SqlitePool,
    embedder: Arc<dyn EmbeddingProvider>,
    collection: String,
    batch_size: usize,
    mmr_lambda: f32,
}

impl VectorIndex {
    pub fn new(
        pool: SqlitePool,
        embedder: Arc<dyn EmbeddingProvider>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            embedder,
            collection: collection.into(),
            batch_size: 64,
            mmr_lambda: 0.5,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Relevance/diversity trade-off: 1.0 is pure relevance, 0.0 pure diversity.
    pub fn with_mmr_lambda(mut self, lambda: f32) -> Self {
        self.mmr_lambda = lambda.clamp(0.0, 1.0);
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Embed and append `chunks` to the collection. Returns the number of
    /// records written. Each batch is committed atomically.
    pub async fn upsert(&self, chunks: &[Chunk]) -> Result<usize, IndexError> {
        let model = self.embedder.model_name().to_string();
        let dims = self.embedder.dims() as i64;
        let mut written = 0usize;

        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self
                .embedder
                .embed(&texts)
                .await
                .map_err(|e| IndexError::Embedding(e.to_string()))?;

            if vectors.len() != batch.len() {
                return Err(IndexError::Embedding(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }

            let now = Utc::now().timestamp();
            let mut tx = self.pool.begin().await?;
            for (chunk, vector) in batch.iter().zip(vectors.iter()) {
                sqlx::query(
                    r#"
                    INSERT INTO embeddings (id, collection, document_id, page, chunk_index,
                                            text, hash, model, dims, embedding, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&chunk.id)
                .bind(&self.collection)
                .bind(&chunk.document_id)
                .bind(chunk.page as i64)
                .bind(chunk.chunk_index)
                .bind(&chunk.text)
                .bind(&chunk.hash)
                .bind(&model)
                .bind(dims)
                .bind(vec_to_blob(vector))
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            written += batch.len();
        }

        debug!(collection = %self.collection, written, "indexed chunks");
        Ok(written)
    }

    /// Return up to `k` chunks chosen by MMR from the `fetch_k` nearest.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        fetch_k: usize,
    ) -> Result<Vec<IndexedChunk>, IndexError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_vec = embedding::embed_query(self.embedder.as_ref(), query)
            .await
            .map_err(|e| IndexError::Embedding(e.to_string()))?;

        // Fetch all vectors in the collection and compute cosine similarity in Rust
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, page, text, embedding
            FROM embeddings
            WHERE collection = ?
            "#,
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates: Vec<(IndexedChunk, Vec<f32>)> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                let page: i64 = row.get("page");
                let chunk = IndexedChunk {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    page: page as u32,
                    text: row.get("text"),
                    score: cosine_similarity(&query_vec, &vector),
                };
                (chunk, vector)
            })
            .collect();

        // Nearest fetch_k by similarity, ties broken by id for determinism
        candidates.sort_by(|a, b| {
            b.0.score
                .partial_cmp(&a.0.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        candidates.truncate(fetch_k.max(k));

        let vectors: Vec<&[f32]> = candidates.iter().map(|(_, v)| v.as_slice()).collect();
        let picked = mmr_select(&query_vec, &vectors, k, self.mmr_lambda);

        Ok(picked
            .into_iter()
            .map(|i| candidates[i].0.clone())
            .collect())
    }

    /// Remove every record of `document_id` from this collection.
    pub async fn remove_document(&self, document_id: &str) -> Result<u64, IndexError> {
        let result = sqlx::query("DELETE FROM embeddings WHERE collection = ? AND document_id = ?")
            .bind(&self.collection)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Number of records in this collection.
    pub async fn count(&self) -> Result<i64, IndexError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Maximal marginal relevance selection.
///
/// Picks the candidate most similar to the query first, then repeatedly
/// the candidate maximising
/// `lambda * sim(query, c) - (1 - lambda) * max(sim(c, selected))`.
/// Returns indices into `candidates` in selection order.
pub fn mmr_select(query: &[f32], candidates: &[&[f32]], k: usize, lambda: f32) -> Vec<usize> {
    let k = k.min(candidates.len());
    if k == 0 {
        return Vec::new();
    }

    let query_sims: Vec<f32> = candidates
        .iter()
        .map(|c| cosine_similarity(query, c))
        .collect();

    let mut selected: Vec<usize> = Vec::with_capacity(k);
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();

    while selected.len() < k && !remaining.is_empty() {
        let mut best_pos = 0usize;
        let mut best_score = f32::NEG_INFINITY;

        for (pos, &idx) in remaining.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|&s| cosine_similarity(candidates[idx], candidates[s]))
                .fold(f32::NEG_INFINITY, f32::max);
            let redundancy = if selected.is_empty() { 0.0 } else { redundancy };
            let score = lambda * query_sims[idx] - (1.0 - lambda) * redundancy;
            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
        }

        selected.push(remaining.remove(best_pos));
    }

    selected
}
