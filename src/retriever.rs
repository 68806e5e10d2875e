//! Query-time retrieval policy.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::error::IndexError;
use crate::index::VectorIndex;

/// Source of context passages for a question.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Returns passage texts, most useful first.
    async fn retrieve(&self, question: &str) -> Result<Vec<String>, IndexError>;
}

/// [`Retriever`] backed by a [`VectorIndex`] with a fixed top-k/fetch-k MMR policy.
pub struct IndexRetriever {
    index: Arc<VectorIndex>,
    k: usize,
    fetch_k: usize,
}

impl IndexRetriever {
    pub fn new(index: Arc<VectorIndex>, k: usize, fetch_k: usize) -> Self {
        Self { index, k, fetch_k }
    }

    pub fn from_config(index: Arc<VectorIndex>, config: &RetrievalConfig) -> Self {
        Self::new(index, config.k, config.fetch_k)
    }
}

#[async_trait]
impl Retriever for IndexRetriever {
    async fn retrieve(&self, question: &str) -> Result<Vec<String>, IndexError> {
        let hits = self.index.search(question, self.k, self.fetch_k).await?;
        Ok(hits.into_iter().map(|h| h.text).collect())
    }
}
