//! Composition root.
//!
//! Every long-lived component (database pool, embedding provider, chat
//! model, OCR engine) is constructed here exactly once and handed to the
//! components that need it. Nothing else in the crate builds its own
//! collaborators.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::chunk::Chunker;
use crate::config::Config;
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::extract::{create_ocr, Extractor, OcrEngine};
use crate::index::VectorIndex;
use crate::ingest::Ingestor;
use crate::llm::{create_model, ChatModel};
use crate::migrate;
use crate::retriever::IndexRetriever;
use crate::store::SqliteStore;
use crate::workflow::Workflow;

/// Storage and ingestion components shared by every command.
pub struct App {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub store: Arc<SqliteStore>,
    pub index: Arc<VectorIndex>,
    pub ingestor: Arc<Ingestor>,
}

impl App {
    /// Connect to the database, apply migrations and build components
    /// from `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        let embedder = create_provider(&config.embedding)?;
        let ocr = create_ocr(&config.ocr);
        Ok(Self::assemble(config, pool, embedder, ocr))
    }

    /// Wire components around an already-migrated pool.
    pub fn assemble(
        config: &Config,
        pool: SqlitePool,
        embedder: Arc<dyn EmbeddingProvider>,
        ocr: Arc<dyn OcrEngine>,
    ) -> Self {
        let store = Arc::new(SqliteStore::new(pool.clone()));
        let index = Arc::new(
            VectorIndex::new(pool.clone(), embedder, config.retrieval.collection.clone())
                .with_batch_size(config.embedding.batch_size)
                .with_mmr_lambda(config.retrieval.mmr_lambda),
        );
        let chunker = Chunker::new(config.chunking.chunk_size, config.chunking.chunk_overlap);
        let ingestor = Arc::new(Ingestor::new(
            Extractor::new(ocr),
            chunker,
            index.clone(),
            store.clone(),
        ));

        Self {
            config: Arc::new(config.clone()),
            pool,
            store,
            index,
            ingestor,
        }
    }

    /// Query workflow using the configured chat model.
    pub fn workflow(&self) -> Result<Arc<Workflow>> {
        let model = create_model(&self.config.llm)?;
        Ok(self.workflow_with(model))
    }

    pub fn workflow_with(&self, model: Arc<dyn ChatModel>) -> Arc<Workflow> {
        let retriever = Arc::new(IndexRetriever::from_config(
            self.index.clone(),
            &self.config.retrieval,
        ));
        Arc::new(Workflow::new(retriever, model))
    }
}
