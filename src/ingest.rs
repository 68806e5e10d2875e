//! Document ingestion pipeline.
//!
//! Coordinates the full flow for one PDF: extraction → chunking →
//! embedding/indexing → document registration. A file is only registered
//! once its chunks are durably indexed, so a failed ingestion never leaves
//! a registry row behind. If registration itself fails, the freshly
//! written records are removed again.

use anyhow::{bail, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chunk::Chunker;
use crate::error::{ExtractionError, IngestError};
use crate::extract::Extractor;
use crate::index::VectorIndex;
use crate::models::NewDocument;
use crate::store::DocumentRegistry;

/// Result of ingesting one file.
#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub document_id: String,
    pub chunks_indexed: usize,
    pub message: String,
}

/// Outcome of [`Ingestor::ingest_dir`].
#[derive(Debug, Default)]
pub struct DirReport {
    pub ingested: Vec<(PathBuf, IngestSummary)>,
    pub failed: Vec<(PathBuf, String)>,
}

pub struct Ingestor {
    extractor: Extractor,
    chunker: Chunker,
    index: Arc<VectorIndex>,
    registry: Arc<dyn DocumentRegistry>,
}

impl Ingestor {
    pub fn new(
        extractor: Extractor,
        chunker: Chunker,
        index: Arc<VectorIndex>,
        registry: Arc<dyn DocumentRegistry>,
    ) -> Self {
        Self {
            extractor,
            chunker,
            index,
            registry,
        }
    }

    /// Ingest the PDF at `path`.
    pub async fn process(&self, path: &Path) -> Result<IngestSummary, IngestError> {
        let file_size = tokio::fs::metadata(path)
            .await
            .map_err(|source| ExtractionError::Io {
                path: path.display().to_string(),
                source,
            })?
            .len() as i64;

        let pages = self.extractor.extract(path).await?;
        let document_id = Uuid::new_v4().to_string();
        let chunks = self.chunker.split(&document_id, &pages)?;
        let chunks_indexed = self.index.upsert(&chunks).await?;

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let registered = self
            .registry
            .create(NewDocument {
                id: document_id.clone(),
                filename,
                file_path: path.display().to_string(),
                file_size,
                chunk_count: chunks_indexed as i64,
            })
            .await;
        if let Err(e) = registered {
            if let Err(cleanup) = self.index.remove_document(&document_id).await {
                warn!(document_id = %document_id, error = %cleanup, "could not remove unregistered chunks");
            }
            return Err(e.into());
        }

        info!(
            path = %path.display(),
            pages = pages.len(),
            chunks = chunks_indexed,
            "document ingested"
        );

        Ok(IngestSummary {
            document_id,
            chunks_indexed,
            message: format!("Successfully processed {} text chunks", chunks_indexed),
        })
    }

    /// Ingest every `.pdf` directly inside `dir`. Per-file failures are
    /// logged and collected; they do not stop the run.
    pub async fn ingest_dir(&self, dir: &Path) -> Result<DirReport> {
        if !dir.is_dir() {
            bail!("not a directory: {}", dir.display());
        }

        let mut pdfs: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_pdf(p))
            .collect();
        pdfs.sort();

        let mut report = DirReport::default();
        for path in pdfs {
            match self.process(&path).await {
                Ok(summary) => report.ingested.push((path, summary)),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to ingest");
                    report.failed.push((path, e.to_string()));
                }
            }
        }
        Ok(report)
    }
}

/// Case-insensitive `.pdf` extension check.
pub fn is_pdf(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("pdf"))
        .unwrap_or(false)
}
