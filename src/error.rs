//! Error taxonomy for ingestion, retrieval, generation and persistence.
//!
//! Each failure domain gets its own type so callers can decide locally
//! whether an error is fatal (ingestion, index) or recoverable (model
//! invocation, persistence).

use thiserror::Error;

/// No text could be obtained from a document by any method.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("PDF has no extractable text and OCR failed: {0}")]
    OcrFailed(String),
    #[error("could not extract any text from PDF (tried both regular extraction and OCR)")]
    NoText,
}

/// Failure in the embedding index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("embedding failed: {0}")]
    Embedding(String),
}

/// Failure of a single ingestion call.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("could not extract any text chunks from the PDF")]
    NoContent,
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("failed to register document: {0}")]
    Registry(#[from] PersistenceError),
}

/// Failure talking to the hosted language model.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("rate limited (429 RESOURCE_EXHAUSTED): {0}")]
    RateLimited(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse model response: {0}")]
    Parse(String),
    #[error("model configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Classify a non-success HTTP response from the model API.
    pub fn from_status(status: u16, body: String) -> Self {
        if status == 429 || body.contains("RESOURCE_EXHAUSTED") {
            LlmError::RateLimited(body)
        } else {
            LlmError::Api { status, body }
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        match self {
            LlmError::RateLimited(_) => true,
            LlmError::Api { status, body } => *status == 429 || body.contains("RESOURCE_EXHAUSTED"),
            LlmError::Other(msg) | LlmError::Parse(msg) => {
                msg.contains("429") || msg.contains("RESOURCE_EXHAUSTED")
            }
            _ => false,
        }
    }
}

/// Failure of a workflow run that could not be recovered inside a stage.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("retrieval failed: {0}")]
    Retrieval(#[from] IndexError),
    #[error(transparent)]
    Model(#[from] LlmError),
}

impl WorkflowError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, WorkflowError::Model(e) if e.is_rate_limited())
    }
}

/// Failure writing conversation or document rows.
#[derive(Debug, Error)]
#[error("persistence error: {0}")]
pub struct PersistenceError(#[from] pub sqlx::Error);
