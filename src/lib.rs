//! # Context Relay
//!
//! Retrieval-augmented question answering over a private PDF corpus, with
//! answers streamed token by token over WebSocket sessions and conversation
//! history kept in SQLite.
//!
//! ## Architecture
//!
//! ```text
//!  ingestion:  PDF ──▶ Extractor ──▶ Chunker ──▶ VectorIndex ──▶ DocumentRegistry
//!                      (text/OCR)    (400/80)    (SQLite+MMR)
//!
//!  query:      question ──▶ Workflow ─────────────────────────▶ SessionRelay ──▶ client
//!                           Retrieve → Grade → Generate         status/chunk/end
//!                                                               + ConversationStore
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`extract`] | PDF text extraction with OCR fallback |
//! | [`chunk`] | Recursive-separator chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Durable vector index with MMR search |
//! | [`retriever`] | Query-time retrieval policy |
//! | [`llm`] | Chat model clients with streaming |
//! | [`workflow`] | Retrieve/grade/generate state machine |
//! | [`relay`] | Streaming session protocol |
//! | [`store`] | Conversations, messages and document registry |
//! | [`ingest`] | Ingestion pipeline |
//! | [`server`] | HTTP and WebSocket server |
//! | [`app`] | Composition root |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod relay;
pub mod retriever;
pub mod server;
pub mod store;
pub mod workflow;
