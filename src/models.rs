//! Core data models used throughout Context Relay.
//!
//! These types represent the pages, chunks, documents and conversation
//! rows that flow through the ingestion and question-answering pipeline.

use serde::{Deserialize, Serialize};

/// One page of plain text produced by the extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// 1-based page number within the source file.
    pub number: u32,
    pub text: String,
}

/// A contiguous span of extracted text, tagged with its origin.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub page: u32,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// An ingested source file as stored in the document registry.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub file_path: String,
    pub file_size: i64,
    pub chunk_count: i64,
    pub created_at: String,
}

/// Metadata supplied when registering a freshly ingested document.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: String,
    pub filename: String,
    pub file_path: String,
    pub file_size: i64,
    pub chunk_count: i64,
}

/// A chat thread owning an ordered list of [`Message`]s.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: i64,
}

/// Author of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// A single persisted chat message.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub role: Role,
    pub content: String,
    #[serde(rename = "timestamp")]
    pub created_at: String,
}
