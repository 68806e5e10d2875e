//! Recursive-separator text chunker with overlap.
//!
//! Splits page text into [`Chunk`]s of at most `chunk_size` characters.
//! Splitting tries separators in priority order (section breaks, paragraph
//! breaks, line breaks, sentence breaks, spaces) and only falls back to raw
//! character boundaries when nothing else fits. Adjacent chunks produced
//! from the same run of pieces share up to `chunk_overlap` trailing
//! characters so a fact straddling a boundary survives in at least one
//! chunk.
//!
//! Lengths are measured in characters, not bytes. Each chunk carries a
//! SHA-256 hash of its text.

use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::error::IngestError;
use crate::models::{Chunk, Page};

/// Separator priority. The empty separator means "split between characters".
const SEPARATORS: &[&str] = &["\n\n\n", "\n\n", "\n", ". ", " ", ""];

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
        }
    }

    /// Split every page into chunks tagged with `document_id` and the page
    /// number. Chunk indices are contiguous across the whole document.
    pub fn split(&self, document_id: &str, pages: &[Page]) -> Result<Vec<Chunk>, IngestError> {
        let mut chunks = Vec::new();
        let mut chunk_index: i64 = 0;

        for page in pages {
            for text in self.split_text(&page.text) {
                chunks.push(make_chunk(document_id, page.number, chunk_index, &text));
                chunk_index += 1;
            }
        }

        if chunks.is_empty() {
            return Err(IngestError::NoContent);
        }
        Ok(chunks)
    }

    /// Split a single text into chunk strings.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, SEPARATORS)
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        // Pick the first separator present in the text
        let mut sep_pos = separators.len().saturating_sub(1);
        for (i, sep) in separators.iter().enumerate() {
            if sep.is_empty() || text.contains(sep) {
                sep_pos = i;
                break;
            }
        }
        let separator = separators.get(sep_pos).copied().unwrap_or("");
        let remaining = separators.get(sep_pos + 1..).unwrap_or(&[]);

        let mut out = Vec::new();
        let mut good: Vec<String> = Vec::new();

        for piece in split_keep_separator(text, separator) {
            if char_len(&piece) < self.chunk_size {
                good.push(piece);
                continue;
            }
            if !good.is_empty() {
                out.extend(self.merge(&good));
                good.clear();
            }
            if remaining.is_empty() {
                let trimmed = piece.trim();
                if !trimmed.is_empty() {
                    out.push(trimmed.to_string());
                }
            } else {
                out.extend(self.split_recursive(&piece, remaining));
            }
        }

        if !good.is_empty() {
            out.extend(self.merge(&good));
        }
        out
    }

    /// Greedily pack small pieces into chunks, carrying an overlap window
    /// of trailing pieces into the next chunk.
    fn merge(&self, pieces: &[String]) -> Vec<String> {
        let mut docs = Vec::new();
        let mut current: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = char_len(piece);
            if total + len > self.chunk_size && !current.is_empty() {
                push_joined(&mut docs, &current);
                while total > self.chunk_overlap
                    || (total + len > self.chunk_size && total > 0)
                {
                    match current.pop_front() {
                        Some(front) => total -= char_len(front),
                        None => break,
                    }
                }
            }
            current.push_back(piece);
            total += len;
        }

        push_joined(&mut docs, &current);
        docs
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(400, 80)
    }
}

fn push_joined(docs: &mut Vec<String>, current: &VecDeque<&str>) {
    let joined: String = current.iter().copied().collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        docs.push(trimmed.to_string());
    }
}

/// Split on `separator`, attaching each separator to the start of the
/// piece that follows it so joining pieces reproduces the input.
fn split_keep_separator(text: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        return text.chars().map(|c| c.to_string()).collect();
    }
    let mut pieces = Vec::new();
    let mut parts = text.split(separator);
    if let Some(first) = parts.next() {
        if !first.is_empty() {
            pieces.push(first.to_string());
        }
    }
    for part in parts {
        pieces.push(format!("{}{}", separator, part));
    }
    pieces
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn make_chunk(document_id: &str, page: u32, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        page,
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}
