//! In-process fakes shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use context_relay::app::App;
use context_relay::config::Config;
use context_relay::embedding::EmbeddingProvider;
use context_relay::error::LlmError;
use context_relay::extract::{DisabledOcr, OcrEngine};
use context_relay::llm::{ChatModel, TokenStream};
use context_relay::migrate;
use context_relay::relay::{SessionChannel, SessionEvent};

// ============ Embeddings ============

/// Bag-of-words hashing embedder: texts sharing words get similar vectors.
pub struct HashEmbedder;

pub const HASH_DIMS: usize = 256;

impl HashEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; HASH_DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            // FNV-1a
            let mut h: u64 = 0xcbf29ce484222325;
            for b in word.bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            v[(h % HASH_DIMS as u64) as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }

    fn dims(&self) -> usize {
        HASH_DIMS
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

// ============ OCR ============

/// OCR engine returning fixed page texts and counting calls.
pub struct FakeOcr {
    pages: Vec<String>,
    pub calls: Mutex<usize>,
}

impl FakeOcr {
    pub fn new(pages: &[&str]) -> Self {
        Self {
            pages: pages.iter().map(|p| p.to_string()).collect(),
            calls: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl OcrEngine for FakeOcr {
    async fn recognize(&self, _pdf_path: &Path) -> anyhow::Result<Vec<String>> {
        *self.calls.lock().unwrap() += 1;
        Ok(self.pages.clone())
    }
}

// ============ Chat model ============

#[derive(Clone, Copy, PartialEq)]
pub enum Failure {
    None,
    RateLimited,
    Other,
}

impl Failure {
    fn error(self) -> Option<LlmError> {
        match self {
            Failure::None => None,
            Failure::RateLimited => Some(LlmError::from_status(
                429,
                r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#.to_string(),
            )),
            Failure::Other => Some(LlmError::Api {
                status: 500,
                body: "upstream exploded".to_string(),
            }),
        }
    }
}

/// Scriptable chat model that records every prompt it receives.
pub struct FakeModel {
    /// Reply to relevance questions; `None` makes grading calls fail.
    pub grade_reply: Option<String>,
    /// Answer fragments, streamed in order or joined for `complete`.
    pub fragments: Vec<String>,
    /// Failure when an answer is requested.
    pub answer_failure: Failure,
    /// Failure sent after all fragments have been streamed.
    pub mid_stream_failure: Failure,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeModel {
    pub fn answering(fragments: &[&str]) -> Self {
        Self {
            grade_reply: Some("yes".to_string()),
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            answer_failure: Failure::None,
            mid_stream_failure: Failure::None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_grade_reply(mut self, reply: Option<&str>) -> Self {
        self.grade_reply = reply.map(str::to_string);
        self
    }

    pub fn with_answer_failure(mut self, failure: Failure) -> Self {
        self.answer_failure = failure;
        self
    }

    pub fn with_mid_stream_failure(mut self, failure: Failure) -> Self {
        self.mid_stream_failure = failure;
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn answer_prompts(&self) -> Vec<String> {
        self.prompts()
            .into_iter()
            .filter(|p| !is_grade_prompt(p))
            .collect()
    }

    fn record(&self, prompt: &str) {
        self.prompts.lock().unwrap().push(prompt.to_string());
    }
}

fn is_grade_prompt(prompt: &str) -> bool {
    prompt.starts_with("Is this document relevant to:")
}

#[async_trait]
impl ChatModel for FakeModel {
    fn name(&self) -> &str {
        "fake"
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.record(prompt);
        if is_grade_prompt(prompt) {
            return self
                .grade_reply
                .clone()
                .ok_or_else(|| LlmError::Other("grader unavailable".to_string()));
        }
        if let Some(err) = self.answer_failure.error() {
            return Err(err);
        }
        Ok(self.fragments.concat())
    }

    async fn stream(&self, prompt: &str) -> Result<TokenStream, LlmError> {
        self.record(prompt);
        if let Some(err) = self.answer_failure.error() {
            return Err(err);
        }

        let (tx, rx) = mpsc::channel(8);
        let fragments = self.fragments.clone();
        let tail = self.mid_stream_failure.error();
        tokio::spawn(async move {
            for f in fragments {
                if tx.send(Ok(f)).await.is_err() {
                    return;
                }
            }
            if let Some(err) = tail {
                let _ = tx.send(Err(err)).await;
            }
        });
        Ok(rx)
    }
}

// ============ Session channel ============

/// Channel fed from a fixed list of questions that records every event.
pub struct FakeChannel {
    incoming: VecDeque<String>,
    pub sent: Vec<SessionEvent>,
}

impl FakeChannel {
    pub fn with_questions(questions: &[&str]) -> Self {
        Self {
            incoming: questions.iter().map(|q| q.to_string()).collect(),
            sent: Vec::new(),
        }
    }

    /// Events split into turns, each ending with an `end` event.
    pub fn turns(&self) -> Vec<Vec<SessionEvent>> {
        let mut turns = Vec::new();
        let mut current = Vec::new();
        for event in &self.sent {
            current.push(event.clone());
            if matches!(event, SessionEvent::End(_)) {
                turns.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            turns.push(current);
        }
        turns
    }
}

#[async_trait]
impl SessionChannel for FakeChannel {
    async fn recv(&mut self) -> Option<String> {
        self.incoming.pop_front()
    }

    async fn send(&mut self, event: SessionEvent) -> anyhow::Result<()> {
        self.sent.push(event);
        Ok(())
    }
}

/// Concatenated content of all `chunk` events.
pub fn chunk_text(events: &[SessionEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Chunk(c) => Some(c.as_str()),
            _ => None,
        })
        .collect()
}

// ============ Storage ============

pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    pool
}

/// App wired with the hashing embedder and the given OCR engine.
pub async fn test_app(ocr: Arc<dyn OcrEngine>) -> App {
    let pool = memory_pool().await;
    App::assemble(&Config::default(), pool, Arc::new(HashEmbedder), ocr)
}

pub async fn test_app_without_ocr() -> App {
    test_app(Arc::new(DisabledOcr)).await
}

// ============ PDF fixtures ============

/// Minimal PDF with one page per entry, each drawing its text with a
/// standard font. Empty entries produce pages without any text.
/// Builds body then xref with correct byte offsets so pdf-extract can parse it.
pub fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
    let n = pages.len();
    let mut offsets = Vec::new();
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");

    offsets.push(out.len());
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");

    let kids: Vec<String> = (0..n).map(|i| format!("{} 0 R", 4 + 2 * i)).collect();
    offsets.push(out.len());
    out.extend_from_slice(
        format!(
            "2 0 obj << /Type /Pages /Kids [{}] /Count {} >> endobj\n",
            kids.join(" "),
            n
        )
        .as_bytes(),
    );

    offsets.push(out.len());
    out.extend_from_slice(
        b"3 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );

    for (i, text) in pages.iter().enumerate() {
        let page_obj = 4 + 2 * i;
        let content_obj = page_obj + 1;

        offsets.push(out.len());
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R /Resources << /Font << /F1 3 0 R >> >> >> endobj\n",
                page_obj, content_obj
            )
            .as_bytes(),
        );

        let stream = if text.is_empty() {
            String::new()
        } else {
            format!("BT /F1 12 Tf 72 700 Td ({}) Tj ET", text)
        };
        offsets.push(out.len());
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
                content_obj,
                stream.len(),
                stream
            )
            .as_bytes(),
        );
    }

    let xref_start = out.len();
    let size = offsets.len() + 1;
    out.extend_from_slice(format!("xref\n0 {}\n", size).as_bytes());
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for off in &offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", off).as_bytes());
    }
    out.extend_from_slice(format!("trailer << /Size {} /Root 1 0 R >>\nstartxref\n", size).as_bytes());
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}
