//! Retrieve → grade → generate query pipeline.
//!
//! A question moves through a fixed, linear sequence of [`Stage`]s, each of
//! which reads and updates a [`QueryState`]:
//!
//! ```text
//! Retrieve ──► Grade ──► Generate ──► Done
//! ```
//!
//! - **Retrieve** asks the [`Retriever`] for candidate passages.
//! - **Grade** asks the model a yes/no relevance question per passage and
//!   keeps the ones it affirms. A failed judgment keeps the passage.
//! - **Generate** answers from the kept passages. A model failure becomes
//!   an `"Error: ..."` answer instead of an error.
//!
//! [`Workflow::run`] drives all stages to completion. [`Workflow::run_streaming`]
//! steps up to `Generate`, then hands back the answer as a [`TokenStream`].

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::WorkflowError;
use crate::llm::{ChatModel, TokenStream};
use crate::retriever::Retriever;

/// Pipeline position. Transitions are unconditional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Retrieve,
    Grade,
    Generate,
    Done,
}

impl Stage {
    pub fn next(self) -> Stage {
        match self {
            Stage::Retrieve => Stage::Grade,
            Stage::Grade => Stage::Generate,
            Stage::Generate | Stage::Done => Stage::Done,
        }
    }
}

/// Per-question state threaded through the stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    pub question: String,
    /// Passages in retrieval order.
    pub documents: Vec<String>,
    /// Passages kept by grading, in retrieval order.
    pub filtered: Vec<String>,
    pub answer: Option<String>,
    /// Set when grading kept nothing. Nothing acts on it yet.
    pub needs_web_search: bool,
}

impl QueryState {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }
}

pub struct Workflow {
    retriever: Arc<dyn Retriever>,
    model: Arc<dyn ChatModel>,
}

impl Workflow {
    pub fn new(retriever: Arc<dyn Retriever>, model: Arc<dyn ChatModel>) -> Self {
        Self { retriever, model }
    }

    /// Run every stage and return the final state.
    pub async fn run(&self, question: &str) -> Result<QueryState, WorkflowError> {
        self.run_until(question, Stage::Done).await
    }

    /// Step from [`Stage::Retrieve`] until `stop` is reached, without
    /// executing `stop` itself.
    pub async fn run_until(&self, question: &str, stop: Stage) -> Result<QueryState, WorkflowError> {
        let mut state = QueryState::new(question);
        let mut stage = Stage::Retrieve;
        while stage != stop && stage != Stage::Done {
            stage = self.step(stage, &mut state).await?;
        }
        Ok(state)
    }

    /// Execute one stage and return the one that follows it.
    pub async fn step(&self, stage: Stage, state: &mut QueryState) -> Result<Stage, WorkflowError> {
        match stage {
            Stage::Retrieve => self.retrieve(state).await?,
            Stage::Grade => self.grade(state).await,
            Stage::Generate => self.generate(state).await,
            Stage::Done => {}
        }
        Ok(stage.next())
    }

    pub async fn retrieve(&self, state: &mut QueryState) -> Result<(), WorkflowError> {
        state.documents = self.retriever.retrieve(&state.question).await?;
        state.needs_web_search = false;
        debug!(retrieved = state.documents.len(), "retrieve stage done");
        Ok(())
    }

    pub async fn grade(&self, state: &mut QueryState) {
        let mut kept = Vec::with_capacity(state.documents.len());

        for doc in &state.documents {
            let prompt = grade_prompt(&state.question, doc);
            match self.model.complete(&prompt).await {
                Ok(reply) => {
                    if reply.to_lowercase().contains("yes") {
                        kept.push(doc.clone());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Error grading document, keeping it");
                    kept.push(doc.clone());
                }
            }
        }

        state.needs_web_search = kept.is_empty();
        if state.needs_web_search {
            info!("no relevant passages after grading");
        }
        state.filtered = kept;
    }

    /// Produce the answer. A state that already has one is left untouched.
    pub async fn generate(&self, state: &mut QueryState) {
        if state.answer.is_some() {
            return;
        }
        let prompt = answer_prompt(&state.question, &state.filtered);
        let answer = match self.model.complete(&prompt).await {
            Ok(text) => text,
            Err(e) => format!("Error: {}", e),
        };
        state.answer = Some(answer);
    }

    /// Step the pipeline up to [`Stage::Generate`], then stream the answer.
    ///
    /// Rate-limit failures are returned as errors, either up front or as
    /// the last stream item, so the caller can advise the user to wait.
    /// Any other model failure arrives as a single `"Error: ..."` fragment.
    pub async fn run_streaming(&self, question: &str) -> Result<TokenStream, WorkflowError> {
        let state = self.run_until(question, Stage::Generate).await?;
        self.generate_stream(&state).await
    }

    /// Streaming counterpart of [`Workflow::generate`].
    pub async fn generate_stream(&self, state: &QueryState) -> Result<TokenStream, WorkflowError> {
        if let Some(answer) = &state.answer {
            return Ok(single_fragment(answer.clone()));
        }

        let prompt = answer_prompt(&state.question, &state.filtered);
        match self.model.stream(&prompt).await {
            Ok(upstream) => Ok(forward_answer(upstream)),
            Err(e) if e.is_rate_limited() => Err(e.into()),
            Err(e) => Ok(single_fragment(format!("Error: {}", e))),
        }
    }
}

pub fn grade_prompt(question: &str, doc: &str) -> String {
    format!(
        "Is this document relevant to: {}? Answer only 'yes' or 'no'.\nDoc: {}",
        question, doc
    )
}

pub fn answer_prompt(question: &str, context: &[String]) -> String {
    format!(
        "Based on the following context, answer the question.\n\nContext: {}\n\nQuestion: {}\n\nAnswer:",
        context.join("\n\n"),
        question
    )
}

fn single_fragment(text: String) -> TokenStream {
    let (tx, rx) = mpsc::channel(1);
    // Capacity 1 and a fresh channel: this cannot fail
    let _ = tx.try_send(Ok(text));
    rx
}

/// Relay model fragments, turning a non-rate-limit failure into a final
/// `"Error: ..."` fragment.
fn forward_answer(mut upstream: TokenStream) -> TokenStream {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        while let Some(item) = upstream.recv().await {
            let (item, last) = match item {
                Ok(text) => (Ok(text), false),
                Err(e) if e.is_rate_limited() => (Err(e), true),
                Err(e) => (Ok(format!("Error: {}", e)), true),
            };
            if tx.send(item).await.is_err() || last {
                return;
            }
        }
    });
    rx
}
