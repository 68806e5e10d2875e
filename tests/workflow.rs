//! Retrieve → grade → generate pipeline against an in-memory index and a
//! scripted chat model.

mod common;

use std::sync::Arc;

use common::*;
use context_relay::app::App;
use context_relay::chunk::Chunker;
use context_relay::models::Page;
use context_relay::workflow::{QueryState, Stage};

const CHUNK: &str = "The candidate's title is Principal Solutions Architect.";

async fn app_with_chunks(texts: &[&str]) -> App {
    let app = test_app_without_ocr().await;
    let pages: Vec<Page> = texts
        .iter()
        .enumerate()
        .map(|(i, t)| Page {
            number: i as u32 + 1,
            text: t.to_string(),
        })
        .collect();
    let chunks = Chunker::default().split("doc-1", &pages).unwrap();
    app.index.upsert(&chunks).await.unwrap();
    app
}

#[tokio::test]
async fn single_chunk_is_retrieved_kept_and_quoted() {
    let app = app_with_chunks(&[CHUNK]).await;
    let model = Arc::new(FakeModel::answering(&["Principal Solutions Architect"]));
    let workflow = app.workflow_with(model.clone());

    let state = workflow.run("What is the candidate's title?").await.unwrap();

    assert_eq!(state.documents, vec![CHUNK.to_string()]);
    assert_eq!(state.filtered, vec![CHUNK.to_string()]);
    assert!(!state.needs_web_search);
    assert_eq!(state.answer.as_deref(), Some("Principal Solutions Architect"));

    let answer_prompts = model.answer_prompts();
    assert_eq!(answer_prompts.len(), 1);
    assert!(answer_prompts[0].contains(CHUNK));
    assert!(answer_prompts[0].contains("Question: What is the candidate's title?"));
}

#[tokio::test]
async fn retriever_prefers_diverse_results() {
    let app = app_with_chunks(&[
        "Kubernetes cluster upgrades are scheduled quarterly.",
        "Kubernetes cluster upgrades are scheduled quarterly by ops.",
        "Kubernetes monitoring uses Prometheus dashboards.",
    ])
    .await;

    let hits = app
        .index
        .search("Kubernetes cluster upgrades", 2, 3)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits[0].text.contains("upgrades"));
    assert!(
        hits[1].text.contains("Prometheus"),
        "near-duplicate should lose to a distinct passage: {:?}",
        hits
    );
}

#[tokio::test]
async fn grading_failures_keep_every_chunk() {
    let app = app_with_chunks(&[CHUNK]).await;
    let model = Arc::new(FakeModel::answering(&["answer"]).with_grade_reply(None));
    let workflow = app.workflow_with(model);

    let mut state = QueryState::new("What is the candidate's title?");
    workflow.retrieve(&mut state).await.unwrap();
    assert!(!state.documents.is_empty());
    workflow.grade(&mut state).await;

    assert_eq!(state.filtered, state.documents);
    assert!(!state.needs_web_search);
}

#[tokio::test]
async fn negative_grades_set_flag_but_still_generate() {
    let app = app_with_chunks(&[CHUNK]).await;
    let model = Arc::new(FakeModel::answering(&["I don't know."]).with_grade_reply(Some("No.")));
    let workflow = app.workflow_with(model.clone());

    let state = workflow.run("What is the weather?").await.unwrap();

    assert!(state.filtered.is_empty());
    assert!(state.needs_web_search);
    assert_eq!(state.answer.as_deref(), Some("I don't know."));
    assert!(model.answer_prompts()[0].contains("Context: \n\nQuestion:"));
}

#[tokio::test]
async fn grade_reply_matching_is_case_insensitive() {
    let app = app_with_chunks(&[CHUNK]).await;
    let model = Arc::new(FakeModel::answering(&["x"]).with_grade_reply(Some("YES, it is.")));
    let workflow = app.workflow_with(model);

    let state = workflow.run("What is the candidate's title?").await.unwrap();
    assert_eq!(state.filtered.len(), 1);
}

#[tokio::test]
async fn generate_is_idempotent() {
    let app = app_with_chunks(&[CHUNK]).await;
    let model = Arc::new(FakeModel::answering(&["first answer"]));
    let workflow = app.workflow_with(model.clone());

    let mut state = workflow.run("What is the candidate's title?").await.unwrap();
    let before = state.clone();
    let calls_before = model.prompts().len();

    let next = workflow.step(Stage::Generate, &mut state).await.unwrap();

    assert_eq!(next, Stage::Done);
    assert_eq!(state, before);
    assert_eq!(model.prompts().len(), calls_before, "no further model call");
}

#[tokio::test]
async fn generation_failure_becomes_error_answer() {
    let app = app_with_chunks(&[CHUNK]).await;
    let model = Arc::new(FakeModel::answering(&[]).with_answer_failure(Failure::Other));
    let workflow = app.workflow_with(model);

    let state = workflow.run("What is the candidate's title?").await.unwrap();
    let answer = state.answer.unwrap();
    assert!(answer.starts_with("Error: "), "got {answer}");
    assert!(answer.contains("upstream exploded"));
}

#[tokio::test]
async fn streaming_yields_fragments_in_order() {
    let app = app_with_chunks(&[CHUNK]).await;
    let model = Arc::new(FakeModel::answering(&["Prin", "cipal ", "Architect"]));
    let workflow = app.workflow_with(model);

    let mut tokens = workflow
        .run_streaming("What is the candidate's title?")
        .await
        .unwrap();
    let mut out = Vec::new();
    while let Some(item) = tokens.recv().await {
        out.push(item.unwrap());
    }
    assert_eq!(out, vec!["Prin", "cipal ", "Architect"]);
}

#[tokio::test]
async fn run_until_generate_stops_before_answering() {
    let app = app_with_chunks(&[CHUNK]).await;
    let model = Arc::new(FakeModel::answering(&["unused"]));
    let workflow = app.workflow_with(model.clone());

    let state = workflow
        .run_until("What is the candidate's title?", Stage::Generate)
        .await
        .unwrap();

    assert_eq!(state.documents, vec![CHUNK.to_string()]);
    assert_eq!(state.filtered, vec![CHUNK.to_string()]);
    assert!(state.answer.is_none());
    assert!(model.answer_prompts().is_empty());
}

#[tokio::test]
async fn streaming_answers_from_graded_context() {
    let app = app_with_chunks(&[CHUNK]).await;
    let model = Arc::new(FakeModel::answering(&["I don't know."]).with_grade_reply(Some("no")));
    let workflow = app.workflow_with(model.clone());

    let mut tokens = workflow.run_streaming("What is the weather?").await.unwrap();
    assert_eq!(tokens.recv().await.unwrap().unwrap(), "I don't know.");

    let prompts = model.prompts();
    assert_eq!(prompts.len(), 2, "one grading call, then the answer");
    assert!(prompts[0].starts_with("Is this document relevant to:"));
    assert!(prompts[1].contains("Context: \n\nQuestion: What is the weather?"));
}

#[tokio::test]
async fn streaming_open_failure_is_single_error_fragment() {
    let app = app_with_chunks(&[CHUNK]).await;
    let model = Arc::new(FakeModel::answering(&[]).with_answer_failure(Failure::Other));
    let workflow = app.workflow_with(model);

    let mut tokens = workflow.run_streaming("q").await.unwrap();
    let first = tokens.recv().await.unwrap().unwrap();
    assert!(first.starts_with("Error: "));
    assert!(tokens.recv().await.is_none());
}

#[tokio::test]
async fn streaming_rate_limit_is_returned_as_error() {
    let app = app_with_chunks(&[CHUNK]).await;
    let model = Arc::new(FakeModel::answering(&[]).with_answer_failure(Failure::RateLimited));
    let workflow = app.workflow_with(model);

    let err = workflow.run_streaming("q").await.unwrap_err();
    assert!(err.is_rate_limited());
}

#[tokio::test]
async fn streaming_mid_stream_failure_ends_with_error_fragment() {
    let app = app_with_chunks(&[CHUNK]).await;
    let model = Arc::new(
        FakeModel::answering(&["partial"]).with_mid_stream_failure(Failure::Other),
    );
    let workflow = app.workflow_with(model);

    let mut tokens = workflow.run_streaming("q").await.unwrap();
    assert_eq!(tokens.recv().await.unwrap().unwrap(), "partial");
    let last = tokens.recv().await.unwrap().unwrap();
    assert!(last.starts_with("Error: "));
    assert!(tokens.recv().await.is_none());
}
