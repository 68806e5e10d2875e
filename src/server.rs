//! HTTP and WebSocket server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/upload` | Upload a PDF (multipart field `file`) and ingest it |
//! | `GET`  | `/files` | List ingested documents |
//! | `DELETE` | `/files/{id}` | Delete a document row and its stored file |
//! | `GET`/`POST` | `/conversations` | List / create conversations |
//! | `GET`/`PUT`/`DELETE` | `/conversations/{id}` | Read with messages / rename / delete |
//! | `POST` | `/conversations/{id}/messages` | Append a message |
//! | `GET`  | `/ws/{conversation_id}` | Streaming chat session, persisted |
//! | `GET`  | `/ws` | Streaming chat session, not persisted |
//!
//! Deleting a document does not remove its chunks from the embedding
//! index, so they can still be retrieved afterwards.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "Conversation not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `unprocessable` (422), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Multipart, Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app::App;
use crate::error::{IngestError, PersistenceError};
use crate::ingest::{is_pdf, Ingestor};
use crate::models::Role;
use crate::relay::{SessionChannel, SessionEvent, SessionRelay};
use crate::store::{ConversationStore, DocumentRegistry};
use crate::workflow::Workflow;

/// Shared state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub conversations: Arc<dyn ConversationStore>,
    pub documents: Arc<dyn DocumentRegistry>,
    pub ingestor: Arc<Ingestor>,
    /// Relay that persists turns to a conversation.
    pub relay: Arc<SessionRelay>,
    /// Relay for `/ws`, without persistence.
    pub legacy_relay: Arc<SessionRelay>,
    /// Where uploaded files are written.
    pub data_dir: PathBuf,
}

impl AppState {
    /// Handler state over `app`'s stores, answering with `workflow`.
    pub fn new(app: &App, workflow: Arc<Workflow>) -> Self {
        Self {
            conversations: app.store.clone(),
            documents: app.store.clone(),
            ingestor: app.ingestor.clone(),
            relay: Arc::new(SessionRelay::new(
                workflow.clone(),
                Some(app.store.clone() as Arc<dyn ConversationStore>),
            )),
            legacy_relay: Arc::new(SessionRelay::new(workflow, None)),
            data_dir: app.config.server.data_dir.clone(),
        }
    }
}

/// Build components from `app` and serve until the process is terminated.
pub async fn run_server(app: &App) -> anyhow::Result<()> {
    let state = AppState::new(app, app.workflow()?);
    tokio::fs::create_dir_all(&state.data_dir).await?;

    let bind_addr = app.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "server listening");
    println!("Listening on http://{}", bind_addr);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/upload", post(handle_upload))
        .route("/files", get(handle_list_files))
        .route("/files/{id}", delete(handle_delete_file))
        .route(
            "/conversations",
            get(handle_list_conversations).post(handle_create_conversation),
        )
        .route(
            "/conversations/{id}",
            get(handle_get_conversation)
                .put(handle_rename_conversation)
                .delete(handle_delete_conversation),
        )
        .route("/conversations/{id}/messages", post(handle_add_message))
        .route("/ws", get(handle_ws_legacy))
        .route("/ws/{conversation_id}", get(handle_ws))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<PersistenceError> for AppError {
    fn from(e: PersistenceError) -> Self {
        internal(e.to_string())
    }
}

impl From<IngestError> for AppError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Extraction(_) | IngestError::NoContent => AppError {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                code: "unprocessable",
                message: e.to_string(),
            },
            IngestError::Index(_) | IngestError::Registry(_) => internal(e.to_string()),
        }
    }
}

type ApiResult = Result<Json<serde_json::Value>, AppError>;

// ============ GET /health ============

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ============ Files ============

async fn handle_upload(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("Multipart error: {e}")))?
    {
        if field.name() == Some("file") || field.file_name().is_some() {
            let filename = field.file_name().unwrap_or("").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| bad_request(format!("Failed to read file: {e}")))?;
            upload = Some((filename, bytes));
            break;
        }
    }
    let (filename, bytes) = upload.ok_or_else(|| bad_request("No file provided"))?;

    // Keep only the final path component of the client-supplied name
    let filename = std::path::Path::new(&filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if filename.is_empty() || !is_pdf(std::path::Path::new(&filename)) {
        return Err(bad_request("Only PDF files are supported"));
    }

    tokio::fs::create_dir_all(&state.data_dir)
        .await
        .map_err(|e| internal(e.to_string()))?;
    let file_path = state.data_dir.join(&filename);
    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| internal(format!("Failed to save file: {e}")))?;

    let result = state.ingestor.process(&file_path).await?;

    Ok(Json(json!({
        "status": "success",
        "message": format!("PDF '{}' saved and processed successfully", filename),
        "file_path": file_path.display().to_string(),
        "result": result,
    })))
}

async fn handle_list_files(State(state): State<AppState>) -> ApiResult {
    let files = state.documents.list().await?;
    Ok(Json(json!({
        "status": "success",
        "count": files.len(),
        "files": files,
    })))
}

async fn handle_delete_file(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let doc = state
        .documents
        .get(&id)
        .await?
        .ok_or_else(|| not_found("File not found"))?;

    state.documents.delete(&id).await?;
    if let Err(e) = tokio::fs::remove_file(&doc.file_path).await {
        warn!(path = %doc.file_path, error = %e, "could not remove stored file");
    }

    Ok(Json(json!({
        "status": "success",
        "message": format!("File '{}' deleted", doc.filename),
    })))
}

// ============ Conversations ============

#[derive(Deserialize, Default)]
struct CreateConversation {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Deserialize)]
struct RenameConversation {
    title: String,
}

#[derive(Deserialize)]
struct NewMessage {
    role: String,
    content: String,
}

async fn handle_list_conversations(State(state): State<AppState>) -> ApiResult {
    let conversations = state.conversations.list().await?;
    Ok(Json(json!({
        "status": "success",
        "conversations": conversations,
    })))
}

async fn handle_create_conversation(
    State(state): State<AppState>,
    Json(body): Json<CreateConversation>,
) -> ApiResult {
    let conversation = state.conversations.create(body.title.as_deref()).await?;
    Ok(Json(json!({
        "status": "success",
        "conversation": conversation,
    })))
}

async fn handle_get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    let conversation = state
        .conversations
        .find(&id)
        .await?
        .ok_or_else(|| not_found("Conversation not found"))?;
    let messages = state.conversations.list_messages(&id).await?;
    Ok(Json(json!({
        "status": "success",
        "conversation": conversation,
        "messages": messages,
    })))
}

async fn handle_rename_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RenameConversation>,
) -> ApiResult {
    if !state.conversations.rename(&id, &body.title).await? {
        return Err(not_found("Conversation not found"));
    }
    let conversation = state
        .conversations
        .find(&id)
        .await?
        .ok_or_else(|| not_found("Conversation not found"))?;
    Ok(Json(json!({
        "status": "success",
        "conversation": conversation,
    })))
}

async fn handle_delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    if !state.conversations.delete(&id).await? {
        return Err(not_found("Conversation not found"));
    }
    Ok(Json(json!({
        "status": "success",
        "message": "Conversation deleted",
    })))
}

async fn handle_add_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<NewMessage>,
) -> ApiResult {
    let role = Role::parse(&body.role)
        .ok_or_else(|| bad_request("role must be 'user' or 'assistant'"))?;
    if state.conversations.find(&id).await?.is_none() {
        return Err(not_found("Conversation not found"));
    }
    let message = state
        .conversations
        .append_message(&id, role, &body.content)
        .await?;
    Ok(Json(json!({
        "status": "success",
        "message": message,
    })))
}

// ============ WebSocket ============

async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let mut channel = WsChannel::new(socket);
        state.relay.run(&mut channel, Some(&conversation_id)).await;
        channel.close().await;
    })
}

async fn handle_ws_legacy(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let mut channel = WsChannel::new(socket);
        state.legacy_relay.run(&mut channel, None).await;
        channel.close().await;
    })
}

/// [`SessionChannel`] over an axum WebSocket. Text frames are questions;
/// events go out as JSON text frames.
pub struct WsChannel {
    socket: WebSocket,
    closed: bool,
}

impl WsChannel {
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            closed: false,
        }
    }

    async fn close(mut self) {
        if !self.closed {
            let _ = self.socket.send(WsMessage::Close(None)).await;
        }
    }
}

#[async_trait]
impl SessionChannel for WsChannel {
    async fn recv(&mut self) -> Option<String> {
        while let Some(msg) = self.socket.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => return Some(text.as_str().to_owned()),
                Ok(WsMessage::Close(_)) => {
                    self.closed = true;
                    return None;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "websocket receive failed");
                    return None;
                }
            }
        }
        self.closed = true;
        None
    }

    async fn send(&mut self, event: SessionEvent) -> anyhow::Result<()> {
        let text = serde_json::to_string(&event)?;
        self.socket.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }
}
