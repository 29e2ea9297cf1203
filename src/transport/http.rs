//! HTTP transport: the relay's JSON API and NDJSON chat stream.
//!
//! `POST /api/chat` answers with `application/x-ndjson`. In streaming mode
//! every JSON record from the assistant is forwarded verbatim as it arrives;
//! in static mode stdout chunks are wrapped as `{"type":"progress"}` lines.
//! The body always ends with exactly one terminal line:
//!
//! ```text
//! {"type":"final_result","message":{...}}
//! {"type":"error","message":{...}}
//! ```
//!
//! Dropping the response body (client disconnect) cancels the request.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::models::chat::{ChatSession, Message};
use crate::persistence::chat_repo::ChatRepo;
use crate::persistence::db::Database;
use crate::pipeline::{RequestPipeline, StreamUpdate};
use crate::project::{check_project, init_project, ProjectInfo};
use crate::runner::{Invocation, ProcessRunner};
use crate::transport::registry::{ActiveRequests, Completion};
use crate::{AppError, Result};

/// Upper bound on waiting for a superseded request of the same chat.
const SUPERSEDED_WAIT: Duration = Duration::from_secs(10);

/// Shared state handed to every handler.
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<GlobalConfig>,
    /// Database pool.
    pub db: Arc<Database>,
    /// Conversation store.
    pub chats: ChatRepo,
    /// Launches assistant processes.
    pub runner: ProcessRunner,
    /// In-flight requests.
    pub requests: ActiveRequests,
}

impl AppState {
    /// Build state from configuration and an open database.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>, db: Arc<Database>) -> Self {
        Self {
            runner: ProcessRunner::from_config(&config),
            chats: ChatRepo::new(Arc::clone(&db)),
            requests: ActiveRequests::new(),
            config,
            db,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: msg,
                    details: None,
                },
            ),
            Self::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error: msg,
                    details: None,
                },
            ),
            other => {
                error!(err = %other, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "Internal server error".into(),
                        details: Some(other.to_string()),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// How `/api/chat` reports progress.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    /// Forward structured assistant records.
    #[default]
    Streaming,
    /// Forward plain stdout chunks.
    Static,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    message: String,
    working_directory: String,
    request_id: Option<String>,
    is_existing_chat: Option<bool>,
    chat_id: Option<String>,
    #[serde(default)]
    mode: ChatMode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    request_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectRequest {
    working_directory: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatSessionPatch {
    title: Option<String>,
    project_path: Option<String>,
    project_name: Option<String>,
}

#[derive(Serialize)]
struct TerminalLine<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: &'a Message,
}

#[derive(Serialize)]
struct ProgressLine<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    content: &'a str,
}

fn require_non_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} is required")));
    }
    Ok(())
}

fn success() -> Json<serde_json::Value> {
    Json(json!({ "success": true }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now().to_rfc3339() }))
}

async fn chat(State(state): State<Arc<AppState>>, Json(req): Json<ChatRequest>) -> Result<Response> {
    require_non_empty(&req.message, "message")?;
    require_non_empty(&req.working_directory, "workingDirectory")?;

    let request_id = req
        .request_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut continue_chat = req.is_existing_chat.unwrap_or(false);
    let guard = match req.chat_id.as_deref() {
        Some(chat_id) => {
            let (guard, superseded) = state.requests.register_for_chat(&request_id, chat_id);
            await_superseded(chat_id, superseded).await;

            let session = state
                .chats
                .get_by_id(chat_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("chat {chat_id} not found")))?;
            continue_chat = req.is_existing_chat.unwrap_or(session.message_count > 0);
            state.chats.append(chat_id, &Message::user(&req.message)).await?;
            guard
        }
        None => state.requests.register(&request_id, None),
    };

    let working_dir = PathBuf::from(&req.working_directory);
    let invocation = match req.mode {
        ChatMode::Streaming => Invocation::streaming(&req.message, working_dir, continue_chat),
        ChatMode::Static => Invocation::plain(&req.message, working_dir, continue_chat),
    };

    let token = guard.token();
    let mut pipeline = RequestPipeline::new(state.runner.clone(), state.config.idle_timeout());
    let updates = pipeline.subscribe();

    info!(%request_id, mode = ?req.mode, continue_chat, "chat request accepted");

    let task_state = Arc::clone(&state);
    let chat_id = req.chat_id;
    tokio::spawn(async move {
        let message_id = Uuid::new_v4().to_string();
        let message = pipeline
            .run(guard.request_id(), message_id, &invocation, guard.token())
            .await;
        if let Some(chat_id) = chat_id.as_deref() {
            if let Err(err) = task_state.chats.append(chat_id, &message).await {
                warn!(chat_id, %err, "failed to persist assistant message");
            }
        }
        drop(guard);
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        ndjson_body(updates, token.drop_guard()),
    )
        .into_response())
}

/// Wait for superseded requests to persist their final messages.
async fn await_superseded(chat_id: &str, superseded: Vec<Completion>) {
    if superseded.is_empty() {
        return;
    }
    info!(chat_id, superseded = superseded.len(), "waiting for superseded requests");
    for done in superseded {
        if tokio::time::timeout(SUPERSEDED_WAIT, done.finished())
            .await
            .is_err()
        {
            warn!(chat_id, "superseded request did not finish in time");
        }
    }
}

/// Render pipeline updates as NDJSON until the terminal line.
///
/// `cancel_on_drop` fires if the body is dropped before the request finished.
fn ndjson_body(updates: UnboundedReceiver<StreamUpdate>, cancel_on_drop: DropGuard) -> Body {
    let lines = stream::unfold(Some((updates, cancel_on_drop)), |state| async move {
        let (mut updates, guard) = state?;
        while let Some(update) = updates.recv().await {
            match update {
                StreamUpdate::Raw(line) => {
                    return Some((Ok::<_, Infallible>(with_newline(line)), Some((updates, guard))));
                }
                StreamUpdate::Progress(content) => {
                    let line = ProgressLine {
                        kind: "progress",
                        content: &content,
                    };
                    if let Some(bytes) = encode_line(&line) {
                        return Some((Ok(bytes), Some((updates, guard))));
                    }
                }
                StreamUpdate::Content(_) => {}
                StreamUpdate::Finished { message, failed } => {
                    drop(guard.disarm());
                    let line = TerminalLine {
                        kind: if failed { "error" } else { "final_result" },
                        message: &message,
                    };
                    return encode_line(&line).map(|bytes| (Ok(bytes), None));
                }
            }
        }
        None
    });
    Body::from_stream(lines)
}

fn with_newline(mut line: String) -> Bytes {
    line.push('\n');
    Bytes::from(line)
}

fn encode_line<T: Serialize>(value: &T) -> Option<Bytes> {
    match serde_json::to_string(value) {
        Ok(line) => Some(with_newline(line)),
        Err(err) => {
            error!(%err, "failed to encode stream line");
            None
        }
    }
}

async fn cancel_chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<serde_json::Value>> {
    state.requests.cancel(&req.request_id)?;
    Ok(success())
}

async fn project_check(Json(req): Json<ProjectRequest>) -> Result<Json<ProjectInfo>> {
    require_non_empty(&req.working_directory, "workingDirectory")?;
    Ok(Json(check_project(std::path::Path::new(&req.working_directory))))
}

async fn project_init(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProjectRequest>,
) -> Result<Json<serde_json::Value>> {
    require_non_empty(&req.working_directory, "workingDirectory")?;
    let message = init_project(&state.runner, std::path::Path::new(&req.working_directory)).await;
    Ok(Json(json!({ "message": message })))
}

async fn list_chats(State(state): State<Arc<AppState>>) -> Result<Json<Vec<ChatSession>>> {
    Ok(Json(state.chats.list().await?))
}

async fn create_chat(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ChatSessionPatch>>,
) -> Result<(StatusCode, Json<ChatSession>)> {
    let patch = body.map(|Json(patch)| patch).unwrap_or_default();
    let session = ChatSession::new(patch.title, patch.project_path, patch.project_name);
    let session = state.chats.create(&session).await?;
    info!(chat_id = %session.id, "chat created");
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ChatSession>> {
    state
        .chats
        .load(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("chat {id} not found")))
}

async fn update_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<ChatSessionPatch>,
) -> Result<Json<ChatSession>> {
    if let Some(title) = patch.title.as_deref() {
        require_non_empty(title, "title")?;
        state.chats.rename(&id, title.trim()).await?;
    }
    if patch.project_path.is_some() || patch.project_name.is_some() {
        state
            .chats
            .set_project(&id, patch.project_path.as_deref(), patch.project_name.as_deref())
            .await?;
    }
    state
        .chats
        .get_by_id(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("chat {id} not found")))
}

async fn delete_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.requests.cancel_for_chat(&id);
    state.chats.delete(&id).await?;
    info!(chat_id = %id, "chat deleted");
    Ok(success())
}

async fn clear_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.chats.clear_messages(&id).await?;
    Ok(success())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(%origin, %err, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(Any)
}

/// Build the relay's router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/chat/cancel", post(cancel_chat))
        .route("/api/project/check", post(project_check))
        .route("/api/project/init", post(project_init))
        .route("/api/chats", get(list_chats).post(create_chat))
        .route(
            "/api/chats/{id}",
            get(get_chat).patch(update_chat).delete(delete_chat),
        )
        .route("/api/chats/{id}/messages", delete(clear_chat))
        .layer(cors)
        .with_state(state)
}

/// Bind `config.bind_addr()` and serve until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Transport` if the listener cannot bind or the server fails.
pub async fn serve(state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let bind = state.config.bind_addr();
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Transport(format!("failed to bind HTTP on {bind}: {err}")))?;
    serve_on(listener, state, ct).await
}

/// Serve on an already bound listener until `ct` is cancelled.
///
/// In-flight requests are cancelled when shutdown begins.
///
/// # Errors
///
/// Returns `AppError::Transport` if the server fails.
pub async fn serve_on(
    listener: TcpListener,
    state: Arc<AppState>,
    ct: CancellationToken,
) -> Result<()> {
    let local: Option<SocketAddr> = listener.local_addr().ok();
    info!(bind = ?local, "starting HTTP transport");

    let requests = state.requests.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            ct.cancelled().await;
            let cancelled = requests.cancel_all();
            info!(cancelled, "HTTP transport shutting down");
        })
        .await
        .map_err(|err| AppError::Transport(format!("HTTP server error: {err}")))?;

    info!("HTTP transport shut down");
    Ok(())
}
