//! HTTP server for the question-answering turn protocol.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ask` | Run a turn; streams turn events as JSON lines |
//! | `POST` | `/resume` | Resume a suspended turn with a reviewer signal |
//! | `POST` | `/ingest` | Ingest one document |
//! | `POST` | `/documents/delete` | Delete every chunk of a source file |
//! | `GET`  | `/health` | Health check (returns version and chunk count) |
//!
//! `/ask` and `/resume` respond with `application/x-ndjson`: one serialized
//! [`TurnEvent`](crate::state::TurnEvent) per line. A turn that hits the
//! human-approval gate emits an `interrupt` event carrying the `turn_id`,
//! parks the serialized turn in the configured store so it survives a
//! restart, and ends the stream; the client continues it via `/resume`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::app::App;
use crate::control::{TurnOutcome, TurnRequest};
use crate::models::{ChunkMetadata, ConversationTurn, MetadataFilter};
use crate::state::{EventSink, ResumeSignal, SuspendedTurn, TurnEvent};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    app: Arc<App>,
}

/// Starts the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(app: Arc<App>) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let state = AppState { app };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/ask", post(handle_ask))
        .route("/resume", post(handle_resume))
        .route("/ingest", post(handle_ingest))
        .route("/documents/delete", post(handle_delete))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("Server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
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

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ /ask ============

#[derive(Deserialize)]
struct AskBody {
    question: String,
    #[serde(default)]
    history: Vec<ConversationTurn>,
    #[serde(default)]
    preferences: Option<String>,
    #[serde(default)]
    filter: MetadataFilter,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    force_web_search: bool,
    #[serde(default)]
    turn_id: Option<String>,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(body): Json<AskBody>,
) -> Result<Response, AppError> {
    if body.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let request = TurnRequest {
        question: body.question,
        history: body.history,
        preferences: body.preferences,
        filter: body.filter,
        top_k: body.top_k,
        force_web_search: body.force_web_search,
        turn_id: body.turn_id,
    };

    let (sink, rx) = EventSink::new();
    let app = state.app.clone();
    tokio::spawn(async move {
        match app.control.run_turn(request, &sink).await {
            Ok(TurnOutcome::Complete { .. }) => {}
            Ok(TurnOutcome::Suspended(turn)) => park(&app, &turn).await,
            Err(e) => {
                tracing::error!(error = %e, "Turn failed");
            }
        }
    });

    Ok(event_stream_response(rx))
}

/// Persist a suspended turn through the configured store.
async fn park(app: &App, turn: &SuspendedTurn) {
    let body = match turn.to_json() {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, turn_id = %turn.turn_id, "Failed to serialize suspended turn");
            return;
        }
    };
    if let Err(e) = app.turns.put(&turn.turn_id, &body).await {
        tracing::error!(error = %e, turn_id = %turn.turn_id, "Failed to persist suspended turn");
    }
}

// ============ /resume ============

#[derive(Deserialize)]
struct ResumeBody {
    turn_id: String,
    #[serde(flatten)]
    signal: ResumeSignal,
}

async fn handle_resume(
    State(state): State<AppState>,
    Json(body): Json<ResumeBody>,
) -> Result<Response, AppError> {
    let payload = state
        .app
        .turns
        .take(&body.turn_id)
        .await
        .map_err(|e| internal(e.to_string()))?
        .ok_or_else(|| not_found(format!("no suspended turn with id {}", body.turn_id)))?;
    let parked = SuspendedTurn::from_json(&payload)
        .map_err(|e| internal(format!("corrupt suspended turn: {}", e)))?;

    let (sink, rx) = EventSink::new();
    let app = state.app.clone();
    tokio::spawn(async move {
        match app.control.resume(parked, body.signal, &sink).await {
            Ok(TurnOutcome::Complete { .. }) => {}
            Ok(TurnOutcome::Suspended(turn)) => park(&app, &turn).await,
            Err(e) => {
                tracing::error!(error = %e, "Resumed turn failed");
            }
        }
    });

    Ok(event_stream_response(rx))
}

/// Serialize turn events as newline-delimited JSON over a streaming body.
fn event_stream_response(rx: tokio::sync::mpsc::UnboundedReceiver<TurnEvent>) -> Response {
    let body = Body::from_stream(stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let line = match serde_json::to_string(&event) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize turn event");
                return None;
            }
        };
        Some((Ok::<_, std::convert::Infallible>(line), rx))
    }));

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        body,
    )
        .into_response()
}

// ============ /ingest ============

#[derive(Deserialize)]
struct IngestBody {
    text: String,
    source_file: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    knowledge_type: Option<String>,
    #[serde(default)]
    folder: Option<String>,
}

#[derive(Serialize)]
struct IngestResponse {
    source_file: String,
    parents: usize,
    children: usize,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(body): Json<IngestBody>,
) -> Result<Json<IngestResponse>, AppError> {
    if body.source_file.trim().is_empty() {
        return Err(bad_request("source_file must not be empty"));
    }

    let metadata = ChunkMetadata {
        source_file: body.source_file.clone(),
        category: body.category,
        knowledge_type: body.knowledge_type,
        folder: body.folder,
    };

    let stats = state
        .app
        .index
        .ingest(&body.text, metadata)
        .await
        .map_err(|e| internal(format!("ingest failed: {}", e)))?;

    Ok(Json(IngestResponse {
        source_file: body.source_file,
        parents: stats.parents,
        children: stats.children,
    }))
}

// ============ /documents/delete ============

#[derive(Deserialize)]
struct DeleteBody {
    source_file: String,
}

#[derive(Serialize)]
struct DeleteResponse {
    source_file: String,
    children_deleted: usize,
    parents_deleted: usize,
}

async fn handle_delete(
    State(state): State<AppState>,
    Json(body): Json<DeleteBody>,
) -> Result<Json<DeleteResponse>, AppError> {
    if body.source_file.trim().is_empty() {
        return Err(bad_request("source_file must not be empty"));
    }

    let stats = state
        .app
        .index
        .delete_by_source(&body.source_file)
        .await
        .map_err(|e| internal(format!("delete failed: {}", e)))?;

    Ok(Json(DeleteResponse {
        source_file: body.source_file,
        children_deleted: stats.children,
        parents_deleted: stats.parents,
    }))
}

// ============ /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    chunks: usize,
}

async fn handle_health(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, AppError> {
    let chunks = state
        .app
        .index
        .chunk_count()
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        chunks,
    }))
}
