//! REST surface over the same [`AppContext`] the MCP tools use.
//!
//! Errors are returned as `{"detail": "..."}` with the status from
//! [`AssistantError::status_code`].
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::AssistantError;
use crate::llm::ModelInfo;
use crate::llm::catalog::{CatalogError, resolve_upload_name};
use crate::mcp::server::AppContext;
use crate::rag::Answer;
use crate::store::Document;

pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl From<AssistantError> for ApiError {
    fn from(err: AssistantError) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(error = %err, "Request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Deserialize)]
pub struct NoteCreate {
    title: String,
    content: String,
}

#[derive(Deserialize)]
pub struct SearchQuery {
    query: String,
}

#[derive(Deserialize)]
pub struct AskRequest {
    query: String,
    max_tokens: Option<usize>,
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/notes", get(list_notes).post(add_note))
        .route("/notes/search", get(search_notes))
        .route("/notes/:id", delete(delete_note))
        .route("/llm/ask", post(ask))
        .route("/llm/models", get(list_models))
        .route(
            "/llm/models/upload",
            post(upload_model).layer(DefaultBodyLimit::disable()),
        )
        .route("/llm/models/activate/:name", post(activate_model))
        .route("/llm/models/:name", delete(delete_model))
        .with_state(ctx)
}

/// Bind `addr` and serve until Ctrl-C.
pub async fn serve(ctx: AppContext, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr, "HTTP server listening");

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server error")
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "memex backend is running!" }))
}

async fn list_notes(State(ctx): State<AppContext>) -> ApiResult<Json<Vec<Document>>> {
    Ok(Json(ctx.with_notes(|notes| notes.list_notes()).await?))
}

async fn add_note(
    State(ctx): State<AppContext>,
    Json(note): Json<NoteCreate>,
) -> ApiResult<(StatusCode, Json<Document>)> {
    let doc = ctx
        .with_notes(move |notes| notes.add_note(&note.title, &note.content))
        .await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn delete_note(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if ctx.with_notes(move |notes| notes.delete_note(&id)).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::new(StatusCode::NOT_FOUND, "Note not found"))
    }
}

async fn search_notes(
    State(ctx): State<AppContext>,
    Query(q): Query<SearchQuery>,
) -> ApiResult<Json<Vec<Document>>> {
    Ok(Json(
        ctx.with_notes(move |notes| notes.search_titles(&q.query))
            .await?,
    ))
}

async fn ask(
    State(ctx): State<AppContext>,
    Json(req): Json<AskRequest>,
) -> ApiResult<Json<Answer>> {
    Ok(Json(ctx.assistant.ask(&req.query, req.max_tokens).await?))
}

async fn list_models(State(ctx): State<AppContext>) -> ApiResult<Json<Vec<ModelInfo>>> {
    Ok(Json(ctx.assistant.list_models().await?))
}

async fn upload_model(
    State(ctx): State<AppContext>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut staged = None;
    let received = receive_upload(&ctx, &mut multipart, &mut staged).await;

    let model_name = match received {
        Ok(model_name) => model_name,
        Err(e) => {
            if let Some((partial, _)) = staged {
                let _ = tokio::fs::remove_file(partial).await;
            }
            return Err(e);
        }
    };
    let Some((partial, original)) = staged else {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "file field is required"));
    };

    let receipt = ctx
        .assistant
        .commit_upload(partial, original, model_name)
        .await?;
    Ok(Json(json!({
        "message": format!("Model {} uploaded successfully", receipt.name),
        "path": receipt.path,
    })))
}

/// Read the multipart fields, streaming `file` chunk by chunk into a staging
/// file. `model_name` may come before or after `file`.
async fn receive_upload(
    ctx: &AppContext,
    multipart: &mut Multipart,
    staged: &mut Option<(PathBuf, String)>,
) -> ApiResult<Option<String>> {
    let mut model_name = None;

    while let Some(mut field) = multipart.next_field().await.map_err(bad_request)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") if staged.is_none() => {
                let original = field.file_name().unwrap_or_default().to_string();
                resolve_upload_name(&original, None).map_err(AssistantError::from)?;

                let partial = ctx.assistant.upload_staging_path();
                *staged = Some((partial.clone(), original));

                let mut file = tokio::fs::File::create(&partial).await.map_err(io_error)?;
                let mut bytes = 0u64;
                while let Some(chunk) = field.chunk().await.map_err(bad_request)? {
                    file.write_all(&chunk).await.map_err(io_error)?;
                    bytes += chunk.len() as u64;
                }
                file.flush().await.map_err(io_error)?;
                debug!(bytes, "Upload received");
            }
            Some("model_name") => {
                model_name = Some(field.text().await.map_err(bad_request)?);
            }
            _ => {}
        }
    }

    Ok(model_name)
}

fn bad_request(err: impl std::fmt::Display) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, err.to_string())
}

fn io_error(err: std::io::Error) -> ApiError {
    AssistantError::from(CatalogError::from(err)).into()
}

async fn activate_model(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let activation = ctx.assistant.activate_model(&name).await?;
    Ok(Json(json!({
        "message": format!("Model {name} activated successfully"),
        "config": activation.config,
    })))
}

async fn delete_model(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    ctx.assistant.delete_model(&name).await?;
    Ok(Json(json!({
        "message": format!("Model {name} deleted successfully"),
    })))
}
