/// MCP Tool handlers for memex.
///
/// Model lifecycle:
/// 1. list_models    – models in the models directory
/// 2. upload_model   – copy a local `.gguf` file into the models directory
/// 3. activate_model – load a model and make it active
/// 4. delete_model   – remove a model file (unloads it if active)
/// 5. model_status   – state of the active-model slot
///
/// Retrieval:
/// 6. ask            – answer a question from the notes corpus
/// 7. reindex        – rebuild the vector index now
///
/// Notes:
/// 8. add_note / list_notes / delete_note / search_notes
use crate::error::AssistantError;
use crate::mcp::server::AppContext;
use rmcp::handler::server::ServerHandler;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{ErrorData as McpError, handler::server::tool::ToolRouter, model::*, tool, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

// ── Parameter structs ────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct AskParams {
    /// Question to answer from the notes
    query: String,
    /// Maximum tokens to generate (default from config, 512)
    max_tokens: Option<usize>,
}

#[derive(Deserialize, JsonSchema)]
struct UploadParams {
    /// Local path of the `.gguf` file to copy into the models directory
    source_path: String,
    /// Name to save the model under (defaults to the source filename)
    model_name: Option<String>,
}

#[derive(Deserialize, JsonSchema)]
struct ModelNameParam {
    /// Model filename, e.g. 'phi-3-mini.Q4_K_M.gguf'
    model_name: String,
}

#[derive(Deserialize, JsonSchema)]
struct NoteParams {
    /// Note title (must not be empty)
    title: String,
    /// Note body (must not be empty)
    content: String,
}

#[derive(Deserialize, JsonSchema)]
struct NoteIdParam {
    /// Note id as returned by add_note / list_notes
    id: String,
}

#[derive(Deserialize, JsonSchema)]
struct SearchNotesParams {
    /// Substring to match against note titles
    query: String,
}

// ── Response helpers ─────────────────────────────────────────────────

fn json_result(value: serde_json::Value) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(&value).unwrap_or_default(),
    )]))
}

fn error_result(msg: &str) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(msg.to_string())]))
}

/// Structural assistant failures are reported to the client as tool errors.
fn assistant_error(err: AssistantError) -> Result<CallToolResult, McpError> {
    warn!(status = err.status_code(), error = %err, "Tool call failed");
    error_result(&err.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, McpError> {
    serde_json::to_value(value)
        .map_err(|e| McpError::internal_error(format!("serialization failed: {e}"), None))
}

// ── Tool implementations ─────────────────────────────────────────────

#[derive(Clone)]
pub struct AppTools {
    pub ctx: AppContext,
    pub tool_router: ToolRouter<Self>,
}

impl ServerHandler for AppTools {}

#[tool_router]
impl AppTools {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "List the GGUF models available in the models directory")]
    async fn list_models(&self) -> Result<CallToolResult, McpError> {
        match self.ctx.assistant.list_models().await {
            Ok(models) => json_result(serde_json::json!({ "models": to_json(&models)? })),
            Err(e) => assistant_error(e),
        }
    }

    #[tool(
        description = "Copy a local .gguf model file into the models directory. The saved name is model_name (or the source filename) with .gguf appended when missing."
    )]
    async fn upload_model(
        &self,
        params: Parameters<UploadParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        if p.source_path.is_empty() {
            return error_result("source_path is required");
        }

        let source = Path::new(&p.source_path);
        let Some(original) = source.file_name().and_then(|n| n.to_str()) else {
            return error_result(&format!("invalid source path: {}", p.source_path));
        };
        let original = original.to_string();

        let file = match std::fs::File::open(source) {
            Ok(f) => f,
            Err(e) => return error_result(&format!("cannot open {}: {e}", p.source_path)),
        };

        match self
            .ctx
            .assistant
            .upload_model(file, original, p.model_name)
            .await
        {
            Ok(receipt) => json_result(serde_json::json!({
                "message": format!("Model {} uploaded successfully", receipt.name),
                "path": receipt.path,
            })),
            Err(e) => assistant_error(e),
        }
    }

    #[tool(description = "Load a model from the models directory and make it the active model")]
    async fn activate_model(
        &self,
        params: Parameters<ModelNameParam>,
    ) -> Result<CallToolResult, McpError> {
        let name = &params.0.model_name;
        if name.is_empty() {
            return error_result("model_name is required");
        }

        match self.ctx.assistant.activate_model(name).await {
            Ok(activation) => json_result(serde_json::json!({
                "message": format!("Model {name} activated successfully"),
                "config": to_json(&activation.config)?,
            })),
            Err(e) => assistant_error(e),
        }
    }

    #[tool(description = "Delete a model file. If it is the active model it is unloaded first.")]
    async fn delete_model(
        &self,
        params: Parameters<ModelNameParam>,
    ) -> Result<CallToolResult, McpError> {
        let name = &params.0.model_name;
        if name.is_empty() {
            return error_result("model_name is required");
        }

        match self.ctx.assistant.delete_model(name).await {
            Ok(()) => json_result(serde_json::json!({
                "message": format!("Model {name} deleted successfully"),
            })),
            Err(e) => assistant_error(e),
        }
    }

    #[tool(description = "Show the state of the active model slot and the last load error")]
    async fn model_status(&self) -> Result<CallToolResult, McpError> {
        let status = self.ctx.assistant.model_status().await;
        json_result(to_json(&status)?)
    }

    #[tool(
        description = "Answer a question using the notes as context. Returns the answer and the source notes. Without an active model only the matching notes are returned."
    )]
    async fn ask(&self, params: Parameters<AskParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        if p.query.trim().is_empty() {
            return error_result("query is required");
        }

        match self.ctx.assistant.ask(&p.query, p.max_tokens).await {
            Ok(answer) => json_result(to_json(&answer)?),
            Err(e) => assistant_error(e),
        }
    }

    #[tool(description = "Rebuild the vector index from all notes")]
    async fn reindex(&self) -> Result<CallToolResult, McpError> {
        match self.ctx.assistant.reindex().await {
            Ok(count) => json_result(serde_json::json!({
                "success": true,
                "documents": count,
            })),
            Err(e) => assistant_error(e),
        }
    }

    #[tool(description = "Add a note")]
    async fn add_note(&self, params: Parameters<NoteParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let added = self
            .ctx
            .with_notes(move |notes| notes.add_note(&p.title, &p.content))
            .await;
        match added {
            Ok(note) => json_result(to_json(&note)?),
            Err(e) => assistant_error(e),
        }
    }

    #[tool(description = "List all notes, newest first")]
    async fn list_notes(&self) -> Result<CallToolResult, McpError> {
        let notes = self
            .ctx
            .with_notes(|notes| notes.list_notes())
            .await
            .map_err(|e| McpError::internal_error(format!("list failed: {e}"), None))?;
        json_result(serde_json::json!({ "notes": to_json(&notes)? }))
    }

    #[tool(description = "Delete a note by id")]
    async fn delete_note(
        &self,
        params: Parameters<NoteIdParam>,
    ) -> Result<CallToolResult, McpError> {
        let id = params.0.id;
        if id.is_empty() {
            return error_result("id is required");
        }

        let deleted = self
            .ctx
            .with_notes(move |notes| notes.delete_note(&id))
            .await
            .map_err(|e| McpError::internal_error(format!("delete failed: {e}"), None))?;
        if !deleted {
            return error_result("Note not found");
        }

        json_result(serde_json::json!({
            "success": true,
            "message": "Note deleted successfully",
        }))
    }

    #[tool(description = "Find notes whose title contains the query (max 10)")]
    async fn search_notes(
        &self,
        params: Parameters<SearchNotesParams>,
    ) -> Result<CallToolResult, McpError> {
        let query = params.0.query;
        let notes = self
            .ctx
            .with_notes(move |notes| notes.search_titles(&query))
            .await
            .map_err(|e| McpError::internal_error(format!("search failed: {e}"), None))?;
        json_result(serde_json::json!({ "notes": to_json(&notes)? }))
    }
}
