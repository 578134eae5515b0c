/// MCP Server setup using `rmcp` with stdio transport.
///
/// Provides `AppContext` (shared state, also used by the HTTP routes) and
/// `McpServer` (startup logic).
use crate::mcp::tools::AppTools;
use anyhow::{Context, Result};
use rmcp::{ServiceExt, handler::server::router::Router, transport::io::stdio};
use std::sync::Arc;
use tracing::info;

use crate::error::AssistantError;
use crate::{assistant::Assistant, store::NoteStore, store::StoreError};

/// Shared application context available to all tool handlers.
#[derive(Clone)]
pub struct AppContext {
    pub assistant: Arc<Assistant>,
    pub notes: Arc<NoteStore>,
}

impl AppContext {
    /// Run a notes-store call on the blocking pool.
    pub async fn with_notes<T, F>(&self, f: F) -> Result<T, AssistantError>
    where
        F: FnOnce(&NoteStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let notes = Arc::clone(&self.notes);
        tokio::task::spawn_blocking(move || f(&notes))
            .await
            .map_err(|e| AssistantError::Worker(e.to_string()))?
            .map_err(Into::into)
    }
}

/// MCP Server wrapping the context and serving via stdio.
#[derive(Clone)]
pub struct McpServer {
    pub ctx: AppContext,
}

impl McpServer {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Start the MCP server on stdio transport (blocks until the client disconnects).
    pub async fn start(self) -> Result<()> {
        info!("Starting MCP server on stdio...");
        let (stdin, stdout) = stdio();

        let app_tools = AppTools::new(self.ctx.clone());
        let router = Router::new(app_tools.clone()).with_tools(app_tools.tool_router.clone());

        let service = router
            .serve((stdin, stdout))
            .await
            .context("MCP Server failed to start on stdio transport")?;

        service
            .waiting()
            .await
            .context("MCP Server encountered an error during stdio transport")?;

        Ok(())
    }
}
