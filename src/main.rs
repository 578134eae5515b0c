use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use memex::assistant::Assistant;
use memex::config::{Config, ReindexPolicy};
use memex::embedder;
use memex::llm::{self, ModelCatalog};
use memex::mcp::{AppContext, McpServer};
use memex::store::NoteStore;

#[derive(Parser)]
#[command(name = "memex", version, about = "Local retrieval-augmented assistant over your notes")]
struct Cli {
    /// Path to the JSON config file (default: config.json)
    #[arg(long, global = true, default_value = "")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve MCP tools over stdio (default)
    Serve,
    /// Serve the REST API
    Http {
        /// Address to bind, overrides `http.bind`
        #[arg(long)]
        bind: Option<String>,
    },
    /// Download the ONNX embedding model files and exit
    DownloadEmbedder,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the MCP channel; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(&cli.config)?;
    config.validate().context("invalid configuration")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::DownloadEmbedder => {
            let dir = config.embedding.model_dir.clone();
            tokio::task::spawn_blocking(move || {
                embedder::download::download_model_files(Path::new(&dir))
            })
            .await
            .context("download task panicked")??;
            info!("Embedding model ready in {}", config.embedding.model_dir);
        }
        Command::Serve => {
            info!("Starting memex MCP server...");
            let ctx = build_context(config).await?;
            McpServer::new(ctx).start().await?;
        }
        Command::Http { bind } => {
            let addr = bind.unwrap_or_else(|| config.http.bind.clone());
            let ctx = build_context(config).await?;
            memex::http::serve(ctx, &addr).await?;
        }
    }

    Ok(())
}

async fn build_context(config: Config) -> Result<AppContext> {
    // 1. Notes store
    let notes = Arc::new(NoteStore::open(&config.db_path).context("Failed to open notes database")?);

    // 2. Embedder (may download model files, which uses blocking HTTP)
    let embedding = config.embedding.clone();
    let embedder = tokio::task::spawn_blocking(move || embedder::from_config(&embedding))
        .await
        .context("embedder init task panicked")??;

    // 3. Models directory and inference backend
    let catalog = ModelCatalog::open(&config.models_dir)
        .with_context(|| format!("Failed to open models directory {}", config.models_dir))?;
    let engine = llm::default_engine();

    // 4. Assistant
    let assistant = Assistant::new(notes.clone(), embedder, engine, catalog, &config);
    if config.retrieval.reindex == ReindexPolicy::Manual {
        let count = assistant.reindex().await?;
        info!(documents = count, "Initial index built");
    }

    Ok(AppContext {
        assistant: Arc::new(assistant),
        notes,
    })
}
