//! # memex: local retrieval-augmented assistant
//!
//! Indexes a corpus of short notes in memory, retrieves the ones closest to a
//! question and hands them to a locally loaded GGUF model for a grounded
//! answer. Served over MCP (stdio) or a small REST API.
//!
//! ## Architecture
//!
//! - **[`config`]**: JSON configuration loading and validation
//! - **[`embedder`]**: Text embedding (ONNX all-MiniLM-L6-v2, or lexical hashing)
//! - **[`index`]**: Flat L2 vector index with snapshot rebuilds
//! - **[`llm`]**: Model catalog, filename-derived load parameters, model manager
//! - **[`rag`]**: Prompt construction and the answer pipeline
//! - **[`store`]**: Document store trait and the SQLite notes store
//! - **[`assistant`]**: The service object tying the parts together
//! - **[`mcp`]**: MCP server with tool handlers (stdio transport via rmcp)
//! - **[`http`]**: REST routes (axum)

pub mod assistant;
pub mod config;
pub mod embedder;
pub mod error;
pub mod http;
pub mod index;
pub mod llm;
pub mod mcp;
pub mod rag;
pub mod store;
