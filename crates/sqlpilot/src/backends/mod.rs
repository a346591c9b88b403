//! Collaborators the pipeline depends on: text generation, query execution and schema retrieval.
//!
//! The orchestrator only sees these traits; `llm_client` and `sqlite_source` are the default
//! implementations wired up by the server.

pub mod llm_client;
pub mod sqlite_source;

pub use llm_client::{HttpGenerator, LlmClientConfig};
pub use sqlite_source::SqliteSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ExecutionError, GenerationError};

/// Bounded view of a query result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultPreview {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub total_rows: usize,
    pub truncated: bool,
}

/// A ranked piece of schema documentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChunk {
    pub content: String,
    pub score: f64,
    #[serde(default)]
    pub source: BTreeMap<String, String>,
}

impl SchemaChunk {
    pub fn table(&self) -> Option<&str> {
        self.source.get("table").map(String::as_str)
    }
}

/// Language-model completion. Implementations do not retry; the repair loop does.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: &str,
        temperature: f32,
    ) -> Result<String, GenerationError>;
}

/// Runs a read-only query, returning at most `row_limit` rows.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str, row_limit: usize) -> Result<ResultPreview, ExecutionError>;
}

#[async_trait]
pub trait SchemaRetriever: Send + Sync {
    async fn retrieve_schema(&self, question: &str, top_k: usize) -> anyhow::Result<Vec<SchemaChunk>>;
}

/// Schema chunks as prompt text, best match first.
pub fn schema_context(chunks: &[SchemaChunk]) -> String {
    if chunks.is_empty() {
        return "(no schema information available)".to_string();
    }
    chunks
        .iter()
        .map(|c| c.content.trim())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Distinct table names referenced by the chunks' metadata.
pub fn chunk_tables(chunks: &[SchemaChunk]) -> Vec<String> {
    let mut tables: Vec<String> = chunks
        .iter()
        .filter_map(|c| c.table())
        .map(|t| t.to_lowercase())
        .collect();
    tables.sort();
    tables.dedup();
    tables
}
