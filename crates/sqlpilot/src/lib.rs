//! Adaptive natural-language to SQL pipeline.
//!
//! A question is turned into a SQL query by a text generator, executed with bounded repair
//! attempts, summarised, and streamed back as progress events. Thumbs-up/down feedback is
//! aggregated into policy hints that are injected into later prompts.

pub mod backends;
pub mod config;
pub mod error;
pub mod feedback_db;
pub mod memory;
pub mod metrics;
pub mod policy;
pub mod query_engine;
pub mod shared_state;
pub mod telemetry;
pub mod utils;

#[cfg(feature = "cli")]
pub mod api;
#[cfg(feature = "cli")]
pub mod server;

// Public API exports
pub use backends::{QueryExecutor, ResultPreview, SchemaChunk, SchemaRetriever, SqlGenerator};
pub use config::Config;
pub use error::{ExecutionError, ExecutionErrorKind, GenerationError, PipelineError, ServiceError, StoreError};
pub use feedback_db::{FeedbackRecord, FeedbackStore, HintType, Polarity, PolicyHint};
pub use memory::{ConversationMemory, Interaction};
pub use policy::{AdvantageCalculator, PolicyEngine, RewardScorer};
pub use query_engine::{
    Collaborators, ProgressEvent, QueryOrchestrator, QueryRequest, QueryResponse, QueryService, ServiceConfig,
    StepKind,
};
pub use shared_state::AppState;

#[cfg(feature = "cli")]
pub use server::{build_router, run_server};
