//! Request execution: orchestration, progress streaming, sessions and the exposed service.

pub mod orchestrator;
pub mod prompts;
pub mod service;
pub mod sessions;
pub mod sql_guard;
pub mod step_stream;
pub mod types;

pub use orchestrator::{next_state, Outcome, PipelineConfig, PipelineState, QueryOrchestrator, RunContext};
pub use prompts::{extract_sql, Prompt, PromptBuilder};
pub use service::{Collaborators, FeedbackAck, FeedbackSubmission, QueryService, ServiceConfig};
pub use sessions::SessionStore;
pub use step_stream::{ProgressEvent, StepKind, StepSender, StepStreams, StepSubscription, StreamConfig};
pub use types::*;
