//! Per-request state machine: retrieve, generate, execute, repair, summarize.
//!
//! Every stage result is folded into an [`Outcome`] and fed to [`next_state`], so the retry
//! policy lives in one function instead of being spread over error handling.

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::prompts::{extract_sql, fallback_summary, Prompt, PromptBuilder};
use super::sessions::SessionStore;
use super::sql_guard::{execute_limited, sanitize_sql, validate_sql};
use super::step_stream::{ProgressEvent, StepKind, StepSender};
use super::types::{ErrorInfo, QueryRequest, ResponseStatus, SharedResponse};
use crate::backends::{chunk_tables, schema_context, QueryExecutor, ResultPreview, SchemaRetriever, SqlGenerator};
use crate::error::{GenerationError, PipelineError};
use crate::memory::{ConversationMemory, Interaction};
use crate::metrics;
use crate::policy::PolicyEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Total execution attempts, including the first.
    pub max_attempts: u32,
    pub execution_timeout: Duration,
    pub default_max_rows: usize,
    pub schema_top_k: usize,
    pub dialect: String,
    pub generation_temperature: f32,
    pub summary_temperature: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            execution_timeout: Duration::from_secs(30),
            default_max_rows: 1000,
            schema_top_k: 10,
            dialect: "SQLite".to_string(),
            generation_temperature: 0.1,
            summary_temperature: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Started,
    Retrieving,
    Generating,
    Executing,
    Repairing,
    Succeeded,
    Failed,
    Summarizing,
    Done,
}

impl PipelineState {
    pub fn step_kind(self) -> StepKind {
        match self {
            Self::Started => StepKind::Started,
            Self::Retrieving => StepKind::Retrieving,
            Self::Generating => StepKind::Generating,
            Self::Executing => StepKind::Executing,
            Self::Repairing => StepKind::Repairing,
            Self::Succeeded => StepKind::Succeeded,
            Self::Failed => StepKind::Failed,
            Self::Summarizing => StepKind::Summarizing,
            Self::Done => StepKind::Done,
        }
    }
}

/// Result of one generate-and-execute attempt.
#[derive(Debug)]
pub enum Outcome {
    Success(ResultPreview),
    Retryable(PipelineError),
    Fatal(PipelineError),
}

impl Outcome {
    pub fn from_error(error: PipelineError) -> Self {
        if error.is_retryable() {
            Self::Retryable(error)
        } else {
            Self::Fatal(error)
        }
    }
}

/// Where an attempt leads. `attempt` is 1-based.
pub fn next_state(outcome: &Outcome, attempt: u32, max_attempts: u32) -> PipelineState {
    match outcome {
        Outcome::Success(_) => PipelineState::Succeeded,
        Outcome::Retryable(_) if attempt < max_attempts => PipelineState::Repairing,
        Outcome::Retryable(_) | Outcome::Fatal(_) => PipelineState::Failed,
    }
}

/// Progress text for a successful execution. A truncated preview only knows a lower bound.
pub fn row_count_text(preview: &ResultPreview, row_limit: usize) -> String {
    if preview.truncated {
        format!("Query returned more than {} rows", row_limit)
    } else {
        format!("Query returned {} rows", preview.total_rows)
    }
}

/// Identity of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub session_id: String,
    pub message_id: String,
}

struct Run<'a> {
    ctx: &'a RunContext,
    events: &'a StepSender,
    response: &'a SharedResponse,
}

impl Run<'_> {
    fn transition(&self, state: PipelineState, description: impl Into<String>, details: serde_json::Value) {
        let description = description.into();
        debug!("[{}] -> {:?}: {}", self.ctx.message_id, state, description);
        let kind = state.step_kind();
        self.response.update(|r| r.current_step = Some(kind));
        self.events.emit(ProgressEvent::new(kind, description).with_details(details));
    }
}

enum Finish {
    Completed { sql: String, preview: ResultPreview, summary: String, attempts: u32 },
    Failed { sql: Option<String>, error: PipelineError, attempts: u32, exhausted: bool },
}

pub struct QueryOrchestrator {
    generator: Arc<dyn SqlGenerator>,
    executor: Arc<dyn QueryExecutor>,
    retriever: Arc<dyn SchemaRetriever>,
    policy: Arc<PolicyEngine>,
    memory: ConversationMemory,
    sessions: Arc<SessionStore>,
    prompts: PromptBuilder,
    config: PipelineConfig,
}

impl QueryOrchestrator {
    pub fn new(
        generator: Arc<dyn SqlGenerator>,
        executor: Arc<dyn QueryExecutor>,
        retriever: Arc<dyn SchemaRetriever>,
        policy: Arc<PolicyEngine>,
        memory: ConversationMemory,
        sessions: Arc<SessionStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            generator,
            executor,
            retriever,
            policy,
            memory,
            sessions,
            prompts: PromptBuilder::new(config.dialect.clone()),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    /// Drive one request to a terminal Response. Never returns early without a `done` event,
    /// including when a stage panics.
    pub async fn run(&self, request: &QueryRequest, ctx: &RunContext, events: &StepSender, response: &SharedResponse) {
        let started = Instant::now();
        metrics::inc_active_queries();
        self.sessions.ensure(&ctx.session_id);

        let run = Run { ctx, events, response };
        let outcome = AssertUnwindSafe(self.pipeline(request, &run)).catch_unwind().await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut accepted: Option<Interaction> = None;
        let success = match outcome {
            Ok(Finish::Completed { sql, preview, summary, attempts }) => {
                accepted = Some(Interaction::new(request.question.trim(), sql.as_str(), summary.as_str()));
                response.update(|r| {
                    r.status = ResponseStatus::Completed;
                    r.sql = Some(sql);
                    r.result_preview = Some(preview);
                    r.summary = Some(summary);
                    r.attempts = attempts;
                    r.elapsed_ms = Some(elapsed_ms);
                    r.current_step = Some(StepKind::Done);
                });
                true
            }
            Ok(Finish::Failed { sql, error, attempts, exhausted }) => {
                let message = if exhausted {
                    format!("Query failed after {} attempts: {}", attempts, error)
                } else {
                    error.to_string()
                };
                warn!("[{}] {}", ctx.message_id, message);
                response.update(|r| {
                    r.status = ResponseStatus::Failed;
                    r.summary = Some(format!(
                        "I was unable to execute this query successfully. The error was: {}",
                        error
                    ));
                    r.sql = sql;
                    r.error = Some(ErrorInfo { message, kind: error.kind().to_string() });
                    r.attempts = attempts;
                    r.elapsed_ms = Some(elapsed_ms);
                    r.current_step = Some(StepKind::Done);
                });
                false
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "query processing panicked".to_string());
                error!("[{}] Query processing panicked: {}", ctx.message_id, message);
                response.update(|r| {
                    r.status = ResponseStatus::Failed;
                    r.error = Some(ErrorInfo { message, kind: "Panic".to_string() });
                    r.elapsed_ms = Some(elapsed_ms);
                    r.current_step = Some(StepKind::Done);
                });
                false
            }
        };

        // the memory window changes under the session entry so deletion clears both together
        self.sessions
            .record_exchange_with(&ctx.session_id, &request.question, response.snapshot(), || {
                if let Some(interaction) = accepted {
                    self.memory.add_interaction(&ctx.session_id, interaction);
                }
            });
        events.emit(
            ProgressEvent::new(
                StepKind::Done,
                if success { "Processing complete" } else { "Processing failed" },
            )
            .with_details(json!({ "elapsed_ms": elapsed_ms })),
        );
        events.finish();

        metrics::dec_active_queries();
        metrics::observe_query_duration(elapsed_ms as f64 / 1000.0);
        info!(
            "[{}] Finished in {} ms ({})",
            ctx.message_id,
            elapsed_ms,
            if success { "completed" } else { "failed" }
        );
    }

    async fn pipeline(&self, request: &QueryRequest, run: &Run<'_>) -> Finish {
        let question = request.question.trim();
        let row_limit = request.options.max_rows.unwrap_or(self.config.default_max_rows).max(1);
        run.transition(PipelineState::Started, "Starting query processing", serde_json::Value::Null);

        run.transition(
            PipelineState::Retrieving,
            "Searching for relevant tables and columns",
            serde_json::Value::Null,
        );
        let chunks = match self.retriever.retrieve_schema(question, self.config.schema_top_k).await {
            Ok(chunks) => chunks,
            Err(e) => {
                return Finish::Failed {
                    sql: None,
                    error: PipelineError::Internal(format!("schema retrieval failed: {}", e)),
                    attempts: 0,
                    exhausted: false,
                }
            }
        };
        let schema = schema_context(&chunks);
        let tables = chunk_tables(&chunks);

        let hints = match self.policy.hints_for_question(question, &tables) {
            Ok(hints) => hints,
            Err(e) => {
                warn!("Policy hints unavailable, continuing without them: {}", e);
                Vec::new()
            }
        };
        let hint_text = PolicyEngine::format_hints_for_prompt(&hints);
        let history = self.memory.context_text(&run.ctx.session_id);

        run.transition(
            PipelineState::Generating,
            "Analyzing question and generating SQL",
            json!({
                "tables": tables,
                "memory_used": !history.is_empty(),
                "hints": hints.len(),
            }),
        );
        let prompt = self.prompts.generation(question, &schema, &history, &hint_text);
        let mut candidate = self.generate_candidate(&prompt).await;
        let mut last_sql: Option<String> = None;

        let mut attempt = 1;
        loop {
            let outcome = match candidate {
                Ok(sql) => {
                    run.response.update(|r| r.sql = Some(sql.clone()));
                    run.transition(
                        PipelineState::Executing,
                        format!("Executing query (attempt {}/{})", attempt, self.config.max_attempts),
                        json!({ "sql": sql, "attempt": attempt }),
                    );
                    let outcome = self.execute_candidate(&sql, row_limit).await;
                    last_sql = Some(sql);
                    outcome
                }
                Err(e) => Outcome::from_error(e),
            };

            let state = next_state(&outcome, attempt, self.config.max_attempts);
            match outcome {
                Outcome::Success(preview) => {
                    let sql = last_sql.unwrap_or_default();
                    run.transition(
                        PipelineState::Succeeded,
                        row_count_text(&preview, row_limit),
                        json!({ "rows": preview.total_rows, "truncated": preview.truncated, "attempt": attempt }),
                    );
                    run.transition(PipelineState::Summarizing, "Generating summary", serde_json::Value::Null);
                    let summary = self.summarize(question, &sql, &preview).await;
                    return Finish::Completed { sql, preview, summary, attempts: attempt };
                }
                Outcome::Retryable(error) if state == PipelineState::Repairing => {
                    metrics::inc_repair_attempts();
                    warn!(
                        "[{}] Attempt {}/{} failed ({}): {}",
                        run.ctx.message_id,
                        attempt,
                        self.config.max_attempts,
                        error.kind(),
                        error
                    );
                    run.transition(
                        PipelineState::Repairing,
                        format!("Retry {}/{}: analyzing error and fixing SQL", attempt + 1, self.config.max_attempts),
                        json!({ "error": error.to_string(), "kind": error.kind() }),
                    );
                    candidate = match &last_sql {
                        Some(failed) => {
                            let repair = self.prompts.repair(failed, &error.to_string(), &schema, &hint_text);
                            self.generate_candidate(&repair).await
                        }
                        None => self.generate_candidate(&prompt).await,
                    };
                    attempt += 1;
                }
                Outcome::Retryable(error) | Outcome::Fatal(error) => {
                    let exhausted = error.is_retryable();
                    run.transition(
                        PipelineState::Failed,
                        format!("Query failed: {}", error),
                        json!({ "error": error.to_string(), "kind": error.kind(), "attempt": attempt }),
                    );
                    return Finish::Failed { sql: last_sql, error, attempts: attempt, exhausted };
                }
            }
        }
    }

    /// Generate, extract, sanitize and validate one candidate.
    async fn generate_candidate(&self, prompt: &Prompt) -> Result<String, PipelineError> {
        let text = self
            .generator
            .generate(&prompt.user, &prompt.system, self.config.generation_temperature)
            .await?;
        let sql = sanitize_sql(&extract_sql(&text));
        if sql.is_empty() {
            return Err(GenerationError("model response contained no SQL".to_string()).into());
        }
        validate_sql(&sql)?;
        Ok(sql)
    }

    /// Execute under the configured timeout. Dropping the execution future cancels it.
    async fn execute_candidate(&self, sql: &str, row_limit: usize) -> Outcome {
        match execute_limited(self.executor.as_ref(), sql, row_limit, self.config.execution_timeout).await {
            Ok(preview) => Outcome::Success(preview),
            Err(e) => Outcome::from_error(e.into()),
        }
    }

    async fn summarize(&self, question: &str, sql: &str, preview: &ResultPreview) -> String {
        let prompt = self.prompts.summary(question, sql, preview);
        match self
            .generator
            .generate(&prompt.user, &prompt.system, self.config.summary_temperature)
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => fallback_summary(preview),
            Err(e) => {
                warn!("Summary generation failed, using fallback: {}", e);
                fallback_summary(preview)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SchemaChunk;
    use crate::error::ExecutionError;
    use crate::feedback_db::FeedbackStore;
    use crate::policy::PolicyConfig;
    use crate::query_engine::step_stream::{StepStreams, StreamConfig};
    use crate::query_engine::types::QueryResponse;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const GOOD_SQL: &str = "SELECT product, SUM(revenue) AS total FROM sales GROUP BY product";
    const BAD_SQL: &str = "SELECT product, SUM(revenu) AS total FROM sales GROUP BY product";

    /// Returns queued replies in order for generation prompts and a fixed text for summaries.
    struct ScriptedGenerator {
        replies: Mutex<Vec<Result<String, GenerationError>>>,
        fallback: String,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(replies: Vec<Result<&str, &str>>, fallback: &str) -> Arc<Self> {
            let mut replies: Vec<_> = replies
                .into_iter()
                .map(|r| r.map(String::from).map_err(|e| GenerationError(e.to_string())))
                .collect();
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
                fallback: fallback.to_string(),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SqlGenerator for ScriptedGenerator {
        async fn generate(&self, prompt: &str, _system: &str, temperature: f32) -> Result<String, GenerationError> {
            if (temperature - 0.3).abs() < 1e-6 {
                return Ok("Widgets lead revenue.".to_string());
            }
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    /// Fails any query mentioning `revenu)`; counts calls.
    struct StubExecutor {
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl QueryExecutor for StubExecutor {
        async fn execute(&self, sql: &str, _row_limit: usize) -> Result<ResultPreview, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if sql.contains("revenu)") {
                return Err(ExecutionError::new("no such column: revenu"));
            }
            if sql.contains("panic_table") {
                panic!("executor exploded");
            }
            Ok(ResultPreview {
                columns: vec!["product".into(), "total".into()],
                rows: vec![vec![json!("widget"), json!(15.0)]],
                total_rows: 1,
                truncated: false,
            })
        }
    }

    struct StubRetriever;

    #[async_trait]
    impl SchemaRetriever for StubRetriever {
        async fn retrieve_schema(&self, _q: &str, _k: usize) -> anyhow::Result<Vec<SchemaChunk>> {
            Ok(vec![SchemaChunk {
                content: "CREATE TABLE sales (product TEXT, revenue REAL)".into(),
                score: 1.0,
                source: [("table".to_string(), "sales".to_string())].into_iter().collect(),
            }])
        }
    }

    struct Harness {
        orchestrator: QueryOrchestrator,
        executor: Arc<StubExecutor>,
        generator: Arc<ScriptedGenerator>,
        streams: Arc<StepStreams>,
        sessions: Arc<SessionStore>,
    }

    fn harness(generator: Arc<ScriptedGenerator>, delay: Option<Duration>, config: PipelineConfig) -> Harness {
        let executor = Arc::new(StubExecutor { calls: AtomicUsize::new(0), delay });
        let store = Arc::new(FeedbackStore::new_in_memory().unwrap());
        let policy = Arc::new(PolicyEngine::new(store, PolicyConfig::default()));
        let sessions = Arc::new(SessionStore::new());
        let orchestrator = QueryOrchestrator::new(
            generator.clone(),
            executor.clone(),
            Arc::new(StubRetriever),
            policy,
            ConversationMemory::default(),
            sessions.clone(),
            config,
        );
        Harness {
            orchestrator,
            executor,
            generator,
            streams: Arc::new(StepStreams::new(StreamConfig::default())),
            sessions,
        }
    }

    async fn run(h: &Harness, question: &str) -> (QueryResponse, Vec<StepKind>) {
        let ctx = RunContext { session_id: "s1".into(), message_id: uuid::Uuid::new_v4().to_string() };
        let events = h.streams.open(&ctx.message_id);
        let response = SharedResponse::new(QueryResponse::running(&ctx.session_id, &ctx.message_id));
        h.orchestrator.run(&QueryRequest::new(question), &ctx, &events, &response).await;
        let kinds = h
            .streams
            .subscribe(&ctx.message_id)
            .unwrap()
            .into_stream()
            .map(|e| e.kind)
            .collect()
            .await;
        (response.snapshot(), kinds)
    }

    #[test]
    fn test_transition_function() {
        let ok = Outcome::Success(ResultPreview::default());
        let retry = Outcome::Retryable(PipelineError::Internal("x".into()));
        let fatal = Outcome::Fatal(PipelineError::Validation("x".into()));
        assert_eq!(next_state(&ok, 3, 3), PipelineState::Succeeded);
        assert_eq!(next_state(&retry, 1, 3), PipelineState::Repairing);
        assert_eq!(next_state(&retry, 3, 3), PipelineState::Failed);
        assert_eq!(next_state(&fatal, 1, 3), PipelineState::Failed);
    }

    #[test]
    fn test_row_count_text_for_truncated_preview() {
        let full = ResultPreview { total_rows: 2, ..ResultPreview::default() };
        assert_eq!(row_count_text(&full, 1000), "Query returned 2 rows");
        let truncated = ResultPreview { total_rows: 1001, truncated: true, ..ResultPreview::default() };
        assert_eq!(row_count_text(&truncated, 1000), "Query returned more than 1000 rows");
    }

    #[tokio::test]
    async fn test_repair_then_success() {
        let generator = ScriptedGenerator::new(vec![Ok(BAD_SQL), Ok(GOOD_SQL)], GOOD_SQL);
        let h = harness(generator, None, PipelineConfig::default());
        let (response, kinds) = run(&h, "Show total revenue by product").await;

        assert_eq!(response.status, ResponseStatus::Completed);
        assert_eq!(response.sql.as_deref(), Some(GOOD_SQL));
        assert_eq!(response.attempts, 2);
        assert_eq!(response.summary.as_deref(), Some("Widgets lead revenue."));
        assert_eq!(kinds.iter().filter(|k| **k == StepKind::Repairing).count(), 1);
        assert_eq!(
            kinds,
            vec![
                StepKind::Started,
                StepKind::Retrieving,
                StepKind::Generating,
                StepKind::Executing,
                StepKind::Repairing,
                StepKind::Executing,
                StepKind::Succeeded,
                StepKind::Summarizing,
                StepKind::Done,
            ]
        );

        // The repair prompt carries the failed query and its error.
        let prompts = h.generator.prompts.lock().unwrap().clone();
        assert!(prompts[1].contains(BAD_SQL));
        assert!(prompts[1].contains("no such column: revenu"));

        assert_eq!(h.orchestrator.memory().len("s1"), 1);
        assert_eq!(h.sessions.get("s1").unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let generator = ScriptedGenerator::new(vec![], BAD_SQL);
        let h = harness(generator, None, PipelineConfig::default());
        let (response, kinds) = run(&h, "Show total revenue by product").await;

        assert_eq!(response.status, ResponseStatus::Failed);
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 3);
        let error = response.error.unwrap();
        assert_eq!(error.kind, "ExecutionError");
        assert!(error.message.starts_with("Query failed after 3 attempts"));
        assert!(error.message.contains("no such column: revenu"));
        assert_eq!(kinds.iter().filter(|k| **k == StepKind::Repairing).count(), 2);
        assert_eq!(kinds.last(), Some(&StepKind::Done));
        assert!(kinds.contains(&StepKind::Failed));
        assert!(!kinds.contains(&StepKind::Summarizing));
        assert_eq!(h.orchestrator.memory().len("s1"), 0);
    }

    #[tokio::test]
    async fn test_validation_error_is_fatal() {
        let generator = ScriptedGenerator::new(vec![Ok("DELETE FROM sales")], GOOD_SQL);
        let h = harness(generator, None, PipelineConfig::default());
        let (response, _) = run(&h, "remove everything").await;

        assert_eq!(response.status, ResponseStatus::Failed);
        assert_eq!(response.error.as_ref().unwrap().kind, "ValidationError");
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_generation_failure_counts_as_attempt() {
        let generator = ScriptedGenerator::new(vec![Err("provider down"), Ok(GOOD_SQL)], GOOD_SQL);
        let h = harness(generator, None, PipelineConfig::default());
        let (response, _) = run(&h, "Show total revenue by product").await;

        assert_eq!(response.status, ResponseStatus::Completed);
        assert_eq!(response.attempts, 2);
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let generator = ScriptedGenerator::new(vec![], GOOD_SQL);
        let config = PipelineConfig {
            execution_timeout: Duration::from_millis(20),
            max_attempts: 2,
            ..PipelineConfig::default()
        };
        let h = harness(generator, Some(Duration::from_secs(5)), config);
        let (response, _) = run(&h, "Show total revenue by product").await;

        assert_eq!(response.status, ResponseStatus::Failed);
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 2);
        assert!(response.error.unwrap().message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_panic_is_caught_and_done_emitted() {
        let generator = ScriptedGenerator::new(vec![Ok("SELECT * FROM panic_table")], GOOD_SQL);
        let h = harness(generator, None, PipelineConfig::default());
        let (response, kinds) = run(&h, "boom").await;

        assert_eq!(response.status, ResponseStatus::Failed);
        let error = response.error.unwrap();
        assert_eq!(error.kind, "Panic");
        assert!(error.message.contains("executor exploded"));
        assert_eq!(kinds.last(), Some(&StepKind::Done));
    }

    #[tokio::test]
    async fn test_history_feeds_follow_up_prompt() {
        let generator = ScriptedGenerator::new(vec![], GOOD_SQL);
        let h = harness(generator, None, PipelineConfig::default());
        run(&h, "Show total revenue by product").await;
        run(&h, "only for widgets").await;

        let prompts = h.generator.prompts.lock().unwrap().clone();
        assert!(!prompts[0].contains("Previous Question"));
        assert!(prompts[1].contains("Previous Question 1: Show total revenue by product"));
    }
}
