//! Operations exposed to the transport: submit, stream, poll, feedback and session management.

use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::orchestrator::{PipelineConfig, QueryOrchestrator, RunContext};
use super::sessions::SessionStore;
use super::step_stream::{StepStreams, StepSubscription, StreamConfig};
use super::types::{
    QueryAccepted, QueryRequest, QueryResponse, ResponseStatus, Role, Session, SessionSummary, SharedResponse,
    UpdateInfo,
};
use crate::backends::{QueryExecutor, SchemaRetriever, SqlGenerator};
use crate::error::{PipelineError, ServiceError};
use crate::feedback_db::{FeedbackStats, FeedbackStore, PolicyHint, Polarity};
use crate::memory::ConversationMemory;
use crate::metrics;
use crate::policy::{
    FeedbackEvent, GroupConfig, GroupTrainer, PolicyConfig, PolicyEngine, RewardScorer, RewardWeights, TrainingStep,
    TrainingSummary,
};

const MAX_QUESTION_CHARS: usize = 4_000;
const MAX_CACHED_RESPONSES: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub pipeline: PipelineConfig,
    pub stream: StreamConfig,
    pub policy: PolicyConfig,
    pub group: GroupConfig,
    pub reward_weights: RewardWeights,
    pub response_ttl: Duration,
    pub memory_window: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            stream: StreamConfig::default(),
            policy: PolicyConfig::default(),
            group: GroupConfig::default(),
            reward_weights: RewardWeights::default(),
            response_ttl: Duration::from_secs(86_400),
            memory_window: crate::memory::DEFAULT_WINDOW_SIZE,
        }
    }
}

/// The external systems the service drives.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn SqlGenerator>,
    pub executor: Arc<dyn QueryExecutor>,
    pub retriever: Arc<dyn SchemaRetriever>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSubmission {
    pub message_id: String,
    pub session_id: String,
    pub polarity: Polarity,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackAck {
    pub feedback_id: String,
    pub message_id: String,
    pub polarity: Polarity,
    pub status: String,
}

pub struct QueryService {
    orchestrator: Arc<QueryOrchestrator>,
    streams: Arc<StepStreams>,
    responses: Cache<String, SharedResponse>,
    sessions: Arc<SessionStore>,
    memory: ConversationMemory,
    policy: Arc<PolicyEngine>,
    trainer: Arc<GroupTrainer>,
}

impl QueryService {
    pub fn new(collaborators: Collaborators, store: Arc<FeedbackStore>, config: ServiceConfig) -> Self {
        let policy = Arc::new(PolicyEngine::new(store, config.policy.clone()));
        let memory = ConversationMemory::new(config.memory_window);
        let sessions = Arc::new(SessionStore::new());

        let orchestrator = Arc::new(QueryOrchestrator::new(
            collaborators.generator.clone(),
            collaborators.executor.clone(),
            collaborators.retriever.clone(),
            policy.clone(),
            memory.clone(),
            sessions.clone(),
            config.pipeline.clone(),
        ));
        let trainer = Arc::new(GroupTrainer::new(
            collaborators.generator,
            collaborators.executor,
            collaborators.retriever,
            policy.clone(),
            RewardScorer::new(config.reward_weights),
            config.group.clone(),
        ));

        Self {
            orchestrator,
            streams: Arc::new(StepStreams::new(config.stream.clone())),
            responses: Cache::builder()
                .max_capacity(MAX_CACHED_RESPONSES)
                .time_to_idle(config.response_ttl)
                .build(),
            sessions,
            memory,
            policy,
            trainer,
        }
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub fn trainer(&self) -> &Arc<GroupTrainer> {
        &self.trainer
    }

    pub fn streams(&self) -> &Arc<StepStreams> {
        &self.streams
    }

    /// Start a request in the background and return its ids immediately.
    pub fn submit(&self, request: QueryRequest) -> Result<QueryAccepted, ServiceError> {
        let (accepted, _) = self.spawn_query(request)?;
        Ok(accepted)
    }

    fn spawn_query(&self, mut request: QueryRequest) -> Result<(QueryAccepted, JoinHandle<()>), ServiceError> {
        let question = request.question.trim();
        if question.is_empty() {
            return Err(ServiceError::InvalidRequest("question must not be empty".to_string()));
        }
        if question.chars().count() > MAX_QUESTION_CHARS {
            return Err(ServiceError::InvalidRequest(format!(
                "question too long (max {} chars)",
                MAX_QUESTION_CHARS
            )));
        }

        let session_id = request
            .session_id
            .take()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let message_id = uuid::Uuid::new_v4().to_string();
        request.session_id = Some(session_id.clone());

        let response = SharedResponse::new(QueryResponse::running(&session_id, &message_id));
        self.responses.insert(message_id.clone(), response.clone());
        let events = self.streams.open(&message_id);
        info!("Accepted query {} in session {}", message_id, session_id);

        let ctx = RunContext { session_id: session_id.clone(), message_id: message_id.clone() };
        let orchestrator = self.orchestrator.clone();
        let streams = self.streams.clone();
        let handle = tokio::spawn(async move {
            orchestrator.run(&request, &ctx, &events, &response).await;
            streams.schedule_release(&ctx.message_id);
        });

        Ok((
            QueryAccepted { session_id, message_id, status: ResponseStatus::Running },
            handle,
        ))
    }

    /// Progress events of a request; `None` once the channel has been released.
    pub fn stream(&self, message_id: &str) -> Option<StepSubscription> {
        self.streams.subscribe(message_id)
    }

    pub fn poll(&self, message_id: &str) -> Option<QueryResponse> {
        self.responses.get(message_id).map(|r| r.snapshot())
    }

    pub fn update(&self, message_id: &str) -> Option<UpdateInfo> {
        self.poll(message_id).map(|r| UpdateInfo::from(&r))
    }

    /// Requests still running, optionally limited to one session.
    pub fn updates(&self, session_id: Option<&str>) -> Vec<UpdateInfo> {
        self.responses
            .iter()
            .map(|(_, shared)| shared.snapshot())
            .filter(|r| r.status == ResponseStatus::Running)
            .filter(|r| session_id.map_or(true, |id| r.session_id == id))
            .map(|r| UpdateInfo::from(&r))
            .collect()
    }

    pub fn submit_feedback(&self, submission: FeedbackSubmission) -> Result<FeedbackAck, ServiceError> {
        let (question, sql) = self.resolve_rated_message(&submission.session_id, &submission.message_id)?;
        let polarity = submission.polarity;
        let record = self.policy.record_feedback(FeedbackEvent {
            message_id: submission.message_id,
            session_id: submission.session_id,
            question,
            sql,
            polarity,
            reason: submission.reason,
        })?;
        metrics::inc_feedback(polarity.as_str());

        Ok(FeedbackAck {
            feedback_id: record.id,
            message_id: record.message_id,
            polarity,
            status: "recorded".to_string(),
        })
    }

    /// Question and generated query of an answered message.
    fn resolve_rated_message(&self, session_id: &str, message_id: &str) -> Result<(String, String), ServiceError> {
        let from_session = self.sessions.get(session_id).and_then(|session| {
            let sql = session
                .messages
                .iter()
                .find(|m| m.id == message_id && m.role == Role::Assistant)
                .and_then(|m| m.response.as_ref())
                .map(|r| r.sql.clone())?;
            Some(sql)
        });

        let sql = match from_session {
            Some(sql) => sql,
            None => match self.poll(message_id) {
                Some(response) if response.session_id == session_id => response.sql,
                _ => return Err(ServiceError::NotFound(format!("message {}", message_id))),
            },
        };
        let sql = sql.ok_or_else(|| {
            ServiceError::InvalidRequest(format!("message {} has no generated query", message_id))
        })?;
        let question = self
            .sessions
            .question_for_message(session_id, message_id)
            .unwrap_or_default();
        Ok((question, sql))
    }

    pub fn list_sessions(&self, limit: usize, offset: usize) -> Vec<SessionSummary> {
        self.sessions.list(limit, offset)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id)
    }

    /// Remove a session together with its conversation window.
    pub fn delete_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove_with(session_id, || self.memory.clear_session(session_id));
        if removed {
            info!("Deleted session {}", session_id);
        }
        removed
    }

    /// Run a follow-up question in an existing session and wait for its final Response.
    pub async fn continue_session(&self, session_id: &str, request: QueryRequest) -> Result<QueryResponse, ServiceError> {
        if !self.sessions.contains(session_id) {
            return Err(ServiceError::NotFound(format!("session {}", session_id)));
        }
        let (accepted, handle) = self.spawn_query(request.in_session(session_id))?;
        if let Err(e) = handle.await {
            warn!("Query task for {} ended abnormally: {}", accepted.message_id, e);
        }
        self.poll(&accepted.message_id)
            .ok_or_else(|| PipelineError::Internal(format!("response {} was evicted", accepted.message_id)).into())
    }

    pub fn feedback_stats(&self) -> Result<FeedbackStats, ServiceError> {
        Ok(self.policy.feedback_stats()?)
    }

    /// Hints that would be injected for the given tables (all general hints when empty).
    pub fn policy_hints(&self, tables: &[String]) -> Result<Vec<PolicyHint>, ServiceError> {
        let min_weight = self.policy.config().min_hint_weight;
        Ok(self.policy.store().hints_for_context(tables, min_weight)?)
    }

    pub fn analyze_policies(&self) -> Result<usize, ServiceError> {
        Ok(self.policy.analyze_and_update_policies()?)
    }

    pub fn clear_feedback(&self) -> Result<(), ServiceError> {
        warn!("Clearing all feedback and policy state");
        Ok(self.policy.store().clear_all()?)
    }

    /// One group scoring pass over `questions`; results are folded into the policy.
    pub async fn train(
        &self,
        questions: &[String],
        expected_tables: &HashMap<String, Vec<String>>,
    ) -> Result<TrainingStep, ServiceError> {
        if questions.iter().all(|q| q.trim().is_empty()) {
            return Err(ServiceError::InvalidRequest("at least one question is required".to_string()));
        }
        Ok(self.trainer.run_step(questions, expected_tables).await?)
    }

    pub fn training_summary(&self) -> Result<TrainingSummary, ServiceError> {
        Ok(self.trainer.summary()?)
    }
}
