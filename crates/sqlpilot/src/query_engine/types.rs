//! Request, response and session types shared by the orchestrator, the service and the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

use super::step_stream::StepKind;
use crate::backends::ResultPreview;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualizationMode {
    #[default]
    Auto,
    TableOnly,
    ChartOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub max_rows: Option<usize>,
    pub visualization_mode: VisualizationMode,
    pub allow_advanced_charts: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_rows: None,
            visualization_mode: VisualizationMode::Auto,
            allow_advanced_charts: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub options: QueryOptions,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            session_id: None,
            options: QueryOptions::default(),
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Running,
    Completed,
    Failed,
}

impl ResponseStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub session_id: String,
    pub message_id: String,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_preview: Option<ResultPreview>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<StepKind>,
}

impl QueryResponse {
    pub fn running(session_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: message_id.into(),
            status: ResponseStatus::Running,
            sql: None,
            result_preview: None,
            summary: None,
            error: None,
            elapsed_ms: None,
            attempts: 0,
            current_step: None,
        }
    }

    /// Coarse completion estimate for pollers.
    pub fn progress_percent(&self) -> u8 {
        match self.status {
            ResponseStatus::Completed | ResponseStatus::Failed => 100,
            ResponseStatus::Running if self.result_preview.is_some() => 75,
            ResponseStatus::Running if self.sql.is_some() => 50,
            ResponseStatus::Running => 25,
        }
    }
}

/// A Response that is mutated in place while its request runs and frozen afterwards.
#[derive(Debug, Clone)]
pub struct SharedResponse(Arc<RwLock<QueryResponse>>);

impl SharedResponse {
    pub fn new(response: QueryResponse) -> Self {
        Self(Arc::new(RwLock::new(response)))
    }

    pub fn snapshot(&self) -> QueryResponse {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Apply `f` unless the response already left `running`.
    pub fn update(&self, f: impl FnOnce(&mut QueryResponse)) -> bool {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        if guard.status.is_terminal() {
            return false;
        }
        f(&mut guard);
        true
    }
}

/// Returned by `submit` before any work has happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAccepted {
    pub session_id: String,
    pub message_id: String,
    pub status: ResponseStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub session_id: String,
    pub message_id: String,
    pub status: ResponseStatus,
    pub partial_sql: Option<String>,
    pub partial_summary: Option<String>,
    pub current_step: Option<StepKind>,
    pub progress_percent: u8,
}

impl From<&QueryResponse> for UpdateInfo {
    fn from(r: &QueryResponse) -> Self {
        Self {
            session_id: r.session_id.clone(),
            message_id: r.message_id.clone(),
            status: r.status,
            partial_sql: r.sql.clone(),
            partial_summary: r.summary.clone(),
            current_step: r.current_step,
            progress_percent: r.progress_percent(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<QueryResponse>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            response: None,
        }
    }

    pub fn assistant(response: QueryResponse) -> Self {
        Self {
            id: response.message_id.clone(),
            role: Role::Assistant,
            content: response.summary.clone().unwrap_or_default(),
            timestamp: Utc::now(),
            response: Some(response),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: None,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    pub fn last_question(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub last_question: Option<String>,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            title: s.title.clone(),
            created_at: s.created_at,
            updated_at: s.updated_at,
            message_count: s.messages.len(),
            last_question: s.last_question().map(String::from),
        }
    }
}
