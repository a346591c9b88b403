//! Query submission, polling and session management endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use super::{track, validate_body, validate_message_id, validate_session_id, ApiError};
use crate::query_engine::{
    QueryAccepted, QueryOptions, QueryRequest, QueryResponse, Session, SessionSummary, UpdateInfo,
};
use crate::shared_state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct ChatQueryRequest {
    #[validate(length(min = 1, max = 4000))]
    pub question: String,
    #[validate(length(min = 1, max = 256))]
    pub session_id: Option<String>,
    #[serde(default)]
    pub options: QueryOptions,
}

impl From<ChatQueryRequest> for QueryRequest {
    fn from(req: ChatQueryRequest) -> Self {
        Self {
            question: req.question,
            session_id: req.session_id,
            options: req.options,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ContinueRequest {
    #[validate(length(min = 1, max = 4000))]
    pub question: String,
    #[serde(default)]
    pub options: QueryOptions,
}

#[derive(Debug, Deserialize)]
pub struct UpdatesParams {
    pub session_id: Option<String>,
    pub message_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UpdatesResponse {
    pub updates: Vec<UpdateInfo>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub sessions: Vec<SessionSummary>,
}

/// POST /chat/query
pub async fn submit_query(
    State(state): State<AppState>,
    Json(req): Json<ChatQueryRequest>,
) -> Result<(StatusCode, Json<QueryAccepted>), ApiError> {
    let request_num = state.counters.inc_total_requests();
    let result = (|| -> Result<_, ApiError> {
        validate_body(&req)?;
        if let Some(ref id) = req.session_id {
            validate_session_id(id)?;
        }
        let accepted = state.service.submit(req.into())?;
        state.counters.inc_queries_submitted();
        info!("Query request #{} accepted as {}", request_num, accepted.message_id);
        Ok((StatusCode::ACCEPTED, Json(accepted)))
    })();
    track("/chat/query", result)
}

/// GET /chat/result/:message_id
pub async fn get_result(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Result<Json<QueryResponse>, ApiError> {
    state.counters.inc_total_requests();
    let result = validate_message_id(&message_id).and_then(|_| {
        state
            .service
            .poll(&message_id)
            .map(Json)
            .ok_or_else(|| ApiError::not_found(format!("message {} not found", message_id)))
    });
    track("/chat/result", result)
}

/// GET /chat/updates
pub async fn get_updates(
    State(state): State<AppState>,
    Query(params): Query<UpdatesParams>,
) -> Result<Json<UpdatesResponse>, ApiError> {
    state.counters.inc_total_requests();
    let updates = match params.message_id {
        Some(ref message_id) => state.service.update(message_id).into_iter().collect(),
        None => state.service.updates(params.session_id.as_deref()),
    };
    track("/chat/updates", Ok(Json(UpdatesResponse { updates })))
}

/// GET /chat/history
pub async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    state.counters.inc_total_requests();
    let limit = params.limit.clamp(1, 500);
    let sessions = state.service.list_sessions(limit, params.offset);
    track("/chat/history", Ok(Json(HistoryResponse { sessions })))
}

/// GET /chat/session/:id
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state.counters.inc_total_requests();
    let result = validate_session_id(&session_id).and_then(|_| {
        state
            .service
            .get_session(&session_id)
            .map(Json)
            .ok_or_else(|| ApiError::not_found(format!("session {} not found", session_id)))
    });
    track("/chat/session", result)
}

/// DELETE /chat/session/:id
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.counters.inc_total_requests();
    let result = validate_session_id(&session_id).and_then(|_| {
        if state.service.delete_session(&session_id) {
            Ok(StatusCode::NO_CONTENT)
        } else {
            Err(ApiError::not_found(format!("session {} not found", session_id)))
        }
    });
    track("/chat/session", result)
}

/// POST /chat/session/:id/continue; waits for the follow-up to finish.
pub async fn continue_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<ContinueRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    state.counters.inc_total_requests();
    if let Err(e) = validate_session_id(&session_id).and_then(|_| validate_body(&req)) {
        return track("/chat/session/continue", Err(e));
    }
    let request = QueryRequest {
        question: req.question,
        session_id: None,
        options: req.options,
    };
    let result = state
        .service
        .continue_session(&session_id, request)
        .await
        .map(Json)
        .map_err(ApiError::from);
    track("/chat/session/continue", result)
}
