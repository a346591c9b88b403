//! Feedback submission and policy inspection endpoints.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use super::{track, validate_body, validate_message_id, validate_session_id, ApiError};
use crate::feedback_db::{FeedbackStats, PolicyHint, Polarity};
use crate::query_engine::{FeedbackAck, FeedbackSubmission};
use crate::shared_state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct FeedbackRequest {
    #[validate(length(min = 1, max = 256))]
    pub message_id: String,
    #[validate(length(min = 1, max = 256))]
    pub session_id: String,
    pub feedback: Polarity,
    #[validate(length(max = 2000))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HintsParams {
    /// Comma-separated table names; empty selects general hints only.
    #[serde(default)]
    pub tables: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HintsResponse {
    pub hints: Vec<PolicyHint>,
    pub formatted: String,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub hints_updated: usize,
}

/// POST /feedback/submit
pub async fn submit_feedback(
    State(state): State<AppState>,
    Json(req): Json<FeedbackRequest>,
) -> Result<Json<FeedbackAck>, ApiError> {
    state.counters.inc_total_requests();
    let result = (|| -> Result<_, ApiError> {
        validate_body(&req)?;
        validate_message_id(&req.message_id)?;
        validate_session_id(&req.session_id)?;
        let ack = state.service.submit_feedback(FeedbackSubmission {
            message_id: req.message_id,
            session_id: req.session_id,
            polarity: req.feedback,
            reason: req.reason.filter(|r| !r.trim().is_empty()),
        })?;
        let n = state.counters.inc_feedback_received();
        info!("Feedback #{} recorded for message {}", n, ack.message_id);
        Ok(Json(ack))
    })();
    track("/feedback/submit", result)
}

/// GET /feedback/stats
pub async fn feedback_stats(State(state): State<AppState>) -> Result<Json<FeedbackStats>, ApiError> {
    state.counters.inc_total_requests();
    let result = state.service.feedback_stats().map(Json).map_err(ApiError::from);
    track("/feedback/stats", result)
}

/// GET /feedback/policy-hints
pub async fn policy_hints(
    State(state): State<AppState>,
    Query(params): Query<HintsParams>,
) -> Result<Json<HintsResponse>, ApiError> {
    state.counters.inc_total_requests();
    let tables: Vec<String> = params
        .tables
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect();
    let result = state
        .service
        .policy_hints(&tables)
        .map(|hints| {
            let formatted = crate::policy::PolicyEngine::format_hints_for_prompt(&hints);
            Json(HintsResponse { hints, formatted })
        })
        .map_err(ApiError::from);
    track("/feedback/policy-hints", result)
}

/// POST /feedback/analyze
pub async fn analyze_feedback(State(state): State<AppState>) -> Result<Json<AnalyzeResponse>, ApiError> {
    state.counters.inc_total_requests();
    let result = state
        .service
        .analyze_policies()
        .map(|hints_updated| Json(AnalyzeResponse { hints_updated }))
        .map_err(ApiError::from);
    track("/feedback/analyze", result)
}

/// DELETE /feedback/clear
pub async fn clear_feedback(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.counters.inc_total_requests();
    let result = state
        .service
        .clear_feedback()
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(ApiError::from);
    track("/feedback/clear", result)
}
