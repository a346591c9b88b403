//! HTTP handlers over the query service.

pub mod chat_api;
pub mod feedback_api;
pub mod policy_api;
pub mod stream_api;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use tracing::error;
use validator::Validate;

use crate::error::{PipelineError, ServiceError};
use crate::metrics;

pub use chat_api::{
    continue_session, delete_session, get_history, get_result, get_session, get_updates, submit_query,
};
pub use feedback_api::{analyze_feedback, clear_feedback, feedback_stats, policy_hints, submit_feedback};
pub use policy_api::{train_policy, training_summary};
pub use stream_api::stream_progress;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(json!({
                "error": self.message,
                "code": self.status.as_u16(),
            })),
        )
            .into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::NotFound(what) => Self::not_found(format!("{} not found", what)),
            ServiceError::InvalidRequest(message) => Self::bad_request(message),
            ServiceError::Pipeline(PipelineError::Validation(message)) => Self::bad_request(message),
            other => {
                error!("Request failed: {}", other);
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: other.to_string(),
                }
            }
        }
    }
}

/// Run the derived validation rules on a request body.
pub(crate) fn validate_body<T: Validate>(body: &T) -> Result<(), ApiError> {
    body.validate().map_err(|e| ApiError::bad_request(e.to_string()))
}

fn validate_id(kind: &str, id: &str) -> Result<(), ApiError> {
    if id.is_empty() {
        return Err(ApiError::bad_request(format!("{} cannot be empty", kind)));
    }
    if id.len() > 256 {
        return Err(ApiError::bad_request(format!("{} too long (max 256 chars)", kind)));
    }
    if !id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        return Err(ApiError::bad_request(format!("{} contains invalid characters", kind)));
    }
    Ok(())
}

pub(crate) fn validate_session_id(session_id: &str) -> Result<(), ApiError> {
    validate_id("Session ID", session_id)
}

pub(crate) fn validate_message_id(message_id: &str) -> Result<(), ApiError> {
    validate_id("Message ID", message_id)
}

/// Count the request under `route` with its final status code.
pub(crate) fn track<T>(route: &str, result: Result<T, ApiError>) -> Result<T, ApiError> {
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => e.status,
    };
    metrics::inc_request(route, status.as_str());
    result
}
