use axum::{extract::State, Json};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::info;
use validator::Validate;

use super::{track, validate_body, ApiError};
use crate::policy::{TrainingStep, TrainingSummary};
use crate::shared_state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct TrainRequest {
    #[validate(length(min = 1, max = 32))]
    pub questions: Vec<String>,
    /// Tables each question should touch, keyed by question text.
    #[serde(default)]
    pub expected_tables: HashMap<String, Vec<String>>,
}

/// POST /policy/train
pub async fn train_policy(
    State(state): State<AppState>,
    Json(req): Json<TrainRequest>,
) -> Result<Json<TrainingStep>, ApiError> {
    state.counters.inc_total_requests();
    if let Err(e) = validate_body(&req) {
        return track("/policy/train", Err(e));
    }
    let result = state
        .service
        .train(&req.questions, &req.expected_tables)
        .await
        .map(|step| {
            info!(
                "Training step {} finished: {} groups, avg reward {:.3}",
                step.step_number,
                step.groups.len(),
                step.avg_reward
            );
            Json(step)
        })
        .map_err(ApiError::from);
    track("/policy/train", result)
}

/// GET /policy/training
pub async fn training_summary(State(state): State<AppState>) -> Result<Json<TrainingSummary>, ApiError> {
    state.counters.inc_total_requests();
    let result = state.service.training_summary().map(Json).map_err(ApiError::from);
    track("/policy/training", result)
}
