//! Server start-up and router assembly.

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::{api, config::Config, shared_state::AppState};

/// Run the HTTP server until it fails.
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let state = AppState::from_config(&cfg)?;
    let addr = cfg.api_addr()?;

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, build_router(state)).await?;

    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/chat/query", post(api::submit_query))
        .route("/chat/stream/:message_id", get(api::stream_progress))
        .route("/chat/result/:message_id", get(api::get_result))
        .route("/chat/updates", get(api::get_updates))
        .route("/chat/history", get(api::get_history))
        .route("/chat/session/:id", get(api::get_session).delete(api::delete_session))
        .route("/chat/session/:id/continue", post(api::continue_session))
        .route("/feedback/submit", post(api::submit_feedback))
        .route("/feedback/stats", get(api::feedback_stats))
        .route("/feedback/policy-hints", get(api::policy_hints))
        .route("/feedback/analyze", post(api::analyze_feedback))
        .route("/feedback/clear", delete(api::clear_feedback))
        .route("/policy/train", post(api::train_policy))
        .route("/policy/training", get(api::training_summary))
        .route("/metrics", get(crate::metrics::get_metrics))
        .route("/healthz", get(|| async { "OK" }))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(600)))
        .with_state(state)
}
