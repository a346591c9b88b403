//! Server-sent progress events for a running request.
//!
//! Each ProgressEvent becomes one SSE event named after its kind with the event JSON as data.
//! The stream ends after `done`; heartbeats come from the subscription itself.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, warn};

use super::{track, validate_message_id, ApiError};
use crate::query_engine::ProgressEvent;
use crate::shared_state::AppState;

fn to_sse(event: ProgressEvent) -> Event {
    match Event::default().event(event.kind.as_str()).json_data(&event) {
        Ok(sse) => sse,
        Err(e) => {
            warn!("Failed to encode progress event: {}", e);
            Event::default()
                .event(event.kind.as_str())
                .data(event.description)
        }
    }
}

/// GET /chat/stream/:message_id
pub async fn stream_progress(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.counters.inc_total_requests();
    let subscription = track(
        "/chat/stream",
        validate_message_id(&message_id).and_then(|_| {
            state
                .service
                .stream(&message_id)
                .ok_or_else(|| ApiError::not_found(format!("no progress stream for message {}", message_id)))
        }),
    )?;

    let n = state.counters.inc_stream_subscriptions();
    debug!("Stream subscription #{} for message {}", n, message_id);

    let events = subscription.into_stream().map(|event| Ok::<_, Infallible>(to_sse(event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
