//! State handed to every HTTP handler.
//!
//! Handlers reach the query service through an `Arc`; nothing here is behind a network hop.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tracing::info;

use crate::backends::{HttpGenerator, SqliteSource};
use crate::config::Config;
use crate::feedback_db::FeedbackStore;
use crate::query_engine::{Collaborators, QueryService, ServiceConfig};

/// Atomic counters for request accounting
#[derive(Debug, Default)]
pub struct AtomicCounters {
    pub total_requests: AtomicUsize,
    pub queries_submitted: AtomicUsize,
    pub feedback_received: AtomicUsize,
    pub stream_subscriptions: AtomicUsize,
}

impl AtomicCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_total_requests(&self) -> usize {
        self.total_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_queries_submitted(&self) -> usize {
        self.queries_submitted.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_feedback_received(&self) -> usize {
        self.feedback_received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_stream_subscriptions(&self) -> usize {
        self.stream_subscriptions.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Unified application state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<QueryService>,
    pub counters: Arc<AtomicCounters>,
}

impl AppState {
    pub fn new(service: Arc<QueryService>) -> Self {
        Self {
            service,
            counters: Arc::new(AtomicCounters::new()),
        }
    }

    /// Wire the default collaborators: the HTTP generator and the SQLite warehouse.
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        info!("Initializing application state");

        let generator = Arc::new(HttpGenerator::new(cfg.llm_client_config())?);
        let source = Arc::new(SqliteSource::open_read_only(&cfg.data_db_path)?);
        let store = Arc::new(FeedbackStore::new(&cfg.store_db_path)?);

        let collaborators = Collaborators {
            generator,
            executor: source.clone(),
            retriever: source,
        };
        Ok(Self::with_collaborators(collaborators, store, cfg.service_config()))
    }

    pub fn with_collaborators(collaborators: Collaborators, store: Arc<FeedbackStore>, config: ServiceConfig) -> Self {
        Self::new(Arc::new(QueryService::new(collaborators, store, config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero_and_increment() {
        let counters = AtomicCounters::new();
        assert_eq!(counters.inc_total_requests(), 1);
        assert_eq!(counters.inc_total_requests(), 2);
        assert_eq!(counters.inc_feedback_received(), 1);
        assert_eq!(counters.queries_submitted.load(Ordering::Relaxed), 0);
    }
}
