//! Per-request progress channels.
//!
//! One producer (the orchestrator) and one consumer (the transport). Sends never block: when a
//! channel is full the event is dropped and counted. The consumer waits with a timeout and yields
//! a synthetic heartbeat instead of closing, and stops after the terminal `done` event.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Started,
    Retrieving,
    Generating,
    Executing,
    Repairing,
    Succeeded,
    Failed,
    Summarizing,
    Done,
    Heartbeat,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Retrieving => "retrieving",
            Self::Generating => "generating",
            Self::Executing => "executing",
            Self::Repairing => "repairing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Summarizing => "summarizing",
            Self::Done => "done",
            Self::Heartbeat => "heartbeat",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(kind: StepKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            details: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn heartbeat() -> Self {
        Self::new(StepKind::Heartbeat, "Still working...")
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub capacity: usize,
    pub heartbeat_interval: Duration,
    pub grace_period: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            heartbeat_interval: Duration::from_secs(30),
            grace_period: Duration::from_secs(60),
        }
    }
}

struct StepChannel {
    tx: mpsc::Sender<ProgressEvent>,
    rx: Mutex<mpsc::Receiver<ProgressEvent>>,
    dropped: AtomicU64,
    finished: AtomicBool,
}

impl StepChannel {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            dropped: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }
    }
}

/// Producer half handed to the orchestrator.
#[derive(Clone)]
pub struct StepSender {
    message_id: String,
    channel: Arc<StepChannel>,
}

impl StepSender {
    /// A sender with no registry behind it, for runs nobody streams.
    pub fn detached(capacity: usize) -> Self {
        Self {
            message_id: String::new(),
            channel: Arc::new(StepChannel::new(capacity)),
        }
    }

    /// Non-blocking send. Returns false if the event was dropped.
    pub fn emit(&self, event: ProgressEvent) -> bool {
        match self.channel.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.channel.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::inc_dropped_events();
                warn!(
                    "Progress channel full for {}, dropped {:?} event ({} dropped so far)",
                    self.message_id, event.kind, dropped
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Mark the stream complete; consumers stop once the buffer is drained.
    pub fn finish(&self) {
        self.channel.finished.store(true, Ordering::Release);
    }

    pub fn dropped(&self) -> u64 {
        self.channel.dropped.load(Ordering::Relaxed)
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

/// Consumer half.
pub struct StepSubscription {
    channel: Arc<StepChannel>,
    heartbeat_interval: Duration,
    done: bool,
}

impl StepSubscription {
    /// Next event, a heartbeat after `heartbeat_interval` of silence, or `None` once the
    /// terminal event has been delivered or the producer finished with nothing left to read.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        if self.done {
            return None;
        }
        let mut rx = self.channel.rx.lock().await;
        let event = match rx.try_recv() {
            Ok(event) => Some(event),
            Err(mpsc::error::TryRecvError::Disconnected) => None,
            Err(mpsc::error::TryRecvError::Empty) => {
                if self.channel.finished.load(Ordering::Acquire) {
                    None
                } else {
                    match tokio::time::timeout(self.heartbeat_interval, rx.recv()).await {
                        Ok(event) => event,
                        Err(_) => return Some(ProgressEvent::heartbeat()),
                    }
                }
            }
        };
        match event {
            Some(event) => {
                if event.kind.is_terminal() {
                    self.done = true;
                }
                Some(event)
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    pub fn into_stream(mut self) -> impl Stream<Item = ProgressEvent> {
        async_stream::stream! {
            while let Some(event) = self.next_event().await {
                yield event;
            }
        }
    }
}

/// Registry of live channels keyed by message id.
pub struct StepStreams {
    channels: DashMap<String, Arc<StepChannel>>,
    config: StreamConfig,
}

impl StepStreams {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            channels: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn open(&self, message_id: &str) -> StepSender {
        let channel = Arc::new(StepChannel::new(self.config.capacity));
        self.channels.insert(message_id.to_string(), channel.clone());
        debug!("Opened progress channel for {}", message_id);
        StepSender {
            message_id: message_id.to_string(),
            channel,
        }
    }

    pub fn subscribe(&self, message_id: &str) -> Option<StepSubscription> {
        self.channels.get(message_id).map(|channel| StepSubscription {
            channel: channel.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
            done: false,
        })
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.channels.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn release(&self, message_id: &str) {
        if self.channels.remove(message_id).is_some() {
            debug!("Released progress channel for {}", message_id);
        }
    }

    /// Discard the channel after the grace period so a slow consumer can finish draining.
    pub fn schedule_release(self: &Arc<Self>, message_id: &str) {
        let streams = Arc::clone(self);
        let message_id = message_id.to_string();
        let grace = self.config.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            streams.release(&message_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn streams(capacity: usize, heartbeat_ms: u64, grace_ms: u64) -> Arc<StepStreams> {
        Arc::new(StepStreams::new(StreamConfig {
            capacity,
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            grace_period: Duration::from_millis(grace_ms),
        }))
    }

    #[tokio::test]
    async fn test_events_arrive_in_order_and_stop_at_done() {
        let registry = streams(10, 1_000, 1_000);
        let tx = registry.open("m1");
        tx.emit(ProgressEvent::new(StepKind::Started, "start"));
        tx.emit(ProgressEvent::new(StepKind::Executing, "run"));
        tx.emit(ProgressEvent::new(StepKind::Done, "done"));

        let events: Vec<StepKind> = registry
            .subscribe("m1")
            .unwrap()
            .into_stream()
            .map(|e| e.kind)
            .collect()
            .await;
        assert_eq!(events, vec![StepKind::Started, StepKind::Executing, StepKind::Done]);
    }

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let registry = streams(2, 1_000, 1_000);
        let tx = registry.open("m1");
        assert!(tx.emit(ProgressEvent::new(StepKind::Started, "1")));
        assert!(tx.emit(ProgressEvent::new(StepKind::Retrieving, "2")));
        assert!(!tx.emit(ProgressEvent::new(StepKind::Generating, "3")));
        assert!(!tx.emit(ProgressEvent::new(StepKind::Executing, "4")));
        assert_eq!(tx.dropped(), 2);

        // the buffered events survive the overflow
        let mut sub = registry.subscribe("m1").unwrap();
        assert_eq!(tokio_test::block_on(sub.next_event()).unwrap().kind, StepKind::Started);
        assert_eq!(tokio_test::block_on(sub.next_event()).unwrap().kind, StepKind::Retrieving);
    }

    #[tokio::test]
    async fn test_heartbeat_on_silence() {
        let registry = streams(4, 20, 1_000);
        let _tx = registry.open("m1");
        let mut sub = registry.subscribe("m1").unwrap();
        let event = sub.next_event().await.unwrap();
        assert_eq!(event.kind, StepKind::Heartbeat);
        assert!(registry.contains("m1"));
    }

    #[tokio::test]
    async fn test_finished_producer_ends_late_subscriber() {
        let registry = streams(4, 5_000, 1_000);
        let tx = registry.open("m1");
        tx.emit(ProgressEvent::new(StepKind::Failed, "x"));
        tx.finish();
        let mut sub = registry.subscribe("m1").unwrap();
        assert_eq!(sub.next_event().await.unwrap().kind, StepKind::Failed);
        let ended = tokio::time::timeout(Duration::from_millis(500), sub.next_event()).await;
        assert_eq!(ended.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_message_has_no_subscription() {
        let registry = streams(4, 20, 20);
        assert!(registry.subscribe("missing").is_none());
    }

    #[tokio::test]
    async fn test_release_after_grace_period() {
        let registry = streams(4, 20, 30);
        registry.open("m1");
        registry.schedule_release("m1");
        assert!(registry.contains("m1"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!registry.contains("m1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = ProgressEvent::new(StepKind::Repairing, "Retry 1/3")
            .with_details(serde_json::json!({"attempt": 2}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "repairing");
        assert_eq!(value["details"]["attempt"], 2);
        let bare = serde_json::to_value(ProgressEvent::new(StepKind::Done, "x")).unwrap();
        assert!(bare.get("details").is_none());
    }
}
