// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! mlld-stream
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Built-in sinks: terminal, progress, collector.
pub mod sink;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

pub use sink::{CollectorSink, ProgressSink, StreamSink, StreamingResult, TerminalSink};

/// Default channel capacity for the stream bus.
const DEFAULT_CAPACITY: usize = 256;

// ── Events ──────────────────────────────────────────────────────────────

/// A streaming event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A run began.
    Start {
        /// Run identifier.
        run_id: Uuid,
    },
    /// A piece of output became available.
    Chunk {
        /// The content.
        content: String,
        /// Stage index the chunk came from, when inside a pipeline.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<usize>,
    },
    /// A pipeline stage began an attempt.
    Stage {
        /// Zero-based stage index.
        index: usize,
        /// Stage name (`@fn` or a builtin).
        name: String,
        /// 1-based attempt counter.
        attempt: u32,
    },
    /// A stage requested a retry.
    Retry {
        /// Zero-based stage index.
        stage: usize,
        /// The attempt that requested the retry.
        attempt: u32,
        /// The hint attached to the next attempt, when any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<serde_json::Value>,
    },
    /// A `show`/`log`/`output` effect fired.
    Effect {
        /// Destination (`stdout`, `stderr`, `both`, `file`).
        kind: String,
        /// Rendered content.
        content: String,
    },
    /// The run finished.
    Stop {
        /// Run identifier.
        run_id: Uuid,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
    },
    /// The run failed.
    Error {
        /// Catalog code (`MLD-X###`).
        code: String,
        /// Rendered diagnostic.
        message: String,
    },
}

impl StreamEvent {
    /// Critical events must never be dropped by a lagging sink.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Stop { .. } | Self::Error { .. })
    }
}

/// An event plus its free-form metadata, as published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Envelope {
    /// The event payload.
    #[serde(flatten)]
    pub event: StreamEvent,
    /// Publisher-attached metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl Envelope {
    /// Envelope with no metadata.
    #[must_use]
    pub fn new(event: StreamEvent) -> Self {
        Self {
            event,
            meta: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry (builder).
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }
}

// ── StreamBus ───────────────────────────────────────────────────────────

/// Shared statistics counters for a [`StreamBus`].
#[derive(Debug, Default)]
struct StatsInner {
    total_published: AtomicU64,
    dropped_events: AtomicU64,
}

/// Broadcast bus distributing [`Envelope`]s to any number of sinks.
pub struct StreamBus {
    tx: broadcast::Sender<Envelope>,
    stats: Arc<StatsInner>,
}

impl StreamBus {
    /// Bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus with an explicit channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Subscribe to future events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Publish an event with no metadata.
    pub fn publish(&self, event: StreamEvent) {
        self.publish_envelope(Envelope::new(event));
    }

    /// Publish a full envelope.
    ///
    /// With no subscribers the envelope is dropped and counted.
    pub fn publish_envelope(&self, envelope: Envelope) {
        self.stats.total_published.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(envelope).is_err() {
            self.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Snapshot of bus statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            total_published: self.stats.total_published.load(Ordering::Relaxed),
            active_subscribers: self.tx.receiver_count(),
            dropped_events: self.stats.dropped_events.load(Ordering::Relaxed),
        }
    }
}

impl Default for StreamBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of [`StreamBus`] statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusStats {
    /// Events published since creation.
    pub total_published: u64,
    /// Subscribers currently listening.
    pub active_subscribers: usize,
    /// Events lost to lag or absent subscribers.
    pub dropped_events: u64,
}

// ── Subscription ────────────────────────────────────────────────────────

/// A handle receiving envelopes from a [`StreamBus`].
pub struct Subscription {
    rx: broadcast::Receiver<Envelope>,
    stats: Arc<StatsInner>,
}

impl Subscription {
    /// Receive the next envelope, waiting asynchronously.
    ///
    /// Lagged (overwritten) events are counted and skipped; backpressure
    /// is cooperative per the streaming contract. Returns `None` when the bus
    /// is dropped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.dropped_events.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain this subscription into the given sinks until the bus closes or
    /// a `stop` event arrives. Critical events reach every sink.
    pub async fn pump(mut self, sinks: &[Arc<dyn StreamSink>]) {
        while let Some(envelope) = self.recv().await {
            let stop = matches!(envelope.event, StreamEvent::Stop { .. });
            for sink in sinks {
                sink.accept(&envelope);
            }
            if stop {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = StreamBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let run_id = Uuid::new_v4();
        bus.publish(StreamEvent::Start { run_id });
        assert_eq!(a.recv().await.unwrap().event, StreamEvent::Start { run_id });
        assert_eq!(b.recv().await.unwrap().event, StreamEvent::Start { run_id });
    }

    #[tokio::test]
    async fn publishing_without_subscribers_counts_drops() {
        let bus = StreamBus::new();
        bus.publish(StreamEvent::Chunk {
            content: "x".into(),
            stage: None,
        });
        let stats = bus.stats();
        assert_eq!(stats.total_published, 1);
        assert_eq!(stats.dropped_events, 1);
    }

    #[tokio::test]
    async fn pump_stops_on_stop_event() {
        let bus = StreamBus::new();
        let sub = bus.subscribe();
        let collector = Arc::new(CollectorSink::new());
        let sinks: Vec<Arc<dyn StreamSink>> = vec![collector.clone()];

        let run_id = Uuid::new_v4();
        bus.publish(StreamEvent::Start { run_id });
        bus.publish(StreamEvent::Chunk {
            content: "hello".into(),
            stage: Some(0),
        });
        bus.publish(StreamEvent::Stop {
            run_id,
            duration_ms: 5,
        });

        sub.pump(&sinks).await;
        let result = collector.result();
        assert_eq!(result.chunks, vec!["hello"]);
        assert_eq!(result.events.len(), 3);
    }

    #[test]
    fn envelope_serde_flattens_the_event_tag() {
        let envelope = Envelope::new(StreamEvent::Error {
            code: "MLD-E001".into(),
            message: "boom".into(),
        })
        .with_meta("stage", serde_json::json!(2));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["meta"]["stage"], 2);
        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn critical_events_are_flagged() {
        assert!(StreamEvent::Stop {
            run_id: Uuid::nil(),
            duration_ms: 0
        }
        .is_critical());
        assert!(StreamEvent::Error {
            code: "MLD-S004".into(),
            message: String::new()
        }
        .is_critical());
        assert!(!StreamEvent::Chunk {
            content: String::new(),
            stage: None
        }
        .is_critical());
    }
}
