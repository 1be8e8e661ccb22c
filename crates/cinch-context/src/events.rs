//! Events emitted by the context engines and the sinks that receive them.
//!
//! Every engine reports notable state changes (budget pressure, compaction
//! passes, relevance updates, loads) as a [`ContextEvent`]. Engines never
//! block on delivery: an [`EventSink`] is called synchronously after the
//! engine has released its internal locks, so a sink may call back into the
//! engine that emitted the event.
//!
//! # Choosing a sink
//!
//! | Sink | Use case |
//! |------|----------|
//! | [`NoopSink`] | Tests or callers that only use return values |
//! | [`LoggingSink`] | Structured logging via `tracing` |
//! | [`FnSink`] | Quick closures for simple callbacks |
//! | [`ChannelSink`] | Hand events to an async consumer over a bounded channel |
//! | [`CompositeSink`] | Fan out to several sinks in order |

use crate::budget::{AllocationChange, WarningLevel};
use crate::loader::LoadStrategy;
use crate::relevance::ItemType;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

// ── Events ─────────────────────────────────────────────────────────

/// A notable state change in one of the engines.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ContextEvent {
    // ── Token budget ──
    /// Usage crossed into a different warning level.
    Warning {
        level: WarningLevel,
        usage_fraction: f64,
        used: usize,
        limit: usize,
    },
    /// Compression could not bring usage back under the ceiling. The
    /// orchestrator should degrade (drop files, compact harder).
    CriticalLimit {
        used: usize,
        limit: usize,
        unabsorbed: usize,
    },
    /// Allocations were lowered to absorb an overflow.
    BudgetCompressed {
        overflow: usize,
        reclaimed: usize,
        changes: Vec<AllocationChange>,
    },

    // ── Compaction ──
    CompactionStarted {
        rounds: usize,
        estimated_tokens: usize,
    },
    CompactionCompleted {
        rounds_compacted: usize,
        rounds_removed: usize,
        tokens_before: usize,
        tokens_after: usize,
    },

    // ── Relevance ──
    ItemTracked { id: String, item_type: ItemType },
    ContextUpdated { items_rescored: usize },
    ItemsEvicted { ids: Vec<String> },

    // ── Loader ──
    FileLoaded {
        uri: String,
        strategy: LoadStrategy,
        bytes: usize,
        from_cache: bool,
    },
    ChunkLoaded {
        uri: String,
        index: usize,
        bytes: usize,
    },
    Invalidated { uri: String },
}

impl ContextEvent {
    /// Short machine-friendly name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Warning { .. } => "warning",
            Self::CriticalLimit { .. } => "critical_limit",
            Self::BudgetCompressed { .. } => "budget_compressed",
            Self::CompactionStarted { .. } => "compaction_started",
            Self::CompactionCompleted { .. } => "compaction_completed",
            Self::ItemTracked { .. } => "item_tracked",
            Self::ContextUpdated { .. } => "context_updated",
            Self::ItemsEvicted { .. } => "items_evicted",
            Self::FileLoaded { .. } => "file_loaded",
            Self::ChunkLoaded { .. } => "chunk_loaded",
            Self::Invalidated { .. } => "invalidated",
        }
    }
}

// ── Sinks ──────────────────────────────────────────────────────────

/// Receiver of [`ContextEvent`]s.
///
/// The default implementation drops every event.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ContextEvent) {
        let _ = event;
    }
}

/// A sink that ignores everything.
pub struct NoopSink;
impl EventSink for NoopSink {}

/// A sink backed by a closure.
///
/// ```
/// use cinch_context::events::{ContextEvent, EventSink, FnSink};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = seen.clone();
/// let sink = FnSink::new(move |_event: &ContextEvent| {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
/// sink.emit(&ContextEvent::Invalidated { uri: "a.rs".into() });
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
/// ```
pub struct FnSink<F>(F)
where
    F: Fn(&ContextEvent) + Send + Sync;

impl<F> FnSink<F>
where
    F: Fn(&ContextEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventSink for FnSink<F>
where
    F: Fn(&ContextEvent) + Send + Sync,
{
    fn emit(&self, event: &ContextEvent) {
        (self.0)(event)
    }
}

/// A sink that forwards events into a bounded tokio channel.
///
/// Delivery uses `try_send`: when the consumer falls behind and the channel
/// is full, the event is dropped and a warning is logged. Engines never wait
/// on a slow consumer.
pub struct ChannelSink {
    tx: mpsc::Sender<ContextEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver half of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ContextEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Wrap an existing sender.
    pub fn from_sender(tx: mpsc::Sender<ContextEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &ContextEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(event = dropped.name(), "event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("event channel closed");
            }
        }
    }
}

/// A sink that delivers to several inner sinks, in registration order.
///
/// ```ignore
/// let sink = CompositeSink::new()
///     .with(LoggingSink)
///     .with(channel_sink);
/// ```
pub struct CompositeSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl CompositeSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Add a sink to the chain.
    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Conditionally add a sink to the chain.
    pub fn with_if(self, condition: bool, sink: impl EventSink + 'static) -> Self {
        if condition { self.with(sink) } else { self }
    }
}

impl Default for CompositeSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for CompositeSink {
    fn emit(&self, event: &ContextEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// A sink that logs events via `tracing`.
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn emit(&self, event: &ContextEvent) {
        match event {
            ContextEvent::Warning {
                level,
                usage_fraction,
                used,
                limit,
            } => match level {
                WarningLevel::Info => {
                    debug!("Context at {:.0}% ({used}/{limit} tokens)", usage_fraction * 100.0)
                }
                WarningLevel::Warning => {
                    info!("Context at {:.0}% ({used}/{limit} tokens)", usage_fraction * 100.0)
                }
                WarningLevel::Critical => {
                    warn!("Context at {:.0}% ({used}/{limit} tokens)", usage_fraction * 100.0)
                }
            },
            ContextEvent::CriticalLimit {
                used,
                limit,
                unabsorbed,
            } => {
                warn!(
                    "Context budget critical: {used}/{limit} tokens, {unabsorbed} tokens could not be reclaimed"
                );
            }
            ContextEvent::BudgetCompressed {
                overflow,
                reclaimed,
                changes,
            } => {
                info!(
                    "Compressed budget: reclaimed {reclaimed}/{overflow} tokens across {} component(s)",
                    changes.len()
                );
                for change in changes {
                    debug!("  {}: {} -> {}", change.component, change.from, change.to);
                }
            }
            ContextEvent::CompactionStarted {
                rounds,
                estimated_tokens,
            } => {
                info!("Compaction started: {rounds} rounds, ~{estimated_tokens} tokens");
            }
            ContextEvent::CompactionCompleted {
                rounds_compacted,
                rounds_removed,
                tokens_before,
                tokens_after,
            } => {
                info!(
                    "Compaction completed: {rounds_compacted} compacted, {rounds_removed} removed, \
                     ~{tokens_before} -> ~{tokens_after} tokens"
                );
            }
            ContextEvent::ItemTracked { id, item_type } => {
                trace!("Tracking {item_type} {id}");
            }
            ContextEvent::ContextUpdated { items_rescored } => {
                debug!("Query context updated, rescored {items_rescored} item(s)");
            }
            ContextEvent::ItemsEvicted { ids } => {
                debug!("Evicted {} low-relevance item(s)", ids.len());
            }
            ContextEvent::FileLoaded {
                uri,
                strategy,
                bytes,
                from_cache,
            } => {
                debug!(
                    "Loaded {uri} ({strategy}, {bytes} bytes{})",
                    if *from_cache { ", cached" } else { "" }
                );
            }
            ContextEvent::ChunkLoaded { uri, index, bytes } => {
                trace!("Loaded chunk {index} of {uri} ({bytes} bytes)");
            }
            ContextEvent::Invalidated { uri } => {
                debug!("Invalidated {uri}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn composite_delivers_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = log.clone();
        let second = log.clone();
        let sink = CompositeSink::new()
            .with(FnSink::new(move |e: &ContextEvent| {
                first.lock().unwrap().push(format!("a:{}", e.name()))
            }))
            .with_if(false, NoopSink)
            .with(FnSink::new(move |e: &ContextEvent| {
                second.lock().unwrap().push(format!("b:{}", e.name()))
            }));

        sink.emit(&ContextEvent::Invalidated { uri: "x".into() });
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:invalidated".to_string(), "b:invalidated".to_string()]
        );
    }

    #[tokio::test]
    async fn channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.emit(&ContextEvent::ContextUpdated { items_rescored: 3 });
        let received = rx.recv().await.unwrap();
        assert_eq!(received, ContextEvent::ContextUpdated { items_rescored: 3 });
    }

    #[tokio::test]
    async fn channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.emit(&ContextEvent::Invalidated { uri: "a".into() });
        sink.emit(&ContextEvent::Invalidated { uri: "b".into() });

        let first = rx.recv().await.unwrap();
        assert_eq!(first, ContextEvent::Invalidated { uri: "a".into() });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);
        sink.emit(&ContextEvent::Invalidated { uri: "a".into() });
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(ContextEvent::ChunkLoaded {
            uri: "big.log".into(),
            index: 3,
            bytes: 65536,
        })
        .unwrap();
        assert_eq!(json["event"], "chunk_loaded");
        assert_eq!(json["index"], 3);
    }
}
