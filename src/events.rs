//! Domain events flowing from the core to its UI collaborator
//!
//! Events are published strictly after the owning transaction commits; the
//! writer appends them to the `outbox` table inside the transaction and
//! drains the outbox once the commit succeeds, which makes delivery
//! at-least-once and per-stream ordered.
//!
//! The bus is a bounded broadcast: every subscriber owns an independent
//! buffer of the newest [`EVENT_BUFFER`] events. A subscriber that falls
//! behind loses the oldest events and receives a single [`Event::Resync`]
//! in their place - `ItemsCleared` keeps its precise meaning and is never
//! reused as a refresh signal.

use crate::config::Settings;
use crate::store::{ItemSummary, Stats};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

/// Per-subscriber buffer bound (backpressure = newest-200).
pub const EVENT_BUFFER: usize = 200;

/// Main event type published to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")] // Creates JSON like {"type": "item_inserted", ...}
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// A new item was persisted.
    ItemInserted(ItemSummary),

    /// An existing item changed (dedup bump, pin/unpin).
    ItemUpdated(ItemSummary),

    /// An item was removed.
    ItemDeleted { id: String },

    /// The history was cleared. Not a refresh signal - it means items are gone.
    ItemsCleared { keep_pinned: bool },

    /// Settings were written through the settings store.
    SettingsChanged(Settings),

    /// Maintained counters changed in bulk (cleanup, clear).
    StatsChanged(Stats),

    /// This subscriber's buffer overflowed; reload state from the facade.
    Resync,

    /// The store failed an integrity check. Terminal: no further writes
    /// will be accepted.
    CorruptDetected,
}

impl Event {
    /// Stable kind tag used for the outbox `kind` column and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ItemInserted(_) => "item_inserted",
            Event::ItemUpdated(_) => "item_updated",
            Event::ItemDeleted { .. } => "item_deleted",
            Event::ItemsCleared { .. } => "items_cleared",
            Event::SettingsChanged(_) => "settings_changed",
            Event::StatsChanged(_) => "stats_changed",
            Event::Resync => "resync",
            Event::CorruptDetected => "corrupt_detected",
        }
    }
}

/// Bounded multi-subscriber event stream.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUFFER)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. A bus with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        tracing::trace!(kind = event.kind(), "publishing event");
        let _ = self.tx.send(event);
    }

    /// Subscribe as an event stream. Buffer overflow surfaces as a single
    /// `Resync` item instead of an error.
    pub fn subscribe(&self) -> impl Stream<Item = Event> + Send + Unpin {
        BroadcastStream::new(self.tx.subscribe()).map(|result| match result {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::warn!(missed, "event subscriber lagged; emitting resync");
                Event::Resync
            }
        })
    }

    /// Raw receiver for tests that want direct recv control.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
