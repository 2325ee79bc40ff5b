//! In-process publish/subscribe for engine events.
//!
//! The bus is a first-class value handed to components by the composition
//! root; there is no emitter inheritance and no cross-component reference
//! besides it. Delivery is synchronous on the publishing caller, best-effort,
//! FIFO per publisher. Slow subscribers lose oldest events rather than
//! blocking publishers.

use tokio::sync::broadcast;
use tracing::trace;

use crate::core::types::{
    ChannelHealth, EpochMillis, Outage, Role, Sample, WatchSession,
};

/// Default per-subscriber buffer. Lagging subscribers drop oldest events.
const DEFAULT_CAPACITY: usize = 256;

/// Engine event, published on the [`EventBus`].
#[derive(Debug, Clone)]
pub enum Event {
    /// A probe completed and its sample was applied
    Sample { sample: Sample },
    /// A channel transitioned between availability states
    StateChanged {
        channel_id: String,
        from: ChannelHealth,
        to: ChannelHealth,
        at_ms: EpochMillis,
        /// A snooze window covered the channel at transition time;
        /// notification adapters decide whether to surface it
        snoozed: bool,
    },
    /// An outage was confirmed (threshold crossed)
    OutageOpened { outage: Outage },
    /// A confirmed outage ended
    OutageClosed { outage: Outage },
    WatchStarted { session: WatchSession },
    WatchEnded { session: WatchSession },
    /// The leader published a shared-state snapshot, or a follower accepted one
    SnapshotPublished { version: u64, publisher: String },
    LeadershipChanged { role: Role },
    /// Persistence health changed; `degraded` flips back to false on recovery
    StoreHealth { degraded: bool, detail: String },
}

impl Event {
    /// Stable event name, matching the published interface.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Sample { .. } => "sample",
            Event::StateChanged { .. } => "state-changed",
            Event::OutageOpened { .. } => "outage-opened",
            Event::OutageClosed { .. } => "outage-closed",
            Event::WatchStarted { .. } => "watch-started",
            Event::WatchEnded { .. } => "watch-ended",
            Event::SnapshotPublished { .. } => "snapshot-published",
            Event::LeadershipChanged { .. } => "leadership-changed",
            Event::StoreHealth { .. } => "store-health",
        }
    }
}

/// Cloneable pub/sub handle shared by all components.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers. Never blocks; events
    /// published with no subscribers are dropped.
    pub fn publish(&self, event: Event) {
        trace!(event = event.name(), "publish");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
