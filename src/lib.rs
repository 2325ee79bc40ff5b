/*!
vigil - a local endpoint health-monitoring engine.

The engine periodically probes user-declared network channels, tracks
availability and latency state per channel, coordinates work across multiple
cooperating processes that observe the same workspace directory, and persists
samples and outage records crash-safely to disk.

## Architecture

A single composition root ([`core::engine::Engine`]) wires the components and
owns their lifecycle:

- [`core::store::AtomicStore`] - crash-safe JSON persistence (temp + fsync +
  rename), coalescing write queue, corrupt-file quarantine
- [`core::coordinator::Coordinator`] - leader election over a workspace lock
  file, heartbeat, shared-state publication, follower observation
- [`core::guard::GuardEvaluator`] - prerequisite conditions with a short-TTL
  result cache
- [`core::dispatcher::Dispatcher`] - bounded-concurrency probe execution with
  per-call deadline and cancellation
- [`core::state_machine`] - per-channel online/offline/unknown transitions and
  outage lifecycle
- [`core::scheduler`] - adaptive next-probe interval computation and the
  timer-heap scheduling loop
- [`core::watch::WatchManager`] / [`core::snooze::SnoozeRegistry`] -
  intensified-monitoring sessions and alert suppression windows
- [`core::events::EventBus`] - in-process pub/sub for samples, transitions,
  outages, and coordination events

Only the leader process executes probes; followers mirror the leader's
published snapshots into their local event bus so host UIs stay live without
duplicate probing.
*/

pub mod config;
pub mod core;

pub use crate::config::{Config, ConfigError, Defaults, GuardDef};
pub use crate::core::engine::{Engine, EngineError, EngineSettings};
pub use crate::core::events::{Event, EventBus};
pub use crate::core::types::{
    Channel, ChannelHealth, ChannelState, Outage, Priority, ProbeKind, ProbeParams, Role, Sample,
    Snooze, WatchDuration, WatchScope, WatchSession,
};

#[cfg(feature = "cli")]
pub mod cli;
