//! Intensified-monitoring sessions (global and per-channel).
//!
//! A watch session overrides a channel's probe cadence and timeout for a
//! window of time - finite or open-ended. At most one session is active per
//! scope key; channel-scope overrides take precedence over a concurrent
//! global session. Sessions persist across restarts; expired ones are
//! pruned at load.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::events::{Event, EventBus};
use crate::core::types::{
    epoch_ms, Priority, WatchDuration, WatchOverrides, WatchScope, WatchSession,
};

/// Ended sessions kept for host inspection and persistence.
const RECENT_SESSIONS_MAX: usize = 50;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("a watch session is already active for scope {0}")]
    AlreadyActive(String),
}

struct Inner {
    active: HashMap<String, WatchSession>,
    recent: Vec<WatchSession>,
    expiry_cancels: HashMap<String, CancellationToken>,
}

/// Owns the set of watch sessions.
pub struct WatchManager {
    inner: Mutex<Inner>,
    events: EventBus,
}

impl WatchManager {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                recent: Vec::new(),
                expiry_cancels: HashMap::new(),
            }),
            events,
        }
    }

    /// Start an intensified session covering all enabled channels.
    pub fn start_global(
        self: &Arc<Self>,
        duration: WatchDuration,
        overrides: WatchOverrides,
    ) -> Result<WatchSession, WatchError> {
        self.start(WatchScope::Global, duration, overrides)
    }

    /// Start a per-channel session. Refuses while one is already active for
    /// the same channel.
    pub fn start_channel(
        self: &Arc<Self>,
        channel_id: impl Into<String>,
        duration: WatchDuration,
        overrides: WatchOverrides,
    ) -> Result<WatchSession, WatchError> {
        self.start(WatchScope::Channel(channel_id.into()), duration, overrides)
    }

    fn start(
        self: &Arc<Self>,
        scope: WatchScope,
        duration: WatchDuration,
        overrides: WatchOverrides,
    ) -> Result<WatchSession, WatchError> {
        let key = scope.key().to_string();
        let session = {
            let mut inner = self.inner.lock().unwrap();
            if inner.active.contains_key(&key) {
                return Err(WatchError::AlreadyActive(key));
            }
            let session = WatchSession {
                scope,
                started_at_ms: epoch_ms(),
                duration,
                interval_override_sec: overrides.interval_sec,
                timeout_override_ms: overrides.timeout_ms,
                sample_count: 0,
                active: true,
                ended_at_ms: None,
            };
            inner.active.insert(key.clone(), session.clone());
            session
        };

        if let WatchDuration::Finite(ms) = duration {
            self.arm_expiry(&key, Duration::from_millis(ms));
        }

        info!(scope = %key, "watch session started");
        self.events.publish(Event::WatchStarted {
            session: session.clone(),
        });
        Ok(session)
    }

    /// Schedule the deferred stop for a finite session.
    fn arm_expiry(self: &Arc<Self>, key: &str, after: Duration) {
        let cancel = CancellationToken::new();
        self.inner
            .lock()
            .unwrap()
            .expiry_cancels
            .insert(key.to_string(), cancel.clone());

        let manager = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(after) => {
                    manager.stop(&key);
                }
            }
        });
    }

    /// End the active session for a scope key (`"*"` for global). Returns
    /// the ended session, or None when nothing was active.
    pub fn stop(&self, scope_key: &str) -> Option<WatchSession> {
        let session = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(cancel) = inner.expiry_cancels.remove(scope_key) {
                cancel.cancel();
            }
            let mut session = inner.active.remove(scope_key)?;
            session.active = false;
            session.ended_at_ms = Some(epoch_ms());
            inner.recent.push(session.clone());
            if inner.recent.len() > RECENT_SESSIONS_MAX {
                let excess = inner.recent.len() - RECENT_SESSIONS_MAX;
                inner.recent.drain(..excess);
            }
            session
        };

        info!(scope = scope_key, samples = session.sample_count, "watch session ended");
        self.events.publish(Event::WatchEnded {
            session: session.clone(),
        });
        Some(session)
    }

    /// Stop every active session (shutdown path).
    pub fn stop_all(&self) {
        let keys: Vec<String> = self.inner.lock().unwrap().active.keys().cloned().collect();
        for key in keys {
            self.stop(&key);
        }
    }

    pub fn is_channel_watched(&self, channel_id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .active
            .values()
            .any(|s| s.scope.covers(channel_id))
    }

    /// Effective overrides for a channel. Channel-scope wins over global;
    /// the priority default fills in a missing interval override.
    pub fn effective_overrides(&self, channel_id: &str, priority: Priority) -> Option<WatchOverrides> {
        let inner = self.inner.lock().unwrap();
        let session = inner
            .active
            .get(channel_id)
            .or_else(|| inner.active.get("*"))?;
        Some(WatchOverrides {
            interval_sec: Some(
                session
                    .interval_override_sec
                    .unwrap_or_else(|| priority.watch_interval_sec()),
            ),
            timeout_ms: session.timeout_override_ms,
        })
    }

    /// Count a sample against every session covering the channel.
    pub fn note_sample(&self, channel_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        for session in inner.active.values_mut() {
            if session.scope.covers(channel_id) {
                session.sample_count += 1;
            }
        }
    }

    /// Active and recently ended sessions, for persistence.
    pub fn to_records(&self) -> Vec<WatchSession> {
        let inner = self.inner.lock().unwrap();
        inner
            .active
            .values()
            .cloned()
            .chain(inner.recent.iter().cloned())
            .collect()
    }

    /// Restore persisted sessions. Sessions whose finite window already
    /// elapsed are recorded as ended rather than resumed.
    pub fn load(self: &Arc<Self>, sessions: Vec<WatchSession>, now_ms: u64) {
        let mut to_arm: Vec<(String, Duration)> = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            for mut session in sessions {
                if session.active {
                    match session.expires_at_ms() {
                        Some(expiry) if expiry <= now_ms => {
                            session.active = false;
                            session.ended_at_ms = Some(expiry);
                            inner.recent.push(session);
                        }
                        Some(expiry) => {
                            let key = session.scope.key().to_string();
                            inner.active.insert(key.clone(), session);
                            to_arm.push((key, Duration::from_millis(expiry - now_ms)));
                        }
                        None => {
                            let key = session.scope.key().to_string();
                            inner.active.insert(key, session);
                        }
                    }
                } else {
                    inner.recent.push(session);
                }
            }
        }
        for (key, remaining) in to_arm {
            self.arm_expiry(&key, remaining);
        }
    }
}
