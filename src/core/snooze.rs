//! Alert-suppression windows.
//!
//! A snooze hides alert-side effects for a scope over a time window without
//! stopping sample collection: samples keep flowing and state transitions
//! still happen, annotated so consumers (notification layers, reports) can
//! decide visibility. Overlapping snoozes act as a union; ranges are never
//! merged.

use std::sync::Mutex;

use tracing::info;

use crate::core::types::{epoch_ms, EpochMillis, Snooze};

/// Owns the set of snooze windows.
pub struct SnoozeRegistry {
    entries: Mutex<Vec<Snooze>>,
}

impl SnoozeRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Add a suppression window for a channel id or `"*"`.
    pub fn add(
        &self,
        scope: impl Into<String>,
        duration_ms: u64,
        reason: impl Into<String>,
    ) -> Snooze {
        let now = epoch_ms();
        let snooze = Snooze {
            scope: scope.into(),
            start_ms: now,
            end_ms: now.saturating_add(duration_ms.max(1)),
            reason: reason.into(),
        };
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|s| s.end_ms > now);
        entries.push(snooze.clone());
        info!(scope = %snooze.scope, until = snooze.end_ms, "snooze added");
        snooze
    }

    /// Remove every snooze for the given scope. Returns how many were
    /// removed.
    pub fn clear(&self, scope: &str) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|s| s.scope != scope);
        let removed = before - entries.len();
        if removed > 0 {
            info!(scope, removed, "snoozes cleared");
        }
        removed
    }

    /// Whether any active window (channel-scoped or wildcard) covers the
    /// channel at `now`.
    pub fn is_snoozed(&self, channel_id: &str, now_ms: EpochMillis) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.covers(channel_id, now_ms))
    }

    /// Current entries, expired ones pruned, for persistence.
    pub fn to_records(&self) -> Vec<Snooze> {
        let now = epoch_ms();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|s| s.end_ms > now);
        entries.clone()
    }

    /// Restore persisted entries, dropping any that already expired.
    pub fn load(&self, snoozes: Vec<Snooze>, now_ms: EpochMillis) {
        let mut entries = self.entries.lock().unwrap();
        *entries = snoozes.into_iter().filter(|s| s.end_ms > now_ms).collect();
    }
}

impl Default for SnoozeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
