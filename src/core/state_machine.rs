/*!
Per-channel state transitions and outage lifecycle.

One sample in, one deterministic outcome out. The engine holds a mutex per
channel and calls [`apply_sample`] under it; this module itself keeps no
shared state, which is what makes the transition rules directly testable.

## Transition rules

On a successful sample: failure streak resets, any open outage closes (a
confirmed outage enters the closed history, an unconfirmed streak is
discarded as a blip), and the channel moves to online if it was not already.

On a failed sample: success streak resets, an outage opens on the first
failure of a streak, and once the consecutive-failure count reaches the
channel threshold the outage is confirmed and the channel moves offline.

## Idempotence

Applying the same `(channel, timestamp)` sample twice is a no-op; duplicates
are detected against a bounded window of recently applied timestamps.
Out-of-order samples (possible when dispatch completions race) are still
applied, but the last-state-change reference only moves forward.
*/

use std::collections::VecDeque;

use tracing::warn;

use crate::core::types::{ChannelHealth, ChannelState, EpochMillis, Outage, Sample};

/// Recently applied timestamps retained per channel for duplicate detection.
const APPLIED_WINDOW: usize = 128;

/// A state transition produced by applying a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ChannelHealth,
    pub to: ChannelHealth,
    pub at_ms: EpochMillis,
}

/// Everything the caller needs to persist and publish after an apply.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// The sample was already applied; nothing changed
    pub duplicate: bool,
    pub transition: Option<Transition>,
    /// Outage confirmed by this sample (threshold crossed)
    pub opened: Option<Outage>,
    /// Confirmed outage closed by this sample
    pub closed: Option<Outage>,
    /// Unconfirmed streak discarded by this sample; not recorded in history
    pub blip: Option<Outage>,
}

/// Apply one sample to a channel's state.
pub fn apply_sample(cs: &mut ChannelState, threshold: u32, sample: &Sample) -> ApplyOutcome {
    if cs.recent_applied.contains(&sample.timestamp_ms) {
        return ApplyOutcome {
            duplicate: true,
            ..Default::default()
        };
    }
    remember_applied(&mut cs.recent_applied, sample.timestamp_ms);

    let mut outcome = ApplyOutcome::default();

    if sample.success {
        cs.consecutive_failures = 0;
        cs.consecutive_successes = cs.consecutive_successes.saturating_add(1);

        if let Some(mut outage) = cs.open_outage.take() {
            if outage.is_confirmed() {
                close_outage(&mut outage, sample.timestamp_ms);
                outcome.closed = Some(outage);
            } else {
                // Recovered before the threshold confirmed it: a blip, kept
                // out of the closed history.
                close_outage(&mut outage, sample.timestamp_ms);
                outcome.blip = Some(outage);
            }
        }

        if cs.state != ChannelHealth::Online {
            outcome.transition = transition(cs, ChannelHealth::Online, sample.timestamp_ms);
        }
    } else {
        cs.consecutive_successes = 0;
        cs.consecutive_failures = cs.consecutive_failures.saturating_add(1);

        let reason = sample.error.clone().unwrap_or_default();
        match &mut cs.open_outage {
            None => {
                cs.open_outage = Some(Outage {
                    channel_id: sample.channel_id.clone(),
                    first_failure_ms: sample.timestamp_ms,
                    confirmed_at_ms: None,
                    end_ms: None,
                    duration_ms: None,
                    reason,
                    failure_count: 1,
                });
            }
            Some(outage) => {
                outage.failure_count = outage.failure_count.saturating_add(1);
                if outage.reason.is_empty() && !reason.is_empty() {
                    outage.reason = reason;
                }
            }
        }

        if cs.consecutive_failures >= threshold && cs.state != ChannelHealth::Offline {
            if let Some(outage) = &mut cs.open_outage {
                if outage.confirmed_at_ms.is_none() {
                    outage.confirmed_at_ms = Some(sample.timestamp_ms);
                    outcome.opened = Some(outage.clone());
                }
            }
            outcome.transition = transition(cs, ChannelHealth::Offline, sample.timestamp_ms);
        }
    }

    cs.last_sample = Some(sample.clone());
    outcome
}

fn transition(
    cs: &mut ChannelState,
    to: ChannelHealth,
    at_ms: EpochMillis,
) -> Option<Transition> {
    let from = cs.state;
    cs.state = to;
    // Out-of-order completions must not move the change reference backwards.
    let at_ms = cs.last_state_change_ms.unwrap_or(0).max(at_ms);
    cs.last_state_change_ms = Some(at_ms);
    Some(Transition { from, to, at_ms })
}

fn close_outage(outage: &mut Outage, end_ms: EpochMillis) {
    let end_ms = end_ms.max(outage.first_failure_ms);
    outage.end_ms = Some(end_ms);
    outage.duration_ms = Some(end_ms - outage.first_failure_ms);
}

fn remember_applied(recent: &mut VecDeque<EpochMillis>, timestamp_ms: EpochMillis) {
    recent.push_back(timestamp_ms);
    while recent.len() > APPLIED_WINDOW {
        recent.pop_front();
    }
}

/// Check the per-channel invariants and self-repair violations.
///
/// Returns a description per repaired violation. A non-empty return after a
/// normal apply indicates a bug upstream; repairs keep the channel serving
/// rather than wedging it.
pub fn repair_invariants(
    cs: &mut ChannelState,
    channel_id: &str,
    threshold: u32,
    now_ms: EpochMillis,
) -> Vec<String> {
    let mut repairs = Vec::new();

    if cs.state == ChannelHealth::Offline && cs.consecutive_failures < threshold {
        repairs.push(format!(
            "offline with {} consecutive failures (threshold {threshold}); reset to unknown",
            cs.consecutive_failures
        ));
        cs.state = ChannelHealth::Unknown;
        cs.last_state_change_ms = Some(cs.last_state_change_ms.unwrap_or(0).max(now_ms));
    }

    if cs.state == ChannelHealth::Online {
        if let Some(last) = &cs.last_sample {
            if !last.success {
                repairs.push("online with a failed last sample; reset to unknown".to_string());
                cs.state = ChannelHealth::Unknown;
                cs.last_state_change_ms = Some(cs.last_state_change_ms.unwrap_or(0).max(now_ms));
            }
        }
    }

    // Re-checked after the reset above: an unknown channel mid-streak keeps
    // its open outage.
    if cs.state == ChannelHealth::Online {
        if let Some(outage) = cs.open_outage.take() {
            repairs.push(format!(
                "online with an open outage since {}; closed at now",
                outage.first_failure_ms
            ));
            // Orphan outage: close it at now so history stays consistent.
            let mut orphan = outage;
            close_outage(&mut orphan, now_ms);
        }
    }

    if let Some(outage) = &mut cs.open_outage {
        if outage.first_failure_ms > now_ms {
            repairs.push(format!(
                "open outage starts in the future ({} > {now_ms}); clamped",
                outage.first_failure_ms
            ));
            outage.first_failure_ms = now_ms;
        }
    }

    for repair in &repairs {
        warn!(channel = channel_id, repair = %repair, "invariant violation repaired");
    }
    repairs
}
