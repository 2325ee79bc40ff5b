//! WatchManager and SnoozeRegistry behavior.

use std::sync::Arc;
use std::time::Duration;

use vigil::core::events::{Event, EventBus};
use vigil::core::snooze::SnoozeRegistry;
use vigil::core::types::{epoch_ms, Priority, WatchDuration, WatchOverrides, WatchScope};
use vigil::core::watch::{WatchError, WatchManager};

use crate::common::wait_for_event;

fn manager() -> (Arc<WatchManager>, EventBus) {
    let events = EventBus::default();
    (Arc::new(WatchManager::new(events.clone())), events)
}

#[tokio::test]
async fn channel_watch_restarts_after_stop() {
    let (watches, _events) = manager();
    watches
        .start_channel("api", WatchDuration::Forever, WatchOverrides::default())
        .unwrap();
    assert!(watches.is_channel_watched("api"));

    watches.stop("api").unwrap();
    assert!(!watches.is_channel_watched("api"));

    // A second start for the same channel must succeed after the stop.
    watches
        .start_channel("api", WatchDuration::Forever, WatchOverrides::default())
        .unwrap();
    assert!(watches.is_channel_watched("api"));
}

#[tokio::test]
async fn duplicate_channel_watch_is_refused() {
    let (watches, _events) = manager();
    watches
        .start_channel("api", WatchDuration::Forever, WatchOverrides::default())
        .unwrap();
    let err = watches
        .start_channel("api", WatchDuration::Forever, WatchOverrides::default())
        .unwrap_err();
    assert_eq!(err, WatchError::AlreadyActive("api".to_string()));
}

#[tokio::test]
async fn channel_scope_overrides_win_over_global() {
    let (watches, _events) = manager();
    watches
        .start_global(
            WatchDuration::Forever,
            WatchOverrides {
                interval_sec: Some(30),
                timeout_ms: Some(5_000),
            },
        )
        .unwrap();
    watches
        .start_channel(
            "api",
            WatchDuration::Forever,
            WatchOverrides {
                interval_sec: Some(15),
                timeout_ms: None,
            },
        )
        .unwrap();

    let api = watches.effective_overrides("api", Priority::Medium).unwrap();
    assert_eq!(api.interval_sec, Some(15));

    // Channels without their own session fall back to the global one.
    let other = watches.effective_overrides("db", Priority::Medium).unwrap();
    assert_eq!(other.interval_sec, Some(30));
    assert_eq!(other.timeout_ms, Some(5_000));
}

#[tokio::test]
async fn priority_default_fills_missing_interval_override() {
    let (watches, _events) = manager();
    watches
        .start_global(WatchDuration::Forever, WatchOverrides::default())
        .unwrap();

    let critical = watches
        .effective_overrides("api", Priority::Critical)
        .unwrap();
    assert_eq!(critical.interval_sec, Some(10));
    let low = watches.effective_overrides("api", Priority::Low).unwrap();
    assert_eq!(low.interval_sec, Some(60));
}

#[tokio::test(start_paused = true)]
async fn finite_session_expires_and_emits_watch_ended() {
    let (watches, events) = manager();
    let mut rx = events.subscribe();

    watches
        .start_channel(
            "api",
            WatchDuration::Finite(60_000),
            WatchOverrides::default(),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(61_000)).await;

    let event = wait_for_event(&mut rx, Duration::from_secs(5), |e| {
        matches!(e, Event::WatchEnded { .. })
    })
    .await;
    let Event::WatchEnded { session } = event else {
        unreachable!()
    };
    assert!(!session.active);
    assert!(session.ended_at_ms.is_some());
    assert!(!watches.is_channel_watched("api"));
}

#[tokio::test]
async fn expired_finite_session_is_closed_on_reload() {
    let (watches, _events) = manager();
    watches
        .start_channel("api", WatchDuration::Finite(3_600_000), WatchOverrides::default())
        .unwrap();
    let records = watches.to_records();

    // A fresh manager two hours later: the one-hour session is over.
    let (reloaded, _events) = manager();
    reloaded.load(records, epoch_ms() + 7_200_000);
    assert!(!reloaded.is_channel_watched("api"));
    let ended = reloaded
        .to_records()
        .into_iter()
        .find(|s| s.scope == WatchScope::Channel("api".into()))
        .unwrap();
    assert!(!ended.active);
    assert!(ended.ended_at_ms.is_some());
}

#[tokio::test]
async fn forever_session_survives_reload() {
    let (watches, _events) = manager();
    watches
        .start_global(WatchDuration::Forever, WatchOverrides::default())
        .unwrap();
    let records = watches.to_records();

    let (reloaded, _events) = manager();
    reloaded.load(records, epoch_ms() + 7_200_000);
    assert!(reloaded.is_channel_watched("db"));
}

#[test]
fn watch_duration_parsing() {
    assert_eq!(
        WatchDuration::parse("forever"),
        Ok(WatchDuration::Forever)
    );
    assert_eq!(
        WatchDuration::parse("1500"),
        Ok(WatchDuration::Finite(1_500))
    );
    assert_eq!(
        WatchDuration::parse("90s"),
        Ok(WatchDuration::Finite(90_000))
    );
    assert_eq!(
        WatchDuration::parse("15m"),
        Ok(WatchDuration::Finite(900_000))
    );
    assert_eq!(
        WatchDuration::parse("1h"),
        Ok(WatchDuration::Finite(3_600_000))
    );
    assert_eq!(
        WatchDuration::parse("12h"),
        Ok(WatchDuration::Finite(43_200_000))
    );
    assert!(WatchDuration::parse("soon").is_err());
    assert!(WatchDuration::parse("10 fortnights").is_err());
}

#[test]
fn watch_scope_keys_and_coverage() {
    assert_eq!(WatchScope::Global.key(), "*");
    assert!(WatchScope::Global.covers("anything"));
    let scoped = WatchScope::Channel("api".into());
    assert_eq!(scoped.key(), "api");
    assert!(scoped.covers("api"));
    assert!(!scoped.covers("db"));
}

#[test]
fn snooze_covers_scope_and_window() {
    let registry = SnoozeRegistry::new();
    let snooze = registry.add("api", 30 * 60 * 1000, "deploying");

    assert!(registry.is_snoozed("api", epoch_ms()));
    assert!(!registry.is_snoozed("db", epoch_ms()));
    // Outside the window.
    assert!(!registry.is_snoozed("api", snooze.end_ms + 1));
}

#[test]
fn wildcard_snooze_covers_every_channel() {
    let registry = SnoozeRegistry::new();
    registry.add("*", 60_000, "maintenance");
    assert!(registry.is_snoozed("api", epoch_ms()));
    assert!(registry.is_snoozed("db", epoch_ms()));

    registry.clear("*");
    assert!(!registry.is_snoozed("api", epoch_ms()));
}

#[test]
fn overlapping_snoozes_form_a_union() {
    let registry = SnoozeRegistry::new();
    let first = registry.add("api", 10_000, "one");
    let second = registry.add("api", 60_000, "two");

    // Any active window suffices; after the first ends the second still
    // covers.
    assert!(registry.is_snoozed("api", first.end_ms + 1));
    assert!(!registry.is_snoozed("api", second.end_ms + 1));

    assert_eq!(registry.clear("api"), 2);
}

#[test]
fn expired_snoozes_are_pruned_from_records() {
    let registry = SnoozeRegistry::new();
    registry.add("api", 1, "blink");
    std::thread::sleep(Duration::from_millis(5));
    assert!(registry.to_records().is_empty());
}
