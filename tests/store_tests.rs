//! AtomicStore: round-trips, coalescing, crash safety, quarantine, caps.

use std::time::Duration;

use tempfile::TempDir;

use vigil::core::events::EventBus;
use vigil::core::store::{
    self, AtomicStore, OutageLog, Record, StoreError, CLOSED_OUTAGES_MAX, SAMPLE_RING_MAX,
};
use vigil::core::types::{ChannelState, Outage, Sample, WatchDuration, WatchScope, WatchSession};

fn open_store(dir: &TempDir) -> AtomicStore {
    AtomicStore::open(dir.path().to_path_buf(), EventBus::default())
}

fn closed_outage(channel: &str, first: u64, reason: &str) -> Outage {
    Outage {
        channel_id: channel.to_string(),
        first_failure_ms: first,
        confirmed_at_ms: Some(first + 10),
        end_ms: Some(first + 100),
        duration_ms: Some(100),
        reason: reason.to_string(),
        failure_count: 3,
    }
}

#[tokio::test]
async fn write_then_load_round_trips() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let session = WatchSession {
        scope: WatchScope::Channel("api".into()),
        started_at_ms: 1_000,
        duration: WatchDuration::Finite(3_600_000),
        interval_override_sec: Some(15),
        timeout_override_ms: None,
        sample_count: 7,
        active: true,
        ended_at_ms: None,
    };
    store
        .write_record(Record::Watch(vec![session.clone()]))
        .durable()
        .await
        .unwrap();

    let mut state = ChannelState::default();
    state.consecutive_failures = 2;
    store
        .write_record(Record::ChannelState {
            channel_id: "api".into(),
            state: state.clone(),
        })
        .durable()
        .await
        .unwrap();

    let snapshot = store.load_all().await.unwrap();
    assert_eq!(snapshot.watches, vec![session]);
    assert_eq!(snapshot.channel_states.get("api"), Some(&state));
}

#[tokio::test]
async fn missing_files_load_as_empty_defaults() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let snapshot = store.load_all().await.unwrap();
    assert!(snapshot.channel_states.is_empty());
    assert!(snapshot.samples.is_empty());
    assert!(snapshot.outages.open.is_empty());
    assert!(snapshot.outages.closed.is_empty());
    assert!(snapshot.watches.is_empty());
    assert!(snapshot.snoozes.is_empty());
    assert!(snapshot.shared_state.is_none());
}

#[tokio::test]
async fn queued_writes_to_one_target_coalesce_to_latest() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut handles = Vec::new();
    for failures in 0..50u32 {
        let mut state = ChannelState::default();
        state.consecutive_failures = failures;
        handles.push(store.write_record(Record::ChannelState {
            channel_id: "api".into(),
            state,
        }));
    }
    for handle in handles {
        handle.durable().await.unwrap();
    }

    let snapshot = store.load_all().await.unwrap();
    assert_eq!(
        snapshot.channel_states.get("api").unwrap().consecutive_failures,
        49
    );
}

#[tokio::test]
async fn sample_ring_stays_bounded() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    for i in 0..(SAMPLE_RING_MAX as u64 + 5) {
        drop(store.append_sample(Sample::ok("api", i, 1)));
    }
    store.flush().await.unwrap();

    let ring = store.samples("api");
    assert_eq!(ring.len(), SAMPLE_RING_MAX);
    // The oldest five were pushed out.
    assert_eq!(ring.first().unwrap().timestamp_ms, 5);

    // The persisted ring matches after a fresh load.
    let reopened = open_store(&dir);
    let snapshot = reopened.load_all().await.unwrap();
    assert_eq!(snapshot.samples.get("api").unwrap().len(), SAMPLE_RING_MAX);
}

#[tokio::test]
async fn crash_between_fsync_and_rename_leaves_previous_content() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut log = OutageLog::default();
    log.record_closed(closed_outage("api", 100, "v1"));
    store
        .write_record(Record::Outages(log))
        .durable()
        .await
        .unwrap();

    // Simulate a writer that crashed after fsyncing its temp file but
    // before the rename: the temp sibling exists, the target is untouched.
    let orphan = dir.path().join("outages.json.tmp.4242.deadbeef");
    std::fs::write(&orphan, b"{\"schema_version\":1,\"payload\":{}}").unwrap();

    let reopened = open_store(&dir);
    let snapshot = reopened.load_all().await.unwrap();
    assert_eq!(snapshot.outages.closed.len(), 1);
    assert_eq!(snapshot.outages.closed[0].reason, "v1");
}

#[tokio::test]
async fn corrupt_record_is_quarantined_and_treated_as_empty() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("outages.json"), b"not json at all {{{").unwrap();

    let store = open_store(&dir);
    let snapshot = store.load_all().await.unwrap();
    assert!(snapshot.outages.closed.is_empty());

    let quarantined = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("outages.json.corrupt.")
        });
    assert!(quarantined, "corrupt file was not renamed aside");
}

#[tokio::test]
async fn trailing_garbage_is_discarded_by_recovery() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut log = OutageLog::default();
    log.record_closed(closed_outage("api", 100, "recovered"));
    store
        .write_record(Record::Outages(log))
        .durable()
        .await
        .unwrap();

    // Append garbage past the valid document.
    let path = store::outages_path(dir.path());
    let mut content = std::fs::read(&path).unwrap();
    content.extend_from_slice(b"\n}}}}garbage tail");
    std::fs::write(&path, content).unwrap();

    let reopened = open_store(&dir);
    let snapshot = reopened.load_all().await.unwrap();
    assert_eq!(snapshot.outages.closed.len(), 1);
    assert_eq!(snapshot.outages.closed[0].reason, "recovered");
}

#[tokio::test]
async fn newer_schema_version_is_rejected_but_not_quarantined() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("snooze.json");
    std::fs::write(
        &path,
        b"{\"schema_version\":99,\"written_at\":0,\"payload\":[]}",
    )
    .unwrap();

    let store = open_store(&dir);
    let snapshot = store.load_all().await.unwrap();
    assert!(snapshot.snoozes.is_empty());
    assert!(path.exists(), "incompatible file must be left in place");
}

#[tokio::test]
async fn oversized_outage_history_is_trimmed_to_cap() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut log = OutageLog::default();
    let padding = "x".repeat(1024);
    for i in 0..2000u64 {
        log.record_closed(closed_outage("api", i, &padding));
    }
    // record_closed already caps in memory; build an oversized record by hand.
    let mut oversized = OutageLog::default();
    for i in 0..2000u64 {
        oversized.closed.push(closed_outage("api", i, &padding));
    }
    assert_eq!(log.closed.len(), CLOSED_OUTAGES_MAX);

    store
        .write_record(Record::Outages(oversized))
        .durable()
        .await
        .unwrap();

    let snapshot = store.load_all().await.unwrap();
    assert_eq!(snapshot.outages.closed.len(), CLOSED_OUTAGES_MAX);
    // Trimming keeps the newest entries.
    assert_eq!(
        snapshot.outages.closed.last().unwrap().first_failure_ms,
        1999
    );
}

#[tokio::test]
async fn untrimmable_oversized_record_fails() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    // A ring already at the cap cannot be trimmed further; huge error
    // strings push it past the record size cap.
    let padding = "e".repeat(2048);
    let ring: Vec<Sample> = (0..SAMPLE_RING_MAX as u64)
        .map(|i| Sample::failed("api", i, padding.clone()))
        .collect();

    let err = store
        .write_record(Record::Samples {
            channel_id: "api".into(),
            ring,
        })
        .durable()
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::TooLarge { .. }));
}

#[tokio::test]
async fn flush_waits_for_queued_writes() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    for i in 0..20u64 {
        drop(store.append_sample(Sample::ok("api", i, 1)));
    }
    tokio::time::timeout(Duration::from_secs(5), store.flush())
        .await
        .expect("flush hung")
        .unwrap();

    assert!(store::channel_samples_path(dir.path(), "api").exists());
}
