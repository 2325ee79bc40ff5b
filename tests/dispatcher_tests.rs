//! Probe dispatch: result shaping, deadlines, cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use vigil::core::dispatcher::{Dispatcher, ProbeOperation, ProbeRegistry, ProbeReport};
use vigil::core::types::{ProbeKind, ProbeParams};

use crate::common::{registry_with, test_channel, ScriptedProbe};

/// Operation that sleeps before answering; used to trip deadlines.
struct SlowProbe {
    delay: Duration,
}

#[async_trait]
impl ProbeOperation for SlowProbe {
    async fn run(
        &self,
        _params: &ProbeParams,
        _deadline: Instant,
        _cancel: CancellationToken,
    ) -> ProbeReport {
        tokio::time::sleep(self.delay).await;
        ProbeReport::ok(1)
    }
}

#[tokio::test]
async fn successful_probe_becomes_a_success_sample() {
    let op = ScriptedProbe::new(vec![ProbeReport::ok(42)]);
    let dispatcher = Dispatcher::new(Arc::new(registry_with(op)), 4);

    let channel = test_channel("api", 60, 3);
    let sample = dispatcher
        .dispatch(&channel, Duration::from_secs(1), CancellationToken::new())
        .await;

    assert!(sample.success);
    assert_eq!(sample.latency_ms, Some(42));
    assert_eq!(sample.channel_id, "api");
    assert!(sample.error.is_none());
}

#[tokio::test]
async fn failed_probe_becomes_a_failure_sample() {
    let op = ScriptedProbe::new(vec![ProbeReport::failed("connection_refused")]);
    let dispatcher = Dispatcher::new(Arc::new(registry_with(op)), 4);

    let channel = test_channel("api", 60, 3);
    let sample = dispatcher
        .dispatch(&channel, Duration::from_secs(1), CancellationToken::new())
        .await;

    assert!(!sample.success);
    assert_eq!(sample.error.as_deref(), Some("connection_refused"));
}

#[tokio::test(start_paused = true)]
async fn deadline_overrun_yields_a_timeout_sample() {
    let mut registry = ProbeRegistry::new();
    registry.register(
        ProbeKind::Http,
        Arc::new(SlowProbe {
            delay: Duration::from_secs(30),
        }),
    );
    let dispatcher = Dispatcher::new(Arc::new(registry), 4);

    let channel = test_channel("api", 60, 3);
    let sample = dispatcher
        .dispatch(&channel, Duration::from_secs(1), CancellationToken::new())
        .await;

    assert!(!sample.success);
    assert_eq!(sample.error.as_deref(), Some("timeout"));
}

#[tokio::test(start_paused = true)]
async fn cancellation_resolves_within_the_grace_period() {
    let mut registry = ProbeRegistry::new();
    registry.register(
        ProbeKind::Http,
        Arc::new(SlowProbe {
            delay: Duration::from_secs(300),
        }),
    );
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), 4));

    let cancel = CancellationToken::new();
    let channel = test_channel("api", 60, 3);
    let dispatch = {
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch(&channel, Duration::from_secs(600), cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();

    let sample = dispatch.await.unwrap();
    assert!(!sample.success);
    assert_eq!(sample.error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn unregistered_kind_fails_without_panicking() {
    // Registry with no operations at all.
    let dispatcher = Dispatcher::new(Arc::new(ProbeRegistry::new()), 4);

    let channel = test_channel("api", 60, 3);
    let sample = dispatcher
        .dispatch(&channel, Duration::from_secs(1), CancellationToken::new())
        .await;

    assert!(!sample.success);
    assert_eq!(sample.error.as_deref(), Some("unregistered probe kind"));
}

#[tokio::test]
async fn excess_dispatches_queue_and_all_complete() {
    let op = ScriptedProbe::always_ok();
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry_with(op.clone())), 2));

    let mut joins = Vec::new();
    for i in 0..10 {
        let dispatcher = Arc::clone(&dispatcher);
        let channel = test_channel(&format!("ch{i}"), 60, 3);
        joins.push(tokio::spawn(async move {
            dispatcher
                .dispatch(&channel, Duration::from_secs(5), CancellationToken::new())
                .await
        }));
    }
    for join in joins {
        assert!(join.await.unwrap().success);
    }
    assert_eq!(op.call_count(), 10);
}
