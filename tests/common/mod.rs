//! Shared test fixtures: scripted probe operations, configuration builders,
//! and event helpers.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use vigil::core::dispatcher::{ProbeOperation, ProbeRegistry, ProbeReport};
use vigil::core::events::Event;
use vigil::core::types::{Channel, Priority, ProbeKind, ProbeParams};
use vigil::config::{Config, Defaults};

/// Probe operation driven by a scripted queue of reports. When the script
/// runs dry it repeats the fallback (success by default).
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ProbeReport>>,
    fallback: ProbeReport,
    pub calls: Mutex<u32>,
}

impl ScriptedProbe {
    pub fn new(reports: Vec<ProbeReport>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(reports.into_iter().collect()),
            fallback: ProbeReport::ok(5),
            calls: Mutex::new(0),
        })
    }

    pub fn always_ok() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn push(&self, report: ProbeReport) {
        self.script.lock().unwrap().push_back(report);
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ProbeOperation for ScriptedProbe {
    async fn run(
        &self,
        _params: &ProbeParams,
        _deadline: Instant,
        _cancel: CancellationToken,
    ) -> ProbeReport {
        *self.calls.lock().unwrap() += 1;
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Registry with one scripted operation registered for the http kind.
pub fn registry_with(op: Arc<dyn ProbeOperation>) -> ProbeRegistry {
    let mut registry = ProbeRegistry::new();
    registry.register(ProbeKind::Http, op);
    registry
}

/// An http channel with zero jitter so interval assertions are exact.
pub fn test_channel(id: &str, interval_sec: u32, threshold: u32) -> Channel {
    Channel {
        id: id.to_string(),
        name: None,
        probe: ProbeParams::Http {
            url: format!("http://127.0.0.1:9/{id}"),
            expect_status: None,
        },
        interval_sec: Some(interval_sec),
        timeout_ms: Some(500),
        threshold: Some(threshold),
        jitter_pct: Some(0),
        enabled: true,
        priority: Priority::Medium,
        guards: Vec::new(),
        hidden: false,
    }
}

pub fn test_config(channels: Vec<Channel>) -> Config {
    Config {
        defaults: Defaults::default(),
        guards: Default::default(),
        channels,
    }
}

/// Wait for the first event matching the predicate, failing the test after
/// the timeout.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    mut predicate: impl FnMut(&Event) -> bool,
) -> Event {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        if predicate(&event) {
            return event;
        }
    }
}
