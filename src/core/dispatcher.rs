//! Probe dispatch: bounded concurrency, per-call deadline, cancellation.
//!
//! The dispatcher orchestrates timing, cancellation, and result shaping
//! only; the probe I/O itself lives behind [`ProbeOperation`] - one
//! registered operation per probe kind. A dispatch always produces a
//! [`Sample`]: timeouts, cancellations, and even panicking operations are
//! shaped into failed samples rather than surfacing as errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::types::{epoch_ms, Channel, ProbeKind, ProbeParams, Sample};

/// Default per-process concurrent dispatch cap.
pub const DEFAULT_CONCURRENCY: usize = 32;

/// How long a cancelled operation gets to wind down before its result is
/// synthesized.
pub const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Raw result returned by a probe operation.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    /// Kind-specific diagnostics; logged, never persisted
    pub details: Option<HashMap<String, String>>,
}

impl ProbeReport {
    pub fn ok(latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms: Some(latency_ms),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// One probe kind's I/O implementation.
///
/// Contract: must not panic, must honor `deadline`, and must react to
/// `cancel` within the grace period. The dispatcher enforces all three
/// defensively regardless.
#[async_trait]
pub trait ProbeOperation: Send + Sync {
    async fn run(
        &self,
        params: &ProbeParams,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> ProbeReport;
}

/// Registered probe operations, one per kind.
#[derive(Default)]
pub struct ProbeRegistry {
    ops: HashMap<ProbeKind, Arc<dyn ProbeOperation>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ProbeKind, op: Arc<dyn ProbeOperation>) {
        self.ops.insert(kind, op);
    }

    pub fn supports(&self, kind: ProbeKind) -> bool {
        self.ops.contains_key(&kind)
    }

    fn get(&self, kind: ProbeKind) -> Option<Arc<dyn ProbeOperation>> {
        self.ops.get(&kind).cloned()
    }
}

/// Executes probe operations under a process-wide concurrency cap.
///
/// Excess dispatches queue FIFO on the semaphore; [`Dispatcher::queued`]
/// exposes the backlog for the scheduler's back-pressure decision.
pub struct Dispatcher {
    registry: Arc<ProbeRegistry>,
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
}

impl Dispatcher {
    pub fn new(registry: Arc<ProbeRegistry>, concurrency: usize) -> Self {
        Self {
            registry,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Dispatches currently waiting for a permit.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Execute one probe for `channel` with the effective `timeout`.
    /// Always returns a Sample; never raises.
    pub async fn dispatch(
        &self,
        channel: &Channel,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Sample {
        let Some(op) = self.registry.get(channel.kind()) else {
            // Configuration validation rejects unregistered kinds; reaching
            // this means a reload raced channel removal.
            warn!(channel = %channel.id, kind = %channel.kind(), "no probe operation registered");
            return Sample::failed(&channel.id, epoch_ms(), "unregistered probe kind");
        };

        self.waiting.fetch_add(1, Ordering::Relaxed);
        let permit = self.permits.acquire().await;
        self.waiting.fetch_sub(1, Ordering::Relaxed);
        let _permit = match permit {
            Ok(permit) => permit,
            Err(_) => return Sample::failed(&channel.id, epoch_ms(), "dispatcher shut down"),
        };

        let deadline = Instant::now() + timeout;
        let params = channel.probe.clone();
        let op_cancel = cancel.clone();
        // Spawned so a misbehaving operation cannot unwind the probe pool.
        let task =
            tokio::spawn(async move { op.run(&params, deadline, op_cancel).await });

        let report = tokio::select! {
            joined = task => match joined {
                Ok(report) => report,
                Err(e) => {
                    warn!(channel = %channel.id, error = %e, "probe operation panicked");
                    ProbeReport::failed("probe operation failed")
                }
            },
            () = tokio::time::sleep_until(deadline) => {
                debug!(channel = %channel.id, timeout_ms = timeout.as_millis() as u64, "probe timed out");
                ProbeReport::failed("timeout")
            }
            () = cancelled_with_grace(&cancel) => {
                ProbeReport::failed("cancelled")
            }
        };

        let timestamp = epoch_ms();
        Sample {
            channel_id: channel.id.clone(),
            timestamp_ms: timestamp,
            success: report.success,
            latency_ms: report.latency_ms,
            error: report.error,
            during_watch: false,
            during_snooze: false,
        }
    }
}

/// Resolves one grace period after cancellation fires, giving the operation
/// a window to return its own (possibly partial) result first.
async fn cancelled_with_grace(cancel: &CancellationToken) {
    cancel.cancelled().await;
    tokio::time::sleep(CANCEL_GRACE).await;
}
