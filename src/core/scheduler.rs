/*!
Adaptive probe cadence and the scheduling loop.

Cadence selection, highest precedence first:

1. **Watch** - an active watch session covering the channel supplies the
   interval (explicit override, or a priority-based default).
2. **Crisis** - offline channels accelerate: baseline scaled by a factor
   that starts below 1.0 and shrinks as the failure streak grows, floored
   so a flapping channel cannot monopolize the probe pool.
3. **Recovery** - unknown state with recent failures probes gently faster
   than baseline.
4. **Stable** - online channels run at baseline, capped by the stable
   ceiling.

Every computed interval gets jitter (`±jitter_pct`) and is clamped to
[`MIN_INTERVAL_SEC`], [`MAX_INTERVAL_SEC`]. Crisis intervals additionally
never exceed the baseline: an outage must never slow monitoring down.

The scheduling loop owns a min-heap keyed by next-fire time. It emits probe
tickets to the engine's runner and is told, after the sample lands, when the
channel should fire next. Configuration reloads rebuild the heap in place,
preserving remaining time for unchanged channels.
*/

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::types::{ChannelHealth, ChannelState, IntervalReason, Priority};

/// Hard floor for any computed probe interval.
pub const MIN_INTERVAL_SEC: u32 = 10;

/// Hard ceiling for any computed probe interval.
pub const MAX_INTERVAL_SEC: u32 = 3600;

/// Stable-cadence ceiling: healthy channels never probe slower than this.
pub const STABLE_CEILING_SEC: u32 = 600;

/// Recovery-cadence floor.
const RECOVERY_FLOOR_SEC: u32 = 15;

/// A computed cadence decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadenceDecision {
    pub interval: Duration,
    pub reason: IntervalReason,
}

/// Inputs for one cadence computation.
#[derive(Debug, Clone, Copy)]
pub struct CadenceInputs<'a> {
    pub baseline_sec: u32,
    pub jitter_pct: u8,
    pub priority: Priority,
    pub threshold: u32,
    pub state: &'a ChannelState,
    /// Interval from a covering watch session, when one is active
    pub watch_override_sec: Option<u32>,
}

/// Compute the next probe interval for a channel.
pub fn compute_interval(inputs: &CadenceInputs<'_>, rng: &mut impl Rng) -> CadenceDecision {
    let (raw_sec, reason) = select_cadence(inputs);
    let jittered = apply_jitter(raw_sec, inputs.jitter_pct, rng);

    let mut clamped = jittered.clamp(f64::from(MIN_INTERVAL_SEC), f64::from(MAX_INTERVAL_SEC));
    if reason == IntervalReason::Crisis {
        // Crisis never slows monitoring below the configured cadence.
        clamped = clamped.min(f64::from(inputs.baseline_sec.max(MIN_INTERVAL_SEC)));
    }

    CadenceDecision {
        interval: Duration::from_secs_f64(clamped),
        reason,
    }
}

fn select_cadence(inputs: &CadenceInputs<'_>) -> (f64, IntervalReason) {
    if let Some(sec) = inputs.watch_override_sec {
        return (f64::from(sec.max(MIN_INTERVAL_SEC)), IntervalReason::Watch);
    }

    let baseline = f64::from(inputs.baseline_sec);
    match inputs.state.state {
        ChannelHealth::Offline => {
            let factor = crisis_factor(
                inputs.state.consecutive_failures,
                inputs.threshold,
                inputs.priority,
            );
            let floor = f64::from(crisis_floor_sec(inputs.priority))
                .min(baseline)
                .max(f64::from(MIN_INTERVAL_SEC));
            ((baseline * factor).max(floor), IntervalReason::Crisis)
        }
        ChannelHealth::Unknown if inputs.state.consecutive_failures >= 1 => (
            (baseline * 0.5).max(f64::from(RECOVERY_FLOOR_SEC)),
            IntervalReason::Recovery,
        ),
        _ => (
            baseline.min(f64::from(STABLE_CEILING_SEC)),
            IntervalReason::Stable,
        ),
    }
}

/// Acceleration factor for offline channels. Starts below 1.0 at the
/// threshold and decreases monotonically as the streak grows.
fn crisis_factor(consecutive_failures: u32, threshold: u32, priority: Priority) -> f64 {
    let over = consecutive_failures.saturating_sub(threshold).min(12);
    let mut factor = 0.6 * 0.85_f64.powi(over as i32);
    if priority == Priority::Critical {
        factor *= 0.5;
    }
    factor.max(0.02)
}

fn crisis_floor_sec(priority: Priority) -> u32 {
    match priority {
        Priority::Critical => MIN_INTERVAL_SEC,
        Priority::High => 12,
        Priority::Medium => 15,
        Priority::Low => 20,
    }
}

fn apply_jitter(raw_sec: f64, jitter_pct: u8, rng: &mut impl Rng) -> f64 {
    if jitter_pct == 0 {
        return raw_sec;
    }
    let jitter = f64::from(jitter_pct) / 100.0;
    raw_sec * (1.0 + rng.random_range(-jitter..=jitter))
}

// Scheduling loop

/// Why a probe ticket fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketReason {
    /// The channel's next-fire time elapsed
    Due,
    /// A host called run-channel-now
    Manual,
}

/// One unit of probe work handed to the engine's runner.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub channel_id: String,
    pub reason: TicketReason,
}

/// Commands accepted by the scheduling loop.
#[derive(Debug)]
pub enum SchedCommand {
    /// (Re)insert a channel, firing after `delay`
    Schedule { channel_id: String, delay: Duration },
    /// Fire a channel immediately, bypassing its interval
    RunNow { channel_id: String },
    /// Remove a channel from the heap
    Remove { channel_id: String },
    /// Configuration reload: `keep` lists surviving channel ids whose
    /// remaining time is preserved; everything else is dropped, and ids in
    /// `fresh` fire immediately
    Rebuild { keep: Vec<String>, fresh: Vec<String> },
}

/// Handle to a running scheduling loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedCommand>,
}

impl SchedulerHandle {
    pub fn send(&self, cmd: SchedCommand) {
        let _ = self.tx.send(cmd);
    }
}

/// Spawn the scheduling loop. Fired tickets arrive on the returned channel's
/// counterpart, which the caller passes in as `ticket_tx`.
pub fn spawn_loop(
    ticket_tx: mpsc::UnboundedSender<Ticket>,
    cancel: CancellationToken,
) -> SchedulerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_loop(rx, ticket_tx, cancel));
    SchedulerHandle { tx }
}

struct HeapEntry {
    fire_at: Instant,
    seq: u64,
    channel_id: String,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then(self.seq.cmp(&other.seq))
    }
}

async fn run_loop(
    mut rx: mpsc::UnboundedReceiver<SchedCommand>,
    ticket_tx: mpsc::UnboundedSender<Ticket>,
    cancel: CancellationToken,
) {
    let mut heap: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::new();
    // Generation per channel: stale heap entries (superseded by a newer
    // Schedule) are discarded when they surface.
    let mut generation: HashMap<String, u64> = HashMap::new();
    let mut seq: u64 = 0;

    info!("scheduler loop started");
    loop {
        // Drop stale entries at the top before computing the sleep target.
        while let Some(Reverse(top)) = heap.peek() {
            if generation.get(&top.channel_id) == Some(&top.seq) {
                break;
            }
            heap.pop();
        }

        let next_fire = heap.peek().map(|Reverse(e)| e.fire_at);

        tokio::select! {
            () = cancel.cancelled() => break,
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                handle_command(cmd, &mut heap, &mut generation, &mut seq, &ticket_tx);
            }
            () = sleep_until_or_forever(next_fire) => {
                let Some(Reverse(entry)) = heap.pop() else { continue };
                if generation.get(&entry.channel_id) != Some(&entry.seq) {
                    continue;
                }
                // The channel leaves the heap until the runner reports back
                // with the next interval.
                generation.remove(&entry.channel_id);
                let _ = ticket_tx.send(Ticket {
                    channel_id: entry.channel_id,
                    reason: TicketReason::Due,
                });
            }
        }
    }
    debug!("scheduler loop stopped");
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn handle_command(
    cmd: SchedCommand,
    heap: &mut BinaryHeap<Reverse<HeapEntry>>,
    generation: &mut HashMap<String, u64>,
    seq: &mut u64,
    ticket_tx: &mpsc::UnboundedSender<Ticket>,
) {
    match cmd {
        SchedCommand::Schedule { channel_id, delay } => {
            *seq += 1;
            generation.insert(channel_id.clone(), *seq);
            heap.push(Reverse(HeapEntry {
                fire_at: Instant::now() + delay,
                seq: *seq,
                channel_id,
            }));
        }
        SchedCommand::RunNow { channel_id } => {
            // The heap entry (if any) stays; its generation is bumped when
            // the runner reschedules after this manual probe.
            let _ = ticket_tx.send(Ticket {
                channel_id,
                reason: TicketReason::Manual,
            });
        }
        SchedCommand::Remove { channel_id } => {
            generation.remove(&channel_id);
        }
        SchedCommand::Rebuild { keep, fresh } => {
            let keep: std::collections::HashSet<String> = keep.into_iter().collect();
            generation.retain(|id, _| keep.contains(id));
            for channel_id in fresh {
                let _ = ticket_tx.send(Ticket {
                    channel_id,
                    reason: TicketReason::Due,
                });
            }
        }
    }
}
