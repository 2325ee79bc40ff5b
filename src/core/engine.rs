/*!
The composition root: wiring, lifecycle, and the host command surface.

[`Engine::new`] is pure - it validates the configuration and stores the
wiring inputs. [`Engine::start`] performs the async setup (store open and
load, coordinator join, background tasks) and flips the engine to running;
[`Engine::stop`] is idempotent and flushes everything down. Commands called
before `start` return [`EngineError::NotReady`] instead of dispatching into
half-built collaborators.

Component references flow one way, from here downward. The only dynamic
cross-component coupling is the [`EventBus`].

## Probe flow

The scheduler loop fires tickets; the runner handles each one:
leader check → back-pressure check → guard evaluation → dispatch →
state-machine apply → persistence → event publication → next-interval
computation → reschedule. A skipped tick (follower, shed, guard-failed,
disabled) reschedules without recording a sample.
*/

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError, Defaults};
use crate::core::coordinator::{Coordinator, CoordinatorError, CoordinatorSettings};
use crate::core::dispatcher::{Dispatcher, ProbeRegistry, DEFAULT_CONCURRENCY};
use crate::core::events::{Event, EventBus};
use crate::core::guard::{build_guards, GuardEvaluator};
use crate::core::scheduler::{
    self, CadenceInputs, SchedCommand, SchedulerHandle, Ticket, TicketReason,
};
use crate::core::snooze::SnoozeRegistry;
use crate::core::state_machine::{apply_sample, repair_invariants, ApplyOutcome};
use crate::core::store::{AtomicStore, OutageLog, Record, StoreError};
use crate::core::types::{
    epoch_ms, Cadence, Channel, ChannelDigest, ChannelState, EpochMillis, Role, Sample, Snooze,
    WatchDuration, WatchOverrides, WatchScope, WatchSession,
};
use crate::core::watch::{WatchError, WatchManager};

/// Engine tuning knobs; the defaults match the documented environment
/// configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub coordinator: CoordinatorSettings,
    /// Concurrent probe dispatch cap
    pub probe_concurrency: usize,
    /// Dispatch backlog above which low-priority ticks are shed
    pub queue_soft_limit: usize,
    /// Event bus buffer per subscriber
    pub event_capacity: usize,
    /// Maximum random delay before a channel's first probe
    pub startup_stagger: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorSettings::default(),
            probe_concurrency: DEFAULT_CONCURRENCY,
            queue_soft_limit: 128,
            event_capacity: 256,
            startup_stagger: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is not running")]
    NotReady,
    #[error("engine already started")]
    AlreadyStarted,
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Watch(#[from] WatchError),
}

enum Phase {
    Created(Box<Config>),
    Running(Arc<Running>),
    Stopped,
}

/// The health-monitoring engine.
pub struct Engine {
    workspace: PathBuf,
    settings: EngineSettings,
    registry: Arc<ProbeRegistry>,
    events: EventBus,
    phase: RwLock<Phase>,
    starting: AtomicBool,
}

struct Running {
    settings: EngineSettings,
    events: EventBus,
    defaults: RwLock<Defaults>,
    channels: RwLock<HashMap<String, Channel>>,
    states: Mutex<HashMap<String, Arc<Mutex<ChannelState>>>>,
    channel_cancels: Mutex<HashMap<String, CancellationToken>>,
    in_flight: Mutex<HashSet<String>>,
    outages: Mutex<OutageLog>,
    store: Arc<AtomicStore>,
    coordinator: Arc<Coordinator>,
    dispatcher: Arc<Dispatcher>,
    guards: Arc<GuardEvaluator>,
    watches: Arc<WatchManager>,
    snoozes: Arc<SnoozeRegistry>,
    sched: SchedulerHandle,
    cancel: CancellationToken,
    dirty: Notify,
}

impl Engine {
    /// Create an engine for a workspace directory. Pure: validates the
    /// configuration and records the wiring inputs; no I/O happens until
    /// [`Engine::start`].
    pub fn new(
        workspace: impl Into<PathBuf>,
        config: Config,
        registry: ProbeRegistry,
    ) -> Result<Self, ConfigError> {
        Self::with_settings(workspace, config, registry, EngineSettings::default())
    }

    pub fn with_settings(
        workspace: impl Into<PathBuf>,
        config: Config,
        registry: ProbeRegistry,
        settings: EngineSettings,
    ) -> Result<Self, ConfigError> {
        config.validate(&registry)?;
        Ok(Self {
            workspace: workspace.into(),
            events: EventBus::new(settings.event_capacity),
            settings,
            registry: Arc::new(registry),
            phase: RwLock::new(Phase::Created(Box::new(config))),
            starting: AtomicBool::new(false),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Current coordinator role, when running.
    pub fn role(&self) -> Option<Role> {
        match &*self.phase.read().unwrap() {
            Phase::Running(running) => Some(running.coordinator.role()),
            _ => None,
        }
    }

    /// Perform the async wiring: open and load the store, join the
    /// workspace, and start the scheduler, runner, and publisher tasks.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self
            .starting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::AlreadyStarted);
        }

        let config = match &*self.phase.read().unwrap() {
            Phase::Created(config) => (**config).clone(),
            _ => {
                self.starting.store(false, Ordering::SeqCst);
                return Err(EngineError::AlreadyStarted);
            }
        };

        match self.boot(config).await {
            Ok(running) => {
                let mut phase = self.phase.write().unwrap();
                if matches!(*phase, Phase::Created(_)) {
                    *phase = Phase::Running(running);
                    info!(workspace = %self.workspace.display(), "engine started");
                    Ok(())
                } else {
                    // Stopped while booting: tear the fresh wiring down.
                    running.cancel.cancel();
                    Err(EngineError::NotReady)
                }
            }
            Err(e) => {
                self.starting.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn boot(&self, config: Config) -> Result<Arc<Running>, EngineError> {
        let cancel = CancellationToken::new();
        let store = Arc::new(AtomicStore::open(self.workspace.clone(), self.events.clone()));
        let snapshot = store.load_all().await?;

        let coordinator = Coordinator::new(
            self.workspace.clone(),
            self.settings.coordinator.clone(),
            Arc::clone(&store),
            self.events.clone(),
            cancel.child_token(),
        );
        coordinator.start().await?;

        let watches = Arc::new(WatchManager::new(self.events.clone()));
        watches.load(snapshot.watches, epoch_ms());
        let snoozes = Arc::new(SnoozeRegistry::new());
        snoozes.load(snapshot.snoozes, epoch_ms());

        let (ticket_tx, ticket_rx) = mpsc::unbounded_channel::<Ticket>();
        let sched = scheduler::spawn_loop(ticket_tx, cancel.child_token());

        let defaults = config.defaults.clone();
        let mut states: HashMap<String, Arc<Mutex<ChannelState>>> = HashMap::new();
        let mut outages = snapshot.outages;
        for channel in &config.channels {
            let mut state = snapshot
                .channel_states
                .get(&channel.id)
                .cloned()
                .unwrap_or_default();
            let repairs = repair_invariants(
                &mut state,
                &channel.id,
                channel.threshold(&defaults),
                epoch_ms(),
            );
            if !repairs.is_empty() {
                drop(store.write_record(Record::ChannelState {
                    channel_id: channel.id.clone(),
                    state: state.clone(),
                }));
            }
            // The channel state record is authoritative for open outages.
            match &state.open_outage {
                Some(outage) => {
                    outages.open.insert(channel.id.clone(), outage.clone());
                }
                None => {
                    outages.open.remove(&channel.id);
                }
            }
            states.insert(channel.id.clone(), Arc::new(Mutex::new(state)));
        }

        let running = Arc::new(Running {
            settings: self.settings.clone(),
            events: self.events.clone(),
            defaults: RwLock::new(defaults),
            channels: RwLock::new(
                config
                    .channels
                    .iter()
                    .map(|c| (c.id.clone(), c.clone()))
                    .collect(),
            ),
            states: Mutex::new(states),
            channel_cancels: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            outages: Mutex::new(outages),
            store,
            coordinator,
            dispatcher: Arc::new(Dispatcher::new(
                Arc::clone(&self.registry),
                self.settings.probe_concurrency,
            )),
            guards: Arc::new(GuardEvaluator::new(build_guards(&config.guards))),
            watches,
            snoozes,
            sched,
            cancel,
            dirty: Notify::new(),
        });

        tokio::spawn(runner_loop(Arc::clone(&running), ticket_rx));
        tokio::spawn(publisher_loop(Arc::clone(&running)));
        tokio::spawn(watch_event_loop(Arc::clone(&running)));

        // First probes are staggered so a restart does not fire every
        // channel at once.
        let stagger_ms = self.settings.startup_stagger.as_millis().max(1) as u64;
        for channel in config.channels.iter().filter(|c| c.enabled) {
            let delay = Duration::from_millis(rand::rng().random_range(0..stagger_ms));
            running.sched.send(SchedCommand::Schedule {
                channel_id: channel.id.clone(),
                delay,
            });
        }

        Ok(running)
    }

    /// Stop the engine: persist sessions, resign leadership, and flush the
    /// store. Idempotent; the engine cannot be restarted afterwards.
    pub async fn stop(&self) {
        let running = {
            let mut phase = self.phase.write().unwrap();
            match std::mem::replace(&mut *phase, Phase::Stopped) {
                Phase::Running(running) => running,
                _ => return,
            }
        };

        running.cancel.cancel();
        // Active sessions persist as active so they survive the restart.
        drop(
            running
                .store
                .write_record(Record::Watch(running.watches.to_records())),
        );
        drop(
            running
                .store
                .write_record(Record::Snooze(running.snoozes.to_records())),
        );
        running.coordinator.resign().await;
        if let Err(e) = running.store.flush().await {
            warn!(error = %e, "final store flush failed");
        }
        info!("engine stopped");
    }

    /// Alias for [`Engine::stop`], matching the host command surface.
    pub async fn shutdown(&self) {
        self.stop().await;
    }

    fn running(&self) -> Result<Arc<Running>, EngineError> {
        match &*self.phase.read().unwrap() {
            Phase::Running(running) => Ok(Arc::clone(running)),
            _ => Err(EngineError::NotReady),
        }
    }

    // ── Host commands ──

    /// Apply a new configuration. On validation failure the previous
    /// configuration remains active.
    pub fn apply_configuration(&self, config: Config) -> Result<(), EngineError> {
        config.validate(&self.registry)?;

        let mut phase = self.phase.write().unwrap();
        match &mut *phase {
            Phase::Created(stored) => {
                **stored = config;
                Ok(())
            }
            Phase::Running(running) => {
                apply_config_running(running, config);
                Ok(())
            }
            Phase::Stopped => Err(EngineError::NotReady),
        }
    }

    pub fn start_global_watch(
        &self,
        duration: WatchDuration,
        overrides: WatchOverrides,
    ) -> Result<WatchSession, EngineError> {
        let running = self.running()?;
        Ok(running.watches.start_global(duration, overrides)?)
    }

    pub fn stop_global_watch(&self) -> Result<Option<WatchSession>, EngineError> {
        let running = self.running()?;
        Ok(running.watches.stop("*"))
    }

    pub fn start_channel_watch(
        &self,
        channel_id: &str,
        duration: WatchDuration,
        overrides: WatchOverrides,
    ) -> Result<WatchSession, EngineError> {
        let running = self.running()?;
        if !running.channels.read().unwrap().contains_key(channel_id) {
            return Err(EngineError::UnknownChannel(channel_id.to_string()));
        }
        Ok(running
            .watches
            .start_channel(channel_id, duration, overrides)?)
    }

    pub fn stop_channel_watch(&self, channel_id: &str) -> Result<Option<WatchSession>, EngineError> {
        let running = self.running()?;
        Ok(running.watches.stop(channel_id))
    }

    /// Suppress alert visibility for a scope (`"*"` or a channel id).
    /// Sample collection continues unchanged.
    pub fn snooze(
        &self,
        scope: &str,
        duration: Duration,
        reason: &str,
    ) -> Result<Snooze, EngineError> {
        let running = self.running()?;
        let snooze = running
            .snoozes
            .add(scope, duration.as_millis() as u64, reason);
        drop(
            running
                .store
                .write_record(Record::Snooze(running.snoozes.to_records())),
        );
        Ok(snooze)
    }

    pub fn clear_snooze(&self, scope: &str) -> Result<usize, EngineError> {
        let running = self.running()?;
        let removed = running.snoozes.clear(scope);
        drop(
            running
                .store
                .write_record(Record::Snooze(running.snoozes.to_records())),
        );
        Ok(removed)
    }

    pub fn is_snoozed(&self, channel_id: &str) -> Result<bool, EngineError> {
        let running = self.running()?;
        Ok(running.snoozes.is_snoozed(channel_id, epoch_ms()))
    }

    /// Schedule an immediate probe, bypassing the interval. Guard
    /// evaluation still applies.
    pub fn run_channel_now(&self, channel_id: &str) -> Result<(), EngineError> {
        let running = self.running()?;
        if !running.channels.read().unwrap().contains_key(channel_id) {
            return Err(EngineError::UnknownChannel(channel_id.to_string()));
        }
        running.sched.send(SchedCommand::RunNow {
            channel_id: channel_id.to_string(),
        });
        Ok(())
    }

    /// Snapshot of a channel's live state.
    pub fn channel_state(&self, channel_id: &str) -> Result<Option<ChannelState>, EngineError> {
        let running = self.running()?;
        let states = running.states.lock().unwrap();
        Ok(states.get(channel_id).map(|cell| cell.lock().unwrap().clone()))
    }

    /// Fraction of successful samples within the trailing window.
    pub fn availability(
        &self,
        channel_id: &str,
        window: Duration,
    ) -> Result<Option<f64>, EngineError> {
        let running = self.running()?;
        let since = epoch_ms().saturating_sub(window.as_millis() as u64);
        Ok(running.store.availability(channel_id, since))
    }

    /// Closed outages for a channel, oldest first.
    pub fn outage_history(&self, channel_id: &str) -> Result<Vec<crate::core::types::Outage>, EngineError> {
        let running = self.running()?;
        let outages = running.outages.lock().unwrap();
        Ok(outages
            .closed
            .iter()
            .filter(|o| o.channel_id == channel_id)
            .cloned()
            .collect())
    }
}

impl Running {
    fn state_cell(&self, channel_id: &str) -> Arc<Mutex<ChannelState>> {
        let mut states = self.states.lock().unwrap();
        Arc::clone(states.entry(channel_id.to_string()).or_default())
    }

    fn channel_cancel(&self, channel_id: &str) -> CancellationToken {
        let mut cancels = self.channel_cancels.lock().unwrap();
        cancels
            .entry(channel_id.to_string())
            .or_insert_with(|| self.cancel.child_token())
            .clone()
    }

    fn watch_interval_override(&self, channel: &Channel) -> Option<u32> {
        self.watches
            .effective_overrides(&channel.id, channel.priority)
            .and_then(|o| o.interval_sec)
    }

    /// Compute the channel's next interval from its current state and
    /// reschedule it. `preserve` skips the computation and keeps a given
    /// delay (back-pressure shed path).
    fn schedule_next(&self, channel: &Channel, preserve: Option<Duration>) {
        let delay = preserve.unwrap_or_else(|| {
            let defaults = self.defaults.read().unwrap().clone();
            let cell = self.state_cell(&channel.id);
            let mut cs = cell.lock().unwrap();
            let decision = scheduler::compute_interval(
                &CadenceInputs {
                    baseline_sec: channel.baseline_sec(&defaults),
                    jitter_pct: channel.jitter_pct(&defaults),
                    priority: channel.priority,
                    threshold: channel.threshold(&defaults),
                    state: &cs,
                    watch_override_sec: self.watch_interval_override(channel),
                },
                &mut rand::rng(),
            );
            cs.cadence = Cadence {
                interval_sec: decision.interval.as_secs() as u32,
                adjusted_at_ms: Some(epoch_ms()),
                reason: Some(decision.reason),
            };
            decision.interval
        });
        self.sched.send(SchedCommand::Schedule {
            channel_id: channel.id.clone(),
            delay,
        });
    }

    fn build_digests(&self) -> (BTreeMap<String, ChannelDigest>, Option<EpochMillis>) {
        let channels = self.channels.read().unwrap();
        let states = self.states.lock().unwrap();
        let mut digests = BTreeMap::new();
        let mut last_probe = None;
        for id in channels.keys() {
            let Some(cell) = states.get(id) else { continue };
            let cs = cell.lock().unwrap();
            if let Some(sample) = &cs.last_sample {
                last_probe = last_probe.max(Some(sample.timestamp_ms));
            }
            digests.insert(
                id.clone(),
                ChannelDigest {
                    state: cs.state,
                    last_sample: cs.last_sample.clone(),
                    last_state_change_ms: cs.last_state_change_ms,
                },
            );
        }
        (digests, last_probe)
    }
}

/// Apply a validated configuration to a running engine.
fn apply_config_running(running: &Arc<Running>, config: Config) {
    let defaults_changed = {
        let mut defaults = running.defaults.write().unwrap();
        let changed = *defaults != config.defaults;
        *defaults = config.defaults.clone();
        changed
    };
    running.guards.replace_guards(build_guards(&config.guards));

    let new_ids: HashSet<String> = config.channels.iter().map(|c| c.id.clone()).collect();
    let mut keep = Vec::new();
    let mut fresh = Vec::new();
    {
        let mut channels = running.channels.write().unwrap();
        for channel in &config.channels {
            match channels.get(&channel.id) {
                Some(existing)
                    if !defaults_changed
                        && existing.interval_sec == channel.interval_sec
                        && existing.enabled == channel.enabled =>
                {
                    // Unchanged cadence: the pending heap entry keeps its
                    // remaining time.
                    keep.push(channel.id.clone());
                }
                Some(_) => fresh.push(channel.id.clone()),
                None => fresh.push(channel.id.clone()),
            }
        }

        // Removed channels: cancel in-flight dispatches, drop state.
        let removed: Vec<String> = channels
            .keys()
            .filter(|id| !new_ids.contains(*id))
            .cloned()
            .collect();
        for id in &removed {
            if let Some(cancel) = running.channel_cancels.lock().unwrap().remove(id) {
                cancel.cancel();
            }
            running.states.lock().unwrap().remove(id);
            running.sched.send(SchedCommand::Remove {
                channel_id: id.clone(),
            });
        }
        running.store.retain_channels(|id| new_ids.contains(id));

        *channels = config
            .channels
            .iter()
            .map(|c| (c.id.clone(), c.clone()))
            .collect();
    }

    let fresh_enabled: Vec<String> = {
        let channels = running.channels.read().unwrap();
        fresh
            .into_iter()
            .filter(|id| channels.get(id).is_some_and(|c| c.enabled))
            .collect()
    };
    info!(
        kept = keep.len(),
        changed = fresh_enabled.len(),
        "configuration applied"
    );
    running.sched.send(SchedCommand::Rebuild {
        keep,
        fresh: fresh_enabled,
    });
}

// ── Background tasks ──

async fn runner_loop(running: Arc<Running>, mut tickets: mpsc::UnboundedReceiver<Ticket>) {
    loop {
        tokio::select! {
            () = running.cancel.cancelled() => break,
            ticket = tickets.recv() => {
                let Some(ticket) = ticket else { break };
                let running = Arc::clone(&running);
                tokio::spawn(async move {
                    handle_ticket(running, ticket).await;
                });
            }
        }
    }
    debug!("runner stopped");
}

async fn handle_ticket(running: Arc<Running>, ticket: Ticket) {
    let channel = {
        let channels = running.channels.read().unwrap();
        channels.get(&ticket.channel_id).cloned()
    };
    let Some(channel) = channel else {
        // Removed by a reload that raced this ticket.
        return;
    };

    if !channel.enabled {
        running.schedule_next(&channel, Some(stable_delay(&running, &channel)));
        return;
    }

    // Followers keep the heap warm but never probe.
    if running.coordinator.role() != Role::Leader {
        running.schedule_next(&channel, None);
        return;
    }

    // Back-pressure: shed due ticks of non-urgent channels while the pool
    // backlog is deep; manual probes always go through.
    if ticket.reason == TicketReason::Due
        && running.dispatcher.queued() > running.settings.queue_soft_limit
        && channel.priority <= crate::core::types::Priority::Medium
    {
        let preserved = {
            let cell = running.state_cell(&channel.id);
            let cs = cell.lock().unwrap();
            Duration::from_secs(u64::from(cs.cadence.interval_sec.max(1)))
        };
        debug!(channel = %channel.id, "tick shed under back-pressure");
        running.schedule_next(&channel, Some(preserved));
        return;
    }

    // At most one dispatch in flight per channel.
    {
        let mut in_flight = running.in_flight.lock().unwrap();
        if !in_flight.insert(channel.id.clone()) {
            running.schedule_next(&channel, None);
            return;
        }
    }

    let probed = probe_channel(&running, &channel).await;

    running.in_flight.lock().unwrap().remove(&channel.id);
    if probed {
        running.schedule_next(&channel, None);
    } else {
        // Guard-skipped ticks reinsert at the stable cadence.
        running.schedule_next(&channel, Some(stable_delay(&running, &channel)));
    }
}

/// Baseline-derived delay used when a tick is skipped without a sample.
fn stable_delay(running: &Running, channel: &Channel) -> Duration {
    let defaults = running.defaults.read().unwrap().clone();
    let baseline = channel
        .baseline_sec(&defaults)
        .min(scheduler::STABLE_CEILING_SEC)
        .max(scheduler::MIN_INTERVAL_SEC);
    Duration::from_secs(u64::from(baseline))
}

/// Run guards and, when they pass, one probe dispatch. Returns whether a
/// sample was recorded.
async fn probe_channel(running: &Arc<Running>, channel: &Channel) -> bool {
    let verdict = running.guards.evaluate(&channel.guards).await;
    if !verdict.all_passed {
        debug!(
            channel = %channel.id,
            failed = ?verdict.failures.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            "guards failed; tick skipped"
        );
        return false;
    }

    let defaults = running.defaults.read().unwrap().clone();
    let overrides = running
        .watches
        .effective_overrides(&channel.id, channel.priority);
    let timeout = overrides
        .and_then(|o| o.timeout_ms)
        .map(Duration::from_millis)
        .unwrap_or_else(|| channel.timeout(&defaults));

    let mut sample = running
        .dispatcher
        .dispatch(channel, timeout, running.channel_cancel(&channel.id))
        .await;
    sample.during_watch = overrides.is_some();
    sample.during_snooze = running.snoozes.is_snoozed(&channel.id, sample.timestamp_ms);

    record_sample(running, channel, &defaults, sample);
    true
}

/// Apply a sample and fan out persistence and events.
fn record_sample(running: &Arc<Running>, channel: &Channel, defaults: &Defaults, sample: Sample) {
    // A reload may have removed the channel while this dispatch was in
    // flight; recording would resurrect its state entry.
    if !running.channels.read().unwrap().contains_key(&channel.id) {
        return;
    }
    let threshold = channel.threshold(defaults);
    let cell = running.state_cell(&channel.id);
    let (outcome, state_snapshot): (ApplyOutcome, ChannelState) = {
        let mut cs = cell.lock().unwrap();
        let outcome = apply_sample(&mut cs, threshold, &sample);
        if !outcome.duplicate {
            repair_invariants(&mut cs, &channel.id, threshold, sample.timestamp_ms);
        }
        (outcome, cs.clone())
    };

    if outcome.duplicate {
        debug!(channel = %channel.id, ts = sample.timestamp_ms, "duplicate sample ignored");
        return;
    }

    drop(running.store.append_sample(sample.clone()));
    drop(running.store.write_record(Record::ChannelState {
        channel_id: channel.id.clone(),
        state: state_snapshot.clone(),
    }));

    let outage_changed = !sample.success
        || outcome.closed.is_some()
        || outcome.blip.is_some()
        || outcome.opened.is_some();
    if outage_changed {
        let log_snapshot = {
            let mut log = running.outages.lock().unwrap();
            match &state_snapshot.open_outage {
                Some(outage) => {
                    log.open.insert(channel.id.clone(), outage.clone());
                }
                None => {
                    log.open.remove(&channel.id);
                }
            }
            if let Some(closed) = &outcome.closed {
                log.record_closed(closed.clone());
            }
            log.clone()
        };
        drop(running.store.write_record(Record::Outages(log_snapshot)));
    }

    running.watches.note_sample(&channel.id);

    running.events.publish(Event::Sample {
        sample: sample.clone(),
    });
    if let Some(transition) = outcome.transition {
        running.events.publish(Event::StateChanged {
            channel_id: channel.id.clone(),
            from: transition.from,
            to: transition.to,
            at_ms: transition.at_ms,
            snoozed: running.snoozes.is_snoozed(&channel.id, transition.at_ms),
        });
    }
    if let Some(outage) = outcome.opened {
        running.events.publish(Event::OutageOpened { outage });
    }
    if let Some(outage) = outcome.closed {
        running.events.publish(Event::OutageClosed { outage });
    }

    running.dirty.notify_one();
}

/// Publish shared-state snapshots: immediately after channel changes and at
/// the publish interval regardless, so followers can tell a live leader
/// from a quiet one.
async fn publisher_loop(running: Arc<Running>) {
    let mut tick = tokio::time::interval(running.settings.coordinator.publish_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = running.cancel.cancelled() => break,
            _ = tick.tick() => {}
            () = running.dirty.notified() => {}
        }
        if running.coordinator.role() != Role::Leader {
            continue;
        }
        let (digests, last_probe) = running.build_digests();
        let active = running.in_flight.lock().unwrap().len() as u32;
        if let Err(e) = running.coordinator.publish(digests, active, last_probe) {
            debug!(error = %e, "snapshot publish skipped");
        }
    }
    debug!("publisher stopped");
}

/// React to watch lifecycle events (manual and expiry alike): persist the
/// session set and reschedule covered channels so overrides take effect
/// without waiting out the old interval.
async fn watch_event_loop(running: Arc<Running>) {
    let mut rx = running.events.subscribe();
    loop {
        let event = tokio::select! {
            () = running.cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        let scope = match event {
            Ok(Event::WatchStarted { session }) | Ok(Event::WatchEnded { session }) => {
                session.scope
            }
            Ok(_) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        drop(
            running
                .store
                .write_record(Record::Watch(running.watches.to_records())),
        );

        let covered: Vec<Channel> = {
            let channels = running.channels.read().unwrap();
            channels
                .values()
                .filter(|c| c.enabled && scope.covers(&c.id))
                .cloned()
                .collect()
        };
        for channel in covered {
            // Skip channels mid-dispatch; they reschedule on completion.
            if running.in_flight.lock().unwrap().contains(&channel.id) {
                continue;
            }
            running.schedule_next(&channel, None);
        }
    }
    debug!("watch event loop stopped");
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match &*self.phase.read().unwrap() {
            Phase::Created(_) => "created",
            Phase::Running(_) => "running",
            Phase::Stopped => "stopped",
        };
        f.debug_struct("Engine")
            .field("workspace", &self.workspace)
            .field("phase", &phase)
            .finish()
    }
}

impl Engine {
    /// The workspace directory this engine persists into.
    pub fn workspace(&self) -> &std::path::Path {
        &self.workspace
    }

    /// Convenience wrapper over [`WatchScope`] keyed commands.
    pub fn stop_watch(&self, scope: &WatchScope) -> Result<Option<WatchSession>, EngineError> {
        let running = self.running()?;
        Ok(running.watches.stop(scope.key()))
    }
}
