/*!
Multi-process coordination over the workspace directory.

Exactly one cooperating process per workspace acts as leader: it executes
probes, applies samples, and publishes a condensed [`SharedStateSnapshot`]
for the others. Followers observe the snapshot file and re-publish channel
events locally without probing.

## Leader election

Election is filesystem-only. The leader lock (`leader.lock`) is acquired
with an exclusive create; on collision the existing lock decides - fresh
heartbeat means follow, stale heartbeat means the lock is stolen. Stealing
happens under a separate fs2 guard file so two followers cannot both delete
and recreate the lock: only the guard holder may remove a stale lock, and it
re-reads the lock under the guard before deleting.

## Heartbeat and failover

While leading, the lock file is rewritten (atomically) every heartbeat
interval. Three consecutive heartbeat write failures force resignation. A
crashed leader simply stops heartbeating; followers reclaim once the lock
ages past the stale timeout, so failover completes within roughly
stale-timeout + one heartbeat interval.

The lock file is authoritative: a leader that reads back a fresh foreign
holder lost a write race, removes its own publication, and demotes. On the
follower side, split-brain publications are resolved deterministically -
the publisher with the older acquisition timestamp wins, tie-broken on the
identity string.
*/

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::events::{Event, EventBus};
use crate::core::store::{self, AtomicStore, Record};
use crate::core::types::{
    epoch_ms, process_identity, ChannelDigest, EpochMillis, LeaderLock, Role,
    SharedStateSnapshot,
};

/// Coordination timing knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Lock rewrite cadence while leading
    pub heartbeat: Duration,
    /// A lock whose heartbeat is older than this is reclaimable
    pub stale_timeout: Duration,
    /// Maximum delay between leader snapshot publications
    pub publish_interval: Duration,
    /// Follower poll cadence (notify wakeups arrive earlier when available)
    pub poll_interval: Duration,
    /// Consecutive heartbeat write failures before resigning
    pub max_heartbeat_failures: u32,
    /// Bounded join attempts before giving up
    pub acquire_attempts: u32,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(3),
            stale_timeout: Duration::from_secs(10),
            publish_interval: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            max_heartbeat_failures: 3,
            acquire_attempts: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("coordinator i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("coordinator serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("could neither acquire leadership nor follow an existing leader")]
    NoRole,
    #[error("not the leader")]
    NotLeader,
}

/// What the lock file currently says.
enum LockView {
    Absent,
    Held(LeaderLock),
    /// Unreadable lock; eligible for steal like a stale one
    Corrupt,
}

/// Workspace coordination: role management, heartbeat, snapshot publication.
pub struct Coordinator {
    workspace: PathBuf,
    settings: CoordinatorSettings,
    identity: String,
    events: EventBus,
    store: Arc<AtomicStore>,
    role_tx: watch::Sender<Role>,
    acquired_at_ms: AtomicU64,
    version: AtomicU64,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        workspace: PathBuf,
        settings: CoordinatorSettings,
        store: Arc<AtomicStore>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (role_tx, _) = watch::channel(Role::Joining);
        Arc::new(Self {
            workspace,
            settings,
            identity: process_identity(),
            events,
            store,
            role_tx,
            acquired_at_ms: AtomicU64::new(0),
            version: AtomicU64::new(0),
            cancel,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn role(&self) -> Role {
        *self.role_tx.borrow()
    }

    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Join the workspace: become leader or follower, then keep the role
    /// loop running in the background. Fails only when neither role could be
    /// reached within the bounded join attempts.
    pub async fn start(self: &Arc<Self>) -> Result<Role, CoordinatorError> {
        let initial = self.join().await?;
        self.set_role(initial);

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.run(initial).await;
        });
        Ok(initial)
    }

    /// Publish a shared-state snapshot. Leader only; versions are assigned
    /// here and strictly increase for this publisher.
    pub fn publish(
        &self,
        channels: std::collections::BTreeMap<String, ChannelDigest>,
        active_probes: u32,
        last_probe_ms: Option<EpochMillis>,
    ) -> Result<u64, CoordinatorError> {
        if self.role() != Role::Leader {
            return Err(CoordinatorError::NotLeader);
        }
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = SharedStateSnapshot {
            version,
            published_at_ms: epoch_ms(),
            publisher: self.identity.clone(),
            publisher_acquired_at_ms: self.acquired_at_ms.load(Ordering::SeqCst),
            channels,
            active_probes,
            last_probe_ms,
        };
        // Durability failures surface through store-health events.
        drop(self.store.write_record(Record::SharedState(snapshot)));
        self.events.publish(Event::SnapshotPublished {
            version,
            publisher: self.identity.clone(),
        });
        Ok(version)
    }

    /// Explicit resignation: release the lock and stop coordinating.
    /// Idempotent; used by engine shutdown.
    pub async fn resign(&self) {
        if self.role() == Role::Resigning {
            return;
        }
        self.set_role(Role::Resigning);
        self.cancel.cancel();
        if self.acquired_at_ms.load(Ordering::SeqCst) > 0 {
            self.release_lock().await;
        }
    }

    fn set_role(&self, role: Role) {
        let changed = *self.role_tx.borrow() != role;
        self.role_tx.send_replace(role);
        if changed {
            info!(role = %role, identity = %self.identity, "coordinator role changed");
            self.events.publish(Event::LeadershipChanged { role });
        }
    }

    async fn run(self: Arc<Self>, initial: Role) {
        let mut role = initial;
        loop {
            role = match role {
                Role::Leader => self.lead().await,
                Role::Follower => self.follow().await,
                Role::Joining => match self.join().await {
                    Ok(next) => next,
                    Err(e) => {
                        warn!(error = %e, "rejoin failed; retrying as follower");
                        tokio::time::sleep(self.settings.poll_interval).await;
                        Role::Joining
                    }
                },
                Role::Resigning => break,
            };
            self.set_role(role);
            if role == Role::Resigning {
                if self.acquired_at_ms.swap(0, Ordering::SeqCst) > 0 {
                    self.release_lock().await;
                }
                break;
            }
        }
        debug!(identity = %self.identity, "coordinator stopped");
    }

    // ── Join ──

    async fn join(&self) -> Result<Role, CoordinatorError> {
        for attempt in 0..self.settings.acquire_attempts {
            if self.cancel.is_cancelled() {
                return Ok(Role::Resigning);
            }
            if attempt > 0 {
                // Jittered backoff keeps colliding joiners apart.
                let jitter_ms = rand::rng().random_range(25..150) * attempt as u64;
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            }

            match self.try_exclusive_create().await {
                Ok(true) => return Ok(Role::Leader),
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, attempt, "lock creation failed");
                    continue;
                }
            }

            match self.read_lock().await {
                LockView::Held(lock) if !lock.is_stale(epoch_ms(), self.settings.stale_timeout) => {
                    debug!(holder = %lock.holder, "fresh leader present; following");
                    return Ok(Role::Follower);
                }
                LockView::Held(lock) => {
                    debug!(holder = %lock.holder, "stale lock; attempting steal");
                    self.steal_stale_lock(Some(lock.heartbeat_at_ms)).await?;
                }
                LockView::Corrupt => {
                    // Unreadable lock: reclaimable only once its mtime goes
                    // stale - a freshly created lock may simply be mid-write.
                    if !self.steal_stale_lock(None).await? {
                        return Ok(Role::Follower);
                    }
                }
                LockView::Absent => {}
            }
        }
        Err(CoordinatorError::NoRole)
    }

    /// Create the lock file fail-if-exists. Returns true when this process
    /// became the holder.
    async fn try_exclusive_create(&self) -> std::io::Result<bool> {
        tokio::fs::create_dir_all(&self.workspace).await?;
        let path = store::leader_lock_path(&self.workspace);
        let now = epoch_ms();
        let lock = LeaderLock {
            holder: self.identity.clone(),
            pid: std::process::id(),
            acquired_at_ms: now,
            heartbeat_at_ms: now,
        };
        let bytes = serde_json::to_vec_pretty(&lock).expect("lock record serializes");

        let open = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        let mut file = match open {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e),
        };
        use tokio::io::AsyncWriteExt;
        file.write_all(&bytes).await?;
        file.sync_all().await?;

        self.acquired_at_ms.store(now, Ordering::SeqCst);
        self.version.store(0, Ordering::SeqCst);
        info!(identity = %self.identity, "leadership acquired");
        Ok(true)
    }

    /// Delete a stale or corrupt lock under the steal guard. The guard file
    /// serializes stealers; the lock is re-read under the guard and only
    /// removed if its heartbeat has not moved. Returns whether the lock was
    /// removed.
    async fn steal_stale_lock(
        &self,
        expected_heartbeat: Option<EpochMillis>,
    ) -> Result<bool, CoordinatorError> {
        let workspace = self.workspace.clone();
        let stale_timeout = self.settings.stale_timeout;
        let removed = tokio::task::spawn_blocking(move || {
            steal_under_guard(&workspace, expected_heartbeat, stale_timeout)
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;
        if removed {
            debug!("stale lock removed");
        }
        Ok(removed)
    }

    async fn read_lock(&self) -> LockView {
        let path = store::leader_lock_path(&self.workspace);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<LeaderLock>(&content) {
                Ok(lock) => LockView::Held(lock),
                Err(e) => {
                    warn!(error = %e, "unreadable leader lock");
                    LockView::Corrupt
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LockView::Absent,
            Err(e) => {
                warn!(error = %e, "leader lock read failed");
                LockView::Corrupt
            }
        }
    }

    async fn release_lock(&self) {
        let path = store::leader_lock_path(&self.workspace);
        // Only remove the lock if it is still ours.
        if let LockView::Held(lock) = self.read_lock().await {
            if lock.holder == self.identity {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(error = %e, "failed to remove leader lock");
                } else {
                    info!(identity = %self.identity, "leadership released");
                }
            }
        }
    }

    /// Remove our shared-state publication after losing a lock race.
    async fn remove_publication(&self) {
        let path = store::shared_state_path(&self.workspace);
        let ours = matches!(
            tokio::fs::read_to_string(&path).await,
            Ok(content) if content.contains(&self.identity)
        );
        if ours {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    // ── Leader ──

    async fn lead(&self) -> Role {
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Role::Resigning,
                _ = heartbeat.tick() => {}
            }

            // The lock file is authoritative: losing a write race means a
            // fresh foreign holder is in it.
            if let LockView::Held(lock) = self.read_lock().await {
                if lock.holder != self.identity
                    && !lock.is_stale(epoch_ms(), self.settings.stale_timeout)
                {
                    warn!(
                        winner = %lock.holder,
                        winner_acquired = lock.acquired_at_ms,
                        "foreign leader detected; demoting"
                    );
                    self.acquired_at_ms.store(0, Ordering::SeqCst);
                    self.remove_publication().await;
                    return Role::Follower;
                }
            }

            match self.write_heartbeat().await {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, failures, "heartbeat write failed");
                    if failures >= self.settings.max_heartbeat_failures {
                        warn!("heartbeat capability lost; resigning");
                        return Role::Resigning;
                    }
                }
            }
        }
    }

    async fn write_heartbeat(&self) -> Result<(), CoordinatorError> {
        let lock = LeaderLock {
            holder: self.identity.clone(),
            pid: std::process::id(),
            acquired_at_ms: self.acquired_at_ms.load(Ordering::SeqCst),
            heartbeat_at_ms: epoch_ms(),
        };
        let bytes = serde_json::to_vec_pretty(&lock)?;
        store::write_atomic(&store::leader_lock_path(&self.workspace), &bytes).await?;
        Ok(())
    }

    // ── Follower ──

    async fn follow(&self) -> Role {
        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Filesystem notification cuts observation latency below the poll
        // interval when the platform supports it.
        let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
        let _watcher = watch_workspace(&self.workspace, wake_tx);

        let mut observer = SnapshotObserver::new(self.settings.stale_timeout);
        let mut corrupt_since: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Role::Resigning,
                _ = poll.tick() => {}
                _ = wake_rx.recv() => {}
            }

            if let Some(snapshot) = self.read_shared_state().await {
                if observer.accept(&snapshot) {
                    self.mirror_snapshot(&observer, snapshot);
                }
            }

            match self.read_lock().await {
                LockView::Absent => {
                    debug!("leader lock absent; rejoining");
                    return Role::Joining;
                }
                LockView::Held(lock)
                    if lock.is_stale(epoch_ms(), self.settings.stale_timeout) =>
                {
                    debug!(holder = %lock.holder, "leader went stale; rejoining");
                    return Role::Joining;
                }
                LockView::Corrupt => {
                    // Could be a starting leader mid-write; rejoin only when
                    // the lock stays unreadable past the stale timeout.
                    let since = *corrupt_since.get_or_insert_with(tokio::time::Instant::now);
                    if since.elapsed() > self.settings.stale_timeout {
                        return Role::Joining;
                    }
                }
                LockView::Held(_) => {
                    corrupt_since = None;
                }
            }
        }
    }

    async fn read_shared_state(&self) -> Option<SharedStateSnapshot> {
        let path = store::shared_state_path(&self.workspace);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        let envelope: crate::core::store::Envelope<SharedStateSnapshot> =
            serde_json::from_str(&content).ok()?;
        if envelope.schema_version > crate::core::store::SCHEMA_VERSION {
            return None;
        }
        Some(envelope.payload)
    }

    /// Re-publish an accepted snapshot as local events so host UIs stay
    /// live without probing.
    fn mirror_snapshot(&self, observer: &SnapshotObserver, snapshot: SharedStateSnapshot) {
        for event in observer.pending_events() {
            self.events.publish(event.clone());
        }
        self.events.publish(Event::SnapshotPublished {
            version: snapshot.version,
            publisher: snapshot.publisher,
        });
    }
}

/// Version- and publisher-gated snapshot acceptance for followers.
struct SnapshotObserver {
    stale_timeout: Duration,
    current: Option<ObservedPublisher>,
    digests: std::collections::HashMap<String, ChannelDigest>,
    pending: Vec<Event>,
}

struct ObservedPublisher {
    identity: String,
    acquired_at_ms: EpochMillis,
    version: u64,
    published_at_ms: EpochMillis,
}

impl SnapshotObserver {
    fn new(stale_timeout: Duration) -> Self {
        Self {
            stale_timeout,
            current: None,
            digests: std::collections::HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Decide whether a snapshot advances the observed state, and stage the
    /// channel events it implies. Snapshots that do not advance are ignored
    /// (R3: replaying an accepted version is a no-op).
    fn accept(&mut self, snapshot: &SharedStateSnapshot) -> bool {
        match &self.current {
            Some(current) if current.identity == snapshot.publisher => {
                if snapshot.version <= current.version {
                    return false;
                }
            }
            Some(current) => {
                let current_quiet = epoch_ms().saturating_sub(current.published_at_ms)
                    > self.stale_timeout.as_millis() as u64;
                let wins = (snapshot.publisher_acquired_at_ms, snapshot.publisher.as_str())
                    < (current.acquired_at_ms, current.identity.as_str());
                if !wins && !current_quiet {
                    debug!(
                        publisher = %snapshot.publisher,
                        "ignoring snapshot from losing split-brain publisher"
                    );
                    return false;
                }
            }
            None => {}
        }

        self.pending.clear();
        for (channel_id, digest) in &snapshot.channels {
            let previous = self.digests.get(channel_id);
            let prev_state = previous.map(|d| d.state).unwrap_or_default();
            if prev_state != digest.state {
                self.pending.push(Event::StateChanged {
                    channel_id: channel_id.clone(),
                    from: prev_state,
                    to: digest.state,
                    at_ms: digest.last_state_change_ms.unwrap_or(snapshot.published_at_ms),
                    snoozed: false,
                });
            }
            let new_sample = match (previous.and_then(|d| d.last_sample.as_ref()), &digest.last_sample) {
                (Some(old), Some(new)) => old.timestamp_ms != new.timestamp_ms,
                (None, Some(_)) => true,
                _ => false,
            };
            if new_sample {
                if let Some(sample) = &digest.last_sample {
                    self.pending.push(Event::Sample {
                        sample: sample.clone(),
                    });
                }
            }
            self.digests.insert(channel_id.clone(), digest.clone());
        }

        self.current = Some(ObservedPublisher {
            identity: snapshot.publisher.clone(),
            acquired_at_ms: snapshot.publisher_acquired_at_ms,
            version: snapshot.version,
            published_at_ms: snapshot.published_at_ms,
        });
        true
    }

    fn pending_events(&self) -> &[Event] {
        &self.pending
    }
}

/// Serialize stealers through an fs2 exclusive lock on a guard file, then
/// remove the stale lock if it has not changed since the caller observed it.
fn steal_under_guard(
    workspace: &Path,
    expected_heartbeat: Option<EpochMillis>,
    stale_timeout: Duration,
) -> std::io::Result<bool> {
    use fs2::FileExt;

    let guard_path = store::leader_lock_path(workspace).with_extension("lock.guard");
    let guard = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&guard_path)?;

    if guard.try_lock_exclusive().is_err() {
        // Another process is mid-steal; let it finish.
        return Ok(false);
    }

    let lock_path = store::leader_lock_path(workspace);
    let removed = match std::fs::read_to_string(&lock_path) {
        Ok(content) => match serde_json::from_str::<LeaderLock>(&content) {
            Ok(lock) => {
                let unchanged =
                    expected_heartbeat.map_or(true, |hb| hb == lock.heartbeat_at_ms);
                if unchanged && lock.is_stale(epoch_ms(), stale_timeout) {
                    std::fs::remove_file(&lock_path)?;
                    true
                } else {
                    false
                }
            }
            // Unreadable lock: reclaim only once the file itself has gone
            // stale, so a mid-write lock from a starting leader survives.
            Err(_) => {
                let old_enough = std::fs::metadata(&lock_path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|mtime| mtime.elapsed().ok())
                    .map_or(true, |age| age > stale_timeout);
                if old_enough {
                    std::fs::remove_file(&lock_path)?;
                    true
                } else {
                    false
                }
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e),
    };

    let _ = fs2::FileExt::unlock(&guard);
    Ok(removed)
}

/// Watch the workspace directory for changes; wakes the follower loop early.
fn watch_workspace(
    workspace: &Path,
    wake_tx: mpsc::Sender<()>,
) -> Option<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |_: notify::Result<notify::Event>| {
        let _ = wake_tx.try_send(());
    })
    .ok()?;
    watcher.watch(workspace, RecursiveMode::NonRecursive).ok()?;
    Some(watcher)
}
