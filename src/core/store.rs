/*!
Crash-safe JSON persistence for the monitoring workspace.

The store is the single authoritative writer for every record file in the
workspace directory (the leader lock is owned by the coordinator and bypasses
the queue). Readers - including other cooperating processes - observe either
the previous or the new content of a record, never a torn intermediate,
because every write goes through a temp file, `fsync`, and an atomic rename.

## Write queue

All writes funnel through one writer task. Queued writes to the same target
coalesce: only the latest payload is persisted, and every caller that queued
a superseded payload is completed when the surviving write lands. Callers
that need durability await the returned [`WriteHandle`]; background callers
drop it and rely on `store-health` events for failure surfacing.

## Failure semantics

I/O errors are retried with bounded exponential backoff (3 attempts).
Persistent failure completes the handle with an error, publishes
`store-health(degraded)`, and the engine proceeds in memory - the store is
authoritative for restart, not for liveness.

## Corrupt files

Unparseable records get a best-effort recovery pass (first valid JSON value,
trailing garbage discarded). Unrecoverable files are renamed to a
`.corrupt.<ts>` sibling and treated as empty. Records with a schema version
newer than this build are rejected with a logged incompatibility and treated
as absent.
*/

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::core::events::{Event, EventBus};
use crate::core::types::{
    epoch_ms, ChannelState, EpochMillis, Outage, Sample, SharedStateSnapshot, Snooze, WatchSession,
};

/// Current on-disk schema version. Readers reject anything newer.
pub const SCHEMA_VERSION: u32 = 1;

/// Per-record file size cap. Oversized records are trimmed once and retried.
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;

/// Bounded per-channel sample ring.
pub const SAMPLE_RING_MAX: usize = 1000;

/// Closed outages retained in the history record.
pub const CLOSED_OUTAGES_MAX: usize = 500;

const WRITE_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Common envelope wrapped around every persisted payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub schema_version: u32,
    pub written_at: EpochMillis,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            written_at: epoch_ms(),
            payload,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("record {kind} exceeds {MAX_RECORD_BYTES} bytes after trimming ({size} bytes)")]
    TooLarge { kind: &'static str, size: usize },
    #[error("store write failed: {0}")]
    WriteFailed(String),
    #[error("store writer task is gone")]
    WriterGone,
}

/// Open and recently closed outages, persisted as one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OutageLog {
    /// At most one open outage per channel
    #[serde(default)]
    pub open: BTreeMap<String, Outage>,
    /// Closed outages, append-only, newest last
    #[serde(default)]
    pub closed: Vec<Outage>,
}

impl OutageLog {
    /// Append a closed outage, keeping the newest [`CLOSED_OUTAGES_MAX`].
    pub fn record_closed(&mut self, outage: Outage) {
        self.closed.push(outage);
        if self.closed.len() > CLOSED_OUTAGES_MAX {
            let excess = self.closed.len() - CLOSED_OUTAGES_MAX;
            self.closed.drain(..excess);
        }
    }
}

/// A typed record accepted by [`AtomicStore::write_record`].
#[derive(Debug, Clone)]
pub enum Record {
    SharedState(SharedStateSnapshot),
    ChannelState {
        channel_id: String,
        state: ChannelState,
    },
    Samples {
        channel_id: String,
        ring: Vec<Sample>,
    },
    Outages(OutageLog),
    Watch(Vec<WatchSession>),
    Snooze(Vec<Snooze>),
}

impl Record {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Record::SharedState(_) => "shared-state",
            Record::ChannelState { .. } => "channel-state",
            Record::Samples { .. } => "samples",
            Record::Outages(_) => "outages",
            Record::Watch(_) => "watch",
            Record::Snooze(_) => "snooze",
        }
    }

    fn path(&self, root: &Path) -> PathBuf {
        match self {
            Record::SharedState(_) => shared_state_path(root),
            Record::ChannelState { channel_id, .. } => channel_state_path(root, channel_id),
            Record::Samples { channel_id, .. } => channel_samples_path(root, channel_id),
            Record::Outages(_) => outages_path(root),
            Record::Watch(_) => watch_path(root),
            Record::Snooze(_) => snooze_path(root),
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Record::SharedState(s) => serde_json::to_vec_pretty(&Envelope::new(s)),
            Record::ChannelState { state, .. } => serde_json::to_vec_pretty(&Envelope::new(state)),
            Record::Samples { ring, .. } => serde_json::to_vec_pretty(&Envelope::new(ring)),
            Record::Outages(log) => serde_json::to_vec_pretty(&Envelope::new(log)),
            Record::Watch(sessions) => serde_json::to_vec_pretty(&Envelope::new(sessions)),
            Record::Snooze(entries) => serde_json::to_vec_pretty(&Envelope::new(entries)),
        }
    }

    /// Trim the record toward its documented retention cap. Returns false
    /// when the record kind has nothing left to trim.
    fn trim(&mut self) -> bool {
        match self {
            Record::Samples { ring, .. } if ring.len() > SAMPLE_RING_MAX => {
                let excess = ring.len() - SAMPLE_RING_MAX;
                ring.drain(..excess);
                true
            }
            Record::Outages(log) if log.closed.len() > CLOSED_OUTAGES_MAX => {
                let excess = log.closed.len() - CLOSED_OUTAGES_MAX;
                log.closed.drain(..excess);
                true
            }
            _ => false,
        }
    }

    /// Serialize with the size cap applied: one trim-and-retry, then fail.
    fn encode(mut self) -> Result<Vec<u8>, StoreError> {
        let kind = self.kind_name();
        let bytes = self.encode_payload()?;
        if bytes.len() <= MAX_RECORD_BYTES {
            return Ok(bytes);
        }
        if self.trim() {
            let bytes = self.encode_payload()?;
            if bytes.len() <= MAX_RECORD_BYTES {
                return Ok(bytes);
            }
            return Err(StoreError::TooLarge {
                kind,
                size: bytes.len(),
            });
        }
        Err(StoreError::TooLarge {
            kind,
            size: bytes.len(),
        })
    }
}

// Workspace file layout

pub fn leader_lock_path(root: &Path) -> PathBuf {
    root.join("leader.lock")
}

pub fn shared_state_path(root: &Path) -> PathBuf {
    root.join("shared-state.json")
}

pub fn channels_dir(root: &Path) -> PathBuf {
    root.join("channels")
}

pub fn channel_state_path(root: &Path, channel_id: &str) -> PathBuf {
    channels_dir(root).join(format!("{channel_id}.state.json"))
}

pub fn channel_samples_path(root: &Path, channel_id: &str) -> PathBuf {
    channels_dir(root).join(format!("{channel_id}.samples.json"))
}

pub fn outages_path(root: &Path) -> PathBuf {
    root.join("outages.json")
}

pub fn watch_path(root: &Path) -> PathBuf {
    root.join("watch.json")
}

pub fn snooze_path(root: &Path) -> PathBuf {
    root.join("snooze.json")
}

/// Everything the store knows after a restart.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    pub channel_states: HashMap<String, ChannelState>,
    pub samples: HashMap<String, VecDeque<Sample>>,
    pub outages: OutageLog,
    pub watches: Vec<WatchSession>,
    pub snoozes: Vec<Snooze>,
    pub shared_state: Option<SharedStateSnapshot>,
}

/// Completion handle for one queued write.
///
/// Awaiting resolves once the content (or a newer coalesced payload for the
/// same target) is durable on disk. Dropping the handle detaches the caller;
/// the write still happens.
#[derive(Debug)]
pub struct WriteHandle {
    rx: oneshot::Receiver<Result<(), StoreError>>,
}

impl WriteHandle {
    pub async fn durable(self) -> Result<(), StoreError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(StoreError::WriterGone),
        }
    }

    fn failed(err: StoreError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { rx }
    }
}

enum WriterMsg {
    Write {
        path: PathBuf,
        kind: &'static str,
        bytes: Vec<u8>,
        done: oneshot::Sender<Result<(), StoreError>>,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
}

/// Crash-safe persistence with a coalescing single-writer queue.
pub struct AtomicStore {
    root: PathBuf,
    tx: mpsc::UnboundedSender<WriterMsg>,
    rings: Mutex<HashMap<String, VecDeque<Sample>>>,
}

impl AtomicStore {
    /// Open a store rooted at the workspace directory and spawn its writer
    /// task. The directory is created on first write.
    pub fn open(root: PathBuf, events: EventBus) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(rx, events));
        Self {
            root,
            tx,
            rings: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Upsert a typed record. Either the new content is fully readable after
    /// the handle resolves, or the previous content still is - no
    /// intermediate state is visible to any reader.
    pub fn write_record(&self, record: Record) -> WriteHandle {
        let path = record.path(&self.root);
        let kind = record.kind_name();
        let bytes = match record.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(kind, error = %err, "refusing unencodable record");
                return WriteHandle::failed(err);
            }
        };
        let (done, rx) = oneshot::channel();
        if self
            .tx
            .send(WriterMsg::Write {
                path,
                kind,
                bytes,
                done,
            })
            .is_err()
        {
            return WriteHandle::failed(StoreError::WriterGone);
        }
        WriteHandle { rx }
    }

    /// Append one sample to the channel's bounded ring and queue the ring
    /// for persistence. On overflow the oldest sample is dropped.
    pub fn append_sample(&self, sample: Sample) -> WriteHandle {
        let channel_id = sample.channel_id.clone();
        let ring: Vec<Sample> = {
            let mut rings = self.rings.lock().unwrap();
            let ring = rings.entry(channel_id.clone()).or_default();
            ring.push_back(sample);
            while ring.len() > SAMPLE_RING_MAX {
                ring.pop_front();
            }
            ring.iter().cloned().collect()
        };
        self.write_record(Record::Samples { channel_id, ring })
    }

    /// Snapshot of a channel's in-memory sample ring, oldest first.
    pub fn samples(&self, channel_id: &str) -> Vec<Sample> {
        self.rings
            .lock()
            .unwrap()
            .get(channel_id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Fraction of successful samples at or after `since_ms`, if any.
    pub fn availability(&self, channel_id: &str, since_ms: EpochMillis) -> Option<f64> {
        let rings = self.rings.lock().unwrap();
        let ring = rings.get(channel_id)?;
        let mut total = 0u32;
        let mut ok = 0u32;
        for sample in ring.iter().filter(|s| s.timestamp_ms >= since_ms) {
            total += 1;
            if sample.success {
                ok += 1;
            }
        }
        (total > 0).then(|| ok as f64 / total as f64)
    }

    /// Drop rings for channels removed by a configuration reload.
    pub fn retain_channels(&self, keep: impl Fn(&str) -> bool) {
        self.rings.lock().unwrap().retain(|id, _| keep(id));
    }

    /// Block until all writes queued so far are durable on disk.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(WriterMsg::Flush { done })
            .map_err(|_| StoreError::WriterGone)?;
        rx.await.map_err(|_| StoreError::WriterGone)
    }

    /// Read every persisted record. Missing files yield empty defaults;
    /// corrupt files are quarantined and treated as empty.
    pub async fn load_all(&self) -> Result<StoreSnapshot, StoreError> {
        let mut snapshot = StoreSnapshot {
            shared_state: read_envelope(&shared_state_path(&self.root)).await?,
            outages: read_envelope(&outages_path(&self.root))
                .await?
                .unwrap_or_default(),
            watches: read_envelope(&watch_path(&self.root))
                .await?
                .unwrap_or_default(),
            snoozes: read_envelope(&snooze_path(&self.root))
                .await?
                .unwrap_or_default(),
            ..Default::default()
        };

        let dir = channels_dir(&self.root);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.prime_rings(&snapshot);
                return Ok(snapshot);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(id) = name.strip_suffix(".state.json") {
                if let Some(state) = read_envelope::<ChannelState>(&path).await? {
                    snapshot.channel_states.insert(id.to_string(), state);
                }
            } else if let Some(id) = name.strip_suffix(".samples.json") {
                if let Some(ring) = read_envelope::<Vec<Sample>>(&path).await? {
                    snapshot
                        .samples
                        .insert(id.to_string(), ring.into_iter().collect());
                }
            }
        }

        self.prime_rings(&snapshot);
        Ok(snapshot)
    }

    fn prime_rings(&self, snapshot: &StoreSnapshot) {
        let mut rings = self.rings.lock().unwrap();
        for (id, ring) in &snapshot.samples {
            rings.insert(id.clone(), ring.clone());
        }
    }
}

/// Read one enveloped record, applying schema rejection, best-effort tail
/// recovery, and quarantine. `Ok(None)` means "treat as absent".
async fn read_envelope<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let value = match serde_json::from_str::<serde_json::Value>(&content) {
        Ok(value) => value,
        Err(parse_err) => {
            // Discard-tail recovery: a crashed writer of a pre-atomic build
            // (or external tooling) may have left trailing garbage after a
            // valid document.
            let mut stream =
                serde_json::Deserializer::from_str(&content).into_iter::<serde_json::Value>();
            match stream.next() {
                Some(Ok(value)) => {
                    warn!(path = %path.display(), "recovered record by discarding trailing bytes");
                    value
                }
                _ => {
                    quarantine(path, &parse_err.to_string()).await;
                    return Ok(None);
                }
            }
        }
    };

    let version = value
        .get("schema_version")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;
    if version > SCHEMA_VERSION {
        warn!(
            path = %path.display(),
            version,
            supported = SCHEMA_VERSION,
            "record written by a newer build; treating as absent"
        );
        return Ok(None);
    }

    match serde_json::from_value::<Envelope<T>>(value) {
        Ok(envelope) => Ok(Some(envelope.payload)),
        Err(e) => {
            quarantine(path, &e.to_string()).await;
            Ok(None)
        }
    }
}

async fn quarantine(path: &Path, reason: &str) {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let target = PathBuf::from(format!("{}.corrupt.{}", path.display(), stamp));
    match tokio::fs::rename(path, &target).await {
        Ok(()) => error!(
            path = %path.display(),
            quarantined = %target.display(),
            reason,
            "unrecoverable record quarantined"
        ),
        Err(e) => error!(
            path = %path.display(),
            reason,
            error = %e,
            "failed to quarantine corrupt record"
        ),
    }
}

/// Write bytes so that readers observe the old or the new content, never a
/// torn intermediate: temp file, fsync, rename, then best-effort parent
/// directory fsync.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let tmp = temp_sibling(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    // Parent directory fsync makes the rename itself durable; failure here
    // cannot produce a torn record, so it is tolerated.
    #[cfg(unix)]
    {
        let parent = parent.to_path_buf();
        let _ = tokio::task::spawn_blocking(move || {
            std::fs::File::open(parent).and_then(|dir| dir.sync_all())
        })
        .await;
    }

    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    use rand::Rng;
    let nonce: u32 = rand::rng().random();
    PathBuf::from(format!(
        "{}.tmp.{}.{:08x}",
        path.display(),
        std::process::id(),
        nonce
    ))
}

async fn writer_task(mut rx: mpsc::UnboundedReceiver<WriterMsg>, events: EventBus) {
    let mut order: VecDeque<PathBuf> = VecDeque::new();
    let mut pending: HashMap<PathBuf, PendingWrite> = HashMap::new();
    let mut flush_waiters: Vec<oneshot::Sender<()>> = Vec::new();
    let mut degraded = false;
    let mut open = true;

    loop {
        if pending.is_empty() {
            if !flush_waiters.is_empty() {
                for waiter in flush_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
            if !open {
                break;
            }
            match rx.recv().await {
                Some(msg) => absorb(msg, &mut order, &mut pending, &mut flush_waiters),
                None => {
                    open = false;
                    continue;
                }
            }
        }

        // Coalesce everything already queued before touching the disk.
        while let Ok(msg) = rx.try_recv() {
            absorb(msg, &mut order, &mut pending, &mut flush_waiters);
        }

        let Some(path) = order.pop_front() else {
            continue;
        };
        let Some(write) = pending.remove(&path) else {
            continue;
        };

        let result = write_with_retry(&path, &write.bytes).await;
        match result {
            Ok(()) => {
                if degraded {
                    degraded = false;
                    events.publish(Event::StoreHealth {
                        degraded: false,
                        detail: format!("{} write recovered", write.kind),
                    });
                }
                for waiter in write.waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) => {
                error!(kind = write.kind, path = %path.display(), error = %e, "persistent write failure");
                if !degraded {
                    degraded = true;
                    events.publish(Event::StoreHealth {
                        degraded: true,
                        detail: format!("{} write failed: {e}", write.kind),
                    });
                }
                let detail = e.to_string();
                for waiter in write.waiters {
                    let _ = waiter.send(Err(StoreError::WriteFailed(detail.clone())));
                }
            }
        }
    }
    debug!("store writer stopped");
}

struct PendingWrite {
    kind: &'static str,
    bytes: Vec<u8>,
    waiters: Vec<oneshot::Sender<Result<(), StoreError>>>,
}

fn absorb(
    msg: WriterMsg,
    order: &mut VecDeque<PathBuf>,
    pending: &mut HashMap<PathBuf, PendingWrite>,
    flush_waiters: &mut Vec<oneshot::Sender<()>>,
) {
    match msg {
        WriterMsg::Write {
            path,
            kind,
            bytes,
            done,
        } => match pending.get_mut(&path) {
            Some(existing) => {
                // Latest queued payload wins; earlier callers complete with it.
                existing.bytes = bytes;
                existing.waiters.push(done);
            }
            None => {
                order.push_back(path.clone());
                pending.insert(
                    path,
                    PendingWrite {
                        kind,
                        bytes,
                        waiters: vec![done],
                    },
                );
            }
        },
        WriterMsg::Flush { done } => {
            if pending.is_empty() {
                let _ = done.send(());
            } else {
                flush_waiters.push(done);
            }
        }
    }
}

async fn write_with_retry(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut last_err = None;
    for attempt in 0..WRITE_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(RETRY_BASE_DELAY * 4u32.pow(attempt - 1)).await;
        }
        match write_atomic(path, bytes).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(path = %path.display(), attempt = attempt + 1, error = %e, "atomic write failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("write failed")))
}
