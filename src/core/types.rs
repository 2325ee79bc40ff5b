// Core types for the health-monitoring engine
use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Defaults;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = u64;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn epoch_ms() -> EpochMillis {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// RFC3339 timestamp with local offset, for human-facing rendering.
pub fn local_timestamp() -> String {
    chrono::Local::now().to_rfc3339()
}

/// Availability state of a monitored channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelHealth {
    /// Last probe succeeded
    Online,
    /// Consecutive failures reached the channel threshold
    Offline,
    /// No conclusive probe yet (startup, or mid failure streak)
    #[default]
    Unknown,
}

impl std::fmt::Display for ChannelHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelHealth::Online => write!(f, "online"),
            ChannelHealth::Offline => write!(f, "offline"),
            ChannelHealth::Unknown => write!(f, "unknown"),
        }
    }
}

/// Channel priority, ordered from least to most urgent.
///
/// Priority feeds the crisis-acceleration floor, the default watch cadence,
/// and the back-pressure shed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Default intensified-monitoring interval when a watch session does not
    /// specify an override.
    pub fn watch_interval_sec(self) -> u32 {
        match self {
            Priority::Critical => 10,
            Priority::High => 15,
            Priority::Medium => 30,
            Priority::Low => 60,
        }
    }
}

/// Probe kinds supported by the dispatcher.
///
/// The engine registers one operation per kind; channels whose kind has no
/// registered operation are rejected at configuration load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Http,
    Tcp,
    Dns,
    Script,
    /// Host-provided task execution (no built-in operation)
    Task,
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeKind::Http => write!(f, "http"),
            ProbeKind::Tcp => write!(f, "tcp"),
            ProbeKind::Dns => write!(f, "dns"),
            ProbeKind::Script => write!(f, "script"),
            ProbeKind::Task => write!(f, "task"),
        }
    }
}

/// Kind-specific probe parameters, tagged by probe kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProbeParams {
    Http {
        url: String,
        /// Expected HTTP status; any 2xx/3xx counts as success when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect_status: Option<u16>,
    },
    Tcp {
        host: String,
        port: u16,
    },
    Dns {
        hostname: String,
    },
    Script {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
    },
    Task {
        label: String,
    },
}

impl ProbeParams {
    pub fn kind(&self) -> ProbeKind {
        match self {
            ProbeParams::Http { .. } => ProbeKind::Http,
            ProbeParams::Tcp { .. } => ProbeKind::Tcp,
            ProbeParams::Dns { .. } => ProbeKind::Dns,
            ProbeParams::Script { .. } => ProbeKind::Script,
            ProbeParams::Task { .. } => ProbeKind::Task,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A monitored target declared by the user.
///
/// Created on configuration load, mutated only on configuration reload.
/// Optional cadence fields fall back to the configuration [`Defaults`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Stable identifier, unique per workspace
    pub id: String,
    /// Display name; hosts fall back to the id when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub probe: ProbeParams,
    /// Baseline probe interval in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_sec: Option<u32>,
    /// Per-probe timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Consecutive failures required for the offline transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u32>,
    /// Jitter percentage applied to computed intervals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_pct: Option<u8>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: Priority,
    /// Named guard references evaluated before each probe
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<String>,
    /// Visibility hint for host UIs; never affects scheduling
    #[serde(default)]
    pub hidden: bool,
}

impl Channel {
    pub fn kind(&self) -> ProbeKind {
        self.probe.kind()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn baseline_sec(&self, defaults: &Defaults) -> u32 {
        self.interval_sec.unwrap_or(defaults.interval_sec)
    }

    pub fn timeout(&self, defaults: &Defaults) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(defaults.timeout_ms))
    }

    pub fn threshold(&self, defaults: &Defaults) -> u32 {
        self.threshold.unwrap_or(defaults.threshold)
    }

    pub fn jitter_pct(&self, defaults: &Defaults) -> u8 {
        self.jitter_pct.unwrap_or(defaults.jitter_pct)
    }
}

/// Outcome of one probe execution. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub channel_id: String,
    /// Milliseconds since epoch; samples for one channel are applied in
    /// timestamp order
    pub timestamp_ms: EpochMillis,
    pub success: bool,
    /// Absent on immediate transport failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Absent on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// A watch session covered the channel when this probe ran
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub during_watch: bool,
    /// A snooze window covered the channel when this probe ran; availability
    /// metrics count annotated samples normally
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub during_snooze: bool,
}

impl Sample {
    pub fn ok(channel_id: impl Into<String>, timestamp_ms: EpochMillis, latency_ms: u64) -> Self {
        Self {
            channel_id: channel_id.into(),
            timestamp_ms,
            success: true,
            latency_ms: Some(latency_ms),
            error: None,
            during_watch: false,
            during_snooze: false,
        }
    }

    pub fn failed(
        channel_id: impl Into<String>,
        timestamp_ms: EpochMillis,
        error: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            timestamp_ms,
            success: false,
            latency_ms: None,
            error: Some(error.into()),
            during_watch: false,
            during_snooze: false,
        }
    }
}

/// A recorded period of offline status.
///
/// Opened in memory on the first failure of a streak; confirmed (and first
/// published) when the failure count reaches the channel threshold; closed on
/// the next success. Streaks that recover before confirmation are discarded
/// and never enter the closed history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outage {
    pub channel_id: String,
    /// Earliest failure in the streak that produced this outage
    pub first_failure_ms: EpochMillis,
    /// When the threshold was crossed and the channel went offline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at_ms: Option<EpochMillis>,
    /// Absent while the outage is open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ms: Option<EpochMillis>,
    /// end_ms − first_failure_ms, set on close
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Earliest non-empty probe error of the streak
    pub reason: String,
    pub failure_count: u32,
}

impl Outage {
    pub fn is_open(&self) -> bool {
        self.end_ms.is_none()
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at_ms.is_some()
    }
}

/// Why the scheduler chose the current probe interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalReason {
    /// A watch session override is in effect
    Watch,
    /// Channel is offline; accelerated cadence
    Crisis,
    /// Recent failures without a confirmed outage; gentle acceleration
    Recovery,
    /// Healthy baseline cadence
    Stable,
}

/// Adaptive cadence metadata attached to a channel's live state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Cadence {
    /// Interval currently in effect, seconds (0 until first computation)
    #[serde(default)]
    pub interval_sec: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjusted_at_ms: Option<EpochMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<IntervalReason>,
}

/// Per-channel live status.
///
/// Mutated exclusively by the state machine; serialized by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChannelState {
    #[serde(default)]
    pub state: ChannelHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_state_change_ms: Option<EpochMillis>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub consecutive_successes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sample: Option<Sample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_outage: Option<Outage>,
    #[serde(default)]
    pub cadence: Cadence,
    /// Recently applied sample timestamps, for (channel, timestamp)
    /// idempotence across out-of-order completions. Not persisted.
    #[serde(skip)]
    pub recent_applied: std::collections::VecDeque<EpochMillis>,
}

/// Scope of a watch session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchScope {
    Global,
    Channel(String),
}

impl WatchScope {
    /// Stable key for the at-most-one-active-session-per-scope invariant.
    /// `"*"` for global, the channel id otherwise.
    pub fn key(&self) -> &str {
        match self {
            WatchScope::Global => "*",
            WatchScope::Channel(id) => id,
        }
    }

    pub fn covers(&self, channel_id: &str) -> bool {
        match self {
            WatchScope::Global => true,
            WatchScope::Channel(id) => id == channel_id,
        }
    }
}

/// Watch session duration: a finite window or open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchDuration {
    Forever,
    Finite(u64),
}

impl WatchDuration {
    pub fn as_millis(&self) -> Option<u64> {
        match self {
            WatchDuration::Forever => None,
            WatchDuration::Finite(ms) => Some(*ms),
        }
    }

    /// Parse `"forever"`, a bare millisecond count, or `"<n><s|m|h|d>"`.
    pub fn parse(input: &str) -> Result<Self, String> {
        let trimmed = input.trim();
        if trimmed.eq_ignore_ascii_case("forever") {
            return Ok(WatchDuration::Forever);
        }
        if let Ok(ms) = trimmed.parse::<u64>() {
            return Ok(WatchDuration::Finite(ms));
        }
        let (digits, unit) = trimmed.split_at(
            trimmed
                .find(|c: char| !c.is_ascii_digit())
                .ok_or_else(|| format!("invalid duration: {trimmed}"))?,
        );
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration: {trimmed}"))?;
        let ms = match unit {
            "ms" => value,
            "s" => value * 1_000,
            "m" => value * 60_000,
            "h" => value * 3_600_000,
            "d" => value * 86_400_000,
            _ => return Err(format!("invalid duration unit: {unit}")),
        };
        Ok(WatchDuration::Finite(ms))
    }
}

impl Serialize for WatchDuration {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WatchDuration::Forever => serializer.serialize_str("forever"),
            WatchDuration::Finite(ms) => serializer.serialize_u64(*ms),
        }
    }
}

impl<'de> Deserialize<'de> for WatchDuration {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(WatchDuration::Finite(ms)),
            Raw::Text(s) => WatchDuration::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// An intensified-monitoring window, global or per-channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchSession {
    pub scope: WatchScope,
    pub started_at_ms: EpochMillis,
    pub duration: WatchDuration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_override_sec: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_override_ms: Option<u64>,
    #[serde(default)]
    pub sample_count: u64,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<EpochMillis>,
}

impl WatchSession {
    /// Wall-clock expiry, absent for open-ended sessions.
    pub fn expires_at_ms(&self) -> Option<EpochMillis> {
        self.duration
            .as_millis()
            .map(|ms| self.started_at_ms.saturating_add(ms))
    }
}

/// Cadence/timeout overrides effective for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatchOverrides {
    pub interval_sec: Option<u32>,
    pub timeout_ms: Option<u64>,
}

/// A user-declared alert-suppression window.
///
/// Snoozes never stop sample collection; consumers query the registry to
/// decide visibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snooze {
    /// Channel id, or `"*"` for all channels
    pub scope: String,
    pub start_ms: EpochMillis,
    pub end_ms: EpochMillis,
    pub reason: String,
}

impl Snooze {
    pub fn covers(&self, channel_id: &str, now_ms: EpochMillis) -> bool {
        (self.scope == "*" || self.scope == channel_id)
            && self.start_ms <= now_ms
            && now_ms < self.end_ms
    }
}

/// Condensed per-channel view inside a [`SharedStateSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDigest {
    pub state: ChannelHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sample: Option<Sample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_state_change_ms: Option<EpochMillis>,
}

/// The leader's published view of all channel states.
///
/// Versions are strictly increasing per publisher; followers ignore
/// snapshots whose version does not advance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedStateSnapshot {
    pub version: u64,
    pub published_at_ms: EpochMillis,
    /// Publisher identity string (`pid-start-nonce`)
    pub publisher: String,
    /// When the publisher acquired leadership; split-brain tie-break key
    pub publisher_acquired_at_ms: EpochMillis,
    pub channels: BTreeMap<String, ChannelDigest>,
    #[serde(default)]
    pub active_probes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_ms: Option<EpochMillis>,
}

/// On-disk leader lock record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderLock {
    /// Holder identity string (`pid-start-nonce`)
    pub holder: String,
    pub pid: u32,
    pub acquired_at_ms: EpochMillis,
    pub heartbeat_at_ms: EpochMillis,
}

impl LeaderLock {
    pub fn is_stale(&self, now_ms: EpochMillis, stale_timeout: Duration) -> bool {
        now_ms.saturating_sub(self.heartbeat_at_ms) > stale_timeout.as_millis() as u64
    }
}

/// Coordinator role within one workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Joining,
    Leader,
    Follower,
    Resigning,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Joining => write!(f, "joining"),
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
            Role::Resigning => write!(f, "resigning"),
        }
    }
}

/// Build a process identity string for lock and snapshot attribution.
///
/// `pid`, process start wall-clock, and a random nonce; unique across
/// restarts of the same pid.
pub fn process_identity() -> String {
    format!(
        "{}-{}-{}",
        std::process::id(),
        epoch_ms(),
        uuid::Uuid::new_v4().simple()
    )
}
