//! Typed configuration consumed by the engine.
//!
//! Parsing from a configuration file is the embedding's concern (the CLI
//! uses [`file`] when the `cli` feature is on); the engine itself consumes
//! an in-memory [`Config`] and validates it before use. Validation failures
//! leave a previously applied configuration active.

#[cfg(feature = "cli")]
pub mod file;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::dispatcher::ProbeRegistry;
use crate::core::scheduler::{MAX_INTERVAL_SEC, MIN_INTERVAL_SEC};
use crate::core::types::{Channel, ProbeParams};

fn default_interval_sec() -> u32 {
    60
}
fn default_timeout_ms() -> u64 {
    3000
}
fn default_threshold() -> u32 {
    3
}
fn default_jitter_pct() -> u8 {
    10
}

/// Fallbacks for per-channel cadence fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_interval_sec")]
    pub interval_sec: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    #[serde(default = "default_jitter_pct")]
    pub jitter_pct: u8,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            interval_sec: default_interval_sec(),
            timeout_ms: default_timeout_ms(),
            threshold: default_threshold(),
            jitter_pct: default_jitter_pct(),
        }
    }
}

/// Named guard definition, built into a guard implementation at apply time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GuardDef {
    /// Passes when the hostname resolves
    Dns { hostname: String },
    /// Passes when host:port accepts a TCP connection
    Tcp { host: String, port: u16 },
}

/// The complete monitoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub guards: HashMap<String, GuardDef>,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("channel id may only contain letters, digits, '.', '_' and '-': {0:?}")]
    InvalidChannelId(String),
    #[error("duplicate channel id: {0}")]
    DuplicateChannelId(String),
    #[error("channel {0}: threshold must be at least 1")]
    ZeroThreshold(String),
    #[error("channel {id}: interval {interval_sec}s outside [{MIN_INTERVAL_SEC}, {MAX_INTERVAL_SEC}]")]
    IntervalOutOfRange { id: String, interval_sec: u32 },
    #[error("channel {id}: jitter {jitter_pct}% exceeds 50%")]
    JitterOutOfRange { id: String, jitter_pct: u8 },
    #[error("channel {id}: no probe operation registered for kind {kind}")]
    UnsupportedKind { id: String, kind: String },
    #[error("channel {id}: invalid url: {detail}")]
    InvalidUrl { id: String, detail: String },
    #[error("channel {id}: port must not be zero")]
    ZeroPort { id: String },
    #[error("channel {id}: empty {field}")]
    EmptyField { id: String, field: &'static str },
    #[error("channel {id} references unknown guard {guard}")]
    UnknownGuard { id: String, guard: String },
    #[error("defaults: threshold must be at least 1")]
    ZeroDefaultThreshold,
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

impl Config {
    /// Validate against the registered probe operations. Returns the first
    /// problem found; the caller keeps its previous configuration on error.
    pub fn validate(&self, registry: &ProbeRegistry) -> Result<(), ConfigError> {
        if self.defaults.threshold == 0 {
            return Err(ConfigError::ZeroDefaultThreshold);
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for channel in &self.channels {
            // Ids double as record file names; keep them path-safe.
            if !valid_id(&channel.id) {
                return Err(ConfigError::InvalidChannelId(channel.id.clone()));
            }
            if !seen.insert(&channel.id) {
                return Err(ConfigError::DuplicateChannelId(channel.id.clone()));
            }
            if channel.threshold(&self.defaults) == 0 {
                return Err(ConfigError::ZeroThreshold(channel.id.clone()));
            }
            let interval = channel.baseline_sec(&self.defaults);
            if !(MIN_INTERVAL_SEC..=MAX_INTERVAL_SEC).contains(&interval) {
                return Err(ConfigError::IntervalOutOfRange {
                    id: channel.id.clone(),
                    interval_sec: interval,
                });
            }
            let jitter = channel.jitter_pct(&self.defaults);
            if jitter > 50 {
                return Err(ConfigError::JitterOutOfRange {
                    id: channel.id.clone(),
                    jitter_pct: jitter,
                });
            }
            if !registry.supports(channel.kind()) {
                return Err(ConfigError::UnsupportedKind {
                    id: channel.id.clone(),
                    kind: channel.kind().to_string(),
                });
            }
            validate_params(channel)?;
            for guard in &channel.guards {
                if !self.guards.contains_key(guard) {
                    return Err(ConfigError::UnknownGuard {
                        id: channel.id.clone(),
                        guard: guard.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn validate_params(channel: &Channel) -> Result<(), ConfigError> {
    let id = || channel.id.clone();
    match &channel.probe {
        ProbeParams::Http { url: raw, .. } => {
            let parsed = url::Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
                id: id(),
                detail: e.to_string(),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidUrl {
                    id: id(),
                    detail: format!("unsupported scheme {}", parsed.scheme()),
                });
            }
        }
        ProbeParams::Tcp { host, port } => {
            if host.is_empty() {
                return Err(ConfigError::EmptyField {
                    id: id(),
                    field: "host",
                });
            }
            if *port == 0 {
                return Err(ConfigError::ZeroPort { id: id() });
            }
        }
        ProbeParams::Dns { hostname } => {
            if hostname.is_empty() {
                return Err(ConfigError::EmptyField {
                    id: id(),
                    field: "hostname",
                });
            }
        }
        ProbeParams::Script { command, .. } => {
            if command.is_empty() {
                return Err(ConfigError::EmptyField {
                    id: id(),
                    field: "command",
                });
            }
        }
        ProbeParams::Task { label } => {
            if label.is_empty() {
                return Err(ConfigError::EmptyField {
                    id: id(),
                    field: "label",
                });
            }
        }
    }
    Ok(())
}
