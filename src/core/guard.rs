//! Prerequisite condition evaluation with a short-TTL result cache.
//!
//! Guards answer "should this probe run at all" - e.g. is DNS reachable, is
//! a dependency port open. A failing guard skips the channel's tick without
//! recording a sample. Guard implementations never raise across the
//! boundary: evaluation failures, timeouts, and panics all become failure
//! results with a machine-readable code.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::config::GuardDef;

/// Cached guard results stay valid this long.
pub const GUARD_CACHE_TTL: Duration = Duration::from_secs(30);

/// Per-guard evaluation timeout.
pub const GUARD_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a guard did not pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardFault {
    /// Machine-readable reason code (`timeout`, `exception`,
    /// `unknown-guard`, or guard-specific)
    pub code: &'static str,
    /// Human description
    pub detail: String,
}

impl GuardFault {
    pub fn new(code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// One failed guard within a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardFailure {
    pub name: String,
    pub fault: GuardFault,
}

/// Aggregate result of evaluating a channel's guard references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardVerdict {
    pub all_passed: bool,
    pub failures: Vec<GuardFailure>,
}

impl GuardVerdict {
    pub fn passed() -> Self {
        Self {
            all_passed: true,
            failures: Vec::new(),
        }
    }
}

/// A named prerequisite condition.
#[async_trait]
pub trait GuardProbe: Send + Sync {
    async fn check(&self) -> Result<(), GuardFault>;
}

type CachedOutcome = Result<(), GuardFault>;

struct CacheEntry {
    at: Instant,
    outcome: CachedOutcome,
}

/// Evaluates named guards with caching and bounded per-guard time.
pub struct GuardEvaluator {
    guards: Mutex<HashMap<String, Arc<dyn GuardProbe>>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    timeout: Duration,
}

impl GuardEvaluator {
    pub fn new(guards: HashMap<String, Arc<dyn GuardProbe>>) -> Self {
        Self {
            guards: Mutex::new(guards),
            cache: Mutex::new(HashMap::new()),
            ttl: GUARD_CACHE_TTL,
            timeout: GUARD_TIMEOUT,
        }
    }

    /// Shrink the cache TTL and timeout (for tests).
    pub fn with_limits(mut self, ttl: Duration, timeout: Duration) -> Self {
        self.ttl = ttl;
        self.timeout = timeout;
        self
    }

    /// Replace the guard set on configuration reload. The cache is cleared;
    /// a redefined guard must not serve its predecessor's result.
    pub fn replace_guards(&self, guards: HashMap<String, Arc<dyn GuardProbe>>) {
        *self.guards.lock().unwrap() = guards;
        self.cache.lock().unwrap().clear();
    }

    /// Evaluate the referenced guards concurrently. The aggregate passes only
    /// when every guard passes; unknown references fail with `unknown-guard`.
    pub async fn evaluate(&self, refs: &[String]) -> GuardVerdict {
        if refs.is_empty() {
            return GuardVerdict::passed();
        }

        let now = Instant::now();
        let mut failures = Vec::new();
        let mut to_run: Vec<(String, Arc<dyn GuardProbe>)> = Vec::new();

        {
            let cache = self.cache.lock().unwrap();
            let guards = self.guards.lock().unwrap();
            for name in refs {
                if let Some(entry) = cache.get(name) {
                    if now.duration_since(entry.at) < self.ttl {
                        if let Err(fault) = &entry.outcome {
                            failures.push(GuardFailure {
                                name: name.clone(),
                                fault: fault.clone(),
                            });
                        }
                        continue;
                    }
                }
                match guards.get(name) {
                    Some(guard) => to_run.push((name.clone(), Arc::clone(guard))),
                    None => failures.push(GuardFailure {
                        name: name.clone(),
                        fault: GuardFault::new("unknown-guard", format!("no guard named {name}")),
                    }),
                }
            }
        }

        let timeout = self.timeout;
        let evaluations = to_run.into_iter().map(|(name, guard)| async move {
            // Spawned so a panicking guard implementation degrades to a
            // failure result instead of unwinding the scheduler.
            let handle =
                tokio::spawn(
                    async move { tokio::time::timeout(timeout, guard.check()).await },
                );
            let outcome: CachedOutcome = match handle.await {
                Ok(Ok(result)) => result,
                Ok(Err(_elapsed)) => Err(GuardFault::new(
                    "timeout",
                    format!("guard did not answer within {}ms", timeout.as_millis()),
                )),
                Err(join_err) => Err(GuardFault::new(
                    "exception",
                    format!("guard implementation failed: {join_err}"),
                )),
            };
            (name, outcome)
        });

        for (name, outcome) in futures::future::join_all(evaluations).await {
            if let Err(fault) = &outcome {
                debug!(guard = %name, code = fault.code, detail = %fault.detail, "guard failed");
                failures.push(GuardFailure {
                    name: name.clone(),
                    fault: fault.clone(),
                });
            }
            self.cache.lock().unwrap().insert(
                name,
                CacheEntry {
                    at: now,
                    outcome,
                },
            );
        }

        GuardVerdict {
            all_passed: failures.is_empty(),
            failures,
        }
    }
}

/// Build guard implementations from configuration definitions.
pub fn build_guards(defs: &HashMap<String, GuardDef>) -> HashMap<String, Arc<dyn GuardProbe>> {
    defs.iter()
        .map(|(name, def)| {
            let guard: Arc<dyn GuardProbe> = match def {
                GuardDef::Dns { hostname } => Arc::new(DnsGuard {
                    hostname: hostname.clone(),
                }),
                GuardDef::Tcp { host, port } => Arc::new(TcpGuard {
                    host: host.clone(),
                    port: *port,
                }),
            };
            (name.clone(), guard)
        })
        .collect()
}

/// Passes when the hostname resolves to at least one address.
struct DnsGuard {
    hostname: String,
}

#[async_trait]
impl GuardProbe for DnsGuard {
    async fn check(&self) -> Result<(), GuardFault> {
        match tokio::net::lookup_host((self.hostname.as_str(), 0u16)).await {
            Ok(mut addrs) => {
                if addrs.next().is_some() {
                    Ok(())
                } else {
                    Err(GuardFault::new(
                        "dns-no-records",
                        format!("{} resolved to no addresses", self.hostname),
                    ))
                }
            }
            Err(e) => Err(GuardFault::new(
                "dns-unresolvable",
                format!("{}: {e}", self.hostname),
            )),
        }
    }
}

/// Passes when a TCP connection to host:port succeeds.
struct TcpGuard {
    host: String,
    port: u16,
}

#[async_trait]
impl GuardProbe for TcpGuard {
    async fn check(&self) -> Result<(), GuardFault> {
        match tokio::net::TcpStream::connect((self.host.as_str(), self.port)).await {
            Ok(_) => Ok(()),
            Err(e) => Err(GuardFault::new(
                "tcp-unreachable",
                format!("{}:{}: {e}", self.host, self.port),
            )),
        }
    }
}
