//! Built-in probe operations for the http, tcp, dns, and script kinds.
//!
//! The `task` kind is host-provided by design: configuration validation
//! rejects task channels unless the embedding host registered an operation
//! for them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::io::{copy, sink};
use isahc::config::Configurable;
use isahc::{HttpClient, Request};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::{ProbeOperation, ProbeRegistry, ProbeReport};
use crate::core::types::{ProbeKind, ProbeParams};

/// Build the default registry with every built-in operation.
pub fn builtin_registry() -> Result<ProbeRegistry, String> {
    let mut registry = ProbeRegistry::new();
    registry.register(ProbeKind::Http, Arc::new(HttpProbe::new()?));
    registry.register(ProbeKind::Tcp, Arc::new(TcpProbe));
    registry.register(ProbeKind::Dns, Arc::new(DnsProbe));
    registry.register(ProbeKind::Script, Arc::new(ScriptProbe));
    Ok(registry)
}

/// Classify transport-level failures into stable error strings.
///
/// Keeps failed-sample reasons comparable across probe kinds so outage
/// reasons stay meaningful.
fn classify_transport_error(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        "timeout"
    } else if lower.contains("connection refused") {
        "connection_refused"
    } else if lower.contains("dns") || lower.contains("resolve") {
        "dns_failure"
    } else if lower.contains("tls") || lower.contains("ssl") || lower.contains("certificate") {
        "tls_failure"
    } else if lower.contains("reset") || lower.contains("broken pipe") {
        "connection_reset"
    } else {
        "connection_error"
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// HTTP(S) probe via isahc: GET the channel URL, drain the body, judge by
/// status code.
pub struct HttpProbe {
    client: HttpClient,
}

impl HttpProbe {
    pub fn new() -> Result<Self, String> {
        let client = HttpClient::builder()
            .build()
            .map_err(|e| format!("failed to create HTTP client: {e}"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProbeOperation for HttpProbe {
    async fn run(
        &self,
        params: &ProbeParams,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> ProbeReport {
        let ProbeParams::Http { url, expect_status } = params else {
            return ProbeReport::failed("http probe received non-http params");
        };

        let request = match Request::get(url.as_str())
            .timeout(remaining(deadline))
            .body(())
        {
            Ok(request) => request,
            Err(e) => return ProbeReport::failed(format!("invalid request: {e}")),
        };

        let start = Instant::now();
        let send = self.client.send_async(request);
        let response = tokio::select! {
            result = send => result,
            () = cancel.cancelled() => return ProbeReport::failed("cancelled"),
        };

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                // Drain without allocating so keep-alive connections are reusable
                let mut body = response.into_body();
                let _ = copy(&mut body, &mut sink()).await;
                let latency = start.elapsed().as_millis() as u64;

                let ok = match expect_status {
                    Some(expected) => status == *expected,
                    None => (200..400).contains(&status),
                };
                if ok {
                    let mut report = ProbeReport::ok(latency);
                    report.details =
                        Some(HashMap::from([("status".to_string(), status.to_string())]));
                    report
                } else {
                    let mut report = ProbeReport::failed(format!("http status {status}"));
                    report.latency_ms = Some(latency);
                    report
                }
            }
            Err(e) => ProbeReport::failed(classify_transport_error(&e.to_string())),
        }
    }
}

/// TCP probe: a successful connect within the deadline is healthy.
pub struct TcpProbe;

#[async_trait]
impl ProbeOperation for TcpProbe {
    async fn run(
        &self,
        params: &ProbeParams,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> ProbeReport {
        let ProbeParams::Tcp { host, port } = params else {
            return ProbeReport::failed("tcp probe received non-tcp params");
        };

        let start = Instant::now();
        let connect = tokio::net::TcpStream::connect((host.as_str(), *port));
        tokio::select! {
            result = tokio::time::timeout_at(deadline, connect) => match result {
                Ok(Ok(_stream)) => ProbeReport::ok(start.elapsed().as_millis() as u64),
                Ok(Err(e)) => ProbeReport::failed(classify_transport_error(&e.to_string())),
                Err(_) => ProbeReport::failed("timeout"),
            },
            () = cancel.cancelled() => ProbeReport::failed("cancelled"),
        }
    }
}

/// DNS probe: the hostname must resolve to at least one address.
pub struct DnsProbe;

#[async_trait]
impl ProbeOperation for DnsProbe {
    async fn run(
        &self,
        params: &ProbeParams,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> ProbeReport {
        let ProbeParams::Dns { hostname } = params else {
            return ProbeReport::failed("dns probe received non-dns params");
        };

        let start = Instant::now();
        let lookup = tokio::net::lookup_host((hostname.as_str(), 0u16));
        tokio::select! {
            result = tokio::time::timeout_at(deadline, lookup) => match result {
                Ok(Ok(mut addrs)) => {
                    if addrs.next().is_some() {
                        ProbeReport::ok(start.elapsed().as_millis() as u64)
                    } else {
                        ProbeReport::failed("dns_failure")
                    }
                }
                Ok(Err(e)) => ProbeReport::failed(classify_transport_error(&e.to_string())),
                Err(_) => ProbeReport::failed("timeout"),
            },
            () = cancel.cancelled() => ProbeReport::failed("cancelled"),
        }
    }
}

/// Script probe: run a command, exit status zero is healthy.
pub struct ScriptProbe;

#[async_trait]
impl ProbeOperation for ScriptProbe {
    async fn run(
        &self,
        params: &ProbeParams,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> ProbeReport {
        let ProbeParams::Script { command, args } = params else {
            return ProbeReport::failed("script probe received non-script params");
        };

        let start = Instant::now();
        let mut child = match tokio::process::Command::new(command)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return ProbeReport::failed(format!("spawn failed: {e}")),
        };

        tokio::select! {
            status = tokio::time::timeout_at(deadline, child.wait()) => match status {
                Ok(Ok(status)) if status.success() => {
                    ProbeReport::ok(start.elapsed().as_millis() as u64)
                }
                Ok(Ok(status)) => ProbeReport::failed(format!("exit status {status}")),
                Ok(Err(e)) => ProbeReport::failed(format!("wait failed: {e}")),
                Err(_) => {
                    let _ = child.kill().await;
                    ProbeReport::failed("timeout")
                }
            },
            () = cancel.cancelled() => {
                let _ = child.kill().await;
                ProbeReport::failed("cancelled")
            }
        }
    }
}
