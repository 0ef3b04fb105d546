// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Health Monitor
//!
//! Background HTTP probes for every service that declares a reachable health
//! endpoint. Each probe runs in its own task: it checks immediately, then
//! every `interval`, each check bounded by `timeout`. A 2xx or 3xx answer is
//! healthy; anything else (including a transport error) is unhealthy.
//!
//! Each probe owns a child of the monitor's root [`CancellationToken`], so
//! [`HealthMonitor::reload`] can stop individual probes while
//! [`HealthMonitor::shutdown`] stops all of them.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::runtime::HealthLabel;
use crate::domain::stack::{ServiceSpec, StackSpec};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthState {
    pub status: HealthLabel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: HealthLabel::Unknown,
            last_checked: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub url: String,
    pub interval: Duration,
    pub timeout: Duration,
}

impl ProbeTarget {
    /// Explicit `health.url`, else the host port published for the health
    /// port (or the first published port) on loopback. `None` when the
    /// service has no HTTP endpoint reachable from the operator.
    ///
    /// A check with only `command` set is skipped: it runs inside the
    /// container as a compose healthcheck and gets no probe here.
    pub fn for_service(spec: &ServiceSpec) -> Option<Self> {
        let health = spec.health.as_ref()?;
        let url = match &health.url {
            Some(url) => url.clone(),
            None => {
                if health.command.is_some() && health.port.is_none() {
                    return None;
                }
                let host_port = match health.port {
                    Some(port) => spec.host_port_for(port)?,
                    None => spec.port_mappings().into_iter().find_map(|m| m.host)?,
                };
                format!("http://127.0.0.1:{}{}", host_port, health.path)
            }
        };
        Some(Self {
            url,
            interval: health.interval,
            timeout: health.timeout,
        })
    }
}

struct Probe {
    target: ProbeTarget,
    token: CancellationToken,
}

pub struct HealthMonitor {
    client: Client,
    table: Arc<RwLock<HashMap<String, HealthState>>>,
    probes: Mutex<HashMap<String, Probe>>,
    root: CancellationToken,
}

impl HealthMonitor {
    pub fn new() -> Self {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| {
                warn!("failed to build health probe client ({}), using defaults", e);
                Client::new()
            });
        Self::with_client(client)
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            table: Arc::new(RwLock::new(HashMap::new())),
            probes: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    /// Desired probe per workload name.
    pub fn targets(spec: &StackSpec) -> HashMap<String, ProbeTarget> {
        spec.workloads()
            .filter_map(|w| ProbeTarget::for_service(w.spec).map(|t| (w.name.to_string(), t)))
            .collect()
    }

    /// Converge running probes onto `spec`: removed or changed probes are
    /// cancelled and forgotten, new ones are spawned.
    pub fn reload(&self, spec: &StackSpec) {
        let mut desired = Self::targets(spec);
        let mut probes = self.probes.lock();

        probes.retain(|name, probe| {
            let keep = desired.get(name) == Some(&probe.target);
            if !keep {
                debug!(service = %name, "stopping health probe");
                probe.token.cancel();
                self.table.write().remove(name);
            }
            keep
        });

        desired.retain(|name, _| !probes.contains_key(name));
        for (name, target) in desired {
            info!(service = %name, url = %target.url, "starting health probe");
            let token = self.root.child_token();
            self.table.write().insert(name.clone(), HealthState::default());
            tokio::spawn(run_probe(
                self.client.clone(),
                self.table.clone(),
                name.clone(),
                target.clone(),
                token.clone(),
            ));
            probes.insert(name, Probe { target, token });
        }
    }

    /// `None` for services without a probe.
    pub fn status(&self, name: &str) -> Option<HealthState> {
        self.table.read().get(name).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, HealthState> {
        self.table.read().clone()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.lock().len()
    }

    pub fn shutdown(&self) {
        self.root.cancel();
        self.probes.lock().clear();
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

async fn run_probe(
    client: Client,
    table: Arc<RwLock<HashMap<String, HealthState>>>,
    name: String,
    target: ProbeTarget,
    token: CancellationToken,
) {
    loop {
        let outcome = tokio::select! {
            _ = token.cancelled() => break,
            outcome = probe_once(&client, &target) => outcome,
        };

        {
            let mut table = table.write();
            // A cancelled probe must not resurrect an entry reload just removed.
            if token.is_cancelled() {
                break;
            }
            let state = table.entry(name.clone()).or_default();
            let previous = state.status;
            state.last_checked = Some(Utc::now());
            match outcome {
                Ok(()) => {
                    state.status = HealthLabel::Healthy;
                    state.last_error = None;
                    state.consecutive_failures = 0;
                }
                Err(error) => {
                    state.status = HealthLabel::Unhealthy;
                    state.consecutive_failures += 1;
                    state.last_error = Some(error);
                }
            }
            if previous != state.status {
                info!(service = %name, from = ?previous, to = ?state.status, "health changed");
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(target.interval) => {}
        }
    }
    debug!(service = %name, "health probe stopped");
}

async fn probe_once(client: &Client, target: &ProbeTarget) -> Result<(), String> {
    match tokio::time::timeout(target.timeout, client.get(&target.url).send()).await {
        Err(_) => Err(format!("timed out after {:?}", target.timeout)),
        Ok(Err(e)) => Err(e.to_string()),
        Ok(Ok(response)) => {
            let status = response.status();
            if status.is_success() || status.is_redirection() {
                Ok(())
            } else {
                Err(format!("HTTP {}", status.as_u16()))
            }
        }
    }
}
