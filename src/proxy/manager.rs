use anyhow::{Result, Context};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cli::config::ProxySettings;
use crate::proxy::health::HealthProbe;
use crate::proxy::model::{Proxy, ProxyId};
use crate::proxy::store::ProxyStore;

/// Smoothing factor for the response time average
const LATENCY_ALPHA: f64 = 0.2;

/// Result of one request routed through a pooled proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Success,
    Failure,
}

/// Read-only view of the pool
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub last_update: Option<DateTime<Utc>>,
}

/// What a health sweep did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub checked: usize,
    pub healthy: usize,
    pub restored: usize,
    pub evicted: usize,
}

struct ProxyEntry {
    proxy: Proxy,
    consecutive_failures: u32,
}

#[derive(Default)]
struct PoolState {
    proxies: HashMap<ProxyId, ProxyEntry>,
    /// Active proxies only, front is handed out next
    rotation: VecDeque<ProxyId>,
    last_update: Option<DateTime<Utc>>,
}

impl PoolState {
    fn activate(&mut self, id: ProxyId) -> bool {
        let Some(entry) = self.proxies.get_mut(&id) else {
            return false;
        };
        entry.consecutive_failures = 0;
        if entry.proxy.is_active {
            return false;
        }
        entry.proxy.is_active = true;
        self.rotation.push_back(id);
        true
    }

    fn deactivate(&mut self, id: ProxyId) -> bool {
        let Some(entry) = self.proxies.get_mut(&id) else {
            return false;
        };
        if !entry.proxy.is_active {
            return false;
        }
        entry.proxy.is_active = false;
        self.rotation.retain(|candidate| *candidate != id);
        true
    }
}

/// Rotating pool of upstream proxies with failure accounting and health sweeps.
///
/// All proxy state lives behind one lock; callers only ever see clones.
pub struct ProxyPool {
    max_failures: u32,
    check_interval: Duration,
    sweep_concurrency: usize,
    probe: Arc<dyn HealthProbe>,
    state: Mutex<PoolState>,
}

impl ProxyPool {
    /// Create an empty pool
    pub fn new(settings: &ProxySettings, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            max_failures: settings.max_failures.max(1),
            check_interval: settings.check_interval(),
            sweep_concurrency: settings.sweep_concurrency.max(1),
            probe,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Next active proxy in rotation order, or `None` when nothing is active
    pub async fn acquire(&self) -> Option<Proxy> {
        let mut state = self.state.lock().await;

        let id = state.rotation.pop_front()?;
        state.rotation.push_back(id);

        let entry = state.proxies.get_mut(&id)?;
        entry.proxy.last_used = Some(Utc::now());
        Some(entry.proxy.clone())
    }

    /// Record the outcome of a request that went through `proxy_id`
    pub async fn report(&self, proxy_id: ProxyId, outcome: ProxyOutcome, latency: Duration) {
        let mut state = self.state.lock().await;

        let Some(entry) = state.proxies.get_mut(&proxy_id) else {
            debug!("Ignoring report for unknown proxy {}", proxy_id);
            return;
        };

        match outcome {
            ProxyOutcome::Success => {
                let sample = latency.as_secs_f64();
                let proxy = &mut entry.proxy;
                proxy.average_response_time = if proxy.success_count == 0 {
                    sample
                } else {
                    LATENCY_ALPHA * sample + (1.0 - LATENCY_ALPHA) * proxy.average_response_time
                };
                proxy.success_count += 1;
                entry.consecutive_failures = 0;
            }
            ProxyOutcome::Failure => {
                entry.proxy.failure_count += 1;
                entry.consecutive_failures += 1;

                if entry.consecutive_failures >= self.max_failures && entry.proxy.is_active {
                    let address = entry.proxy.address();
                    let failures = entry.consecutive_failures;
                    state.deactivate(proxy_id);
                    warn!("Evicted proxy {} after {} consecutive failures", address, failures);
                }
            }
        }
    }

    /// Probe a single proxy
    pub async fn health_check(&self, proxy: &Proxy) -> bool {
        self.probe.check(proxy).await
    }

    /// Admit a proxy after it passes a health check
    pub async fn add(&self, mut proxy: Proxy) -> bool {
        if !self.health_check(&proxy).await {
            warn!("Rejected proxy {}: health check failed", proxy.address());
            return false;
        }

        proxy.is_active = false;
        proxy.last_checked = Some(Utc::now());
        let id = proxy.id;

        let mut state = self.state.lock().await;
        state.rotation.retain(|candidate| *candidate != id);
        state.proxies.insert(id, ProxyEntry { proxy, consecutive_failures: 0 });
        state.activate(id);

        info!("Added proxy {} to the pool", id);
        true
    }

    /// Re-check every proxy whose last check is older than the check interval,
    /// with bounded fan-out, and move each into or out of the rotation.
    pub async fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let interval = chrono::Duration::from_std(self.check_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let due: Vec<Proxy> = {
            let state = self.state.lock().await;
            state
                .proxies
                .values()
                .filter(|entry| entry.proxy.last_checked.map_or(true, |checked| now - checked > interval))
                .map(|entry| entry.proxy.clone())
                .collect()
        };

        if due.is_empty() {
            return SweepReport::default();
        }

        debug!("Health-checking {} proxies", due.len());

        let probe = self.probe.clone();
        let results: Vec<(ProxyId, bool)> = stream::iter(due)
            .map(|proxy| {
                let probe = probe.clone();
                async move { (proxy.id, probe.check(&proxy).await) }
            })
            .buffer_unordered(self.sweep_concurrency)
            .collect()
            .await;

        let mut report = SweepReport {
            checked: results.len(),
            ..Default::default()
        };

        let checked_at = Utc::now();
        let mut state = self.state.lock().await;

        for (id, healthy) in results {
            // Removed by a store sync while the check was running
            let Some(entry) = state.proxies.get_mut(&id) else {
                continue;
            };
            entry.proxy.last_checked = Some(checked_at);

            if healthy {
                report.healthy += 1;
                if state.activate(id) {
                    report.restored += 1;
                    info!("Proxy {} passed its health check and is back in rotation", id);
                }
            } else if state.deactivate(id) {
                report.evicted += 1;
                warn!("Proxy {} failed its health check and left the rotation", id);
            }
        }

        state.last_update = Some(checked_at);
        report
    }

    /// Merge the store's records into the pool.
    ///
    /// Proxies already pooled keep their live metrics; new ones join with their
    /// stored `is_active`; ones gone from the store are dropped.
    pub async fn sync_from(&self, store: &dyn ProxyStore) -> Result<usize> {
        let records = store.list().await.context("Failed to list proxies from store")?;
        let mut state = self.state.lock().await;

        let listed: HashSet<ProxyId> = records.iter().map(|p| p.id).collect();
        state.proxies.retain(|id, _| listed.contains(id));
        state.rotation.retain(|id| listed.contains(id));

        let mut added = 0;
        for proxy in records {
            if state.proxies.contains_key(&proxy.id) {
                continue;
            }
            let id = proxy.id;
            let active = proxy.is_active;
            state.proxies.insert(id, ProxyEntry { proxy, consecutive_failures: 0 });
            if active {
                state.rotation.push_back(id);
            }
            added += 1;
        }

        state.last_update = Some(Utc::now());
        debug!("Synced proxy pool from store: {} new, {} total", added, state.proxies.len());
        Ok(added)
    }

    /// Write every proxy's status and metrics back to the store
    pub async fn persist(&self, store: &dyn ProxyStore) -> Result<()> {
        for proxy in self.snapshot().await {
            store
                .save(&proxy)
                .await
                .context(format!("Failed to save proxy {}", proxy.id))?;
        }
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<Proxy> {
        let state = self.state.lock().await;
        let mut proxies: Vec<Proxy> = state.proxies.values().map(|e| e.proxy.clone()).collect();
        proxies.sort_by_key(|p| p.id);
        proxies
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            total: state.proxies.len(),
            active: state.rotation.len(),
            last_update: state.last_update,
        }
    }
}
