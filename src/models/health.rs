use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::models::adapter::ProviderAdapter;
use crate::models::provider::Credentials;

#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckerConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub history_size: usize,
    /// Number of most recent samples considered before flipping state.
    pub debounce_window: usize,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(15),
            history_size: 100,
            debounce_window: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSample {
    pub at: DateTime<Utc>,
    pub healthy: bool,
    pub latency_ms: f64,
}

#[derive(Debug, Default)]
struct ProviderHealth {
    history: VecDeque<HealthSample>,
    healthy: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthSummary {
    pub is_healthy: bool,
    pub uptime_last_hour: f64,
    pub avg_latency_last_hour_ms: f64,
    pub samples_last_hour: usize,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Periodic background prober, independent of the request path.
pub struct HealthChecker {
    targets: Vec<Arc<dyn ProviderAdapter>>,
    credentials: Credentials,
    config: HealthCheckerConfig,
    state: Mutex<HashMap<String, ProviderHealth>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthChecker {
    pub fn new(
        targets: Vec<Arc<dyn ProviderAdapter>>,
        credentials: Credentials,
        config: HealthCheckerConfig,
    ) -> Self {
        Self {
            targets,
            credentials,
            config,
            state: Mutex::new(HashMap::new()),
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthCheckerConfig {
        &self.config
    }

    /// Spawn the probing loop. Calling it while already running does nothing.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("Health monitoring disabled by configuration");
            return;
        }

        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let checker = Arc::clone(self);
        let interval = self.config.interval;
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                checker.run_once().await;
            }
        }));

        info!(
            "Started health monitoring of {} providers every {:?}",
            self.targets.len(),
            interval
        );
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("Stopped health monitoring");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Probe every target concurrently, each bounded by the probe timeout.
    pub async fn run_once(&self) -> Vec<(String, bool)> {
        let timeout = self.config.probe_timeout;
        let probes = self.targets.iter().map(|adapter| {
            let credentials = &self.credentials;
            async move {
                let started = Instant::now();
                let healthy = tokio::time::timeout(timeout, adapter.probe_health(credentials))
                    .await
                    .unwrap_or(false);
                (adapter.provider().key(), healthy, started.elapsed())
            }
        });

        let results = join_all(probes).await;
        let now = Utc::now();
        results
            .into_iter()
            .map(|(key, healthy, latency)| {
                self.record_sample_at(&key, now, healthy, latency);
                (key, healthy)
            })
            .collect()
    }

    pub fn record_sample(&self, key: &str, healthy: bool, latency: Duration) -> Option<bool> {
        self.record_sample_at(key, Utc::now(), healthy, latency)
    }

    /// Append a sample and apply the debounce rule. Returns the new state when
    /// it changed.
    pub fn record_sample_at(
        &self,
        key: &str,
        at: DateTime<Utc>,
        healthy: bool,
        latency: Duration,
    ) -> Option<bool> {
        let mut state = self.state.lock();
        let entry = state.entry(key.to_string()).or_default();

        entry.history.push_back(HealthSample {
            at,
            healthy,
            latency_ms: latency.as_secs_f64() * 1000.0,
        });
        while entry.history.len() > self.config.history_size.max(1) {
            entry.history.pop_front();
        }

        let previous = match entry.healthy {
            Some(previous) => previous,
            None => {
                entry.healthy = Some(healthy);
                debug!("Initial health of {}: {}", key, healthy);
                return None;
            }
        };

        let window = self.config.debounce_window.max(1);
        let recent: Vec<bool> = entry.history.iter().rev().take(window).map(|s| s.healthy).collect();
        let disagreeing = recent.iter().filter(|&&h| h != previous).count();
        if disagreeing * 2 <= recent.len() {
            return None;
        }

        entry.healthy = Some(!previous);
        if previous {
            warn!(
                "Provider {} degraded: {}/{} recent probes failed",
                key,
                disagreeing,
                recent.len()
            );
        } else {
            info!("Provider {} recovered", key);
        }
        Some(!previous)
    }

    pub fn is_healthy(&self, key: &str) -> Option<bool> {
        self.state.lock().get(key).and_then(|h| h.healthy)
    }

    pub fn history(&self, key: &str) -> Vec<HealthSample> {
        self.state
            .lock()
            .get(key)
            .map(|h| h.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> BTreeMap<String, ProviderHealthSummary> {
        self.summary_at(Utc::now())
    }

    pub fn summary_at(&self, now: DateTime<Utc>) -> BTreeMap<String, ProviderHealthSummary> {
        let hour_ago = now - chrono::Duration::hours(1);
        let state = self.state.lock();

        state
            .iter()
            .map(|(key, health)| {
                let recent: Vec<_> = health.history.iter().filter(|s| s.at >= hour_ago).collect();
                let samples = recent.len();
                let (uptime, latency) = if samples == 0 {
                    (0.0, 0.0)
                } else {
                    let up = recent.iter().filter(|s| s.healthy).count();
                    let total_latency: f64 = recent.iter().map(|s| s.latency_ms).sum();
                    (
                        up as f64 * 100.0 / samples as f64,
                        total_latency / samples as f64,
                    )
                };

                (
                    key.clone(),
                    ProviderHealthSummary {
                        is_healthy: health.healthy.unwrap_or(false),
                        uptime_last_hour: uptime,
                        avg_latency_last_hour_ms: latency,
                        samples_last_hour: samples,
                        last_checked: health.history.back().map(|s| s.at),
                    },
                )
            })
            .collect()
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
