use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::app::config::AppConfig;
use crate::error::{Error, Result};
use crate::models::adapter::{build_adapter, ProviderAdapter};
use crate::models::cooldown::ResiliencePolicy;
use crate::models::health::{HealthChecker, HealthCheckerConfig, ProviderHealthSummary};
use crate::models::metrics::{AttemptRecord, MetricsCollector, MetricsConfig};
use crate::models::provider::{
    ContentType, Credentials, GenerationRequest, GenerationResponse, ModelStatus, ProviderDescriptor,
    UsageCounters,
};
use crate::models::registry::Registry;
use crate::models::transport::build_client;

pub const NO_PROVIDERS: &str = "no providers available";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub health_cache_ttl: Duration,
    pub default_deadline: Option<Duration>,
    pub connect_timeout: Duration,
    pub policy: ResiliencePolicy,
    pub health: HealthCheckerConfig,
    pub metrics: MetricsConfig,
    /// Credentials used when probing outside of a request.
    pub probe_credentials: Credentials,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            health_cache_ttl: Duration::from_secs(60),
            default_deadline: None,
            connect_timeout: Duration::from_secs(10),
            policy: ResiliencePolicy::default(),
            health: HealthCheckerConfig::default(),
            metrics: MetricsConfig::default(),
            probe_credentials: Credentials::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedProbe {
    at: Instant,
    healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealthStatus {
    pub healthy: bool,
    pub enabled: bool,
    pub available_models: usize,
    pub total_models: usize,
    pub models: BTreeMap<String, ModelStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatsReport {
    pub total_requests: u64,
    pub success_requests: u64,
    pub fail_requests: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
    pub active_requests: usize,
    pub last_request: Option<DateTime<Utc>>,
    pub models: BTreeMap<String, UsageCounters>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayStats {
    pub provider_count: usize,
    pub providers: BTreeMap<String, ProviderStatsReport>,
}

/// Fallback orchestrator: ranks providers for a request and walks them until
/// one succeeds. Every outcome is returned as a [`GenerationResponse`].
pub struct Gateway {
    registry: Registry,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    health_cache: Mutex<HashMap<String, CachedProbe>>,
    health_checker: Arc<HealthChecker>,
    metrics: Arc<MetricsCollector>,
    config: GatewayConfig,
    closed: AtomicBool,
}

impl Gateway {
    pub fn from_config(app_config: &AppConfig) -> Result<Self> {
        let config = app_config.to_gateway_config();
        let registry = Registry::from_config(&app_config.providers)?;
        let client = build_client(config.connect_timeout)?;

        let mut adapters = HashMap::new();
        for provider in registry.all() {
            let adapter = build_adapter(provider.clone(), config.policy.clone(), client.clone())?;
            adapters.insert(provider.key(), adapter);
        }

        info!(
            "Gateway initialized with {} providers",
            registry.len()
        );
        Ok(Self::from_parts(registry, adapters, config))
    }

    pub fn from_parts(
        registry: Registry,
        adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
        config: GatewayConfig,
    ) -> Self {
        let targets: Vec<_> = registry
            .all()
            .filter(|p| p.enabled)
            .filter_map(|p| adapters.get(&p.key()).cloned())
            .collect();
        let health_checker = Arc::new(HealthChecker::new(
            targets,
            config.probe_credentials.clone(),
            config.health.clone(),
        ));
        let metrics = Arc::new(MetricsCollector::new(config.metrics.clone()));

        Self {
            registry,
            adapters,
            health_cache: Mutex::new(HashMap::new()),
            health_checker,
            metrics,
            config,
            closed: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.health_checker
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run one request through the fallback cascade. Never fails: exhaustion,
    /// deadline expiry and shutdown are all reported in the response.
    pub async fn generate(&self, request: GenerationRequest) -> GenerationResponse {
        let started = Instant::now();
        debug!(
            "Generating {} for endpoint {} (request {})",
            request.content_type, request.endpoint, request.id
        );

        let response = match request.deadline.or(self.config.default_deadline) {
            Some(limit) => match tokio::time::timeout(limit, self.run_cascade(&request)).await {
                Ok(response) => response,
                Err(_) => {
                    warn!("Request {} exceeded its deadline of {:?}", request.id, limit);
                    let mut details = Map::new();
                    details.insert("reason".to_string(), Value::from("deadline_exceeded"));
                    GenerationResponse::failure(
                        &request.id,
                        Error::Timeout(limit).to_string(),
                        details,
                    )
                }
            },
            None => self.run_cascade(&request).await,
        };

        let response = response.with_elapsed(started.elapsed());
        self.metrics
            .record(AttemptRecord::from_response(&request, &response));
        response
    }

    async fn run_cascade(&self, request: &GenerationRequest) -> GenerationResponse {
        if self.is_closed() {
            return GenerationResponse::failure(&request.id, "gateway is shut down", Map::new());
        }

        let mut providers = self.registry.providers_for(request.content_type);
        if providers.is_empty() {
            let mut details = Map::new();
            details.insert(
                "content_type".to_string(),
                Value::from(request.content_type.as_str()),
            );
            return GenerationResponse::failure(&request.id, NO_PROVIDERS, details);
        }

        if let Some(preferred) = request.preferred_provider.as_deref() {
            if let Some(pos) = providers.iter().position(|p| p.name == preferred) {
                let provider = providers.remove(pos);
                providers.insert(0, provider);
            }
        }

        let mut tried = Vec::new();
        let mut skipped = Vec::new();
        let mut last_failure: Option<GenerationResponse> = None;

        for provider in providers {
            if !provider.resolves(&request.endpoint) {
                debug!(
                    "Provider {} has no endpoint {}, skipping",
                    provider.name, request.endpoint
                );
                skipped.push(skip_entry(&provider, "endpoint_not_found"));
                continue;
            }
            let Some(adapter) = self.adapters.get(&provider.key()) else {
                skipped.push(skip_entry(&provider, "no_adapter"));
                continue;
            };
            if !self.check_health(adapter, &request.credentials).await {
                warn!("Provider {} failed its health probe, skipping", provider.name);
                skipped.push(skip_entry(&provider, "unhealthy"));
                continue;
            }

            tried.push(Value::from(provider.name.as_str()));
            let response = adapter.call_api(request).await;

            if response.success || response.model.is_some() {
                provider.record_outcome(
                    response.model.as_deref(),
                    response.success,
                    response.elapsed(),
                    response.tokens_used,
                );
            }

            if response.success {
                let mut response = response;
                response
                    .metadata
                    .insert("providers_tried".to_string(), Value::Array(tried));
                return response;
            }

            warn!(
                "Provider {} failed request {}: {}",
                provider.name,
                request.id,
                response.error.as_deref().unwrap_or("unknown error")
            );
            last_failure = Some(response);
        }

        let mut details = Map::new();
        details.insert("providers_tried".to_string(), Value::Array(tried));
        details.insert("providers_skipped".to_string(), Value::Array(skipped));

        match last_failure {
            Some(last) => {
                error!("All providers failed for request {}", request.id);
                for (key, value) in last.error_details {
                    details.entry(key).or_insert(value);
                }
                let message = format!(
                    "All providers failed. Last error: {}",
                    last.error.as_deref().unwrap_or("unknown error")
                );
                GenerationResponse::failure(&request.id, message, details)
                    .with_attribution(last.provider.as_deref(), last.model.as_deref())
            }
            None => {
                error!(
                    "No provider could serve endpoint {} for request {}",
                    request.endpoint, request.id
                );
                GenerationResponse::failure(
                    &request.id,
                    format!("{} for endpoint '{}'", NO_PROVIDERS, request.endpoint),
                    details,
                )
            }
        }
    }

    /// TTL-cached probe; a fresh probe is issued only after the window expires.
    async fn check_health(&self, adapter: &Arc<dyn ProviderAdapter>, credentials: &Credentials) -> bool {
        let provider = adapter.provider();
        let key = provider.key();

        if let Some(cached) = self.health_cache.lock().get(&key).copied() {
            if cached.at.elapsed() < self.config.health_cache_ttl {
                return cached.healthy;
            }
        }

        let healthy = tokio::time::timeout(provider.probe_timeout, adapter.probe_health(credentials))
            .await
            .unwrap_or(false);
        self.health_cache.lock().insert(
            key,
            CachedProbe {
                at: Instant::now(),
                healthy,
            },
        );
        healthy
    }

    /// Reachability and model availability, grouped by content type.
    pub async fn health_status(&self) -> BTreeMap<ContentType, BTreeMap<String, ProviderHealthStatus>> {
        let credentials = &self.config.probe_credentials;
        let checks = self.registry.all().map(|provider| async move {
            let healthy = match self.adapters.get(&provider.key()) {
                Some(adapter) if provider.enabled => self.check_health(adapter, credentials).await,
                _ => false,
            };
            (provider.clone(), healthy)
        });

        let mut status: BTreeMap<ContentType, BTreeMap<String, ProviderHealthStatus>> = BTreeMap::new();
        for (provider, healthy) in join_all(checks).await {
            let available = provider.available_models();
            let models = provider
                .models()
                .iter()
                .map(|m| (m.name.clone(), m.status()))
                .collect();
            status.entry(provider.content_type).or_default().insert(
                provider.name.clone(),
                ProviderHealthStatus {
                    healthy,
                    enabled: provider.enabled,
                    available_models: available.len(),
                    total_models: provider.models().len(),
                    models,
                },
            );
        }
        status
    }

    /// Pure read of the running counters.
    pub fn stats(&self) -> GatewayStats {
        let providers = self
            .registry
            .all()
            .map(|provider| {
                let stats = provider.stats();
                (
                    provider.key(),
                    ProviderStatsReport {
                        total_requests: stats.totals.total_requests,
                        success_requests: stats.totals.success_requests,
                        fail_requests: stats.totals.fail_requests,
                        success_rate: stats.totals.success_rate(),
                        avg_latency_ms: stats.totals.avg_latency_ms,
                        total_tokens: stats.totals.total_tokens,
                        active_requests: provider.active_requests(),
                        last_request: stats.last_request,
                        models: stats.models,
                    },
                )
            })
            .collect();

        GatewayStats {
            provider_count: self.registry.len(),
            providers,
        }
    }

    pub fn health_summary(&self) -> BTreeMap<String, ProviderHealthSummary> {
        self.health_checker.summary()
    }

    pub fn start_health_monitoring(&self) {
        if self.is_closed() {
            return;
        }
        self.health_checker.start();
    }

    pub fn set_model_enabled(
        &self,
        content_type: ContentType,
        provider: &str,
        model: &str,
        enabled: bool,
    ) -> Result<()> {
        let descriptor = self
            .registry
            .provider(content_type, provider)
            .ok_or_else(|| Error::registry(format!("unknown {} provider '{}'", content_type, provider)))?;
        let model_descriptor = descriptor
            .model(model)
            .ok_or_else(|| Error::registry(format!("provider '{}' has no model '{}'", provider, model)))?;

        model_descriptor.set_enabled(enabled);
        info!(
            "Model {}/{} {}",
            provider,
            model,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Clear every cooldown; returns how many models were released.
    pub fn reset_cooldowns(&self) -> usize {
        let mut released = 0;
        for provider in self.registry.all() {
            for model in provider.models() {
                if matches!(model.status(), ModelStatus::Cooldown | ModelStatus::Error) {
                    model.clear_cooldown();
                    released += 1;
                }
            }
        }
        self.health_cache.lock().clear();
        info!("Released {} models from cooldown", released);
        released
    }

    /// Release adapter sessions and stop background work. Safe to call repeatedly.
    pub fn cleanup(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.health_checker.stop();
        for adapter in self.adapters.values() {
            adapter.close();
        }
        info!("Gateway shut down, {} adapters closed", self.adapters.len());
    }
}

fn skip_entry(provider: &ProviderDescriptor, reason: &str) -> Value {
    let mut entry = Map::new();
    entry.insert("provider".to_string(), Value::from(provider.name.as_str()));
    entry.insert("reason".to_string(), Value::from(reason));
    Value::Object(entry)
}
