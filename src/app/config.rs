use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::info;
use validator::Validate;

use crate::error::{Error, Result};
use crate::models::gateway::GatewayConfig;
use crate::models::health::HealthCheckerConfig;
use crate::models::metrics::MetricsConfig as MetricsSettings;
use crate::models::provider::{AuthStyle, BackendKind, ContentType, Credentials};
use crate::platform::AppPaths;

/// Prefix for environment overrides, e.g. `GENROUTE__HEALTH__INTERVAL_SECS=30`.
pub const ENV_PREFIX: &str = "GENROUTE";

#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    #[validate(nested)]
    pub health: HealthConfig,
    #[serde(default)]
    #[validate(nested)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    #[validate(nested)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    pub health_cache_ttl_secs: u64,
    pub request_deadline_secs: Option<u64>,
    pub connect_timeout_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            health_cache_ttl_secs: 60,
            request_deadline_secs: None,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base: u64,
    pub factor_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: 2,
            factor_ms: 250,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    pub rate_limited_secs: u64,
    pub forbidden_secs: u64,
    pub server_error_secs: u64,
    pub transient_secs: u64,
    pub unknown_secs: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            rate_limited_secs: 600,
            forbidden_secs: 1800,
            server_error_secs: 300,
            transient_secs: 600,
            unknown_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct HealthConfig {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub interval_secs: u64,
    #[validate(range(min = 1))]
    pub probe_timeout_secs: u64,
    #[validate(range(min = 1))]
    pub history_size: usize,
    /// Credentials used by background probes, keyed like request credentials.
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            probe_timeout_secs: 15,
            history_size: 100,
            credentials: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MetricsConfig {
    #[validate(range(min = 1))]
    pub max_history: usize,
    pub min_samples: u64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_success_rate: f64,
    #[validate(range(min = 0.0, max = 86400.0))]
    pub max_avg_latency_secs: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub peak_load_ratio: f64,
    #[validate(range(min = 1, max = 87600))]
    pub hourly_retention_hours: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_history: 10_000,
            min_samples: 10,
            min_success_rate: 0.8,
            max_avg_latency_secs: 30.0,
            peak_load_ratio: 0.9,
            hourly_retention_hours: 168,
        }
    }
}

/// Request body template and response pointers for `custom` backends.
/// `body` is JSON text whose string leaves may contain `{{placeholder}}` markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomTemplate {
    pub body: String,
    pub content_pointer: String,
    #[serde(default)]
    pub tokens_pointer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProviderConfig {
    #[validate(length(min = 1))]
    pub name: String,
    pub kind: BackendKind,
    pub content_type: ContentType,
    #[validate(range(min = 0))]
    pub priority: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[validate(url)]
    pub base_url: String,
    pub credential_key: String,
    #[serde(default)]
    pub auth: AuthStyle,
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    #[serde(default = "default_max_concurrent")]
    #[validate(range(min = 1))]
    pub max_concurrent_requests: usize,
    #[serde(default)]
    pub health_path: Option<String>,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 86400.0))]
    pub probe_timeout_secs: Option<f64>,
    #[serde(default)]
    pub template: Option<CustomTemplate>,
    #[validate(nested)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ModelConfig {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default = "default_timeout_secs")]
    #[validate(range(min = 0.0, max = 86400.0))]
    pub timeout_secs: f64,
    #[serde(default = "default_retry_budget")]
    #[validate(range(min = 1))]
    pub retry_budget: u32,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub priority: i64,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            endpoint: None,
            max_tokens: default_max_tokens(),
            params: Map::new(),
            timeout_secs: default_timeout_secs(),
            retry_budget: default_retry_budget(),
            priority: 0,
            cooldown_secs: None,
            enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout_secs() -> f64 {
    60.0
}

fn default_retry_budget() -> u32 {
    2
}

fn model(name: &str, priority: i64, timeout_secs: f64, params: Value) -> ModelConfig {
    ModelConfig {
        name: name.to_string(),
        priority,
        timeout_secs,
        params: params.as_object().cloned().unwrap_or_default(),
        ..ModelConfig::default()
    }
}

fn endpoints(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(id, path)| (id.to_string(), path.to_string()))
        .collect()
}

impl AppConfig {
    /// The catalog shipped with a fresh installation.
    pub fn default_catalog() -> Self {
        let text_endpoints = [
            ("chat", "chat/completions"),
            ("lesson-plan", "chat/completions"),
            ("exercises", "chat/completions"),
        ];

        let groq = ProviderConfig {
            name: "groq".to_string(),
            kind: BackendKind::Direct,
            content_type: ContentType::Text,
            priority: 0,
            enabled: true,
            base_url: "https://api.groq.com/openai/v1".to_string(),
            credential_key: "groq".to_string(),
            auth: AuthStyle::Bearer,
            endpoints: endpoints(&text_endpoints),
            max_concurrent_requests: 10,
            health_path: Some("models".to_string()),
            probe_timeout_secs: None,
            template: None,
            models: vec![
                model("llama-3.3-70b-versatile", 0, 60.0, json!({"temperature": 0.7})),
                model("llama-3.1-8b-instant", 1, 30.0, json!({"temperature": 0.7})),
            ],
        };

        let together = ProviderConfig {
            name: "together".to_string(),
            kind: BackendKind::Direct,
            content_type: ContentType::Text,
            priority: 1,
            enabled: true,
            base_url: "https://api.together.xyz/v1".to_string(),
            credential_key: "together".to_string(),
            auth: AuthStyle::Bearer,
            endpoints: endpoints(&text_endpoints),
            max_concurrent_requests: 5,
            health_path: Some("models".to_string()),
            probe_timeout_secs: None,
            template: None,
            models: vec![model(
                "meta-llama/Llama-3.3-70B-Instruct-Turbo-Free",
                0,
                90.0,
                json!({"temperature": 0.7, "top_p": 0.9}),
            )],
        };

        let gemini = ProviderConfig {
            name: "gemini".to_string(),
            kind: BackendKind::Custom,
            content_type: ContentType::Text,
            priority: 2,
            enabled: true,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            credential_key: "gemini".to_string(),
            auth: AuthStyle::Query {
                name: "key".to_string(),
            },
            endpoints: endpoints(&[
                ("chat", "models/{model}:generateContent"),
                ("lesson-plan", "models/{model}:generateContent"),
                ("exercises", "models/{model}:generateContent"),
            ]),
            max_concurrent_requests: 5,
            health_path: Some("models".to_string()),
            probe_timeout_secs: None,
            template: Some(CustomTemplate {
                body: json!({
                    "contents": [{"parts": [{"text": "{{prompt}}"}]}],
                    "generationConfig": {
                        "maxOutputTokens": "{{max_tokens}}",
                        "temperature": "{{temperature}}"
                    }
                })
                .to_string(),
                content_pointer: "/candidates/0/content/parts/0/text".to_string(),
                tokens_pointer: Some("/usageMetadata/totalTokenCount".to_string()),
            }),
            models: vec![
                model("gemini-2.0-flash", 0, 60.0, json!({"temperature": 0.7})),
                model("gemini-1.5-flash", 1, 60.0, json!({"temperature": 0.7})),
            ],
        };

        let flux = ProviderConfig {
            name: "together-images".to_string(),
            kind: BackendKind::ImageBackend,
            content_type: ContentType::Image,
            priority: 0,
            enabled: true,
            base_url: "https://api.together.xyz/v1".to_string(),
            credential_key: "together".to_string(),
            auth: AuthStyle::Bearer,
            endpoints: endpoints(&[("flux-images", "images/generations")]),
            max_concurrent_requests: 3,
            health_path: Some("models".to_string()),
            probe_timeout_secs: None,
            template: None,
            models: vec![model(
                "black-forest-labs/FLUX.1-schnell-Free",
                0,
                120.0,
                json!({"width": 1024, "height": 768, "steps": 4}),
            )],
        };

        Self {
            providers: vec![groq, together, gemini, flux],
            ..Self::default()
        }
    }

    pub async fn load(paths: &AppPaths) -> Result<Self> {
        let config_file = paths.config_file();

        if !config_file.exists() {
            info!("Config file not found, creating default configuration");
            let default_config = Self::default_catalog();
            default_config.save_to(&config_file).await?;
            return Ok(default_config);
        }

        Self::load_from(&config_file)
    }

    /// Read a TOML file and layer `GENROUTE__*` environment overrides on top.
    pub fn load_from(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {:?}", path);

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: AppConfig = settings.try_deserialize()?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", path);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let config_content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        fs::write(path, config_content).await?;

        info!("Configuration saved successfully");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(|e| Error::validation(e.to_string()))?;

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert((provider.content_type, provider.name.as_str())) {
                return Err(Error::validation(format!(
                    "Provider {} is declared twice for {} content",
                    provider.name, provider.content_type
                )));
            }
            if provider.models.is_empty() {
                return Err(Error::validation(format!("Provider {} has no models", provider.name)));
            }
            if provider.kind == BackendKind::Custom && provider.template.is_none() {
                return Err(Error::validation(format!(
                    "Custom provider {} requires a template",
                    provider.name
                )));
            }
        }

        Ok(())
    }

    pub fn to_gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            health_cache_ttl: Duration::from_secs(self.gateway.health_cache_ttl_secs),
            default_deadline: self.gateway.request_deadline_secs.map(Duration::from_secs),
            connect_timeout: Duration::from_secs(self.gateway.connect_timeout_secs),
            policy: crate::models::cooldown::ResiliencePolicy {
                cooldown: (&self.cooldown).into(),
                backoff: (&self.backoff).into(),
            },
            health: self.to_health_checker_config(),
            metrics: self.to_metrics_config(),
            probe_credentials: Credentials::from(self.health.credentials.clone()),
        }
    }

    pub fn to_health_checker_config(&self) -> HealthCheckerConfig {
        HealthCheckerConfig {
            enabled: self.health.enabled,
            interval: Duration::from_secs(self.health.interval_secs),
            probe_timeout: Duration::from_secs(self.health.probe_timeout_secs),
            history_size: self.health.history_size,
            ..HealthCheckerConfig::default()
        }
    }

    pub fn to_metrics_config(&self) -> MetricsSettings {
        MetricsSettings {
            max_history: self.metrics.max_history,
            min_samples: self.metrics.min_samples,
            min_success_rate: self.metrics.min_success_rate,
            max_avg_latency: Duration::try_from_secs_f64(self.metrics.max_avg_latency_secs).unwrap_or_default(),
            peak_load_ratio: self.metrics.peak_load_ratio,
            hourly_retention_hours: self.metrics.hourly_retention_hours,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_catalog_is_valid() {
        let config = AppConfig::default_catalog();
        assert!(config.validate().is_ok());
        assert_eq!(config.providers.len(), 4);
        let images: Vec<_> = config
            .providers
            .iter()
            .filter(|p| p.content_type == ContentType::Image)
            .collect();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].kind, BackendKind::ImageBackend);
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let mut config = AppConfig::default_catalog();
        config.providers[0].models[0].timeout_secs = 1e30;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default_catalog();
        config.metrics.hourly_retention_hours = usize::MAX;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default_catalog();
        config.providers[0].probe_timeout_secs = Some(1e30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let mut config = AppConfig::default_catalog();
        let duplicate = config.providers[0].clone();
        config.providers.push(duplicate);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_priority_rejected() {
        let mut config = AppConfig::default_catalog();
        config.providers[0].models[0].priority = -3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_conversion() {
        let config = AppConfig::default_catalog();
        let gateway = config.to_gateway_config();
        assert_eq!(gateway.health_cache_ttl, Duration::from_secs(60));
        assert_eq!(gateway.policy.cooldown.forbidden, Duration::from_secs(1800));
        assert_eq!(gateway.policy.backoff.max_delay, Duration::from_secs(10));
        assert_eq!(gateway.health.history_size, 100);
        assert!((gateway.metrics.min_success_rate - 0.8).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_missing_file_writes_default_catalog() {
        let dir = TempDir::new().unwrap();
        let paths = AppPaths::with_root(dir.path());

        let config = AppConfig::load(&paths).await.unwrap();
        assert!(paths.config_file().exists());
        assert_eq!(config.providers.len(), 4);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("genroute.toml");

        let config = AppConfig::default_catalog();
        config.save_to(&path).await.unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.providers.len(), config.providers.len());
        let gemini = loaded.providers.iter().find(|p| p.name == "gemini").unwrap();
        assert_eq!(
            gemini.auth,
            AuthStyle::Query {
                name: "key".to_string()
            }
        );
        assert!(gemini.template.is_some());
    }

    #[tokio::test]
    async fn test_environment_overrides_file_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("genroute.toml");
        AppConfig::default_catalog().save_to(&path).await.unwrap();

        std::env::set_var("GENROUTE__METRICS__MIN_SAMPLES", "42");
        let loaded = AppConfig::load_from(&path);
        std::env::remove_var("GENROUTE__METRICS__MIN_SAMPLES");

        let loaded = loaded.unwrap();
        assert_eq!(loaded.metrics.min_samples, 42);
        assert_eq!(loaded.health.interval_secs, 60);
    }
}
