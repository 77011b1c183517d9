use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use uuid::Uuid;

use crate::app::config::{CustomTemplate, ModelConfig, ProviderConfig};
use crate::error::{Error, Result};
use crate::models::cooldown::ErrorClass;

/// Longest window a single failure can impose.
fn max_cooldown_span() -> chrono::Duration {
    chrono::Duration::days(365)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(ContentType::Text),
            "image" => Ok(ContentType::Image),
            other => Err(format!("unknown content type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Direct,
    ImageBackend,
    Custom,
}

/// How the per-call credential is attached to an upstream request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum AuthStyle {
    #[default]
    Bearer,
    Header { name: String },
    Query { name: String },
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelStatus {
    Available,
    Cooldown,
    Error,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelState {
    pub status: ModelStatus,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_class: Option<ErrorClass>,
}

impl ModelState {
    fn new(enabled: bool) -> Self {
        Self {
            status: if enabled {
                ModelStatus::Available
            } else {
                ModelStatus::Disabled
            },
            cooldown_until: None,
            error_count: 0,
            last_success: None,
            last_error: None,
            last_error_class: None,
        }
    }

    /// Lazily expire a cooldown. Returns true when the model is selectable at `now`.
    fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        match self.status {
            ModelStatus::Available => true,
            ModelStatus::Disabled => false,
            ModelStatus::Cooldown | ModelStatus::Error => match self.cooldown_until {
                Some(until) if now < until => false,
                _ => {
                    self.status = ModelStatus::Available;
                    self.cooldown_until = None;
                    true
                }
            },
        }
    }
}

/// A single model of a provider. Static fields come from configuration; the
/// runtime state is guarded per model so concurrent requests cannot lose updates.
#[derive(Debug)]
pub struct ModelDescriptor {
    pub name: String,
    pub kind: BackendKind,
    pub endpoint: Option<String>,
    pub max_tokens: u32,
    pub params: Map<String, Value>,
    pub timeout: Duration,
    pub retry_budget: u32,
    pub priority: u32,
    pub cooldown_hint: Option<Duration>,
    state: Mutex<ModelState>,
}

impl ModelDescriptor {
    pub fn from_config(config: &ModelConfig, kind: BackendKind) -> Result<Self> {
        if config.name.trim().is_empty() {
            return Err(Error::registry("model name must not be empty"));
        }
        if config.priority < 0 {
            return Err(Error::registry(format!(
                "model '{}' has negative priority {}",
                config.name, config.priority
            )));
        }
        let timeout = Duration::try_from_secs_f64(config.timeout_secs).map_err(|_| {
            Error::registry(format!(
                "model '{}' has invalid timeout {}",
                config.name, config.timeout_secs
            ))
        })?;

        Ok(Self {
            name: config.name.clone(),
            kind,
            endpoint: config.endpoint.clone(),
            max_tokens: config.max_tokens,
            params: config.params.clone(),
            timeout,
            retry_budget: config.retry_budget.max(1),
            priority: u32::try_from(config.priority).unwrap_or(u32::MAX),
            cooldown_hint: config.cooldown_secs.map(Duration::from_secs),
            state: Mutex::new(ModelState::new(config.enabled)),
        })
    }

    pub fn snapshot(&self) -> ModelState {
        self.state.lock().clone()
    }

    pub fn status(&self) -> ModelStatus {
        self.state.lock().status
    }

    pub fn error_count(&self) -> u32 {
        self.state.lock().error_count
    }

    pub fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        self.state.lock().cooldown_until
    }

    pub fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        self.state.lock().refresh(now)
    }

    pub fn mark_success(&self) {
        let mut state = self.state.lock();
        if state.status == ModelStatus::Disabled {
            return;
        }
        state.status = ModelStatus::Available;
        state.cooldown_until = None;
        state.error_count = 0;
        state.last_success = Some(Utc::now());
    }

    pub fn enter_cooldown(&self, duration: Duration, class: ErrorClass, message: &str) -> DateTime<Utc> {
        self.enter_cooldown_at(Utc::now(), duration, class, message)
    }

    /// Put the model into cooldown starting at `now`. Concurrent failures only
    /// ever extend an existing window.
    pub fn enter_cooldown_at(
        &self,
        now: DateTime<Utc>,
        duration: Duration,
        class: ErrorClass,
        message: &str,
    ) -> DateTime<Utc> {
        let span = chrono::Duration::from_std(duration)
            .unwrap_or_else(|_| max_cooldown_span())
            .min(max_cooldown_span());
        let until = now + span;

        let mut state = self.state.lock();
        state.error_count += 1;
        state.last_error = Some(message.to_string());
        state.last_error_class = Some(class);
        if state.status == ModelStatus::Disabled {
            return until;
        }
        state.status = ModelStatus::Cooldown;
        let until = match state.cooldown_until {
            Some(existing) if existing > until => existing,
            _ => until,
        };
        state.cooldown_until = Some(until);
        until
    }

    /// The caller's timeout cut an attempt short. The model stays selectable:
    /// no cooldown window and no error count, the next availability check
    /// returns it to `Available`.
    pub fn mark_cancelled(&self, message: &str) {
        let mut state = self.state.lock();
        state.last_error = Some(message.to_string());
        state.last_error_class = Some(ErrorClass::Cancelled);
        if state.status == ModelStatus::Available {
            state.status = ModelStatus::Error;
        }
    }

    pub fn clear_cooldown(&self) {
        let mut state = self.state.lock();
        if matches!(state.status, ModelStatus::Cooldown | ModelStatus::Error) {
            state.status = ModelStatus::Available;
            state.cooldown_until = None;
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock();
        match (enabled, state.status) {
            (false, _) => {
                state.status = ModelStatus::Disabled;
                state.cooldown_until = None;
            }
            (true, ModelStatus::Disabled) => state.status = ModelStatus::Available,
            (true, _) => {}
        }
    }
}

/// Request/latency/token counters shared by provider and model breakdowns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageCounters {
    pub total_requests: u64,
    pub success_requests: u64,
    pub fail_requests: u64,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
}

impl UsageCounters {
    pub fn record(&mut self, success: bool, latency: Duration, tokens: u64) {
        self.total_requests += 1;
        if success {
            self.success_requests += 1;
        } else {
            self.fail_requests += 1;
        }
        self.total_tokens += tokens;
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.total_requests as f64;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.success_requests as f64 / self.total_requests as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderStats {
    #[serde(flatten)]
    pub totals: UsageCounters,
    pub last_request: Option<DateTime<Utc>>,
    pub models: BTreeMap<String, UsageCounters>,
}

/// A provider: one backend family with its ranked models.
#[derive(Debug)]
pub struct ProviderDescriptor {
    pub name: String,
    pub kind: BackendKind,
    pub content_type: ContentType,
    pub priority: u32,
    pub enabled: bool,
    pub base_url: String,
    pub credential_key: String,
    pub auth: AuthStyle,
    pub endpoints: HashMap<String, String>,
    pub max_concurrent_requests: usize,
    pub health_path: Option<String>,
    pub probe_timeout: Duration,
    pub template: Option<CustomTemplate>,
    models: Vec<Arc<ModelDescriptor>>,
    stats: RwLock<ProviderStats>,
    slots: Semaphore,
}

impl ProviderDescriptor {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        if config.name.trim().is_empty() {
            return Err(Error::registry("provider name must not be empty"));
        }
        if config.priority < 0 {
            return Err(Error::registry(format!(
                "provider '{}' has negative priority {}",
                config.name, config.priority
            )));
        }
        url::Url::parse(&config.base_url).map_err(|e| {
            Error::registry(format!(
                "provider '{}' has invalid base URL '{}': {}",
                config.name, config.base_url, e
            ))
        })?;
        if config.kind == BackendKind::Custom && config.template.is_none() {
            return Err(Error::registry(format!(
                "custom provider '{}' requires a request template",
                config.name
            )));
        }

        let mut models = Vec::with_capacity(config.models.len());
        for model_config in &config.models {
            if models
                .iter()
                .any(|m: &Arc<ModelDescriptor>| m.name == model_config.name)
            {
                return Err(Error::registry(format!(
                    "provider '{}' declares model '{}' twice",
                    config.name, model_config.name
                )));
            }
            let model = ModelDescriptor::from_config(model_config, config.kind)
                .map_err(|e| Error::registry(format!("provider '{}': {}", config.name, e)))?;
            models.push(Arc::new(model));
        }

        let probe_timeout = match config.probe_timeout_secs {
            Some(secs) => Duration::try_from_secs_f64(secs).map_err(|_| {
                Error::registry(format!(
                    "provider '{}' has invalid probe timeout {}",
                    config.name, secs
                ))
            })?,
            None => Duration::from_secs(10),
        };
        let max_concurrent_requests = config.max_concurrent_requests.max(1);

        Ok(Self {
            name: config.name.clone(),
            kind: config.kind,
            content_type: config.content_type,
            priority: u32::try_from(config.priority).unwrap_or(u32::MAX),
            enabled: config.enabled,
            base_url: config.base_url.clone(),
            credential_key: config.credential_key.clone(),
            auth: config.auth.clone(),
            endpoints: config.endpoints.clone(),
            max_concurrent_requests,
            health_path: config.health_path.clone(),
            probe_timeout,
            template: config.template.clone(),
            models,
            stats: RwLock::new(ProviderStats::default()),
            slots: Semaphore::new(max_concurrent_requests),
        })
    }

    /// Unique key across content types, e.g. `text:groq`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.content_type, self.name)
    }

    pub fn models(&self) -> &[Arc<ModelDescriptor>] {
        &self.models
    }

    pub fn model(&self, name: &str) -> Option<&Arc<ModelDescriptor>> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Selectable models at `now`, sorted ascending by priority.
    pub fn available_models_at(&self, now: DateTime<Utc>) -> Vec<Arc<ModelDescriptor>> {
        let mut available: Vec<_> = self
            .models
            .iter()
            .filter(|m| m.is_available_at(now))
            .cloned()
            .collect();
        available.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        available
    }

    pub fn available_models(&self) -> Vec<Arc<ModelDescriptor>> {
        self.available_models_at(Utc::now())
    }

    pub fn resolves(&self, endpoint: &str) -> bool {
        self.endpoints.contains_key(endpoint)
    }

    /// Absolute URL for `endpoint` on `model`. Paths are relative to the model's
    /// endpoint override or the provider base URL and may contain `{model}`.
    pub fn endpoint_url(&self, model: &ModelDescriptor, endpoint: &str) -> Result<String> {
        let path = self
            .endpoints
            .get(endpoint)
            .ok_or_else(|| Error::EndpointNotFound {
                provider: self.name.clone(),
                endpoint: endpoint.to_string(),
            })?
            .replace("{model}", &model.name);

        if path.starts_with("http://") || path.starts_with("https://") {
            return Ok(path);
        }
        let base = model.endpoint.as_deref().unwrap_or(&self.base_url);
        Ok(join_url(base, &path))
    }

    pub fn health_url(&self) -> String {
        join_url(&self.base_url, self.health_path.as_deref().unwrap_or(""))
    }

    pub fn credential<'a>(&self, credentials: &'a Credentials) -> Result<&'a str> {
        if self.auth == AuthStyle::None {
            return Ok("");
        }
        credentials
            .get(&self.credential_key)
            .ok_or_else(|| Error::MissingCredential(self.credential_key.clone()))
    }

    pub async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>> {
        self.slots
            .acquire()
            .await
            .map_err(|_| Error::Closed(self.name.clone()))
    }

    pub fn active_requests(&self) -> usize {
        self.max_concurrent_requests - self.slots.available_permits()
    }

    pub fn record_outcome(&self, model: Option<&str>, success: bool, latency: Duration, tokens: u64) {
        let mut stats = self.stats.write();
        stats.totals.record(success, latency, tokens);
        stats.last_request = Some(Utc::now());
        if let Some(model) = model {
            stats
                .models
                .entry(model.to_string())
                .or_default()
                .record(success, latency, tokens);
        }
    }

    pub fn stats(&self) -> ProviderStats {
        self.stats.read().clone()
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Per-call credentials keyed by backend identifier ("groq", "gemini", ...).
#[derive(Clone, Default, Deserialize, Serialize)]
pub struct Credentials(HashMap<String, String>);

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend: impl Into<String>, secret: impl Into<String>) -> Self {
        self.0.insert(backend.into(), secret.into());
        self
    }

    pub fn insert(&mut self, backend: impl Into<String>, secret: impl Into<String>) {
        self.0.insert(backend.into(), secret.into());
    }

    pub fn get(&self, backend: &str) -> Option<&str> {
        self.0.get(backend).map(String::as_str).filter(|s| !s.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<String, String>> for Credentials {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.0.keys().collect();
        keys.sort();
        f.debug_struct("Credentials").field("backends", &keys).finish()
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub id: String,
    pub endpoint: String,
    pub content_type: ContentType,
    pub payload: Map<String, Value>,
    pub credentials: Credentials,
    pub preferred_provider: Option<String>,
    pub preferred_model: Option<String>,
    pub timeout_override: Option<Duration>,
    pub max_retries_override: Option<u32>,
    pub deadline: Option<Duration>,
    pub created_at: DateTime<Utc>,
}

impl GenerationRequest {
    pub fn new(endpoint: impl Into<String>, content_type: ContentType, payload: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            endpoint: endpoint.into(),
            content_type,
            payload,
            credentials: Credentials::default(),
            preferred_provider: None,
            preferred_model: None,
            timeout_override: None,
            max_retries_override: None,
            deadline: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_preferred_provider(mut self, provider: impl Into<String>) -> Self {
        self.preferred_provider = Some(provider.into());
        self
    }

    pub fn with_preferred_model(mut self, model: impl Into<String>) -> Self {
        self.preferred_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries_override = Some(max_retries);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Normalized result of one successful model invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub content: String,
    pub tokens_used: u64,
    pub metadata: Map<String, Value>,
    pub attempts: u32,
}

impl ModelOutput {
    pub fn new(content: impl Into<String>, tokens_used: u64) -> Self {
        Self {
            content: content.into(),
            tokens_used,
            metadata: Map::new(),
            attempts: 1,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub request_id: String,
    pub success: bool,
    pub content: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub elapsed_ms: u64,
    pub tokens_used: u64,
    pub metadata: Map<String, Value>,
    pub error: Option<String>,
    pub error_details: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl GenerationResponse {
    pub fn success(request_id: &str, provider: &str, model: &str, output: ModelOutput) -> Self {
        let mut metadata = output.metadata;
        metadata.insert("attempts".to_string(), Value::from(output.attempts));
        Self {
            request_id: request_id.to_string(),
            success: true,
            content: output.content,
            provider: Some(provider.to_string()),
            model: Some(model.to_string()),
            elapsed_ms: 0,
            tokens_used: output.tokens_used,
            metadata,
            error: None,
            error_details: Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn failure(request_id: &str, error: impl Into<String>, details: Map<String, Value>) -> Self {
        Self {
            request_id: request_id.to_string(),
            success: false,
            content: String::new(),
            provider: None,
            model: None,
            elapsed_ms: 0,
            tokens_used: 0,
            metadata: Map::new(),
            error: Some(error.into()),
            error_details: details,
            created_at: Utc::now(),
        }
    }

    pub fn with_attribution(mut self, provider: Option<&str>, model: Option<&str>) -> Self {
        self.provider = provider.map(str::to_string);
        self.model = model.map(str::to_string);
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    pub fn attempts(&self) -> Option<u64> {
        self.metadata.get("attempts").and_then(Value::as_u64)
    }
}
