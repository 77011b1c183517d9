use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_retry::RetryIf;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::cooldown::{classify, ErrorClass, ResiliencePolicy};
use crate::models::custom::CustomAdapter;
use crate::models::direct::DirectAdapter;
use crate::models::image::ImageAdapter;
use crate::models::provider::{
    BackendKind, Credentials, GenerationRequest, GenerationResponse, ModelDescriptor, ModelOutput,
    ProviderDescriptor,
};
use crate::models::transport::HttpTransport;

/// Final error of one model after its retry budget, classified once.
#[derive(Debug)]
pub struct ModelFailure {
    pub error: Error,
    pub class: ErrorClass,
    pub attempts: u32,
}

/// One backend kind. Implementors provide the wire translation; the model
/// cascade, retries and cooldown bookkeeping are shared.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> &Arc<ProviderDescriptor>;

    fn policy(&self) -> &ResiliencePolicy;

    /// Build the upstream request body for `model`.
    fn translate_request(&self, model: &ModelDescriptor, request: &GenerationRequest) -> Result<Value>;

    /// One attempt against one model, without retries.
    async fn invoke_model(&self, model: &ModelDescriptor, request: &GenerationRequest) -> Result<ModelOutput>;

    fn normalize_response(&self, model: &ModelDescriptor, raw: Value) -> Result<ModelOutput>;

    async fn probe_health(&self, credentials: &Credentials) -> bool;

    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Try the provider's available models in priority order and return the
    /// first success, or an aggregated failure naming the last error.
    async fn call_api(&self, request: &GenerationRequest) -> GenerationResponse {
        let provider = self.provider();
        let started = Instant::now();

        if self.is_closed() {
            let error = Error::Closed(provider.name.clone());
            return GenerationResponse::failure(&request.id, error.to_string(), Map::new())
                .with_attribution(Some(&provider.name), None);
        }

        let _permit = match provider.acquire_slot().await {
            Ok(permit) => permit,
            Err(e) => {
                return GenerationResponse::failure(&request.id, e.to_string(), Map::new())
                    .with_attribution(Some(&provider.name), None)
            }
        };

        let mut models = provider.available_models();
        if let Some(preferred) = request.preferred_model.as_deref() {
            if let Some(pos) = models.iter().position(|m| m.name == preferred) {
                let model = models.remove(pos);
                models.insert(0, model);
            }
        }

        if models.is_empty() {
            let mut details = Map::new();
            details.insert("provider".to_string(), Value::from(provider.name.as_str()));
            details.insert("reason".to_string(), Value::from("all models cooling down or disabled"));
            return GenerationResponse::failure(
                &request.id,
                format!("Provider {} has no available models", provider.name),
                details,
            )
            .with_attribution(Some(&provider.name), None)
            .with_elapsed(started.elapsed());
        }

        let mut models_tried = Vec::with_capacity(models.len());
        let mut last: Option<(String, ModelFailure)> = None;

        for model in models {
            models_tried.push(Value::from(model.name.as_str()));

            match self.call_model_with_retry(&model, request).await {
                Ok(output) => {
                    model.mark_success();
                    info!(
                        "Request {} served by {}/{} after {} attempt(s)",
                        request.id, provider.name, model.name, output.attempts
                    );
                    return GenerationResponse::success(&request.id, &provider.name, &model.name, output)
                        .with_elapsed(started.elapsed());
                }
                Err(failure) => {
                    let message = failure.error.to_string();
                    match self
                        .policy()
                        .cooldown
                        .duration_with_hint(failure.class, model.cooldown_hint)
                    {
                        Some(duration) => {
                            let until = model.enter_cooldown(duration, failure.class, &message);
                            warn!(
                                "Model {}/{} failed ({}), cooling down until {}: {}",
                                provider.name,
                                model.name,
                                failure.class.as_str(),
                                until,
                                message
                            );
                        }
                        None if failure.class == ErrorClass::Cancelled => {
                            model.mark_cancelled(&message);
                            warn!(
                                "Model {}/{} cut short by caller timeout for request {}",
                                provider.name, model.name, request.id
                            );
                        }
                        None => {
                            warn!(
                                "Model {}/{} rejected request {}: {}",
                                provider.name, model.name, request.id, message
                            );
                        }
                    }

                    let stop = !failure.class.is_retryable();
                    last = Some((model.name.clone(), failure));
                    if stop {
                        break;
                    }
                }
            }
        }

        let mut details = Map::new();
        details.insert("provider".to_string(), Value::from(provider.name.as_str()));
        details.insert("models_tried".to_string(), Value::Array(models_tried));

        let (error, model) = match last {
            Some((model, failure)) => {
                details.insert("model".to_string(), Value::from(model.as_str()));
                details.insert("error_class".to_string(), Value::from(failure.class.as_str()));
                details.insert("attempts".to_string(), Value::from(failure.attempts));
                (
                    format!(
                        "Provider {} failed ({}): {}",
                        provider.name,
                        failure.class.as_str(),
                        failure.error
                    ),
                    Some(model),
                )
            }
            None => (format!("Provider {} failed", provider.name), None),
        };

        GenerationResponse::failure(&request.id, error, details)
            .with_attribution(Some(&provider.name), model.as_deref())
            .with_elapsed(started.elapsed())
    }

    /// Up to the model's retry budget of attempts, each bounded by the model
    /// timeout, with exponential backoff in between. Validation errors stop
    /// immediately. A caller timeout shorter than the model's own yields
    /// [`Error::Cancelled`] instead of a backend timeout.
    async fn call_model_with_retry(
        &self,
        model: &ModelDescriptor,
        request: &GenerationRequest,
    ) -> std::result::Result<ModelOutput, ModelFailure> {
        let budget = request
            .max_retries_override
            .unwrap_or(model.retry_budget)
            .max(1);
        let timeout = request.timeout_override.unwrap_or(model.timeout);
        let caller_bounded = request.timeout_override.is_some_and(|t| t < model.timeout);
        let attempts = AtomicU32::new(0);
        let provider = &self.provider().name;

        let strategy = self.policy().backoff.delays(budget - 1);
        let attempts_ref = &attempts;
        let result = RetryIf::spawn(
            strategy,
            move || async move {
                let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(
                    "Attempt {}/{} on {}/{} for request {}",
                    attempt, budget, provider, model.name, request.id
                );

                match tokio::time::timeout(timeout, self.invoke_model(model, request)).await {
                    Ok(Ok(output)) if output.content.trim().is_empty() => {
                        Err(Error::malformed(format!("{} returned empty content", model.name)))
                    }
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(e)) => {
                        debug!("Attempt {} on {}/{} failed: {}", attempt, provider, model.name, e);
                        Err(e)
                    }
                    Err(_) if caller_bounded => Err(Error::Cancelled(timeout)),
                    Err(_) => Err(Error::Timeout(timeout)),
                }
            },
            |e: &Error| classify(e).is_retryable(),
        )
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        match result {
            Ok(mut output) => {
                output.attempts = attempts;
                Ok(output)
            }
            Err(error) => Err(ModelFailure {
                class: classify(&error),
                error,
                attempts,
            }),
        }
    }
}

/// Shared HTTP path for adapters whose wire format is a single JSON POST.
pub(crate) async fn invoke_over_http<A>(
    adapter: &A,
    transport: &HttpTransport,
    model: &ModelDescriptor,
    request: &GenerationRequest,
) -> Result<ModelOutput>
where
    A: ProviderAdapter + ?Sized,
{
    let provider = adapter.provider();
    let credential = provider.credential(&request.credentials)?;
    let url = provider.endpoint_url(model, &request.endpoint)?;
    let body = adapter.translate_request(model, request)?;

    let raw = transport.post_json(&url, &provider.auth, credential, &body).await?;
    adapter.normalize_response(model, raw)
}

pub(crate) async fn probe_over_http(
    provider: &ProviderDescriptor,
    transport: &HttpTransport,
    credentials: &Credentials,
) -> bool {
    let credential = credentials.get(&provider.credential_key).unwrap_or("");
    transport
        .probe(&provider.health_url(), &provider.auth, credential, provider.probe_timeout)
        .await
}

/// Build the adapter matching the provider's backend kind.
pub fn build_adapter(
    provider: Arc<ProviderDescriptor>,
    policy: ResiliencePolicy,
    client: reqwest::Client,
) -> Result<Arc<dyn ProviderAdapter>> {
    let adapter: Arc<dyn ProviderAdapter> = match provider.kind {
        BackendKind::Direct => Arc::new(DirectAdapter::new(provider, policy, client)),
        BackendKind::ImageBackend => Arc::new(ImageAdapter::new(provider, policy, client)),
        BackendKind::Custom => Arc::new(CustomAdapter::new(provider, policy, client)?),
    };
    Ok(adapter)
}


#[cfg(test)]
mod tests {
    use super::testing::{provider, ScriptedAdapter, Step};
    use super::*;
    use crate::models::provider::{ContentType, ModelStatus};

    fn request() -> GenerationRequest {
        GenerationRequest::new("chat", ContentType::Text, Map::new())
    }

    #[tokio::test]
    async fn test_first_model_success() {
        let adapter = ScriptedAdapter::new(provider("p", 0, &[("a", 0)]))
            .script("a", vec![Step::Succeed("hello")]);

        let response = adapter.call_api(&request()).await;
        assert!(response.success);
        assert_eq!(response.content, "hello");
        assert_eq!(response.model.as_deref(), Some("a"));
        assert_eq!(response.attempts(), Some(1));
    }

    #[tokio::test]
    async fn test_retry_then_succeed_on_same_model() {
        let adapter = ScriptedAdapter::new(provider("p", 0, &[("a", 0)]))
            .script("a", vec![Step::Status(503, "busy"), Step::Succeed("ok")]);

        let response = adapter.call_api(&request()).await;
        assert!(response.success);
        assert_eq!(response.attempts(), Some(2));
        assert_eq!(adapter.calls("a"), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_model_cools_down() {
        let provider = provider("p", 0, &[("a", 0)]);
        let adapter = ScriptedAdapter::new(provider.clone())
            .script("a", vec![Step::Status(429, "Too Many Requests")]);

        let response = adapter.call_api(&request()).await;
        assert!(!response.success);
        assert_eq!(adapter.calls("a"), 2);
        assert!(response.error.as_deref().unwrap().contains("rate_limited"));
        assert_eq!(response.error_details["error_class"], "rate_limited");

        let model = provider.model("a").unwrap();
        assert_eq!(model.status(), ModelStatus::Cooldown);
        let until = model.cooldown_until().unwrap();
        let window = until - chrono::Utc::now();
        assert!(window > chrono::Duration::minutes(9));
    }

    #[tokio::test]
    async fn test_falls_through_to_next_model() {
        let provider = provider("p", 0, &[("a", 0), ("b", 1)]);
        let adapter = ScriptedAdapter::new(provider.clone())
            .script("a", vec![Step::Status(500, "boom")])
            .script("b", vec![Step::Succeed("from b")]);

        let response = adapter.call_api(&request()).await;
        assert!(response.success);
        assert_eq!(response.model.as_deref(), Some("b"));
        assert_eq!(provider.model("a").unwrap().status(), ModelStatus::Cooldown);
        assert_eq!(provider.model("b").unwrap().error_count(), 0);
    }

    #[tokio::test]
    async fn test_validation_error_is_not_retried_or_cooled() {
        let provider = provider("p", 0, &[("a", 0), ("b", 1)]);
        let adapter = ScriptedAdapter::new(provider.clone())
            .script("a", vec![Step::Invalid("prompt is required")])
            .script("b", vec![Step::Succeed("unused")]);

        let response = adapter.call_api(&request()).await;
        assert!(!response.success);
        assert_eq!(adapter.calls("a"), 1);
        assert_eq!(adapter.calls("b"), 0);
        assert_eq!(provider.model("a").unwrap().status(), ModelStatus::Available);
        assert_eq!(response.error_details["error_class"], "validation_error");
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient_failure() {
        let provider = provider("p", 0, &[("slow", 0)]);
        let adapter = ScriptedAdapter::new(provider.clone()).script("slow", vec![Step::Hang]);

        let response = adapter.call_api(&request()).await;
        assert!(!response.success);
        assert_eq!(adapter.calls("slow"), 2);
        assert_eq!(response.error_details["error_class"], "transient");
        assert_eq!(provider.model("slow").unwrap().status(), ModelStatus::Cooldown);
    }

    #[tokio::test]
    async fn test_caller_timeout_does_not_cool_down() {
        let provider = provider("p", 0, &[("slow", 0), ("fast", 1)]);
        let adapter = ScriptedAdapter::new(provider.clone())
            .script("slow", vec![Step::Hang])
            .script("fast", vec![Step::Hang]);

        let response = adapter
            .call_api(&request().with_timeout(std::time::Duration::from_millis(1)))
            .await;
        assert!(!response.success);
        assert_eq!(response.error_details["error_class"], "cancelled");
        assert_eq!(adapter.calls("slow"), 2);
        assert_eq!(adapter.calls("fast"), 2);

        let slow = provider.model("slow").unwrap();
        assert!(slow.cooldown_until().is_none());
        assert_eq!(slow.error_count(), 0);
        assert_eq!(provider.available_models().len(), 2);
    }

    #[tokio::test]
    async fn test_longer_caller_timeout_still_cools_down() {
        let provider = provider("p", 0, &[("slow", 0)]);
        let adapter = ScriptedAdapter::new(provider.clone()).script("slow", vec![Step::Hang]);

        let response = adapter
            .call_api(&request().with_timeout(std::time::Duration::from_millis(300)))
            .await;
        assert_eq!(response.error_details["error_class"], "transient");
        assert_eq!(provider.model("slow").unwrap().status(), ModelStatus::Cooldown);
    }

    #[tokio::test]
    async fn test_preferred_model_goes_first() {
        let adapter = ScriptedAdapter::new(provider("p", 0, &[("a", 0), ("b", 1)]))
            .script("a", vec![Step::Succeed("a")])
            .script("b", vec![Step::Succeed("b")]);

        let response = adapter
            .call_api(&request().with_preferred_model("b"))
            .await;
        assert_eq!(response.model.as_deref(), Some("b"));
        assert_eq!(adapter.calls("a"), 0);
    }

    #[tokio::test]
    async fn test_max_retries_override() {
        let adapter = ScriptedAdapter::new(provider("p", 0, &[("a", 0)]))
            .script("a", vec![Step::Status(502, "bad gateway")]);

        let response = adapter.call_api(&request().with_max_retries(4)).await;
        assert!(!response.success);
        assert_eq!(adapter.calls("a"), 4);
        assert_eq!(response.error_details["attempts"], 4);
    }

    #[tokio::test]
    async fn test_empty_content_is_a_failure() {
        let adapter = ScriptedAdapter::new(provider("p", 0, &[("a", 0)]))
            .script("a", vec![Step::Succeed("   ")]);

        let response = adapter.call_api(&request()).await;
        assert!(!response.success);
        assert_eq!(response.error_details["error_class"], "server_error");
    }

    #[tokio::test]
    async fn test_closed_adapter_fails_without_calls() {
        let adapter = ScriptedAdapter::new(provider("p", 0, &[("a", 0)]))
            .script("a", vec![Step::Succeed("x")]);
        adapter.close();

        let response = adapter.call_api(&request()).await;
        assert!(!response.success);
        assert_eq!(adapter.total_calls(), 0);
    }
}
