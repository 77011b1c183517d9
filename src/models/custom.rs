use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::{Arc, LazyLock};

use crate::error::{Error, Result};
use crate::models::adapter::{invoke_over_http, probe_over_http, ProviderAdapter};
use crate::models::cooldown::ResiliencePolicy;
use crate::models::provider::{Credentials, GenerationRequest, ModelDescriptor, ModelOutput, ProviderDescriptor};
use crate::models::transport::HttpTransport;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("placeholder pattern is valid"));

/// Backend described entirely by configuration: a JSON body template with
/// `{{name}}` placeholders and JSON pointers into the response.
pub struct CustomAdapter {
    provider: Arc<ProviderDescriptor>,
    policy: ResiliencePolicy,
    transport: HttpTransport,
    body: Value,
    content_pointer: String,
    tokens_pointer: Option<String>,
}

impl CustomAdapter {
    pub fn new(provider: Arc<ProviderDescriptor>, policy: ResiliencePolicy, client: reqwest::Client) -> Result<Self> {
        let template = provider
            .template
            .clone()
            .ok_or_else(|| Error::registry(format!("custom provider '{}' has no template", provider.name)))?;
        let body: Value = serde_json::from_str(&template.body).map_err(|e| {
            Error::registry(format!("template of provider '{}' is not valid JSON: {}", provider.name, e))
        })?;
        let transport = HttpTransport::new(provider.name.clone(), client);

        Ok(Self {
            provider,
            policy,
            transport,
            body,
            content_pointer: template.content_pointer,
            tokens_pointer: template.tokens_pointer,
        })
    }

    fn variables(model: &ModelDescriptor, request: &GenerationRequest) -> Map<String, Value> {
        let mut vars = model.params.clone();
        vars.insert("model".to_string(), Value::from(model.name.as_str()));
        vars.insert("max_tokens".to_string(), Value::from(model.max_tokens));
        for (key, value) in &request.payload {
            vars.insert(key.clone(), value.clone());
        }
        vars
    }
}

/// Substitute placeholders in every string leaf. A leaf that is exactly one
/// placeholder takes the variable's JSON value, so numbers stay numbers.
pub fn render_template(template: &Value, vars: &Map<String, Value>) -> Result<Value> {
    match template {
        Value::String(text) => render_string(text, vars),
        Value::Array(items) => items
            .iter()
            .map(|item| render_template(item, vars))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(object) => {
            let mut rendered = Map::with_capacity(object.len());
            for (key, value) in object {
                rendered.insert(key.clone(), render_template(value, vars)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn lookup<'a>(vars: &'a Map<String, Value>, name: &str) -> Result<&'a Value> {
    vars.get(name)
        .ok_or_else(|| Error::validation(format!("template variable '{}' is missing from the request", name)))
}

fn render_string(text: &str, vars: &Map<String, Value>) -> Result<Value> {
    if let Some(caps) = PLACEHOLDER.captures(text) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(text.len()) {
            return lookup(vars, &caps[1]).cloned();
        }
    }

    let mut rendered = String::with_capacity(text.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        rendered.push_str(&text[last..whole.start()]);
        match lookup(vars, name.as_str())? {
            Value::String(s) => rendered.push_str(s),
            other => rendered.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    rendered.push_str(&text[last..]);
    Ok(Value::String(rendered))
}

#[async_trait]
impl ProviderAdapter for CustomAdapter {
    fn provider(&self) -> &Arc<ProviderDescriptor> {
        &self.provider
    }

    fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    fn translate_request(&self, model: &ModelDescriptor, request: &GenerationRequest) -> Result<Value> {
        render_template(&self.body, &Self::variables(model, request))
    }

    async fn invoke_model(&self, model: &ModelDescriptor, request: &GenerationRequest) -> Result<ModelOutput> {
        invoke_over_http(self, &self.transport, model, request).await
    }

    fn normalize_response(&self, model: &ModelDescriptor, raw: Value) -> Result<ModelOutput> {
        let content = match raw.pointer(&self.content_pointer) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => {
                return Err(Error::malformed(format!(
                    "{} response has nothing at {}",
                    model.name, self.content_pointer
                )))
            }
            Some(other) => other.to_string(),
        };
        let tokens = self
            .tokens_pointer
            .as_deref()
            .and_then(|pointer| raw.pointer(pointer))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(ModelOutput::new(content, tokens))
    }

    async fn probe_health(&self, credentials: &Credentials) -> bool {
        probe_over_http(&self.provider, &self.transport, credentials).await
    }

    fn close(&self) {
        self.transport.close();
    }

    fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::AppConfig;
    use crate::models::provider::ContentType;
    use crate::models::transport::build_client;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gemini(base_url: &str) -> CustomAdapter {
        let mut config = AppConfig::default_catalog()
            .providers
            .into_iter()
            .find(|p| p.name == "gemini")
            .unwrap();
        config.base_url = base_url.to_string();
        let provider = Arc::new(ProviderDescriptor::from_config(&config).unwrap());
        CustomAdapter::new(
            provider,
            ResiliencePolicy::default(),
            build_client(Duration::from_secs(5)).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_render_keeps_types_and_interpolates() {
        let template = json!({
            "n": "{{count}}",
            "text": "Write about {{topic}} in {{count}} lines",
            "list": ["{{topic}}"]
        });
        let vars = json!({"count": 3, "topic": "rust"}).as_object().cloned().unwrap();

        let rendered = render_template(&template, &vars).unwrap();
        assert_eq!(rendered["n"], 3);
        assert_eq!(rendered["text"], "Write about rust in 3 lines");
        assert_eq!(rendered["list"][0], "rust");
    }

    #[test]
    fn test_missing_variable_is_validation_error() {
        let template = json!({"text": "{{absent}}"});
        let err = render_template(&template, &Map::new()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_invalid_template_rejected_at_construction() {
        let mut config = AppConfig::default_catalog()
            .providers
            .into_iter()
            .find(|p| p.name == "gemini")
            .unwrap();
        if let Some(template) = config.template.as_mut() {
            template.body = "{not json".to_string();
        }
        let provider = Arc::new(ProviderDescriptor::from_config(&config).unwrap());
        let result = CustomAdapter::new(
            provider,
            ResiliencePolicy::default(),
            build_client(Duration::from_secs(5)).unwrap(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_gemini_style_backend() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.0-flash:generateContent"))
            .and(query_param("key", "g-key"))
            .and(body_partial_json(json!({
                "contents": [{"parts": [{"text": "Explain fractions"}]}],
                "generationConfig": {"maxOutputTokens": 4096}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "Fractions are parts"}]}}],
                "usageMetadata": {"totalTokenCount": 33}
            })))
            .mount(&server)
            .await;

        let adapter = gemini(&server.uri());
        let request = GenerationRequest::new(
            "lesson-plan",
            ContentType::Text,
            json!({"prompt": "Explain fractions"}).as_object().cloned().unwrap(),
        )
        .with_credentials(Credentials::new().with("gemini", "g-key"));

        let response = adapter.call_api(&request).await;
        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.content, "Fractions are parts");
        assert_eq!(response.tokens_used, 33);
        assert_eq!(response.model.as_deref(), Some("gemini-2.0-flash"));
    }

    #[tokio::test]
    async fn test_region_block_cools_model_for_forbidden_window() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "User location is not supported for the API use."}
            })))
            .mount(&server)
            .await;

        let adapter = gemini(&server.uri());
        let request = GenerationRequest::new(
            "chat",
            ContentType::Text,
            json!({"prompt": "hi"}).as_object().cloned().unwrap(),
        )
        .with_credentials(Credentials::new().with("gemini", "g-key"))
        .with_max_retries(1);

        let response = adapter.call_api(&request).await;
        assert!(!response.success);
        assert_eq!(response.error_details["error_class"], "forbidden");
        assert!(adapter.provider().available_models().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_backend_keeps_query_key_out_of_results() {
        use crate::models::metrics::{AttemptRecord, MetricsCollector};

        let adapter = gemini("http://127.0.0.1:1");
        let request = GenerationRequest::new(
            "chat",
            ContentType::Text,
            json!({"prompt": "hi"}).as_object().cloned().unwrap(),
        )
        .with_credentials(Credentials::new().with("gemini", "SUPERSECRETKEY"))
        .with_max_retries(1);

        let response = adapter.call_api(&request).await;
        assert!(!response.success);
        assert_eq!(response.error_details["error_class"], "transient");
        assert!(!response.error.as_deref().unwrap_or("").contains("SUPERSECRETKEY"));

        let metrics = MetricsCollector::default();
        metrics.record(AttemptRecord::from_response(&request, &response));
        let report = metrics.provider_report();
        assert!(report
            .values()
            .flat_map(|r| r.top_errors.iter())
            .all(|(error, _)| !error.contains("SUPERSECRETKEY")));
        assert!(!serde_json::to_string(&response).unwrap().contains("SUPERSECRETKEY"));
    }
}
