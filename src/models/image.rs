use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::adapter::{invoke_over_http, probe_over_http, ProviderAdapter};
use crate::models::cooldown::ResiliencePolicy;
use crate::models::provider::{Credentials, GenerationRequest, ModelDescriptor, ModelOutput, ProviderDescriptor};
use crate::models::transport::HttpTransport;

const SIZE_KEYS: [&str; 4] = ["width", "height", "steps", "n"];

/// Image generation backend speaking the `images/generations` dialect.
/// Content of a successful response is an image URL or inline base64 data.
pub struct ImageAdapter {
    provider: Arc<ProviderDescriptor>,
    policy: ResiliencePolicy,
    transport: HttpTransport,
}

impl ImageAdapter {
    pub fn new(provider: Arc<ProviderDescriptor>, policy: ResiliencePolicy, client: reqwest::Client) -> Self {
        let transport = HttpTransport::new(provider.name.clone(), client);
        Self {
            provider,
            policy,
            transport,
        }
    }
}

#[async_trait]
impl ProviderAdapter for ImageAdapter {
    fn provider(&self) -> &Arc<ProviderDescriptor> {
        &self.provider
    }

    fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    fn translate_request(&self, model: &ModelDescriptor, request: &GenerationRequest) -> Result<Value> {
        let prompt = request
            .payload_str("prompt")
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| Error::validation("image generation requires a 'prompt'"))?;

        let mut body = json!({
            "model": model.name,
            "prompt": prompt,
            "n": 1,
            "response_format": "url",
        });

        let object = body
            .as_object_mut()
            .ok_or_else(|| Error::unknown("image request body is not an object"))?;
        for (key, value) in &model.params {
            object.insert(key.clone(), value.clone());
        }
        for key in SIZE_KEYS {
            if let Some(value) = request.payload.get(key) {
                if !value.is_u64() {
                    return Err(Error::validation(format!("'{}' must be a positive integer", key)));
                }
                object.insert(key.to_string(), value.clone());
            }
        }
        if let Some(format) = request.payload_str("response_format") {
            if !matches!(format, "url" | "b64_json") {
                return Err(Error::validation(format!("unsupported response_format '{}'", format)));
            }
            object.insert("response_format".to_string(), Value::from(format));
        }
        if let Some(negative) = request.payload_str("negative_prompt") {
            object.insert("negative_prompt".to_string(), Value::from(negative));
        }

        Ok(body)
    }

    async fn invoke_model(&self, model: &ModelDescriptor, request: &GenerationRequest) -> Result<ModelOutput> {
        invoke_over_http(self, &self.transport, model, request).await
    }

    fn normalize_response(&self, model: &ModelDescriptor, raw: Value) -> Result<ModelOutput> {
        let image = raw
            .pointer("/data/0")
            .ok_or_else(|| Error::malformed(format!("{} returned no images", model.name)))?;

        let (content, format) = if let Some(url) = image.get("url").and_then(Value::as_str) {
            (url, "url")
        } else if let Some(data) = image.get("b64_json").and_then(Value::as_str) {
            (data, "b64_json")
        } else {
            return Err(Error::malformed(format!("{} image has neither url nor b64_json", model.name)));
        };

        let mut output = ModelOutput::new(content, 0).with_metadata("image_format", Value::from(format));
        if let Some(seed) = image.get("seed") {
            output = output.with_metadata("seed", seed.clone());
        }
        Ok(output)
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
