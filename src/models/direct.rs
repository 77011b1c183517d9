use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::adapter::{invoke_over_http, probe_over_http, ProviderAdapter};
use crate::models::cooldown::ResiliencePolicy;
use crate::models::provider::{Credentials, GenerationRequest, ModelDescriptor, ModelOutput, ProviderDescriptor};
use crate::models::transport::HttpTransport;

/// Synchronous chat-completions backend (OpenAI-compatible wire format).
pub struct DirectAdapter {
    provider: Arc<ProviderDescriptor>,
    policy: ResiliencePolicy,
    transport: HttpTransport,
}

impl DirectAdapter {
    pub fn new(provider: Arc<ProviderDescriptor>, policy: ResiliencePolicy, client: reqwest::Client) -> Self {
        let transport = HttpTransport::new(provider.name.clone(), client);
        Self {
            provider,
            policy,
            transport,
        }
    }

    fn messages(request: &GenerationRequest) -> Result<Value> {
        if let Some(messages) = request.payload.get("messages") {
            return match messages.as_array() {
                Some(list) if !list.is_empty() => Ok(messages.clone()),
                _ => Err(Error::validation("messages must be a non-empty array")),
            };
        }

        let prompt = request
            .payload_str("prompt")
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| Error::validation("payload requires 'prompt' or 'messages'"))?;

        let mut messages = Vec::new();
        if let Some(system) = request.payload_str("system") {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));
        Ok(Value::Array(messages))
    }
}

#[async_trait]
impl ProviderAdapter for DirectAdapter {
    fn provider(&self) -> &Arc<ProviderDescriptor> {
        &self.provider
    }

    fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    fn translate_request(&self, model: &ModelDescriptor, request: &GenerationRequest) -> Result<Value> {
        let max_tokens = request
            .payload
            .get("max_tokens")
            .and_then(Value::as_u64)
            .map(|n| n.min(model.max_tokens as u64))
            .unwrap_or(model.max_tokens as u64);

        let mut body = json!({
            "model": model.name,
            "messages": Self::messages(request)?,
            "max_tokens": max_tokens,
            "stream": false,
        });

        if let Some(object) = body.as_object_mut() {
            for (key, value) in &model.params {
                object.insert(key.clone(), value.clone());
            }
            for key in ["temperature", "top_p"] {
                if let Some(value) = request.payload.get(key) {
                    object.insert(key.to_string(), value.clone());
                }
            }
        }

        Ok(body)
    }

    async fn invoke_model(&self, model: &ModelDescriptor, request: &GenerationRequest) -> Result<ModelOutput> {
        invoke_over_http(self, &self.transport, model, request).await
    }

    fn normalize_response(&self, model: &ModelDescriptor, raw: Value) -> Result<ModelOutput> {
        let content = raw
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::malformed(format!("{} response has no choices", model.name)))?;
        let tokens = raw
            .pointer("/usage/total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let mut output = ModelOutput::new(content, tokens);
        if let Some(reason) = raw.pointer("/choices/0/finish_reason") {
            output = output.with_metadata("finish_reason", reason.clone());
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
