use arc_swap::ArcSwapOption;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::provider::AuthStyle;

pub fn build_client(connect_timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(concat!("genroute/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(Error::from)
}

/// Shared HTTP session of one adapter. Closing drops the client; later calls
/// fail with [`Error::Closed`].
#[derive(Debug)]
pub struct HttpTransport {
    provider: String,
    client: ArcSwapOption<Client>,
}

impl HttpTransport {
    pub fn new(provider: impl Into<String>, client: Client) -> Self {
        Self {
            provider: provider.into(),
            client: ArcSwapOption::from_pointee(client),
        }
    }

    fn client(&self) -> Result<Arc<Client>> {
        self.client
            .load_full()
            .ok_or_else(|| Error::Closed(self.provider.clone()))
    }

    pub fn is_closed(&self) -> bool {
        self.client.load().is_none()
    }

    /// Idempotent.
    pub fn close(&self) {
        if self.client.swap(None).is_some() {
            debug!("Closed HTTP session for provider {}", self.provider);
        }
    }

    fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
        auth: &AuthStyle,
        credential: &str,
    ) -> reqwest::RequestBuilder {
        match auth {
            AuthStyle::Bearer => builder.bearer_auth(credential),
            AuthStyle::Header { name } => builder.header(name.as_str(), credential),
            AuthStyle::Query { name } => builder.query(&[(name.as_str(), credential)]),
            AuthStyle::None => builder,
        }
    }

    pub async fn post_json(
        &self,
        url: &str,
        auth: &AuthStyle,
        credential: &str,
        body: &Value,
    ) -> Result<Value> {
        let client = self.client()?;
        let request = self.authorize(client.post(url), auth, credential).json(body);

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = extract_error_message(&error_text).unwrap_or(error_text);
            warn!(
                "Provider {} returned {}: {}",
                self.provider,
                status.as_u16(),
                message
            );
            return Err(Error::upstream(status.as_u16(), message));
        }

        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| Error::malformed(format!("{} returned invalid JSON: {}", self.provider, e)))
    }

    /// Lightweight reachability check. Any non-5xx answer counts as healthy,
    /// so a missing or wrong credential still reports the backend as up.
    pub async fn probe(
        &self,
        url: &str,
        auth: &AuthStyle,
        credential: &str,
        timeout: Duration,
    ) -> bool {
        let client = match self.client() {
            Ok(client) => client,
            Err(_) => return false,
        };
        let request = self.authorize(client.get(url), auth, credential).timeout(timeout);

        match request.send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                debug!("Health probe for {} failed: {}", self.provider, e.without_url());
                false
            }
        }
    }
}

/// Pull a human readable message out of common upstream error envelopes.
fn extract_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let candidates = [
        value.pointer("/error/message"),
        value.pointer("/error"),
        value.pointer("/message"),
        value.pointer("/detail"),
    ];
    let message = candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().map(str::to_string));
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> HttpTransport {
        HttpTransport::new("test", build_client(Duration::from_secs(5)).unwrap())
    }

    #[tokio::test]
    async fn test_post_json_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let url = format!("{}/v1/chat", server.uri());
        let value = transport()
            .post_json(&url, &AuthStyle::Bearer, "sk-test", &json!({}))
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn test_query_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("key", "g-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let auth = AuthStyle::Query {
            name: "key".to_string(),
        };
        let result = transport()
            .post_json(&server.uri(), &auth, "g-test", &json!({}))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_query_credential_absent_from_connection_error() {
        let auth = AuthStyle::Query {
            name: "key".to_string(),
        };
        let err = transport()
            .post_json("http://127.0.0.1:1/models/m:generateContent", &auth, "SUPERSECRETKEY", &json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Http(_)));
        assert!(!err.to_string().contains("SUPERSECRETKEY"));
        assert!(!format!("{err:?}").contains("SUPERSECRETKEY"));
    }

    #[tokio::test]
    async fn test_upstream_error_carries_status_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_json(json!({"error": {"message": "Rate limit reached"}})),
            )
            .mount(&server)
            .await;

        let err = transport()
            .post_json(&server.uri(), &AuthStyle::Bearer, "k", &json!({}))
            .await
            .unwrap_err();
        match err {
            Error::Upstream { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "Rate limit reached");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_probe_treats_client_errors_as_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/unauthorized"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let t = transport();
        let timeout = Duration::from_secs(2);
        assert!(t.probe(&format!("{}/unauthorized", server.uri()), &AuthStyle::Bearer, "", timeout).await);
        assert!(!t.probe(&format!("{}/down", server.uri()), &AuthStyle::Bearer, "", timeout).await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let t = transport();
        t.close();
        t.close();
        assert!(t.is_closed());
        let err = t
            .post_json("http://localhost:1", &AuthStyle::None, "", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
    }
}
