use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[source] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Missing credential for backend '{0}'")]
    MissingCredential(String),

    #[error("Provider '{provider}' has no endpoint '{endpoint}'")]
    EndpointNotFound { provider: String, endpoint: String },

    #[error("Upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Attempt cancelled by caller timeout after {0:?}")]
    Cancelled(Duration),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Adapter for provider '{0}' is closed")]
    Closed(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Request URLs may carry query-string credentials, so they never reach the
/// error text.
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.without_url())
    }
}

impl Error {
    pub fn registry(msg: impl Into<String>) -> Self {
        Error::Registry(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn upstream(status: u16, msg: impl Into<String>) -> Self {
        Error::Upstream {
            status,
            message: msg.into(),
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedResponse(msg.into())
    }

    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Error::Unknown(msg.into())
    }

    /// HTTP status attached to the error, if the backend produced one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Upstream { status, .. } => Some(*status),
            Error::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
