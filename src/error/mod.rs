//! Error types for registry pull operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PullError>;

#[derive(Debug, Error)]
pub enum PullError {
    /// Network related errors
    #[error("Network error: {0}")]
    Network(String),
    /// Registry protocol errors
    #[error("Registry error: {0}")]
    Registry(String),
    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),
    /// A fresh authentication attempt was rejected by the registry
    #[error("Unauthorized")]
    Unauthorized,
    /// The retry budget for a single request was exhausted
    #[error("Too many retries")]
    TooManyRetries,
    /// A 2xx was expected and something else came back
    #[error("Unexpected status code {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    /// Manifest failed signature or consistency verification
    #[error("Manifest error: {0}")]
    Manifest(String),
    /// A downloaded blob did not hash to the digest the manifest promised
    #[error("Integrity error: expected digest {expected}, computed {computed}")]
    Integrity { expected: String, computed: String },
    /// File IO errors
    #[error("IO error: {0}")]
    Io(String),
    /// Parse errors
    #[error("Parse error: {0}")]
    Parse(String),
    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    /// Feature not implemented
    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl From<std::io::Error> for PullError {
    fn from(err: std::io::Error) -> Self {
        PullError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PullError {
    fn from(err: serde_json::Error) -> Self {
        PullError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for PullError {
    fn from(err: reqwest::Error) -> Self {
        PullError::Network(err.to_string())
    }
}

impl From<url::ParseError> for PullError {
    fn from(err: url::ParseError) -> Self {
        PullError::Validation(err.to_string())
    }
}
