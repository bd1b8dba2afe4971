//! HTTP transport construction
//!
//! Builds the reqwest clients a pull session uses: one long-lived client for
//! manifest and blob traffic (no overall timeout, so large layers can take
//! their natural transfer time) and one short-timeout client for token
//! exchanges. Clients are built per session rather than shared process-wide.

use crate::error::{PullError, Result};
use reqwest::{Client, NoProxy, Proxy};
use std::path::PathBuf;
use std::time::Duration;

pub const USER_AGENT: &str = concat!("Docker-Image-Puller/", env!("CARGO_PKG_VERSION"));

/// Timeout applied to token-exchange requests
pub const TOKEN_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Default)]
pub struct TransportBuilder {
    proxy: Option<String>,
    ca_file: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route requests through an HTTP proxy, except for hosts matched by the
    /// standard no-proxy environment list.
    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Trust an additional root CA loaded from a PEM file. Used when a
    /// caller points at a registry with its own certificate authority.
    pub fn with_ca_file(mut self, ca_file: Option<PathBuf>) -> Self {
        self.ca_file = ca_file;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(&self) -> Result<Client> {
        let mut builder = Client::builder().user_agent(USER_AGENT);

        if let Some(proxy) = &self.proxy {
            let url = url::Url::parse(proxy)?;
            let proxy = Proxy::all(url.as_str())
                .map_err(|e| PullError::Validation(format!("Invalid proxy address: {}", e)))?
                .no_proxy(NoProxy::from_env());
            builder = builder.proxy(proxy);
        }

        if let Some(ca_file) = &self.ca_file {
            let pem = std::fs::read(ca_file).map_err(|e| {
                PullError::Io(format!("failed to read pem file {}: {}", ca_file.display(), e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|_| PullError::Validation("unable to append root cert".to_string()))?;
            builder = builder.add_root_certificate(cert);
        }

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        builder
            .build()
            .map_err(|e| PullError::Network(format!("Failed to build http client: {}", e)))
    }
}
