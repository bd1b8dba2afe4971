//! Registry client for the Docker Registry HTTP v2 protocol
//!
//! A [`Remote`] scopes one registry + repository: it owns the HTTP clients,
//! the auth resolver, and the URL composition for manifest and blob
//! requests. Every request runs through a bounded retry loop that consumes
//! a 401 challenge exactly once; a 401 received on a request that already
//! carried an authorization header fails outright.

use crate::error::{PullError, Result};
use crate::logging::Logger;
use crate::manifest::{
    MEDIA_TYPE_MANIFEST_V1, MEDIA_TYPE_MANIFEST_V2, MEDIA_TYPE_SIGNED_MANIFEST_V1,
    ManifestResponse,
};
use crate::digest::Digest;
use crate::reference::ImageRef;
use crate::registry::auth::{AuthResolver, Credentials};
use crate::registry::transport::{TOKEN_EXCHANGE_TIMEOUT, TransportBuilder};
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::path::PathBuf;

/// Attempts made per request: one unauthenticated, one after resolving the
/// challenge, one safety margin.
pub const MAX_REQUEST_RETRIES: u32 = 3;

/// Accept values offered on pull-path manifest requests. The reconstructor
/// consumes schema 1 history, so schema 2 is not requested here.
pub const MANIFEST_V1_MEDIA_TYPES: &[&str] =
    &[MEDIA_TYPE_SIGNED_MANIFEST_V1, MEDIA_TYPE_MANIFEST_V1];

/// Accept values offered by the streaming producer, which can serialize
/// either schema.
pub const MANIFEST_ALL_MEDIA_TYPES: &[&str] = &[
    MEDIA_TYPE_SIGNED_MANIFEST_V1,
    MEDIA_TYPE_MANIFEST_V1,
    MEDIA_TYPE_MANIFEST_V2,
];

pub struct RemoteBuilder {
    reference: ImageRef,
    credentials: Credentials,
    proxy: Option<String>,
    ca_file: Option<PathBuf>,
    plain_http: bool,
    logger: Logger,
}

impl RemoteBuilder {
    pub fn new(reference: ImageRef) -> Self {
        Self {
            reference,
            credentials: Credentials::default(),
            proxy: None,
            ca_file: None,
            plain_http: false,
            logger: Logger::new(false),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_ca_file(mut self, ca_file: Option<PathBuf>) -> Self {
        self.ca_file = ca_file;
        self
    }

    /// Talk to the registry over plain HTTP. Only sensible for local
    /// registries and test servers.
    pub fn with_plain_http(mut self, plain_http: bool) -> Self {
        self.plain_http = plain_http;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn build(self) -> Result<Remote> {
        let transport = TransportBuilder::new()
            .with_proxy(self.proxy.clone())
            .with_ca_file(self.ca_file.clone());
        let client = transport.build()?;
        let token_client = transport.with_timeout(TOKEN_EXCHANGE_TIMEOUT).build()?;

        let scheme = if self.plain_http { "http" } else { "https" };
        let auth = AuthResolver::new(
            token_client,
            scheme,
            self.reference.hostname().to_string(),
            self.credentials,
            vec![self.reference.pull_scope()],
            self.logger.clone(),
        );

        Ok(Remote {
            reference: self.reference,
            client,
            auth,
            scheme,
            logger: self.logger,
        })
    }
}

pub struct Remote {
    reference: ImageRef,
    client: Client,
    auth: AuthResolver,
    scheme: &'static str,
    logger: Logger,
}

impl Remote {
    pub fn builder(reference: ImageRef) -> RemoteBuilder {
        RemoteBuilder::new(reference)
    }

    pub fn reference(&self) -> &ImageRef {
        &self.reference
    }

    /// Drop any authorization header acquired so far; see
    /// [`AuthResolver::clear`].
    pub fn clear_auth(&self) {
        self.auth.clear();
    }

    fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.reference.hostname())
    }

    /// `/v2/{namespace}/{image}/manifests/{reference}`; the namespace
    /// segment is omitted entirely when empty (top-level ECR repositories).
    pub fn manifest_url(&self, manifest_reference: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(),
            self.reference.repository_path(),
            manifest_reference
        )
    }

    pub fn blob_url(&self, digest: &Digest) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(),
            self.reference.repository_path(),
            digest
        )
    }

    /// Communicate with the remote server and validate that it supports the
    /// v2 protocol: either `/v2/` or `/v2/_ping` must answer 200.
    pub async fn ping(&self) -> Result<bool> {
        let uris = [
            format!("{}/v2/", self.base_url()),
            format!("{}/v2/_ping", self.base_url()),
        ];

        for uri in &uris {
            let response = match self
                .execute_with_retry(|| self.client.get(uri.as_str()), None)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    self.logger.detail(&format!("Error pinging {}: {}", uri, e));
                    continue;
                }
            };
            if response.status() == StatusCode::OK {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Fetch the raw manifest bytes for the session's reference
    pub async fn get_manifest_bytes(&self, media_types: &[&str]) -> Result<ManifestResponse> {
        let uri = self.manifest_url(&self.reference.manifest_reference());
        self.logger.detail(&format!("Get manifest {}", uri));

        // A pull scope is requested in case the oauth implementation does
        // not provide a scope in the authorization failure.
        let additional_scope = self.reference.pull_scope();

        let response = self
            .execute_with_retry(
                || {
                    let mut request = self.client.get(&uri);
                    for media_type in media_types {
                        request = request.header(ACCEPT, *media_type);
                    }
                    request
                },
                Some(&additional_scope),
            )
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(PullError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let docker_content_digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.logger
            .detail(&format!("Responded with media-type: {:?}", content_type));

        let raw = response.bytes().await?.to_vec();
        Ok(ManifestResponse {
            raw,
            content_type,
            docker_content_digest,
        })
    }

    /// Open a blob download. Returns the streaming response and the
    /// Content-Length the registry reported, or -1 when absent. Extra
    /// headers are passed through verbatim (e.g. `Range` in proxy mode).
    pub async fn get_blob(
        &self,
        digest: &Digest,
        extra_headers: &[(String, String)],
    ) -> Result<(Response, i64)> {
        let uri = self.blob_url(digest);
        self.logger.detail(&format!("Downloading blob from {}", uri));

        let additional_scope = self.reference.pull_scope();
        let response = self
            .execute_with_retry(
                || {
                    let mut request = self.client.get(&uri);
                    for (name, value) in extra_headers {
                        request = request.header(name.as_str(), value.as_str());
                    }
                    request
                },
                Some(&additional_scope),
            )
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(PullError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let content_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(-1);

        Ok((response, content_length))
    }

    /// Issue a request, authenticating with the v2 auth server if needed.
    ///
    /// ```text
    /// unauthenticated -> 200           done
    /// unauthenticated -> 401           resolve challenge, retry
    /// authenticated   -> 401           Unauthorized
    /// ```
    ///
    /// The request builder is re-invoked per attempt because a sent request
    /// cannot be replayed.
    pub async fn execute_with_retry<F>(
        &self,
        build_request: F,
        additional_scope: Option<&str>,
    ) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            if attempts > MAX_REQUEST_RETRIES {
                return Err(PullError::TooManyRetries);
            }

            let auth_header = self.auth.authorization_header();
            let mut request = build_request();
            if let Some(header) = &auth_header {
                request = request.header(AUTHORIZATION, header);
            }

            let response = request.send().await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            if auth_header.is_some() {
                // A fresh challenge was already consumed for this header;
                // re-resolving would loop forever on a rejecting registry.
                return Err(PullError::Unauthorized);
            }

            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            self.auth.resolve(&challenge, additional_scope).await?;
        }
    }
}
