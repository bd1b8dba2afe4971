//! Challenge-based authentication for registry access
//!
//! The resolver owns the mutable auth state of a single remote: the current
//! `Authorization` header, the cached bearer token with its expiry, and any
//! refresh token the token endpoint handed back. It understands three
//! challenge flavors: `Bearer` (token exchange against the advertised realm),
//! `Basic`, and the out-of-band ECR token flow for AWS registry hostnames.

use crate::error::{PullError, Result};
use crate::logging::Logger;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use std::sync::Mutex;

/// A token must not live less than 60 seconds; older clients assumed this
/// minimum when the response omitted an expiry.
pub const MINIMUM_TOKEN_LIFETIME_SECS: i64 = 60;

/// A cached token within this many seconds of expiry is treated as expired
/// to tolerate clock drift at the server.
const EXPIRY_SLACK_SECS: i64 = 60;

const OAUTH_CLIENT_ID: &str = "registry-client";

/// Time source, injectable so tests can pin the clock
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Credentials for a single remote. For ECR registries the username and
/// password carry the AWS access key id and secret access key.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    /// A pre-acquired bearer token, used when no username/password is set
    pub token: Option<String>,
}

impl Credentials {
    fn basic_pair(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
    scopes: Vec<String>,
}

impl CachedToken {
    fn usable_for(&self, scopes: &[String], now: DateTime<Utc>) -> bool {
        scopes.iter().all(|s| self.scopes.contains(s))
            && now + Duration::seconds(EXPIRY_SLACK_SECS) < self.expires_at
    }
}

#[derive(Default)]
struct AuthState {
    auth_header: Option<String>,
    cached: Option<CachedToken>,
    refresh_token: Option<String>,
    service_hostname: Option<String>,
}

/// Parsed `WWW-Authenticate` challenge parameters
#[derive(Debug, Default, PartialEq)]
struct Challenge {
    realm: String,
    service: String,
    scope: Option<String>,
}

fn parse_challenge(params: &str) -> Challenge {
    let mut challenge = Challenge::default();
    for param in params.split(',') {
        let param = param.trim();
        if let Some(eq_pos) = param.find('=') {
            let key = param[..eq_pos].trim();
            let value = param[eq_pos + 1..].trim().trim_matches('"');
            match key {
                "realm" => challenge.realm = value.to_string(),
                "service" => challenge.service = value.to_string(),
                "scope" => challenge.scope = Some(value.to_string()),
                _ => {}
            }
        }
    }
    challenge
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    issued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Canonicalize a token response: `access_token` is equivalent to `token`,
/// the minimum lifetime applies, and a missing `issued_at` means "now".
fn token_from_response(
    response: TokenResponse,
    now: DateTime<Utc>,
) -> Result<(String, DateTime<Utc>, Option<String>)> {
    let token = match (response.token, response.access_token) {
        (Some(token), _) if !token.is_empty() => token,
        (_, Some(token)) if !token.is_empty() => token,
        _ => {
            return Err(PullError::Auth(
                "authorization server did not include a token in the response".to_string(),
            ));
        }
    };

    let expires_in = response
        .expires_in
        .unwrap_or(0)
        .max(MINIMUM_TOKEN_LIFETIME_SECS);
    let issued_at = response.issued_at.unwrap_or(now);

    Ok((
        token,
        issued_at + Duration::seconds(expires_in),
        response.refresh_token,
    ))
}

pub fn is_aws_endpoint(hostname: &str) -> bool {
    hostname.ends_with(".amazonaws.com")
}

/// Split an ECR hostname `<registry>.dkr.ecr.<zone>.amazonaws.com` into the
/// registry id and zone.
pub fn parse_ecr_endpoint(endpoint: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = endpoint.split('.').collect();
    if parts.len() < 6 || parts[1] != "dkr" || parts[2] != "ecr" {
        return Err(PullError::Validation("Invalid ECR URL".to_string()));
    }
    Ok((parts[0].to_string(), parts[3].to_string()))
}

/// Resolves authentication challenges for one remote registry
pub struct AuthResolver {
    client: Client,
    scheme: &'static str,
    hostname: String,
    credentials: Credentials,
    default_scopes: Vec<String>,
    clock: Box<dyn Clock>,
    logger: Logger,
    state: Mutex<AuthState>,
}

impl AuthResolver {
    pub fn new(
        client: Client,
        scheme: &'static str,
        hostname: String,
        credentials: Credentials,
        default_scopes: Vec<String>,
        logger: Logger,
    ) -> Self {
        Self {
            client,
            scheme,
            hostname,
            credentials,
            default_scopes,
            clock: Box::new(SystemClock),
            logger,
            state: Mutex::new(AuthState::default()),
        }
    }

    /// The current `Authorization` header value, if any. Reads copy the
    /// value so the lock is never held across a request.
    pub fn authorization_header(&self) -> Option<String> {
        match self.state.lock() {
            Ok(state) => state.auth_header.clone(),
            Err(_) => None,
        }
    }

    /// Drop the current authorization header. Tokens acquired without a
    /// repository scope (e.g. by the protocol probe) cause 401s when a pull
    /// starts, so sessions clear the header before the manifest request.
    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.auth_header = None;
        }
    }

    pub fn service_hostname(&self) -> Option<String> {
        match self.state.lock() {
            Ok(state) => state.service_hostname.clone(),
            Err(_) => None,
        }
    }

    /// Consume a `WWW-Authenticate` challenge and install a fresh
    /// authorization header for the remote.
    pub async fn resolve(&self, challenge: &str, additional_scope: Option<&str>) -> Result<()> {
        if is_aws_endpoint(&self.hostname) {
            return self.resolve_ecr().await;
        }
        if let Some(params) = challenge.strip_prefix("Bearer ") {
            return self.resolve_bearer(params, additional_scope).await;
        }
        if challenge.starts_with("Basic ") {
            return self.resolve_basic(additional_scope).await;
        }
        Err(PullError::Auth(format!(
            "unsupported authentication type: {}",
            challenge
        )))
    }

    async fn resolve_bearer(&self, params: &str, additional_scope: Option<&str>) -> Result<()> {
        let challenge = parse_challenge(params);
        if challenge.realm.is_empty() {
            return Err(PullError::Auth(
                "no realm specified for token auth challenge".to_string(),
            ));
        }
        url::Url::parse(&challenge.realm)
            .map_err(|e| PullError::Auth(format!("invalid token auth challenge realm: {}", e)))?;

        // The challenge scope wins; the caller's hint fills in for token
        // servers that omit it from the authorization failure.
        let mut scopes: Vec<String> = Vec::new();
        for scope in challenge
            .scope
            .as_deref()
            .into_iter()
            .chain(additional_scope)
        {
            if !scope.is_empty() && !scopes.iter().any(|s| s == scope) {
                scopes.push(scope.to_string());
            }
        }

        self.logger.detail(&format!(
            "Bearer auth challenge: realm={}, service={}",
            challenge.realm, challenge.service
        ));

        let token = self
            .get_token(&challenge.realm, &challenge.service, &scopes)
            .await?;

        if let Ok(mut state) = self.state.lock() {
            if !challenge.service.is_empty() {
                state.service_hostname = Some(challenge.service.clone());
            }
            state.auth_header = Some(format!("Bearer {}", token));
        }
        Ok(())
    }

    /// Fetch a bearer token for the requested scopes, consulting the cache
    /// first. Results of fetches beyond the resolver's default scope set do
    /// not touch the cache.
    async fn get_token(&self, realm: &str, service: &str, scopes: &[String]) -> Result<String> {
        let now = self.clock.now();
        let default_scopes_only = scopes.iter().all(|s| self.default_scopes.contains(s));

        if default_scopes_only {
            if let Ok(state) = self.state.lock() {
                if let Some(cached) = &state.cached {
                    if cached.usable_for(scopes, now) {
                        return Ok(cached.token.clone());
                    }
                    self.logger
                        .warning("cached registry token is no longer valid; requesting a fresh one");
                }
            }
        }

        let refresh_token = match self.state.lock() {
            Ok(state) => state.refresh_token.clone(),
            Err(_) => None,
        };

        let (token, expires_at, new_refresh_token) = match refresh_token {
            Some(refresh_token) => {
                self.fetch_token_oauth(realm, &refresh_token, service, scopes)
                    .await?
            }
            None => self.fetch_token(realm, service, scopes).await?,
        };

        if let Ok(mut state) = self.state.lock() {
            if let Some(refresh) = &new_refresh_token {
                state.refresh_token = Some(refresh.clone());
            }
            if default_scopes_only {
                state.cached = Some(CachedToken {
                    token: token.clone(),
                    expires_at,
                    scopes: scopes.to_vec(),
                });
            }
        }

        Ok(token)
    }

    async fn fetch_token(&self, realm: &str, service: &str, scopes: &[String]) -> Result<(String, DateTime<Utc>, Option<String>)> {
        let mut request = self.client.get(realm);
        if !service.is_empty() {
            request = request.query(&[("service", service)]);
        }
        for scope in scopes {
            request = request.query(&[("scope", scope)]);
        }

        if let Some((username, password)) = self.credentials.basic_pair() {
            request = request
                .query(&[("account", username)])
                .basic_auth(username, Some(password));
        } else if let Some(token) = &self.credentials.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PullError::Network(format!("Failed to request auth token: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PullError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PullError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| PullError::Auth(format!("unable to decode token response: {}", e)))?;

        token_from_response(token_response, self.clock.now())
    }

    /// OAuth2 token exchange, taken when a refresh token is on file
    async fn fetch_token_oauth(
        &self,
        realm: &str,
        refresh_token: &str,
        service: &str,
        scopes: &[String],
    ) -> Result<(String, DateTime<Utc>, Option<String>)> {
        let scope = scopes.join(" ");
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("service", service),
            ("scope", scope.as_str()),
            ("client_id", OAUTH_CLIENT_ID),
        ];

        let response = self
            .client
            .post(realm)
            .form(&form)
            .send()
            .await
            .map_err(|e| PullError::Network(format!("Failed to request auth token: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PullError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PullError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| PullError::Auth(format!("unable to decode token response: {}", e)))?;

        token_from_response(token_response, self.clock.now())
    }

    /// Adopt a Basic authorization header after the registry accepts it.
    /// No token fetch is performed.
    async fn resolve_basic(&self, additional_scope: Option<&str>) -> Result<()> {
        let (username, password) = self.credentials.basic_pair().ok_or_else(|| {
            PullError::Auth("username and password are required for basic authentication".to_string())
        })?;
        let authorization = format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", username, password))
        );

        let mut uri = format!("{}://{}/", self.scheme, self.hostname);
        if let Some(scope) = additional_scope {
            uri = format!("{}?scope={}", uri, scope);
        }

        let response = self
            .client
            .get(&uri)
            .header(AUTHORIZATION, &authorization)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PullError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PullError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        if let Ok(mut state) = self.state.lock() {
            state.auth_header = Some(authorization);
        }
        Ok(())
    }

    /// Acquire an ECR authorization token out of band. The username and
    /// password fields carry the AWS access key pair.
    async fn resolve_ecr(&self) -> Result<()> {
        let (registry_id, zone) = parse_ecr_endpoint(&self.hostname)?;
        let (access_key, secret_key) = self.credentials.basic_pair().ok_or_else(|| {
            PullError::Auth("AWS credentials are required for ECR registries".to_string())
        })?;

        let config = aws_sdk_ecr::Config::builder()
            .behavior_version(aws_sdk_ecr::config::BehaviorVersion::latest())
            .region(aws_sdk_ecr::config::Region::new(zone))
            .credentials_provider(aws_sdk_ecr::config::Credentials::new(
                access_key, secret_key, None, None, "docker-image-puller",
            ))
            .build();
        let ecr = aws_sdk_ecr::Client::from_conf(config);

        let response = ecr
            .get_authorization_token()
            .registry_ids(registry_id)
            .send()
            .await
            .map_err(|e| PullError::Auth(format!("Failed to get ECR authorization token: {}", e)))?;

        let token = response
            .authorization_data()
            .first()
            .and_then(|data| data.authorization_token())
            .ok_or_else(|| {
                PullError::Auth(format!(
                    "Provided ECR repo: {} not accessible with credentials",
                    self.hostname
                ))
            })?;

        if let Ok(mut state) = self.state.lock() {
            state.auth_header = Some(format!("Basic {}", token));
        }
        Ok(())
    }
}
