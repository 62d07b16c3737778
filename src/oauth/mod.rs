//! OAuth token acquisition.
//!
//! [`TokenExchanger`] abstracts the token endpoint so the refresh
//! coordinator can be driven by a scripted fake in tests. The production
//! implementation posts RFC 6749 `application/x-www-form-urlencoded` bodies
//! and supports a two-stage attempt: an internal OAuth helper service first
//! (method `oauth_service`), falling back to the provider's public token
//! endpoint (method `direct_oauth`) only when the helper is unreachable or
//! reports itself down. Errors that could equally come from the provider
//! (rejected grants, rate limits) never trigger the fallback.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::types::RefreshMethod;

/// Longest error-body excerpt carried in error messages.
const ERROR_BODY_EXCERPT: usize = 200;

/// Default token lifetime when the provider omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// A token set returned by the provider.
#[derive(Clone)]
pub struct TokenSet {
    /// The bearer for upstream calls.
    pub access_token: String,
    /// Replacement refresh token, when the provider rotates it.
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires.
    pub expires_in: i64,
    /// Granted scope, when reported.
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

/// OAuth client credential pair.
#[derive(Clone)]
pub struct ClientPair {
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
}

impl std::fmt::Debug for ClientPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPair")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// Parameters for an initial (or re-authorization) exchange.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    /// Client credentials.
    pub client: ClientPair,
    /// Scope to request.
    pub scopes: Option<String>,
    /// Provider token endpoint.
    pub token_url: String,
}

/// Parameters for a refresh-grant renewal.
#[derive(Clone)]
pub struct RefreshRequest {
    /// Client credentials.
    pub client: ClientPair,
    /// The long-lived refresh token.
    pub refresh_token: String,
    /// Provider token endpoint.
    pub token_url: String,
}

impl std::fmt::Debug for RefreshRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshRequest")
            .field("client", &self.client)
            .field("refresh_token", &"[REDACTED]")
            .field("token_url", &self.token_url)
            .finish()
    }
}

/// Typed token-acquisition failures.
#[derive(Debug, Clone, Error)]
pub enum OauthError {
    /// The provider rejected the refresh token (`invalid_grant`).
    #[error("refresh token rejected")]
    InvalidRefreshToken,
    /// The provider rejected the client credentials.
    #[error("client credentials rejected")]
    InvalidClient,
    /// Transport-level failure reaching the endpoint.
    #[error("network error: {0}")]
    Network(String),
    /// The provider throttled the request.
    #[error("provider rate limit")]
    ProviderRateLimit,
    /// The endpoint reported itself unavailable (5xx).
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// Anything else.
    #[error("token endpoint error: {0}")]
    Unknown(String),
}

impl OauthError {
    /// Stable kind string for audit entries.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::InvalidRefreshToken => "invalid_refresh_token",
            Self::InvalidClient => "invalid_client",
            Self::Network(_) => "network_error",
            Self::ProviderRateLimit => "provider_rate_limit",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Whether the failure class justifies retrying (and, on the helper
    /// path, falling back to the provider directly).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::ServiceUnavailable(_))
    }
}

/// Token acquisition seam between the refresh coordinator and the outside
/// world. The production implementation is [`HttpExchanger`].
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    /// Acquire a first token set for a client pair.
    ///
    /// # Errors
    ///
    /// Returns a typed [`OauthError`]; only transient kinds are worth
    /// retrying.
    async fn exchange(
        &self,
        request: &ExchangeRequest,
    ) -> Result<(TokenSet, RefreshMethod), OauthError>;

    /// Renew an access token with a refresh grant.
    ///
    /// # Errors
    ///
    /// Returns a typed [`OauthError`]; only transient kinds are worth
    /// retrying.
    async fn refresh(
        &self,
        request: &RefreshRequest,
    ) -> Result<(TokenSet, RefreshMethod), OauthError>;
}

/// Wire shape of a token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    #[serde(default)]
    scope: Option<String>,
}

fn default_expires_in() -> i64 {
    DEFAULT_EXPIRES_IN_SECS
}

/// Wire shape of an RFC 6749 error response.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
}

/// Production exchanger posting form bodies over HTTP.
pub struct HttpExchanger {
    http: reqwest::Client,
    /// Internal OAuth helper endpoint. `None` forces direct calls.
    service_url: Option<String>,
}

impl HttpExchanger {
    /// Build an exchanger with a per-attempt timeout.
    ///
    /// # Errors
    ///
    /// Returns [`OauthError::Network`] when the HTTP client cannot be
    /// constructed.
    pub fn new(service_url: Option<String>, timeout: Duration) -> Result<Self, OauthError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OauthError::Network(e.to_string()))?;
        Ok(Self { http, service_url })
    }

    /// Post a token-grant form, trying the helper service first when one is
    /// configured. The provider endpoint is forwarded to the helper as a
    /// `token_url` form field so it knows where to proxy.
    async fn post_with_fallback(
        &self,
        token_url: &str,
        form: &[(&str, &str)],
    ) -> Result<(TokenSet, RefreshMethod), OauthError> {
        if let Some(service_url) = self.service_url.as_deref() {
            let mut service_form = form.to_vec();
            service_form.push(("token_url", token_url));
            match self.post_form(service_url, &service_form).await {
                Ok(token) => return Ok((token, RefreshMethod::OauthService)),
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        err = %e,
                        "oauth helper unavailable, falling back to direct endpoint"
                    );
                }
                // Errors the provider could equally have produced must not
                // cross methods.
                Err(e) => return Err(e),
            }
        }

        let token = self.post_form(token_url, form).await?;
        Ok((token, RefreshMethod::DirectOauth))
    }

    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<TokenSet, OauthError> {
        let response = self
            .http
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| OauthError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OauthError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_error(status, &body));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| OauthError::Unknown(format!("malformed token response: {e}")))?;
        Ok(TokenSet {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_in: parsed.expires_in,
            scope: parsed.scope,
        })
    }
}

#[async_trait]
impl TokenExchanger for HttpExchanger {
    async fn exchange(
        &self,
        request: &ExchangeRequest,
    ) -> Result<(TokenSet, RefreshMethod), OauthError> {
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", request.client.client_id.as_str()),
            ("client_secret", request.client.client_secret.as_str()),
        ];
        if let Some(scopes) = request.scopes.as_deref() {
            form.push(("scope", scopes));
        }
        self.post_with_fallback(&request.token_url, &form).await
    }

    async fn refresh(
        &self,
        request: &RefreshRequest,
    ) -> Result<(TokenSet, RefreshMethod), OauthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", request.refresh_token.as_str()),
            ("client_id", request.client.client_id.as_str()),
            ("client_secret", request.client.client_secret.as_str()),
        ];
        self.post_with_fallback(&request.token_url, &form).await
    }
}

/// Map a non-2xx token endpoint response to a typed error.
///
/// The RFC 6749 `error` field takes precedence over the status code so a
/// 400 `invalid_grant` and a 401 `invalid_client` both land on the right
/// kind regardless of provider quirks.
fn classify_error(status: StatusCode, body: &str) -> OauthError {
    let error_code = serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|e| e.error);

    match error_code.as_deref() {
        Some("invalid_grant") => return OauthError::InvalidRefreshToken,
        Some("invalid_client") => return OauthError::InvalidClient,
        _ => {}
    }

    // Truncate the body so error messages never leak full payloads.
    let excerpt: String = body.chars().take(ERROR_BODY_EXCERPT).collect();
    if status == StatusCode::TOO_MANY_REQUESTS {
        OauthError::ProviderRateLimit
    } else if status.is_server_error() {
        OauthError::ServiceUnavailable(format!("HTTP {status}: {excerpt}"))
    } else {
        OauthError::Unknown(format!("HTTP {status}: {excerpt}"))
    }
}
