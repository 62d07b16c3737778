//! Core types shared across the credential plane.
//!
//! Status enums are stored as lowercase TEXT in SQLite; each carries an
//! `as_str`/`parse` pair so the store layer never round-trips through serde.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when a TEXT column holds a value outside the closed enum set.
#[derive(Debug, Error)]
#[error("invalid {field} value: {value}")]
pub struct InvalidEnumValue {
    /// Column or field name that failed to parse.
    pub field: &'static str,
    /// The offending stored value.
    pub value: String,
}

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Visible to the auth pipeline and counted against the plan quota.
    Active,
    /// Paused by the user; tokens survive for re-activation.
    Inactive,
    /// Past its expiration timestamp or explicitly expired.
    Expired,
}

impl InstanceStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Expired => "expired",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, InvalidEnumValue> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "expired" => Ok(Self::Expired),
            other => Err(InvalidEnumValue {
                field: "status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Credential-freshness state for an instance's OAuth flow.
///
/// Api-key instances are `completed` on creation; there is no exchange to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OauthStatus {
    /// Authorization started but tokens not yet acquired.
    Pending,
    /// Tokens acquired; the instance counts against the active quota.
    Completed,
    /// Refresh token rejected or flow abandoned; re-authorization required.
    Failed,
    /// Token past hard expiry with no usable refresh token.
    Expired,
}

impl OauthStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, InvalidEnumValue> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(InvalidEnumValue {
                field: "oauth_status",
                value: other.to_owned(),
            }),
        }
    }
}

/// How a service type authenticates upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    /// Static API key supplied at instance creation.
    ApiKey,
    /// OAuth 2.0 client pair plus access/refresh tokens.
    Oauth,
}

impl AuthKind {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Oauth => "oauth",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised auth kind.
    pub fn parse(s: &str) -> Result<Self, InvalidEnumValue> {
        match s {
            "api_key" => Ok(Self::ApiKey),
            "oauth" => Ok(Self::Oauth),
            other => Err(InvalidEnumValue {
                field: "auth_kind",
                value: other.to_owned(),
            }),
        }
    }
}

/// Billing plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanKind {
    /// Default tier with a bounded active-instance quota.
    Free,
    /// Unlimited concurrently active instances.
    Pro,
}

impl PlanKind {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised plan kind.
    pub fn parse(s: &str) -> Result<Self, InvalidEnumValue> {
        match s {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            other => Err(InvalidEnumValue {
                field: "plan_kind",
                value: other.to_owned(),
            }),
        }
    }
}

/// Which path acquired a token: the internal OAuth helper service or the
/// provider's public endpoint directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMethod {
    /// Internal OAuth helper service.
    OauthService,
    /// Provider's public token endpoint.
    DirectOauth,
}

impl RefreshMethod {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OauthService => "oauth_service",
            Self::DirectOauth => "direct_oauth",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised method.
    pub fn parse(s: &str) -> Result<Self, InvalidEnumValue> {
        match s {
            "oauth_service" => Ok(Self::OauthService),
            "direct_oauth" => Ok(Self::DirectOauth),
            other => Err(InvalidEnumValue {
                field: "method",
                value: other.to_owned(),
            }),
        }
    }
}

/// Outcome recorded on an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// The token operation completed.
    Success,
    /// The token operation failed.
    Failure,
    /// The operation was started but not yet resolved.
    Pending,
}

impl AuditStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Pending => "pending",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, InvalidEnumValue> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "pending" => Ok(Self::Pending),
            other => Err(InvalidEnumValue {
                field: "audit_status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Token operation tag recorded on an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    /// First token acquisition completing an authorization flow.
    InitialExchange,
    /// Renewal of an access token via refresh token.
    Refresh,
    /// Adoption of a still-valid stored token into the cache.
    TokenAdopt,
    /// User-driven restart of a failed authorization flow.
    Reauthorization,
}

impl AuditOperation {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitialExchange => "initial_exchange",
            Self::Refresh => "refresh",
            Self::TokenAdopt => "token_adopt",
            Self::Reauthorization => "reauthorization",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised operation.
    pub fn parse(s: &str) -> Result<Self, InvalidEnumValue> {
        match s {
            "initial_exchange" => Ok(Self::InitialExchange),
            "refresh" => Ok(Self::Refresh),
            "token_adopt" => Ok(Self::TokenAdopt),
            "reauthorization" => Ok(Self::Reauthorization),
            other => Err(InvalidEnumValue {
                field: "operation",
                value: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway error taxonomy
// ---------------------------------------------------------------------------

/// Uniform error envelope returned to the tool-call transport.
///
/// `code` is drawn from the closed taxonomy in [`GatewayError`]; the specific
/// code lets the UI layer decide between "retry", "renew instance", and
/// "reconnect account".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// HTTP-shaped status the transport should answer with.
    pub status: u16,
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Structured details for codes that carry them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Every failure the auth pipeline and instance manager can surface.
///
/// Operations short-circuit on the first failure instead of catching; the
/// variant determines the caller's recovery path.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The path parameter fails the lexical instance-id check.
    #[error("invalid instance id: {0}")]
    InvalidInstanceId(String),
    /// No such instance for the presenter.
    #[error("instance not found")]
    InstanceNotFound,
    /// Service type deactivated or transient provider outage.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// The user paused this instance.
    #[error("instance is inactive")]
    InstanceInactive,
    /// Past `expires_at` or explicitly expired.
    #[error("instance is expired")]
    InstanceExpired,
    /// Stored credentials violate the credential-shape invariant.
    #[error("stored credentials are malformed: {0}")]
    InvalidCredentialsShape(String),
    /// Refresh token rejected; the user must restart the OAuth flow.
    #[error("reauthentication required")]
    ReauthenticationRequired,
    /// Network failure or provider 5xx after both refresh methods.
    #[error("oauth transient failure: {0}")]
    OauthTransientFailure(String),
    /// Creating the instance would exceed the plan quota.
    #[error("active instance limit reached ({current}/{max})")]
    ActiveLimitReached {
        /// Instances currently counted against the quota.
        current: u32,
        /// The plan's maximum concurrently active instances.
        max: u32,
    },
    /// Optimistic-lock version mismatch during a write.
    #[error("version conflict")]
    Conflict,
    /// Uncategorised internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInstanceId(_) => "invalid_instance_id",
            Self::InstanceNotFound => "instance_not_found",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::InstanceInactive => "instance_inactive",
            Self::InstanceExpired => "instance_expired",
            Self::InvalidCredentialsShape(_) => "invalid_credentials_shape",
            Self::ReauthenticationRequired => "reauthentication_required",
            Self::OauthTransientFailure(_) => "oauth_transient_failure",
            Self::ActiveLimitReached { .. } => "active_limit_reached",
            Self::Conflict => "conflict",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP-shaped status for the error envelope.
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidInstanceId(_) => 400,
            Self::InstanceNotFound => 404,
            Self::ServiceUnavailable(_) => 503,
            Self::InstanceInactive => 403,
            Self::InstanceExpired => 410,
            Self::InvalidCredentialsShape(_) => 500,
            Self::ReauthenticationRequired => 401,
            Self::OauthTransientFailure(_) => 502,
            Self::ActiveLimitReached { .. } => 403,
            Self::Conflict => 409,
            Self::Internal(_) => 500,
        }
    }

    /// Render the uniform error envelope for the transport layer.
    pub fn envelope(&self) -> ErrorEnvelope {
        let details = match self {
            Self::ActiveLimitReached { current, max } => Some(serde_json::json!({
                "currentCount": current,
                "maxInstances": max,
            })),
            _ => None,
        };
        ErrorEnvelope {
            status: self.status(),
            code: self.code().to_owned(),
            message: self.to_string(),
            details,
        }
    }
}
