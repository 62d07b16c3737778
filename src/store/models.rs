//! Row models and their SQLite codecs.
//!
//! Ids are stored as hyphenated lowercase UUID TEXT; enums as their
//! `as_str` form; JSON documents (`features_json`, `metadata_json`) are
//! closed-schema structs parsed with unknown fields ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::types::{
    AuditOperation, AuditStatus, AuthKind, InstanceStatus, OauthStatus, PlanKind, RefreshMethod,
};

use super::StoreError;

/// Parse a stored UUID TEXT column.
pub(super) fn parse_uuid(field: &'static str, value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value)
        .map_err(|_| StoreError::IntegrityViolation(format!("malformed {field} uuid: {value}")))
}

// ---------------------------------------------------------------------------
// Users and plans
// ---------------------------------------------------------------------------

/// A user owning instances. The credential plane treats users as opaque:
/// identity and authentication live elsewhere.
#[derive(Debug, Clone)]
pub struct UserRow {
    /// Stable id.
    pub id: Uuid,
    /// Unique email.
    pub email: String,
    /// Display name.
    pub name: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl UserRow {
    pub(super) fn from_row(row: &SqliteRow) -> Result<Self, StoreError> {
        let id: String = row.try_get("id")?;
        Ok(Self {
            id: parse_uuid("user.id", &id)?,
            email: row.try_get("email")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Plan feature flags. Stored as `features_json`; the schema is closed —
/// unknown keys are ignored at read, never round-tripped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanFeatures {
    /// Whether the plan may call the management API.
    pub api_access: bool,
    /// Whether refreshes for this plan skip the backoff queue.
    pub priority_refresh: bool,
    /// Optional daily request ceiling.
    pub max_requests_per_day: Option<i64>,
}

/// A user's plan row. One per user, materialized as `free` at user creation.
#[derive(Debug, Clone)]
pub struct UserPlanRow {
    /// Stable id.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Plan tier.
    pub kind: PlanKind,
    /// Maximum concurrently active completed instances. `None` = unlimited.
    pub max_instances: Option<i64>,
    /// Lifetime instances created by this user.
    pub total_created: i64,
    /// Feature flags.
    pub features: PlanFeatures,
    /// Optional plan expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl UserPlanRow {
    pub(super) fn from_row(row: &SqliteRow) -> Result<Self, StoreError> {
        let id: String = row.try_get("id")?;
        let user_id: String = row.try_get("user_id")?;
        let kind: String = row.try_get("kind")?;
        let features_json: String = row.try_get("features_json")?;
        Ok(Self {
            id: parse_uuid("user_plan.id", &id)?,
            user_id: parse_uuid("user_plan.user_id", &user_id)?,
            kind: PlanKind::parse(&kind)?,
            max_instances: row.try_get("max_instances")?,
            total_created: row.try_get("total_created")?,
            features: serde_json::from_str(&features_json)?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A registry entry describing one integration.
#[derive(Debug, Clone)]
pub struct ServiceTypeRow {
    /// Stable id.
    pub id: Uuid,
    /// Unique short name (e.g. "gmail").
    pub short_name: String,
    /// Human-facing name.
    pub display_name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Optional icon URL.
    pub icon_url: Option<String>,
    /// Legacy per-integration port. Unused by the credential plane.
    pub port: Option<i64>,
    /// How instances of this type authenticate.
    pub auth_kind: AuthKind,
    /// Whether new tool calls may target this type.
    pub is_active: bool,
    /// Lifetime instances created for this type.
    pub total_created: i64,
    /// Instances currently in `active` status.
    pub active_count: i64,
    /// Provider token endpoint (exchange and refresh).
    pub token_url: Option<String>,
    /// Provider authorization URL for the user-facing flow.
    pub authorize_url: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl ServiceTypeRow {
    pub(super) fn from_row(row: &SqliteRow) -> Result<Self, StoreError> {
        let id: String = row.try_get("id")?;
        let auth_kind: String = row.try_get("auth_kind")?;
        Ok(Self {
            id: parse_uuid("service_type.id", &id)?,
            short_name: row.try_get("short_name")?,
            display_name: row.try_get("display_name")?,
            description: row.try_get("description")?,
            icon_url: row.try_get("icon_url")?,
            port: row.try_get("port")?,
            auth_kind: AuthKind::parse(&auth_kind)?,
            is_active: row.try_get("is_active")?,
            total_created: row.try_get("total_created")?,
            active_count: row.try_get("active_count")?,
            token_url: row.try_get("token_url")?,
            authorize_url: row.try_get("authorize_url")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Seed for a new registry entry.
#[derive(Debug, Clone)]
pub struct NewServiceType {
    /// Unique short name.
    pub short_name: String,
    /// Human-facing name.
    pub display_name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Optional icon URL.
    pub icon_url: Option<String>,
    /// Legacy per-integration port.
    pub port: Option<i64>,
    /// Auth kind.
    pub auth_kind: AuthKind,
    /// Provider token endpoint.
    pub token_url: Option<String>,
    /// Provider authorization URL.
    pub authorize_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

/// A user's provisioned binding to one service type.
#[derive(Debug, Clone)]
pub struct InstanceRow {
    /// Stable id.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Bound service type.
    pub service_type_id: Uuid,
    /// User-chosen name.
    pub custom_name: String,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// OAuth flow status. Meaningful for OAuth service types; api-key
    /// instances are `completed` at creation.
    pub oauth_status: OauthStatus,
    /// Optional expiration. `None` = never expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// Last tool-call usage.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Tool-call usage counter.
    pub usage_count: i64,
    /// How many times the instance has been renewed.
    pub renewed_count: i64,
    /// Last renewal timestamp.
    pub last_renewed_at: Option<DateTime<Utc>>,
    /// Last time the credentials child row changed. Drives cache
    /// reconciliation.
    pub credentials_updated_at: Option<DateTime<Utc>>,
    /// Optimistic-lock version counter.
    pub version: i64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl InstanceRow {
    pub(super) fn from_row(row: &SqliteRow) -> Result<Self, StoreError> {
        let id: String = row.try_get("id")?;
        let user_id: String = row.try_get("user_id")?;
        let service_type_id: String = row.try_get("service_type_id")?;
        let status: String = row.try_get("status")?;
        let oauth_status: String = row.try_get("oauth_status")?;
        Ok(Self {
            id: parse_uuid("instance.id", &id)?,
            user_id: parse_uuid("instance.user_id", &user_id)?,
            service_type_id: parse_uuid("instance.service_type_id", &service_type_id)?,
            custom_name: row.try_get("custom_name")?,
            status: InstanceStatus::parse(&status)?,
            oauth_status: OauthStatus::parse(&oauth_status)?,
            expires_at: row.try_get("expires_at")?,
            last_used_at: row.try_get("last_used_at")?,
            usage_count: row.try_get("usage_count")?,
            renewed_count: row.try_get("renewed_count")?,
            last_renewed_at: row.try_get("last_renewed_at")?,
            credentials_updated_at: row.try_get("credentials_updated_at")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Seed for a new instance row.
#[derive(Debug, Clone)]
pub struct NewInstance {
    /// Owning user.
    pub user_id: Uuid,
    /// Bound service type.
    pub service_type_id: Uuid,
    /// User-chosen name.
    pub custom_name: String,
    /// Optional expiration.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Selective update for instance fields. `None` leaves a field untouched;
/// the nested `Option` on `expires_at` distinguishes "clear" from "keep".
#[derive(Debug, Clone, Default)]
pub struct InstancePatch {
    /// New custom name.
    pub custom_name: Option<String>,
    /// New lifecycle status.
    pub status: Option<InstanceStatus>,
    /// New OAuth status.
    pub oauth_status: Option<OauthStatus>,
    /// New expiration (`Some(None)` clears it).
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

/// Filters for instance listings.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    /// Restrict to one lifecycle status.
    pub status: Option<InstanceStatus>,
    /// Restrict to one OAuth status.
    pub oauth_status: Option<OauthStatus>,
    /// Restrict to one service type.
    pub service_type_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// One-to-one child of an instance carrying secret material.
///
/// Shape invariant: either `api_key` is set and all OAuth columns are null,
/// or `client_id` and `client_secret` are both set (tokens only alongside
/// the client pair).
#[derive(Clone)]
pub struct CredentialsRow {
    /// Stable id.
    pub id: Uuid,
    /// Parent instance.
    pub instance_id: Uuid,
    /// Static API key, for `api_key` service types.
    pub api_key: Option<String>,
    /// OAuth client id.
    pub client_id: Option<String>,
    /// OAuth client secret.
    pub client_secret: Option<String>,
    /// Current access token.
    pub access_token: Option<String>,
    /// Long-lived refresh token.
    pub refresh_token: Option<String>,
    /// Access token hard expiry.
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Granted scope.
    pub token_scope: Option<String>,
    /// OAuth flow status, mirrored on the instance row.
    pub oauth_status: OauthStatus,
    /// When the flow completed (null only while `pending`).
    pub oauth_completed_at: Option<DateTime<Utc>>,
    /// Pending authorization URL handed to the user.
    pub oauth_authorization_url: Option<String>,
    /// CSRF state for the pending flow.
    pub oauth_state: Option<String>,
    /// Optimistic-lock version counter.
    pub version: i64,
    /// Last secret-material change.
    pub last_modified: DateTime<Utc>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for CredentialsRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsRow")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("token_expires_at", &self.token_expires_at)
            .field("token_scope", &self.token_scope)
            .field("oauth_status", &self.oauth_status)
            .field("version", &self.version)
            .finish()
    }
}

impl CredentialsRow {
    pub(super) fn from_row(row: &SqliteRow) -> Result<Self, StoreError> {
        let id: String = row.try_get("id")?;
        let instance_id: String = row.try_get("instance_id")?;
        let oauth_status: String = row.try_get("oauth_status")?;
        Ok(Self {
            id: parse_uuid("credentials.id", &id)?,
            instance_id: parse_uuid("credentials.instance_id", &instance_id)?,
            api_key: row.try_get("api_key")?,
            client_id: row.try_get("client_id")?,
            client_secret: row.try_get("client_secret")?,
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
            token_expires_at: row.try_get("token_expires_at")?,
            token_scope: row.try_get("token_scope")?,
            oauth_status: OauthStatus::parse(&oauth_status)?,
            oauth_completed_at: row.try_get("oauth_completed_at")?,
            oauth_authorization_url: row.try_get("oauth_authorization_url")?,
            oauth_state: row.try_get("oauth_state")?,
            version: row.try_get("version")?,
            last_modified: row.try_get("last_modified")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Whether the stored access token is live at `now` (strict: a token
    /// expiring exactly at `now` is dead).
    pub fn token_live_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.access_token, self.token_expires_at) {
            (Some(_), Some(expires)) => expires > now,
            _ => false,
        }
    }
}

/// Secret material supplied at instance creation.
#[derive(Clone, Default)]
pub struct CredentialsSeed {
    /// Static API key, for `api_key` service types.
    pub api_key: Option<String>,
    /// OAuth client id.
    pub client_id: Option<String>,
    /// OAuth client secret.
    pub client_secret: Option<String>,
    /// Scope to request during the authorization flow.
    pub token_scope: Option<String>,
    /// Authorization URL handed to the user, for OAuth creates.
    pub oauth_authorization_url: Option<String>,
    /// CSRF state for the pending flow, for OAuth creates.
    pub oauth_state: Option<String>,
}

impl std::fmt::Debug for CredentialsSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsSeed")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("token_scope", &self.token_scope)
            .finish()
    }
}

impl CredentialsSeed {
    /// Validate the credential-shape invariant application-side, before the
    /// schema CHECK gets a chance to reject the insert.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IntegrityViolation`] when neither or both
    /// credential shapes are present.
    pub fn validate_shape(&self) -> Result<(), StoreError> {
        let has_key = self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty());
        let has_pair = self.client_id.as_deref().is_some_and(|c| !c.trim().is_empty())
            && self
                .client_secret
                .as_deref()
                .is_some_and(|c| !c.trim().is_empty());
        match (has_key, has_pair) {
            (true, false) => Ok(()),
            (false, true) => Ok(()),
            (true, true) => Err(StoreError::IntegrityViolation(
                "credentials carry both an api key and an OAuth client pair".to_owned(),
            )),
            (false, false) => Err(StoreError::IntegrityViolation(
                "credentials carry neither an api key nor a complete OAuth client pair"
                    .to_owned(),
            )),
        }
    }

    /// Whether this seed is the api-key shape.
    pub fn is_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

/// Token fields written back after a successful exchange or refresh.
#[derive(Clone)]
pub struct TokenWrite {
    /// New access token.
    pub access_token: String,
    /// Replacement refresh token, if the provider rotated it.
    pub refresh_token: Option<String>,
    /// New hard expiry.
    pub token_expires_at: DateTime<Utc>,
    /// Granted scope, if reported.
    pub token_scope: Option<String>,
}

impl std::fmt::Debug for TokenWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenWrite")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("token_expires_at", &self.token_expires_at)
            .field("token_scope", &self.token_scope)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

/// Structured audit metadata. Closed schema; unknown keys are dropped at
/// read rather than round-tripped as opaque blobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditMetadata {
    /// Wall-clock duration of the token exchange, in milliseconds.
    pub response_time_ms: Option<i64>,
    /// Which bounded-retry attempt produced this entry (1-based).
    pub attempt: Option<u32>,
    /// Free-form origin tag (e.g. "auth_pipeline", "maintenance").
    pub source: Option<String>,
}

/// A new audit entry to append.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    /// Instance the operation targeted.
    pub instance_id: Uuid,
    /// Owner, when known.
    pub user_id: Option<Uuid>,
    /// Operation tag.
    pub operation: AuditOperation,
    /// Outcome.
    pub status: AuditStatus,
    /// Acquisition path, for token operations.
    pub method: Option<RefreshMethod>,
    /// Error kind string, for failures.
    pub error_kind: Option<String>,
    /// Error message, for failures.
    pub error_message: Option<String>,
    /// Structured metadata.
    pub metadata: AuditMetadata,
}

/// A stored audit entry.
#[derive(Debug, Clone)]
pub struct AuditEntryRow {
    /// Append-order id.
    pub id: i64,
    /// Instance the operation targeted.
    pub instance_id: Uuid,
    /// Owner, when known.
    pub user_id: Option<Uuid>,
    /// Operation tag.
    pub operation: AuditOperation,
    /// Outcome.
    pub status: AuditStatus,
    /// Acquisition path.
    pub method: Option<RefreshMethod>,
    /// Error kind string.
    pub error_kind: Option<String>,
    /// Error message.
    pub error_message: Option<String>,
    /// Structured metadata.
    pub metadata: AuditMetadata,
    /// Append timestamp.
    pub created_at: DateTime<Utc>,
}

impl AuditEntryRow {
    pub(super) fn from_row(row: &SqliteRow) -> Result<Self, StoreError> {
        let instance_id: String = row.try_get("instance_id")?;
        let user_id: Option<String> = row.try_get("user_id")?;
        let operation: String = row.try_get("operation")?;
        let status: String = row.try_get("status")?;
        let method: Option<String> = row.try_get("method")?;
        let metadata_json: String = row.try_get("metadata_json")?;
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: parse_uuid("audit.instance_id", &instance_id)?,
            user_id: user_id
                .map(|u| parse_uuid("audit.user_id", &u))
                .transpose()?,
            operation: AuditOperation::parse(&operation)?,
            status: AuditStatus::parse(&status)?,
            method: method.map(|m| RefreshMethod::parse(&m)).transpose()?,
            error_kind: row.try_get("error_kind")?,
            error_message: row.try_get("error_message")?,
            metadata: serde_json::from_str(&metadata_json)?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Filters for audit queries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Restrict to one operation tag.
    pub operation: Option<AuditOperation>,
    /// Restrict to one outcome.
    pub status: Option<AuditStatus>,
    /// Cap the number of rows returned (newest first).
    pub limit: Option<u32>,
}

/// One group in an audit aggregation.
#[derive(Debug, Clone)]
pub struct AuditAggregateRow {
    /// Operation tag.
    pub operation: AuditOperation,
    /// Outcome.
    pub status: AuditStatus,
    /// Entries in the group.
    pub count: i64,
    /// Mean recorded exchange duration across the group, when present.
    pub avg_response_time_ms: Option<f64>,
}
