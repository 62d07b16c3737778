//! Per-request authentication pipeline.
//!
//! The [`AuthGate`] sits between the tool-call transport and the adapters.
//! Full auth resolves a live bearer (cache first, stored token second,
//! refresh last) and attaches `{instance_id, user_id, bearer}` to the
//! request; lightweight auth only proves the instance exists and its
//! service type is active. Checks short-circuit on the first failure with
//! a distinct error kind, never by catching.
//!
//! Usage bookkeeping (`last_used_at`, `usage_count`) is fire-and-forget:
//! it runs in a spawned task and its failures are logged and dropped, so
//! the request path never blocks on it.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{CacheRecord, CredentialCache};
use crate::refresh::RefreshCoordinator;
use crate::store::{Store, StoreError};
use crate::types::{AuthKind, GatewayError, InstanceStatus, OauthStatus};

/// Synthetic cache TTL for api-key bearers, which never expire upstream.
/// Bounded so reconciliation re-reads the store at least hourly.
const API_KEY_CACHE_TTL_SECS: i64 = 3600;

/// Context attached to a request after auth.
#[derive(Clone)]
pub struct RequestAuth {
    /// The validated instance.
    pub instance_id: Uuid,
    /// Its owner.
    pub user_id: Uuid,
    /// Present only after full auth.
    pub bearer: Option<String>,
}

impl std::fmt::Debug for RequestAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestAuth")
            .field("instance_id", &self.instance_id)
            .field("user_id", &self.user_id)
            .field("bearer", &self.bearer.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Lexical instance-id check: total and deterministic, shared with clients.
/// Canonical shape is the 36-character hyphenated UUID.
///
/// # Errors
///
/// Returns `InvalidInstanceId` for anything else.
pub fn parse_instance_id(raw: &str) -> Result<Uuid, GatewayError> {
    if raw.len() != 36 {
        return Err(GatewayError::InvalidInstanceId(raw.to_owned()));
    }
    Uuid::parse_str(raw).map_err(|_| GatewayError::InvalidInstanceId(raw.to_owned()))
}

/// Request middleware resolving instances to credentials.
pub struct AuthGate {
    store: Store,
    cache: Arc<CredentialCache>,
    coordinator: Arc<RefreshCoordinator>,
}

impl AuthGate {
    /// Build a gate over the given store, cache, and coordinator.
    pub fn new(
        store: Store,
        cache: Arc<CredentialCache>,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            store,
            cache,
            coordinator,
        }
    }

    /// Full auth for tool-call dispatch: validate, resolve a live bearer,
    /// attach the request context.
    ///
    /// # Errors
    ///
    /// One kind per failed check: `invalid_instance_id`,
    /// `instance_not_found`, `service_unavailable`, `instance_inactive`,
    /// `instance_expired`, `invalid_credentials_shape`,
    /// `reauthentication_required`, `oauth_transient_failure`.
    pub async fn authorize_full(&self, raw_id: &str) -> Result<RequestAuth, GatewayError> {
        let instance_id = parse_instance_id(raw_id)?;

        // Cache hit: no datastore reads on the hot path; the usage bump
        // happens off to the side.
        if let Some(record) = self.cache.get(&instance_id) {
            self.spawn_usage_touch(instance_id);
            return Ok(RequestAuth {
                instance_id,
                user_id: record.user_id,
                bearer: Some(record.bearer),
            });
        }

        let instance = self
            .store
            .get_instance(instance_id)
            .await
            .map_err(StoreError::into_gateway)?;
        let service = self
            .store
            .get_service_type(instance.service_type_id)
            .await
            .map_err(|e| GatewayError::ServiceUnavailable(e.to_string()))?;
        if !service.is_active {
            return Err(GatewayError::ServiceUnavailable(format!(
                "service type {} is deactivated",
                service.short_name
            )));
        }

        match instance.status {
            InstanceStatus::Active => {}
            InstanceStatus::Inactive => return Err(GatewayError::InstanceInactive),
            InstanceStatus::Expired => return Err(GatewayError::InstanceExpired),
        }
        // An instance expiring exactly now is already expired.
        if let Some(expires_at) = instance.expires_at {
            if expires_at <= Utc::now() {
                return Err(GatewayError::InstanceExpired);
            }
        }

        let bearer = match service.auth_kind {
            AuthKind::ApiKey => {
                let creds = self
                    .store
                    .get_credentials(instance_id)
                    .await
                    .map_err(StoreError::into_gateway)?;
                let api_key = creds.api_key.clone().ok_or_else(|| {
                    GatewayError::InvalidCredentialsShape(
                        "api-key instance has no key on record".to_owned(),
                    )
                })?;
                let expires_at = Utc::now() + chrono::Duration::seconds(API_KEY_CACHE_TTL_SECS);
                let mut record =
                    CacheRecord::new(api_key.clone(), expires_at, instance.user_id);
                record.status = Some(instance.status);
                self.cache.put(instance_id, record);
                api_key
            }
            AuthKind::Oauth => {
                let creds = self
                    .store
                    .get_credentials(instance_id)
                    .await
                    .map_err(StoreError::into_gateway)?;
                if creds.client_id.is_none() || creds.client_secret.is_none() {
                    return Err(GatewayError::InvalidCredentialsShape(
                        "OAuth instance is missing its client pair".to_owned(),
                    ));
                }
                match creds.oauth_status {
                    OauthStatus::Completed => {}
                    OauthStatus::Pending | OauthStatus::Failed => {
                        return Err(GatewayError::ReauthenticationRequired)
                    }
                    OauthStatus::Expired => return Err(GatewayError::InstanceExpired),
                }
                // Adoption of a live stored token and the refresh state
                // machine both live in the coordinator.
                self.coordinator.resolve_bearer(&instance).await?.token
            }
        };

        self.spawn_usage_touch(instance_id);
        Ok(RequestAuth {
            instance_id,
            user_id: instance.user_id,
            bearer: Some(bearer),
        })
    }

    /// Lightweight auth for non-critical endpoints: proves existence and
    /// service activeness, attaches no bearer, skips token freshness
    /// entirely.
    ///
    /// # Errors
    ///
    /// Returns `invalid_instance_id`, `instance_not_found`, or
    /// `service_unavailable`.
    pub async fn authorize_light(&self, raw_id: &str) -> Result<RequestAuth, GatewayError> {
        let instance_id = parse_instance_id(raw_id)?;
        let instance = self
            .store
            .get_instance(instance_id)
            .await
            .map_err(StoreError::into_gateway)?;
        let service = self
            .store
            .get_service_type(instance.service_type_id)
            .await
            .map_err(|e| GatewayError::ServiceUnavailable(e.to_string()))?;
        if !service.is_active {
            return Err(GatewayError::ServiceUnavailable(format!(
                "service type {} is deactivated",
                service.short_name
            )));
        }
        Ok(RequestAuth {
            instance_id,
            user_id: instance.user_id,
            bearer: None,
        })
    }

    /// Best-effort usage bookkeeping off the request path.
    fn spawn_usage_touch(&self, instance_id: Uuid) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.touch_usage(instance_id).await {
                debug!(instance_id = %instance_id, err = %e, "usage tracking failed");
            }
        });
    }
}
