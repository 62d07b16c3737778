//! Instance lifecycle management.
//!
//! CRUD and state transitions under plan quotas. The quota check itself
//! lives inside the store's create transaction; this layer validates the
//! registry entry, prepares the authorization flow for OAuth instances,
//! and keeps the credential cache in step with lifecycle changes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{CachePatch, CredentialCache};
use crate::oauth::{ClientPair, ExchangeRequest, TokenExchanger};
use crate::store::models::{
    CredentialsSeed, InstanceFilter, InstancePatch, InstanceRow, NewAuditEntry, NewInstance,
    ServiceTypeRow, TokenWrite,
};
use crate::store::{Store, StoreError};
use crate::types::{AuditOperation, AuditStatus, AuthKind, GatewayError, InstanceStatus};

/// Length of the generated CSRF state parameter.
const OAUTH_STATE_LEN: usize = 32;

/// Result of a create: the instance, plus the authorization URL the user
/// must visit when the service type is OAuth.
#[derive(Debug, Clone)]
pub struct CreatedInstance {
    /// The stored instance row.
    pub instance: InstanceRow,
    /// Present for OAuth instances; the user completes the flow here.
    pub authorization_url: Option<String>,
}

/// Manages instance CRUD and state transitions.
pub struct InstanceManager {
    store: Store,
    cache: Arc<CredentialCache>,
    exchanger: Arc<dyn TokenExchanger>,
}

impl InstanceManager {
    /// Build a manager over the given store, cache, and exchanger.
    pub fn new(
        store: Store,
        cache: Arc<CredentialCache>,
        exchanger: Arc<dyn TokenExchanger>,
    ) -> Self {
        Self {
            store,
            cache,
            exchanger,
        }
    }

    /// Create an instance under the owner's plan quota.
    ///
    /// Api-key instances complete immediately. OAuth instances start
    /// `pending` with a generated authorization URL and CSRF state; they
    /// count against the quota only once the flow completes.
    ///
    /// # Errors
    ///
    /// Returns `ActiveLimitReached` with the current count when the quota
    /// is exhausted, `ServiceUnavailable` for unknown or deactivated
    /// service types, and `InvalidCredentialsShape` for malformed seeds.
    pub async fn create(
        &self,
        user_id: Uuid,
        service_type_id: Uuid,
        custom_name: &str,
        mut seed: CredentialsSeed,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<CreatedInstance, GatewayError> {
        let service = self.load_active_service(service_type_id).await?;

        let authorization_url = match service.auth_kind {
            AuthKind::ApiKey => None,
            AuthKind::Oauth => {
                let client_id = seed.client_id.clone().ok_or_else(|| {
                    GatewayError::InvalidCredentialsShape(
                        "OAuth instance requires a client id".to_owned(),
                    )
                })?;
                let state = generate_state();
                let url = build_authorization_url(
                    &service,
                    &client_id,
                    &state,
                    seed.token_scope.as_deref(),
                )?;
                seed.oauth_state = Some(state);
                seed.oauth_authorization_url = Some(url.clone());
                Some(url)
            }
        };

        let new = NewInstance {
            user_id,
            service_type_id,
            custom_name: custom_name.to_owned(),
            expires_at,
        };
        let (instance, _creds) = self
            .store
            .create_instance_tx(&new, &seed)
            .await
            .map_err(StoreError::into_gateway)?;

        info!(
            instance_id = %instance.id,
            user_id = %user_id,
            service = %service.short_name,
            oauth_status = instance.oauth_status.as_str(),
            "instance created"
        );
        Ok(CreatedInstance {
            instance,
            authorization_url,
        })
    }

    /// Pause or resume an instance. Never touches OAuth status — tokens
    /// survive a pause and the instance simply disappears from the auth
    /// pipeline until resumed.
    ///
    /// # Errors
    ///
    /// Returns `InstanceExpired` when the instance needs a renewal instead,
    /// `InstanceNotFound` when the owner has no such instance.
    pub async fn toggle(
        &self,
        user_id: Uuid,
        instance_id: Uuid,
        active: bool,
    ) -> Result<InstanceRow, GatewayError> {
        let current = self
            .store
            .get_instance_for_user(instance_id, user_id)
            .await
            .map_err(StoreError::into_gateway)?;
        if current.status == InstanceStatus::Expired {
            return Err(GatewayError::InstanceExpired);
        }

        let status = if active {
            InstanceStatus::Active
        } else {
            InstanceStatus::Inactive
        };
        let patch = InstancePatch {
            status: Some(status),
            ..Default::default()
        };
        let updated = self
            .store
            .update_instance_fields(instance_id, user_id, &patch)
            .await
            .map_err(StoreError::into_gateway)?;

        self.cache.patch(
            &instance_id,
            &CachePatch {
                status: Some(status),
                ..Default::default()
            },
        );
        Ok(updated)
    }

    /// Renew an instance: new expiry, back to `active`, renewal counter
    /// bumped. OAuth status is untouched; stale tokens refresh lazily on
    /// the next authenticated call.
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound` when the owner has no such instance.
    pub async fn renew(
        &self,
        user_id: Uuid,
        instance_id: Uuid,
        new_expires_at: Option<DateTime<Utc>>,
    ) -> Result<InstanceRow, GatewayError> {
        let renewed = self
            .store
            .renew_instance(instance_id, user_id, new_expires_at)
            .await
            .map_err(StoreError::into_gateway)?;

        self.cache.patch(
            &instance_id,
            &CachePatch {
                status: Some(InstanceStatus::Active),
                ..Default::default()
            },
        );
        info!(instance_id = %instance_id, "instance renewed");
        Ok(renewed)
    }

    /// Rename an instance.
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound` when the owner has no such instance.
    pub async fn rename(
        &self,
        user_id: Uuid,
        instance_id: Uuid,
        custom_name: &str,
    ) -> Result<InstanceRow, GatewayError> {
        let patch = InstancePatch {
            custom_name: Some(custom_name.to_owned()),
            ..Default::default()
        };
        self.store
            .update_instance_fields(instance_id, user_id, &patch)
            .await
            .map_err(StoreError::into_gateway)
    }

    /// Delete an instance. Credentials and audit entries cascade; the
    /// cache entry is evicted.
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound` when the owner has no such instance.
    pub async fn delete(&self, user_id: Uuid, instance_id: Uuid) -> Result<(), GatewayError> {
        self.store
            .delete_instance(instance_id, user_id)
            .await
            .map_err(StoreError::into_gateway)?;
        self.cache.delete(&instance_id);
        info!(instance_id = %instance_id, "instance deleted");
        Ok(())
    }

    /// List the owner's instances, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on backend failure.
    pub async fn list(
        &self,
        user_id: Uuid,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceRow>, GatewayError> {
        self.store
            .list_user_instances(user_id, filter)
            .await
            .map_err(StoreError::into_gateway)
    }

    /// Complete a pending authorization flow. The callback sink calls this
    /// with the CSRF state it received; a mismatched or stale state fails
    /// closed without touching stored credentials.
    ///
    /// On success the first token set is exchanged, persisted, the cache
    /// seeded, and both rows flip to `completed`.
    ///
    /// # Errors
    ///
    /// Returns `ReauthenticationRequired` for a state mismatch or a flow
    /// that is no longer pending, `OauthTransientFailure` when the
    /// exchange fails transiently.
    pub async fn complete_authorization(
        &self,
        instance_id: Uuid,
        state: &str,
    ) -> Result<InstanceRow, GatewayError> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await
            .map_err(StoreError::into_gateway)?;
        let creds = self
            .store
            .get_credentials(instance_id)
            .await
            .map_err(StoreError::into_gateway)?;

        if creds.oauth_status != crate::types::OauthStatus::Pending {
            return Err(GatewayError::ReauthenticationRequired);
        }
        if creds.oauth_state.as_deref() != Some(state) {
            warn!(instance_id = %instance_id, "authorization state mismatch");
            return Err(GatewayError::ReauthenticationRequired);
        }
        let (Some(client_id), Some(client_secret)) =
            (creds.client_id.clone(), creds.client_secret.clone())
        else {
            return Err(GatewayError::InvalidCredentialsShape(
                "pending OAuth credentials are missing the client pair".to_owned(),
            ));
        };

        let service = self
            .store
            .get_service_type(instance.service_type_id)
            .await
            .map_err(|e| GatewayError::ServiceUnavailable(e.to_string()))?;
        let Some(token_url) = service.token_url.clone() else {
            return Err(GatewayError::ServiceUnavailable(format!(
                "service type {} has no token endpoint",
                service.short_name
            )));
        };

        let request = ExchangeRequest {
            client: ClientPair {
                client_id,
                client_secret,
            },
            scopes: creds.token_scope.clone(),
            token_url,
        };

        let started = std::time::Instant::now();
        match self.exchanger.exchange(&request).await {
            Ok((token_set, method)) => {
                let expires_at = Utc::now() + chrono::Duration::seconds(token_set.expires_in.max(0));
                let write = TokenWrite {
                    access_token: token_set.access_token.clone(),
                    refresh_token: token_set.refresh_token.clone(),
                    token_expires_at: expires_at,
                    token_scope: token_set.scope.clone(),
                };
                self.store
                    .complete_oauth(instance_id, &write)
                    .await
                    .map_err(StoreError::into_gateway)?;

                let mut record = crate::cache::CacheRecord::new(
                    token_set.access_token,
                    expires_at,
                    instance.user_id,
                );
                record.refresh_token = token_set.refresh_token;
                record.scope = token_set.scope;
                self.cache.put(instance_id, record);

                let mut entry = NewAuditEntry::success(
                    instance_id,
                    Some(instance.user_id),
                    AuditOperation::InitialExchange,
                    method,
                );
                entry.metadata.response_time_ms =
                    Some(i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX));
                if let Err(e) = self.store.append_audit(&entry).await {
                    warn!(instance_id = %instance_id, err = %e, "audit append failed");
                }

                info!(instance_id = %instance_id, method = method.as_str(), "authorization completed");
                self.store
                    .get_instance(instance_id)
                    .await
                    .map_err(StoreError::into_gateway)
            }
            Err(e) => {
                let entry = NewAuditEntry::failure(
                    instance_id,
                    Some(instance.user_id),
                    AuditOperation::InitialExchange,
                    e.kind_str(),
                    &e.to_string(),
                );
                if let Err(audit_err) = self.store.append_audit(&entry).await {
                    warn!(instance_id = %instance_id, err = %audit_err, "audit append failed");
                }
                if e.is_transient() {
                    Err(GatewayError::OauthTransientFailure(e.to_string()))
                } else {
                    Err(GatewayError::Internal(e.to_string()))
                }
            }
        }
    }

    /// Restart the authorization flow for a `failed` (or token-expired)
    /// credential: back to `pending` with a fresh state and URL.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when the flow is not in a restartable state,
    /// `InstanceNotFound` when the owner has no such instance.
    pub async fn begin_reauthorization(
        &self,
        user_id: Uuid,
        instance_id: Uuid,
    ) -> Result<String, GatewayError> {
        let instance = self
            .store
            .get_instance_for_user(instance_id, user_id)
            .await
            .map_err(StoreError::into_gateway)?;
        let creds = self
            .store
            .get_credentials(instance_id)
            .await
            .map_err(StoreError::into_gateway)?;

        if !matches!(
            creds.oauth_status,
            crate::types::OauthStatus::Failed | crate::types::OauthStatus::Expired
        ) {
            return Err(GatewayError::Conflict);
        }
        let Some(client_id) = creds.client_id.clone() else {
            return Err(GatewayError::InvalidCredentialsShape(
                "credentials are missing the OAuth client pair".to_owned(),
            ));
        };

        let service = self
            .store
            .get_service_type(instance.service_type_id)
            .await
            .map_err(|e| GatewayError::ServiceUnavailable(e.to_string()))?;
        let state = generate_state();
        let url =
            build_authorization_url(&service, &client_id, &state, creds.token_scope.as_deref())?;

        self.store
            .reset_oauth_pending(instance_id, &url, &state)
            .await
            .map_err(StoreError::into_gateway)?;
        self.cache.delete(&instance_id);

        let entry = NewAuditEntry {
            instance_id,
            user_id: Some(user_id),
            operation: AuditOperation::Reauthorization,
            status: AuditStatus::Pending,
            method: None,
            error_kind: None,
            error_message: None,
            metadata: Default::default(),
        };
        if let Err(e) = self.store.append_audit(&entry).await {
            warn!(instance_id = %instance_id, err = %e, "audit append failed");
        }

        info!(instance_id = %instance_id, "reauthorization started");
        Ok(url)
    }

    async fn load_active_service(
        &self,
        service_type_id: Uuid,
    ) -> Result<ServiceTypeRow, GatewayError> {
        let service = self
            .store
            .get_service_type(service_type_id)
            .await
            .map_err(|e| GatewayError::ServiceUnavailable(e.to_string()))?;
        if !service.is_active {
            return Err(GatewayError::ServiceUnavailable(format!(
                "service type {} is deactivated",
                service.short_name
            )));
        }
        Ok(service)
    }
}

/// Generate a CSRF state parameter.
fn generate_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(OAUTH_STATE_LEN)
        .map(char::from)
        .collect()
}

/// Build the user-facing authorization URL for an OAuth service type.
fn build_authorization_url(
    service: &ServiceTypeRow,
    client_id: &str,
    state: &str,
    scope: Option<&str>,
) -> Result<String, GatewayError> {
    let base = service.authorize_url.as_deref().ok_or_else(|| {
        GatewayError::ServiceUnavailable(format!(
            "service type {} has no authorization endpoint",
            service.short_name
        ))
    })?;
    let mut url = url::Url::parse(base)
        .map_err(|e| GatewayError::Internal(format!("malformed authorization endpoint: {e}")))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("state", state);
    if let Some(scope) = scope {
        url.query_pairs_mut().append_pair("scope", scope);
    }
    Ok(url.into())
}
