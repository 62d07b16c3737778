//! Token refresh coordination.
//!
//! The [`RefreshCoordinator`] owns credential freshness for the whole
//! process. One refresh slot exists per instance id: the first caller to
//! need a refresh installs a completion cell and performs the exchange in a
//! spawned task; everyone else (and the leader itself) awaits the cell, so
//! at most one outbound token call is ever in flight per instance. Caller
//! cancellation never aborts the exchange — the spawned task runs to
//! completion and the remaining waiters still get the result.
//!
//! Cross-process races are handled one layer down: token write-back goes
//! through the credentials version counter, and a CAS conflict falls back
//! to an unconditional write (another process already refreshed; accept
//! latest-writer-wins).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{CacheRecord, CredentialCache};
use crate::oauth::{ClientPair, OauthError, RefreshRequest, TokenExchanger, TokenSet};
use crate::store::models::{CredentialsRow, InstanceRow, NewAuditEntry, TokenWrite};
use crate::store::{Store, StoreError};
use crate::types::{AuditOperation, GatewayError, RefreshMethod};

/// Bounded local retries for transient exchange failures.
const MAX_REFRESH_ATTEMPTS: u32 = 3;

/// Base delay for the exponential backoff between retries.
const BACKOFF_BASE_MS: u64 = 100;

/// A bearer token ready to attach to a request.
#[derive(Clone)]
pub struct Bearer {
    /// The access token.
    pub token: String,
    /// Hard expiry.
    pub expires_at: chrono::DateTime<Utc>,
}

impl std::fmt::Debug for Bearer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bearer")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Shared result of one refresh slot.
#[derive(Debug, Clone)]
enum RefreshOutcome {
    /// A live bearer, freshly refreshed or adopted.
    Fresh(Bearer),
    /// The refresh token was rejected; the user must re-authorize.
    RequiresReauth,
    /// Transient failure; the caller may retry the request.
    Transient(String),
    /// Non-retriable failure for this request.
    Fatal(String),
}

/// Drives the refresh state machine: cache-first, stored-token adoption,
/// singleflight exchange, optimistically-locked write-back, audit.
pub struct RefreshCoordinator {
    store: Store,
    cache: Arc<CredentialCache>,
    exchanger: Arc<dyn TokenExchanger>,
    /// One completion cell per instance with a refresh in flight.
    inflight: Mutex<HashMap<Uuid, broadcast::Sender<RefreshOutcome>>>,
    /// Maximum wait on someone else's in-flight refresh.
    singleflight_timeout: Duration,
    /// Skew buffer subtracted from expiry when judging freshness.
    skew: chrono::Duration,
}

impl RefreshCoordinator {
    /// Build a coordinator over the given store, cache, and exchanger.
    pub fn new(
        store: Store,
        cache: Arc<CredentialCache>,
        exchanger: Arc<dyn TokenExchanger>,
        singleflight_timeout: Duration,
        skew: chrono::Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cache,
            exchanger,
            inflight: Mutex::new(HashMap::new()),
            singleflight_timeout,
            skew,
        })
    }

    /// Produce a live bearer for an instance, refreshing if necessary.
    ///
    /// The instance row must already have passed pipeline validation
    /// (active service type, active status, unexpired).
    ///
    /// # Errors
    ///
    /// Returns `ReauthenticationRequired` when the refresh token was
    /// rejected, `OauthTransientFailure` when both acquisition methods
    /// failed transiently, and `Internal` for everything else.
    pub async fn resolve_bearer(
        self: &Arc<Self>,
        instance: &InstanceRow,
    ) -> Result<Bearer, GatewayError> {
        let now = Utc::now();

        // Fast path: cached bearer still comfortably inside its lifetime.
        if let Some(record) = self.cache.get(&instance.id) {
            if record.expires_at > now + self.skew {
                return Ok(Bearer {
                    token: record.bearer,
                    expires_at: record.expires_at,
                });
            }
        }

        let creds = self
            .store
            .get_credentials(instance.id)
            .await
            .map_err(StoreError::into_gateway)?;

        // Cache-cold but the stored token is still live (typical after a
        // restart): adopt it instead of burning a refresh.
        if creds.token_live_at(now + self.skew) {
            return Ok(self.adopt_stored_token(instance, &creds));
        }

        // A refresh is required; join or become the per-instance slot.
        let outcome = self.join_or_lead_refresh(instance, &creds).await;
        match outcome {
            RefreshOutcome::Fresh(bearer) => Ok(bearer),
            RefreshOutcome::RequiresReauth => Err(GatewayError::ReauthenticationRequired),
            RefreshOutcome::Transient(msg) => Err(GatewayError::OauthTransientFailure(msg)),
            RefreshOutcome::Fatal(msg) => Err(GatewayError::Internal(msg)),
        }
    }

    /// Write a still-valid stored token into the cache and return it.
    fn adopt_stored_token(
        self: &Arc<Self>,
        instance: &InstanceRow,
        creds: &CredentialsRow,
    ) -> Bearer {
        // token_live_at guarantees both fields are present.
        let token = creds.access_token.clone().unwrap_or_default();
        let expires_at = creds.token_expires_at.unwrap_or_else(Utc::now);

        let mut record = CacheRecord::new(token.clone(), expires_at, instance.user_id);
        record.refresh_token = creds.refresh_token.clone();
        record.scope = creds.token_scope.clone();
        record.status = Some(instance.status);
        self.cache.put(instance.id, record);

        Bearer { token, expires_at }
    }

    /// Either subscribe to an in-flight refresh or install a new slot and
    /// lead it. The leader's work runs in a spawned task so a cancelled
    /// caller cannot abort it for the other waiters.
    async fn join_or_lead_refresh(
        self: &Arc<Self>,
        instance: &InstanceRow,
        creds: &CredentialsRow,
    ) -> RefreshOutcome {
        let mut rx = {
            let mut inflight = self.inflight.lock().await;
            if let Some(tx) = inflight.get(&instance.id) {
                tx.subscribe()
            } else {
                let (tx, rx) = broadcast::channel(1);
                inflight.insert(instance.id, tx.clone());

                let coordinator = Arc::clone(self);
                let instance = instance.clone();
                let creds = creds.clone();
                tokio::spawn(async move {
                    let outcome = coordinator.perform_refresh(&instance, &creds).await;
                    // Remove the slot before broadcasting so a caller that
                    // arrives after completion starts a fresh slot instead
                    // of waiting on a spent one.
                    let mut inflight = coordinator.inflight.lock().await;
                    inflight.remove(&instance.id);
                    let _ = tx.send(outcome);
                });
                rx
            }
        };

        match tokio::time::timeout(self.singleflight_timeout, rx.recv()).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => RefreshOutcome::Transient("refresh slot closed unexpectedly".to_owned()),
            Err(_) => {
                RefreshOutcome::Transient("timed out waiting for in-flight refresh".to_owned())
            }
        }
    }

    /// The actual exchange: timed, retried on transient failures with
    /// exponential backoff, written back under the version counter.
    async fn perform_refresh(
        self: &Arc<Self>,
        instance: &InstanceRow,
        creds: &CredentialsRow,
    ) -> RefreshOutcome {
        let (Some(client_id), Some(client_secret)) =
            (creds.client_id.clone(), creds.client_secret.clone())
        else {
            return RefreshOutcome::Fatal("credentials are missing the OAuth client pair".into());
        };

        let Some(refresh_token) = creds.refresh_token.clone().filter(|t| !t.is_empty()) else {
            // Nothing to renew with: terminal until the user re-authorizes.
            self.record_failure(
                instance,
                "invalid_refresh_token",
                "no refresh token on record",
                None,
                0,
            )
            .await;
            self.mark_failed(instance).await;
            return RefreshOutcome::RequiresReauth;
        };

        let service = match self.store.get_service_type(instance.service_type_id).await {
            Ok(service) => service,
            Err(e) => return RefreshOutcome::Fatal(format!("service type lookup failed: {e}")),
        };
        let Some(token_url) = service.token_url.clone() else {
            return RefreshOutcome::Fatal(format!(
                "service type {} has no token endpoint",
                service.short_name
            ));
        };

        let request = RefreshRequest {
            client: ClientPair {
                client_id,
                client_secret,
            },
            refresh_token,
            token_url,
        };
        let expected_version = creds.version;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = self.exchanger.refresh(&request).await;
            let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

            match result {
                Ok((token_set, method)) => {
                    return self
                        .commit_refresh(instance, expected_version, token_set, method, elapsed_ms, attempt)
                        .await;
                }
                Err(e) if e.is_transient() && attempt < MAX_REFRESH_ATTEMPTS => {
                    let delay = BACKOFF_BASE_MS * 2u64.pow(attempt - 1)
                        + u64::from(rand::random::<u8>() % 50);
                    warn!(
                        instance_id = %instance.id,
                        attempt,
                        err = %e,
                        delay_ms = delay,
                        "transient refresh failure, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    return self
                        .fail_refresh(instance, e, elapsed_ms, attempt)
                        .await;
                }
            }
        }
    }

    /// Persist a successful exchange, repopulate the cache, and audit it.
    async fn commit_refresh(
        self: &Arc<Self>,
        instance: &InstanceRow,
        expected_version: i64,
        token_set: TokenSet,
        method: RefreshMethod,
        elapsed_ms: i64,
        attempt: u32,
    ) -> RefreshOutcome {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(token_set.expires_in.max(0));
        let write = TokenWrite {
            access_token: token_set.access_token.clone(),
            refresh_token: token_set.refresh_token.clone(),
            token_expires_at: expires_at,
            token_scope: token_set.scope.clone(),
        };

        let cas = self
            .store
            .update_credentials_cas(instance.id, expected_version, &write)
            .await;
        match cas {
            Ok(_) => {}
            Err(StoreError::Conflict) => {
                // Another process already refreshed; accept this write as
                // the new baseline rather than failing ten waiting calls.
                warn!(instance_id = %instance.id, "refresh write-back lost the version race");
                if let Err(e) = self
                    .store
                    .update_credentials_unconditional(instance.id, &write)
                    .await
                {
                    return RefreshOutcome::Fatal(format!("token write-back failed: {e}"));
                }
            }
            Err(e) => return RefreshOutcome::Fatal(format!("token write-back failed: {e}")),
        }

        let mut record = CacheRecord::new(
            token_set.access_token.clone(),
            expires_at,
            instance.user_id,
        );
        record.refresh_token = token_set.refresh_token.clone();
        record.scope = token_set.scope.clone();
        record.status = Some(instance.status);
        record.last_successful_refresh = Some(now);
        self.cache.put(instance.id, record);
        self.cache.reset_refresh_attempts(&instance.id);

        let mut entry = NewAuditEntry::success(
            instance.id,
            Some(instance.user_id),
            AuditOperation::Refresh,
            method,
        );
        entry.metadata.response_time_ms = Some(elapsed_ms);
        entry.metadata.attempt = Some(attempt);
        if let Err(e) = self.store.append_audit(&entry).await {
            warn!(instance_id = %instance.id, err = %e, "audit append failed");
        }

        info!(
            instance_id = %instance.id,
            method = method.as_str(),
            response_time_ms = elapsed_ms,
            "access token refreshed"
        );
        RefreshOutcome::Fresh(Bearer {
            token: token_set.access_token,
            expires_at,
        })
    }

    /// Record a terminal refresh failure and map it to an outcome.
    async fn fail_refresh(
        self: &Arc<Self>,
        instance: &InstanceRow,
        error: OauthError,
        elapsed_ms: i64,
        attempt: u32,
    ) -> RefreshOutcome {
        self.cache.increment_refresh_attempts(&instance.id);
        self.record_failure(
            instance,
            error.kind_str(),
            &error.to_string(),
            Some(elapsed_ms),
            attempt,
        )
        .await;

        warn!(
            instance_id = %instance.id,
            error_kind = error.kind_str(),
            attempt,
            "token refresh failed"
        );

        match error {
            OauthError::InvalidRefreshToken => {
                // Stored tokens stay as they are; only the status flips.
                self.mark_failed(instance).await;
                RefreshOutcome::RequiresReauth
            }
            OauthError::Network(_)
            | OauthError::ServiceUnavailable(_)
            | OauthError::ProviderRateLimit => RefreshOutcome::Transient(error.to_string()),
            OauthError::InvalidClient | OauthError::Unknown(_) => {
                RefreshOutcome::Fatal(error.to_string())
            }
        }
    }

    async fn mark_failed(self: &Arc<Self>, instance: &InstanceRow) {
        if let Err(e) = self.store.mark_oauth_failed(instance.id).await {
            warn!(instance_id = %instance.id, err = %e, "failed to mark credentials failed");
        }
    }

    async fn record_failure(
        self: &Arc<Self>,
        instance: &InstanceRow,
        error_kind: &str,
        error_message: &str,
        elapsed_ms: Option<i64>,
        attempt: u32,
    ) {
        let mut entry = NewAuditEntry::failure(
            instance.id,
            Some(instance.user_id),
            AuditOperation::Refresh,
            error_kind,
            error_message,
        );
        entry.metadata.response_time_ms = elapsed_ms;
        entry.metadata.attempt = (attempt > 0).then_some(attempt);
        if let Err(e) = self.store.append_audit(&entry).await {
            warn!(instance_id = %instance.id, err = %e, "audit append failed");
        }
    }
}

