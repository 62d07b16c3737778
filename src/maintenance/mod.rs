//! Background maintenance.
//!
//! A periodic sweeper with four duties per tick, each bounded by the tick
//! quota: expire due instances, reap stale pending OAuth flows, trim the
//! audit log, and reconcile the credential cache against the store. It also
//! effects the `completed -> expired` credential transition for tokens past
//! hard expiry with no usable refresh token.
//!
//! Reconciliation is strictly cache-follows-store: the cache is never
//! allowed to overwrite the store here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::{CachePatch, CacheRecord, CredentialCache};
use crate::config::GatewayConfig;
use crate::store::{Store, StoreError};

/// Outcome of one maintenance tick, for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Instances flipped to `expired`.
    pub expired_instances: u64,
    /// Stale pending flows marked `failed`.
    pub reaped_pending: u64,
    /// Completed credentials whose dead tokens were marked `expired`.
    pub expired_tokens: u64,
    /// Audit entries removed by retention.
    pub audit_removed: u64,
    /// Cache entries refreshed from the store.
    pub cache_refreshed: usize,
    /// Cache entries evicted (gone or tokenless in the store).
    pub cache_evicted: usize,
}

/// The background sweeper.
pub struct MaintenanceLoop {
    store: Store,
    cache: Arc<CredentialCache>,
    interval: Duration,
    pending_ttl: chrono::Duration,
    retention: chrono::Duration,
    tick_quota: u32,
}

impl MaintenanceLoop {
    /// Build a loop from configuration.
    pub fn new(store: Store, cache: Arc<CredentialCache>, config: &GatewayConfig) -> Self {
        Self {
            store,
            cache,
            interval: Duration::from_millis(config.maintenance.interval_ms),
            pending_ttl: chrono::Duration::milliseconds(
                i64::try_from(config.maintenance.pending_ttl_ms).unwrap_or(i64::MAX),
            ),
            retention: chrono::Duration::days(i64::from(config.audit.retention_days)),
            tick_quota: config.maintenance.tick_quota,
        }
    }

    /// Run until shutdown is signalled. The current tick finishes its
    /// duties before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        // Don't pile up missed ticks behind a slow duty.
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup isn't a sweep.
        ticker.tick().await;

        info!(interval_ms = self.interval.as_millis() as u64, "maintenance loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    info!(
                        expired_instances = report.expired_instances,
                        reaped_pending = report.reaped_pending,
                        expired_tokens = report.expired_tokens,
                        audit_removed = report.audit_removed,
                        cache_refreshed = report.cache_refreshed,
                        cache_evicted = report.cache_evicted,
                        "maintenance tick complete"
                    );
                }
                _ = shutdown.changed() => {
                    info!("maintenance loop stopping");
                    return;
                }
            }
        }
    }

    /// Perform one tick's duties. Public so tests can drive the sweeper
    /// without a timer.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let now = Utc::now();

        // Expire instances whose expires_at has passed.
        match self.store.list_expired_instances(now, self.tick_quota).await {
            Ok(due) => {
                let ids: Vec<_> = due.iter().map(|i| i.id).collect();
                match self.store.bulk_mark_expired(&ids).await {
                    Ok(count) => {
                        report.expired_instances = count;
                        for id in &ids {
                            self.cache.patch(
                                id,
                                &CachePatch {
                                    status: Some(crate::types::InstanceStatus::Expired),
                                    ..Default::default()
                                },
                            );
                        }
                    }
                    Err(e) => warn!(err = %e, "bulk expiry failed"),
                }
            }
            Err(e) => warn!(err = %e, "expired-instance sweep failed"),
        }

        // Reap OAuth flows stuck in pending past the TTL.
        let pending_cutoff = now - self.pending_ttl;
        match self
            .store
            .list_stale_pending_oauth(pending_cutoff, self.tick_quota)
            .await
        {
            Ok(stale) => {
                for instance in stale {
                    match self.store.mark_oauth_failed(instance.id).await {
                        Ok(()) => {
                            report.reaped_pending += 1;
                            self.cache.delete(&instance.id);
                        }
                        Err(e) => {
                            warn!(instance_id = %instance.id, err = %e, "pending reap failed");
                        }
                    }
                }
            }
            Err(e) => warn!(err = %e, "stale-pending sweep failed"),
        }

        // Tokens past hard expiry with nothing to refresh them: the
        // completed -> expired transition.
        match self
            .store
            .list_unrefreshable_expired_tokens(now, self.tick_quota)
            .await
        {
            Ok(ids) => {
                for id in ids {
                    match self.store.mark_token_expired(id).await {
                        Ok(()) => {
                            report.expired_tokens += 1;
                            self.cache.delete(&id);
                        }
                        Err(StoreError::NotFound) => {}
                        Err(e) => warn!(instance_id = %id, err = %e, "token expiry failed"),
                    }
                }
            }
            Err(e) => warn!(err = %e, "token-expiry sweep failed"),
        }

        // Audit retention.
        match self.store.cleanup_audit(now - self.retention).await {
            Ok(removed) => report.audit_removed = removed,
            Err(e) => warn!(err = %e, "audit cleanup failed"),
        }

        // Cache reconciliation.
        let (refreshed, evicted) = self.reconcile_cache().await;
        report.cache_refreshed = refreshed;
        report.cache_evicted = evicted;

        report
    }

    /// Converge the cache with the store. For each cached id: evict when
    /// the instance is gone, reload when the store's credentials are newer
    /// than the cached record, otherwise just mirror the status.
    async fn reconcile_cache(&self) -> (usize, usize) {
        let mut refreshed = 0usize;
        let mut evicted = 0usize;

        for id in self.cache.ids() {
            let Some(record) = self.cache.peek(&id) else {
                continue;
            };

            let instance = match self.store.get_instance(id).await {
                Ok(instance) => instance,
                Err(StoreError::NotFound) => {
                    self.cache.delete(&id);
                    evicted += 1;
                    continue;
                }
                Err(e) => {
                    // Store unavailable: leave the cache alone this tick.
                    warn!(instance_id = %id, err = %e, "reconciliation read failed");
                    continue;
                }
            };

            let store_is_newer = instance
                .credentials_updated_at
                .is_some_and(|updated| updated > record.cached_at);

            if store_is_newer {
                match self.store.get_credentials(id).await {
                    Ok(creds) => match (creds.access_token.clone(), creds.token_expires_at) {
                        (Some(token), Some(expires_at)) => {
                            let mut fresh =
                                CacheRecord::new(token, expires_at, instance.user_id);
                            fresh.refresh_token = creds.refresh_token.clone();
                            fresh.scope = creds.token_scope.clone();
                            fresh.status = Some(instance.status);
                            fresh.last_used = record.last_used;
                            self.cache.put(id, fresh);
                            refreshed += 1;
                        }
                        // Tokens are gone from the store; the cache must
                        // not keep serving them.
                        _ => {
                            self.cache.delete(&id);
                            evicted += 1;
                        }
                    },
                    Err(StoreError::NotFound) => {
                        self.cache.delete(&id);
                        evicted += 1;
                    }
                    Err(e) => {
                        warn!(instance_id = %id, err = %e, "reconciliation read failed");
                    }
                }
            } else if record.status != Some(instance.status) {
                self.cache.patch(
                    &id,
                    &CachePatch {
                        status: Some(instance.status),
                        ..Default::default()
                    },
                );
                refreshed += 1;
            }
        }

        (refreshed, evicted)
    }
}
