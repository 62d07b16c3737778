//! Refresh algorithm: cache hits, stored-token adoption, write-back under
//! the version counter, and the failure outcome classes.

use std::sync::Arc;

use chrono::{Duration, Utc};

use straylight::cache::CredentialCache;
use straylight::oauth::OauthError;
use straylight::store::models::AuditFilter;
use straylight::types::{AuditStatus, OauthStatus, RefreshMethod};

use crate::support::{
    complete_tokens, coordinator, create_oauth_instance, memory_store, seed_oauth_service,
    seed_user, ScriptedExchanger,
};

#[tokio::test]
async fn stale_cache_and_dead_stored_token_trigger_one_refresh() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let instance = create_oauth_instance(&store, &user, &service, "stale").await;
    // Stored access token expired five minutes ago; refresh token valid.
    complete_tokens(&store, instance.id, "expired-token", -300, Some("rt-live")).await;
    let before = store.get_credentials(instance.id).await.expect("row");

    let cache = Arc::new(CredentialCache::new(0, 4));
    let exchanger = ScriptedExchanger::new();
    exchanger.push_token("fresh-token", 3600, RefreshMethod::OauthService);
    let coordinator = coordinator(&store, &cache, &exchanger);

    let instance_row = store.get_instance(instance.id).await.expect("row");
    let bearer = coordinator
        .resolve_bearer(&instance_row)
        .await
        .expect("bearer resolved");
    assert_eq!(bearer.token, "fresh-token");
    assert_eq!(exchanger.call_count(), 1);

    // Credentials updated under the version counter: exactly +1.
    let after = store.get_credentials(instance.id).await.expect("row");
    assert_eq!(after.version, before.version + 1);
    assert_eq!(after.access_token.as_deref(), Some("fresh-token"));
    assert!(after.token_expires_at.expect("expiry") > Utc::now());

    // Cache repopulated.
    let record = cache.get(&instance.id).expect("cache hit");
    assert_eq!(record.bearer, "fresh-token");
    assert_eq!(record.refresh_attempts, 0);

    // One success audit entry with the method and timing.
    let entries = store
        .query_audit(instance.id, &AuditFilter::default())
        .await
        .expect("audit");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, AuditStatus::Success);
    assert_eq!(entries[0].method, Some(RefreshMethod::OauthService));
    assert!(entries[0].metadata.response_time_ms.is_some());
}

#[tokio::test]
async fn direct_fallback_method_lands_in_the_audit_entry() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let instance = create_oauth_instance(&store, &user, &service, "fallback").await;
    complete_tokens(&store, instance.id, "expired", -60, Some("rt")).await;

    let cache = Arc::new(CredentialCache::new(0, 4));
    let exchanger = ScriptedExchanger::new();
    // The exchanger reports it had to go around the helper service.
    exchanger.push_token("direct-token", 3600, RefreshMethod::DirectOauth);
    let coordinator = coordinator(&store, &cache, &exchanger);

    let instance_row = store.get_instance(instance.id).await.expect("row");
    let bearer = coordinator
        .resolve_bearer(&instance_row)
        .await
        .expect("bearer resolved");
    assert_eq!(bearer.token, "direct-token");

    let entries = store
        .query_audit(instance.id, &AuditFilter::default())
        .await
        .expect("audit");
    assert_eq!(entries[0].method, Some(RefreshMethod::DirectOauth));
}

#[tokio::test]
async fn cached_bearer_short_circuits_everything() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let instance = create_oauth_instance(&store, &user, &service, "cached").await;
    complete_tokens(&store, instance.id, "stored", 3600, Some("rt")).await;

    let cache = Arc::new(CredentialCache::new(0, 4));
    let exchanger = ScriptedExchanger::new();
    let coordinator = coordinator(&store, &cache, &exchanger);

    let instance_row = store.get_instance(instance.id).await.expect("row");

    // First call adopts the stored token without an exchange.
    let first = coordinator
        .resolve_bearer(&instance_row)
        .await
        .expect("adopted");
    assert_eq!(first.token, "stored");
    assert_eq!(exchanger.call_count(), 0);

    // Second call is a pure cache hit.
    let second = coordinator
        .resolve_bearer(&instance_row)
        .await
        .expect("cache hit");
    assert_eq!(second.token, "stored");
    assert_eq!(exchanger.call_count(), 0);
}

#[tokio::test]
async fn back_to_back_refreshes_only_exchange_once() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let instance = create_oauth_instance(&store, &user, &service, "idempotent").await;
    complete_tokens(&store, instance.id, "expired", -60, Some("rt")).await;

    let cache = Arc::new(CredentialCache::new(0, 4));
    let exchanger = ScriptedExchanger::new();
    exchanger.push_token("once", 3600, RefreshMethod::OauthService);
    let coordinator = coordinator(&store, &cache, &exchanger);

    let instance_row = store.get_instance(instance.id).await.expect("row");
    let first = coordinator
        .resolve_bearer(&instance_row)
        .await
        .expect("refreshed");
    // The second resolve observes the fresh cache and never calls out.
    let second = coordinator
        .resolve_bearer(&instance_row)
        .await
        .expect("cache hit");
    assert_eq!(first.token, second.token);
    assert_eq!(exchanger.call_count(), 1);
}

#[tokio::test]
async fn invalid_refresh_token_fails_the_flow_without_touching_tokens() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let instance = create_oauth_instance(&store, &user, &service, "revoked").await;
    complete_tokens(&store, instance.id, "old-token", -60, Some("rt-revoked")).await;

    let cache = Arc::new(CredentialCache::new(0, 4));
    let exchanger = ScriptedExchanger::new();
    exchanger.push_error(OauthError::InvalidRefreshToken);
    let coordinator = coordinator(&store, &cache, &exchanger);

    let instance_row = store.get_instance(instance.id).await.expect("row");
    let err = coordinator
        .resolve_bearer(&instance_row)
        .await
        .expect_err("must require reauth");
    assert_eq!(err.code(), "reauthentication_required");
    assert_eq!(exchanger.call_count(), 1);

    // Token state is untouched; only the status machine moved.
    let creds = store.get_credentials(instance.id).await.expect("row");
    assert_eq!(creds.access_token.as_deref(), Some("old-token"));
    assert_eq!(creds.oauth_status, OauthStatus::Failed);
    let parent = store.get_instance(instance.id).await.expect("instance");
    assert_eq!(parent.oauth_status, OauthStatus::Failed);

    // Failure recorded with its kind.
    let entries = store
        .query_audit(instance.id, &AuditFilter::default())
        .await
        .expect("audit");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, AuditStatus::Failure);
    assert_eq!(
        entries[0].error_kind.as_deref(),
        Some("invalid_refresh_token")
    );
}

#[tokio::test]
async fn transient_failures_are_retried_then_surfaced_as_retriable() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let instance = create_oauth_instance(&store, &user, &service, "flaky").await;
    complete_tokens(&store, instance.id, "expired", -60, Some("rt")).await;

    let cache = Arc::new(CredentialCache::new(0, 4));
    let exchanger = ScriptedExchanger::new();
    for _ in 0..3 {
        exchanger.push_error(OauthError::ServiceUnavailable("down".to_owned()));
    }
    let coordinator = coordinator(&store, &cache, &exchanger);

    let instance_row = store.get_instance(instance.id).await.expect("row");
    let err = coordinator
        .resolve_bearer(&instance_row)
        .await
        .expect_err("transient failure");
    assert_eq!(err.code(), "oauth_transient_failure");
    // Bounded retries: exactly three attempts.
    assert_eq!(exchanger.call_count(), 3);

    // Transient failures never move the status machine.
    let creds = store.get_credentials(instance.id).await.expect("row");
    assert_eq!(creds.oauth_status, OauthStatus::Completed);
}

#[tokio::test]
async fn transient_then_success_recovers_within_the_retry_budget() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let instance = create_oauth_instance(&store, &user, &service, "recovers").await;
    complete_tokens(&store, instance.id, "expired", -60, Some("rt")).await;

    let cache = Arc::new(CredentialCache::new(0, 4));
    let exchanger = ScriptedExchanger::new();
    exchanger.push_error(OauthError::Network("connection reset".to_owned()));
    exchanger.push_token("after-retry", 3600, RefreshMethod::OauthService);
    let coordinator = coordinator(&store, &cache, &exchanger);

    let instance_row = store.get_instance(instance.id).await.expect("row");
    let bearer = coordinator
        .resolve_bearer(&instance_row)
        .await
        .expect("recovered");
    assert_eq!(bearer.token, "after-retry");
    assert_eq!(exchanger.call_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn losing_the_version_race_falls_back_to_an_unconditional_write() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let instance = create_oauth_instance(&store, &user, &service, "raced").await;
    complete_tokens(&store, instance.id, "expired", -60, Some("rt")).await;

    let cache = Arc::new(CredentialCache::new(0, 4));
    // Stall the exchange long enough for a concurrent writer to sneak in.
    let exchanger =
        crate::support::ScriptedExchanger::with_delay(std::time::Duration::from_millis(150));
    exchanger.push_token("from-refresh", 3600, RefreshMethod::OauthService);
    let coordinator = coordinator(&store, &cache, &exchanger);

    let instance_row = store.get_instance(instance.id).await.expect("row");
    let racing = {
        let coordinator = Arc::clone(&coordinator);
        let instance_row = instance_row.clone();
        tokio::spawn(async move { coordinator.resolve_bearer(&instance_row).await })
    };

    // While the exchange is in flight, another process rotates the tokens
    // and bumps the version, so the coordinator's CAS will lose.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    store
        .update_credentials_unconditional(
            instance.id,
            &straylight::store::models::TokenWrite {
                access_token: "interloper".to_owned(),
                refresh_token: None,
                token_expires_at: Utc::now() + Duration::seconds(600),
                token_scope: None,
            },
        )
        .await
        .expect("concurrent write");

    // The losing writer accepts latest-writer-wins and still succeeds.
    let bearer = racing
        .await
        .expect("task joined")
        .expect("refresh still succeeds");
    assert_eq!(bearer.token, "from-refresh");

    let creds = store.get_credentials(instance.id).await.expect("row");
    assert_eq!(creds.access_token.as_deref(), Some("from-refresh"));
}

#[tokio::test]
async fn missing_refresh_token_requires_reauthorization() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let instance = create_oauth_instance(&store, &user, &service, "tokenless").await;
    // Completed flow whose provider never issued a refresh token.
    complete_tokens(&store, instance.id, "expired", -60, None).await;

    let cache = Arc::new(CredentialCache::new(0, 4));
    let exchanger = ScriptedExchanger::new();
    let coordinator = coordinator(&store, &cache, &exchanger);

    let instance_row = store.get_instance(instance.id).await.expect("row");
    let err = coordinator
        .resolve_bearer(&instance_row)
        .await
        .expect_err("nothing to refresh with");
    assert_eq!(err.code(), "reauthentication_required");
    assert_eq!(exchanger.call_count(), 0);

    let creds = store.get_credentials(instance.id).await.expect("row");
    assert_eq!(creds.oauth_status, OauthStatus::Failed);
}

#[tokio::test]
async fn skew_buffer_treats_nearly_expired_cache_as_a_miss() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let instance = create_oauth_instance(&store, &user, &service, "skew").await;
    complete_tokens(&store, instance.id, "expired", -60, Some("rt")).await;

    let cache = Arc::new(CredentialCache::new(0, 4));
    let exchanger = ScriptedExchanger::new();
    exchanger.push_token("fresh", 3600, RefreshMethod::OauthService);
    // Thirty-second skew buffer.
    let coordinator = straylight::refresh::RefreshCoordinator::new(
        store.clone(),
        Arc::clone(&cache),
        Arc::clone(&exchanger) as Arc<dyn straylight::oauth::TokenExchanger>,
        std::time::Duration::from_secs(5),
        Duration::seconds(30),
    );

    // A cached bearer with ten seconds left falls inside the buffer.
    let mut record = straylight::cache::CacheRecord::new(
        "nearly-dead".to_owned(),
        Utc::now() + Duration::seconds(10),
        user.id,
    );
    record.refresh_token = Some("rt".to_owned());
    cache.put(instance.id, record);

    let instance_row = store.get_instance(instance.id).await.expect("row");
    let bearer = coordinator
        .resolve_bearer(&instance_row)
        .await
        .expect("refreshed past the buffer");
    assert_eq!(bearer.token, "fresh");
    assert_eq!(exchanger.call_count(), 1);
}
