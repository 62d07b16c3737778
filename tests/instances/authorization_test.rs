//! Authorization flow completion and re-authorization through the manager.

use std::sync::Arc;

use straylight::cache::CredentialCache;
use straylight::instances::InstanceManager;
use straylight::oauth::{OauthError, TokenExchanger};
use straylight::store::models::AuditFilter;
use straylight::store::Store;
use straylight::types::{AuditOperation, AuditStatus, OauthStatus, RefreshMethod};

use crate::support::{
    complete_tokens, create_oauth_instance, memory_store, seed_oauth_service, seed_user,
    ScriptedExchanger,
};

fn manager_with(
    store: &Store,
    cache: &Arc<CredentialCache>,
    exchanger: &Arc<ScriptedExchanger>,
) -> InstanceManager {
    InstanceManager::new(
        store.clone(),
        Arc::clone(cache),
        Arc::clone(exchanger) as Arc<dyn TokenExchanger>,
    )
}

#[tokio::test]
async fn completing_the_flow_exchanges_and_seeds_the_cache() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let cache = Arc::new(CredentialCache::new(0, 4));
    let exchanger = ScriptedExchanger::new();
    exchanger.push_token("first-token", 3600, RefreshMethod::OauthService);
    let manager = manager_with(&store, &cache, &exchanger);

    let instance = create_oauth_instance(&store, &user, &service, "inbox").await;
    let creds = store.get_credentials(instance.id).await.expect("row");
    let state = creds.oauth_state.expect("state present");

    let completed = manager
        .complete_authorization(instance.id, &state)
        .await
        .expect("flow completes");
    assert_eq!(completed.oauth_status, OauthStatus::Completed);
    assert_eq!(exchanger.call_count(), 1);

    let creds = store.get_credentials(instance.id).await.expect("row");
    assert_eq!(creds.access_token.as_deref(), Some("first-token"));
    assert_eq!(creds.oauth_status, OauthStatus::Completed);
    assert!(creds.oauth_state.is_none());

    // The cache is seeded so the first tool call is already a hit.
    let record = cache.get(&instance.id).expect("cache seeded");
    assert_eq!(record.bearer, "first-token");

    let entries = store
        .query_audit(instance.id, &AuditFilter::default())
        .await
        .expect("audit");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation, AuditOperation::InitialExchange);
    assert_eq!(entries[0].status, AuditStatus::Success);
}

#[tokio::test]
async fn state_mismatch_fails_closed() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let cache = Arc::new(CredentialCache::new(0, 4));
    let exchanger = ScriptedExchanger::new();
    let manager = manager_with(&store, &cache, &exchanger);

    let instance = create_oauth_instance(&store, &user, &service, "forged").await;
    let err = manager
        .complete_authorization(instance.id, "wrong-state")
        .await
        .expect_err("state mismatch");
    assert_eq!(err.code(), "reauthentication_required");
    // No exchange is attempted and the flow stays pending.
    assert_eq!(exchanger.call_count(), 0);
    let creds = store.get_credentials(instance.id).await.expect("row");
    assert_eq!(creds.oauth_status, OauthStatus::Pending);
}

#[tokio::test]
async fn completing_a_non_pending_flow_is_rejected() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let cache = Arc::new(CredentialCache::new(0, 4));
    let exchanger = ScriptedExchanger::new();
    let manager = manager_with(&store, &cache, &exchanger);

    let instance = create_oauth_instance(&store, &user, &service, "done").await;
    complete_tokens(&store, instance.id, "tok", 3600, Some("rt")).await;

    let err = manager
        .complete_authorization(instance.id, "seed-state")
        .await
        .expect_err("already completed");
    assert_eq!(err.code(), "reauthentication_required");
}

#[tokio::test]
async fn transient_exchange_failure_leaves_the_flow_pending() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let cache = Arc::new(CredentialCache::new(0, 4));
    let exchanger = ScriptedExchanger::new();
    exchanger.push_error(OauthError::ServiceUnavailable("down".to_owned()));
    let manager = manager_with(&store, &cache, &exchanger);

    let instance = create_oauth_instance(&store, &user, &service, "retry-me").await;
    let creds = store.get_credentials(instance.id).await.expect("row");
    let state = creds.oauth_state.expect("state");

    let err = manager
        .complete_authorization(instance.id, &state)
        .await
        .expect_err("exchange failed");
    assert_eq!(err.code(), "oauth_transient_failure");

    // Pending flows survive transient failures; the user can retry.
    let creds = store.get_credentials(instance.id).await.expect("row");
    assert_eq!(creds.oauth_status, OauthStatus::Pending);
    let entries = store
        .query_audit(instance.id, &AuditFilter::default())
        .await
        .expect("audit");
    assert_eq!(entries[0].status, AuditStatus::Failure);
}

#[tokio::test]
async fn reauthorization_restarts_a_failed_flow() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let cache = Arc::new(CredentialCache::new(0, 4));
    let exchanger = ScriptedExchanger::new();
    let manager = manager_with(&store, &cache, &exchanger);

    let instance = create_oauth_instance(&store, &user, &service, "broken").await;
    complete_tokens(&store, instance.id, "tok", 3600, Some("rt")).await;
    store.mark_oauth_failed(instance.id).await.expect("failed");

    let url = manager
        .begin_reauthorization(user.id, instance.id)
        .await
        .expect("restarted");
    assert!(url.starts_with("https://provider.example/oauth/authorize?"));

    let creds = store.get_credentials(instance.id).await.expect("row");
    assert_eq!(creds.oauth_status, OauthStatus::Pending);
    let fresh_state = creds.oauth_state.expect("new state");
    assert_ne!(fresh_state, "seed-state");

    // The full failed -> pending -> completed edge.
    exchanger.push_token("second-chance", 3600, RefreshMethod::OauthService);
    let completed = manager
        .complete_authorization(instance.id, &fresh_state)
        .await
        .expect("completes again");
    assert_eq!(completed.oauth_status, OauthStatus::Completed);
}

#[tokio::test]
async fn reauthorization_rejects_healthy_flows() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let cache = Arc::new(CredentialCache::new(0, 4));
    let exchanger = ScriptedExchanger::new();
    let manager = manager_with(&store, &cache, &exchanger);

    let instance = create_oauth_instance(&store, &user, &service, "healthy").await;
    complete_tokens(&store, instance.id, "tok", 3600, Some("rt")).await;

    let err = manager
        .begin_reauthorization(user.id, instance.id)
        .await
        .expect_err("completed flows have nothing to restart");
    assert_eq!(err.code(), "conflict");
}
