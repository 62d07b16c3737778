//! Create-under-limit through the manager, including the concurrent case.

use std::sync::Arc;

use straylight::cache::CredentialCache;
use straylight::instances::InstanceManager;
use straylight::oauth::TokenExchanger;
use straylight::store::models::CredentialsSeed;
use straylight::store::Store;
use straylight::types::{GatewayError, OauthStatus};

use crate::support::{
    memory_store, seed_api_service, seed_oauth_service, seed_user, ScriptedExchanger,
};

fn manager(store: &Store, cache: &Arc<CredentialCache>) -> Arc<InstanceManager> {
    let exchanger = ScriptedExchanger::new();
    Arc::new(InstanceManager::new(
        store.clone(),
        Arc::clone(cache),
        exchanger as Arc<dyn TokenExchanger>,
    ))
}

fn api_seed(key: &str) -> CredentialsSeed {
    CredentialsSeed {
        api_key: Some(key.to_owned()),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_admit_exactly_one_under_a_quota_of_one() {
    let store = memory_store().await;
    let user = seed_user(&store, 1).await;
    let service = seed_api_service(&store).await;
    let cache = Arc::new(CredentialCache::new(0, 4));
    let manager = manager(&store, &cache);

    let first = {
        let manager = Arc::clone(&manager);
        let user_id = user.id;
        let service_id = service.id;
        tokio::spawn(async move {
            manager
                .create(user_id, service_id, "left", api_seed("key-left"), None)
                .await
        })
    };
    let second = {
        let manager = Arc::clone(&manager);
        let user_id = user.id;
        let service_id = service.id;
        tokio::spawn(async move {
            manager
                .create(user_id, service_id, "right", api_seed("key-right"), None)
                .await
        })
    };

    let results = [
        first.await.expect("task joined"),
        second.await.expect("task joined"),
    ];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one create may win");

    let loser = results
        .into_iter()
        .find_map(Result::err)
        .expect("one create must lose");
    match &loser {
        GatewayError::ActiveLimitReached { current, max } => {
            assert_eq!(*current, 1);
            assert_eq!(*max, 1);
        }
        other => panic!("expected ActiveLimitReached, got {other:?}"),
    }

    // The envelope carries the counts the UI shows.
    let envelope = loser.envelope();
    assert_eq!(envelope.details.expect("details")["currentCount"], 1);

    assert_eq!(
        store.count_active_completed(user.id).await.expect("count"),
        1
    );
}

#[tokio::test]
async fn oauth_create_returns_an_authorization_url() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let cache = Arc::new(CredentialCache::new(0, 4));
    let manager = manager(&store, &cache);

    let seed = CredentialsSeed {
        client_id: Some("client-id".to_owned()),
        client_secret: Some("client-secret".to_owned()),
        token_scope: Some("mail.read".to_owned()),
        ..Default::default()
    };
    let created = manager
        .create(user.id, service.id, "inbox", seed, None)
        .await
        .expect("created");

    assert_eq!(created.instance.oauth_status, OauthStatus::Pending);
    let url = created.authorization_url.expect("authorization url");
    assert!(url.starts_with("https://provider.example/oauth/authorize?"));
    assert!(url.contains("client_id=client-id"));
    assert!(url.contains("scope=mail.read"));

    // The flow bookkeeping is on the credentials row.
    let creds = store
        .get_credentials(created.instance.id)
        .await
        .expect("credentials");
    assert!(creds.oauth_state.is_some());
    assert_eq!(creds.oauth_authorization_url.as_deref(), Some(url.as_str()));
}

#[tokio::test]
async fn api_key_create_skips_the_flow() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_api_service(&store).await;
    let cache = Arc::new(CredentialCache::new(0, 4));
    let manager = manager(&store, &cache);

    let created = manager
        .create(user.id, service.id, "keyed", api_seed("sk-live"), None)
        .await
        .expect("created");
    assert!(created.authorization_url.is_none());
    assert_eq!(created.instance.oauth_status, OauthStatus::Completed);
}

#[tokio::test]
async fn create_rejects_deactivated_and_unknown_service_types() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_api_service(&store).await;
    let cache = Arc::new(CredentialCache::new(0, 4));
    let manager = manager(&store, &cache);

    store
        .set_service_type_active(service.id, false)
        .await
        .expect("deactivated");
    let err = manager
        .create(user.id, service.id, "nope", api_seed("k"), None)
        .await
        .expect_err("deactivated service");
    assert_eq!(err.code(), "service_unavailable");

    let err = manager
        .create(user.id, uuid::Uuid::new_v4(), "ghost", api_seed("k"), None)
        .await
        .expect_err("unknown service");
    assert_eq!(err.code(), "service_unavailable");
}

#[tokio::test]
async fn oauth_create_requires_a_client_pair() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let cache = Arc::new(CredentialCache::new(0, 4));
    let manager = manager(&store, &cache);

    let err = manager
        .create(
            user.id,
            service.id,
            "half",
            CredentialsSeed::default(),
            None,
        )
        .await
        .expect_err("missing client pair");
    assert_eq!(err.code(), "invalid_credentials_shape");
}
