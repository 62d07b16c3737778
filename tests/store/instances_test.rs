//! Instance CRUD, the create-under-limit transaction, and sweep queries.

use chrono::{Duration, Utc};
use uuid::Uuid;

use straylight::store::models::{CredentialsSeed, InstanceFilter, InstancePatch, NewInstance};
use straylight::store::StoreError;
use straylight::types::{InstanceStatus, OauthStatus, PlanKind};

use crate::support::{
    create_api_instance, create_oauth_instance, memory_store, seed_api_service,
    seed_oauth_service, seed_user,
};

#[tokio::test]
async fn creating_a_user_materializes_a_free_plan() {
    let store = memory_store().await;
    let user = seed_user(&store, 1).await;

    let plan = store.get_plan(user.id).await.expect("plan exists");
    assert_eq!(plan.kind, PlanKind::Free);
    assert_eq!(plan.max_instances, Some(1));
    assert_eq!(plan.total_created, 0);
}

#[tokio::test]
async fn api_key_instance_completes_on_creation() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_api_service(&store).await;

    let instance = create_api_instance(&store, &user, &service, "mail").await;
    assert_eq!(instance.status, InstanceStatus::Active);
    assert_eq!(instance.oauth_status, OauthStatus::Completed);

    let creds = store.get_credentials(instance.id).await.expect("credentials");
    assert_eq!(creds.oauth_status, OauthStatus::Completed);
    assert!(creds.oauth_completed_at.is_some());
    assert!(creds.api_key.is_some());
    assert!(creds.client_id.is_none());

    let refreshed_service = store.get_service_type(service.id).await.expect("service");
    assert_eq!(refreshed_service.total_created, 1);
    assert_eq!(refreshed_service.active_count, 1);

    let plan = store.get_plan(user.id).await.expect("plan");
    assert_eq!(plan.total_created, 1);
}

#[tokio::test]
async fn oauth_instance_starts_pending_with_flow_bookkeeping() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;

    let instance = create_oauth_instance(&store, &user, &service, "gh").await;
    assert_eq!(instance.oauth_status, OauthStatus::Pending);

    let creds = store.get_credentials(instance.id).await.expect("credentials");
    assert_eq!(creds.oauth_status, OauthStatus::Pending);
    assert!(creds.oauth_completed_at.is_none());
    assert!(creds.oauth_state.is_some());
    assert!(creds.oauth_authorization_url.is_some());
    assert!(creds.access_token.is_none());
}

#[tokio::test]
async fn create_rejects_when_quota_is_exhausted() {
    let store = memory_store().await;
    let user = seed_user(&store, 1).await;
    let service = seed_api_service(&store).await;

    create_api_instance(&store, &user, &service, "first").await;

    let seed = CredentialsSeed {
        api_key: Some("key-second".to_owned()),
        ..Default::default()
    };
    let new = NewInstance {
        user_id: user.id,
        service_type_id: service.id,
        custom_name: "second".to_owned(),
        expires_at: None,
    };
    let err = store
        .create_instance_tx(&new, &seed)
        .await
        .expect_err("quota is full");
    match err {
        StoreError::LimitReached { current, max } => {
            assert_eq!(current, 1);
            assert_eq!(max, 1);
        }
        other => panic!("expected LimitReached, got {other:?}"),
    }

    // The rolled-back create must not leak a plan counter bump.
    let plan = store.get_plan(user.id).await.expect("plan");
    assert_eq!(plan.total_created, 1);
}

#[tokio::test]
async fn pending_oauth_instances_do_not_count_against_the_quota() {
    let store = memory_store().await;
    let user = seed_user(&store, 1).await;
    let service = seed_oauth_service(&store).await;

    // Two pending OAuth instances fit under a quota of one, because the
    // quota counts active AND completed.
    create_oauth_instance(&store, &user, &service, "one").await;
    create_oauth_instance(&store, &user, &service, "two").await;

    assert_eq!(
        store.count_active_completed(user.id).await.expect("count"),
        0
    );
}

#[tokio::test]
async fn create_rejects_malformed_credential_shapes() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_api_service(&store).await;

    let new = NewInstance {
        user_id: user.id,
        service_type_id: service.id,
        custom_name: "bad".to_owned(),
        expires_at: None,
    };

    let neither = CredentialsSeed::default();
    assert!(matches!(
        store.create_instance_tx(&new, &neither).await,
        Err(StoreError::IntegrityViolation(_))
    ));

    let both = CredentialsSeed {
        api_key: Some("k".to_owned()),
        client_id: Some("c".to_owned()),
        client_secret: Some("s".to_owned()),
        ..Default::default()
    };
    assert!(matches!(
        store.create_instance_tx(&new, &both).await,
        Err(StoreError::IntegrityViolation(_))
    ));
}

#[tokio::test]
async fn create_rejects_seed_mismatched_with_auth_kind() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let oauth_service = seed_oauth_service(&store).await;

    // An api-key seed against an OAuth service type is a shape error.
    let seed = CredentialsSeed {
        api_key: Some("key".to_owned()),
        ..Default::default()
    };
    let new = NewInstance {
        user_id: user.id,
        service_type_id: oauth_service.id,
        custom_name: "mismatch".to_owned(),
        expires_at: None,
    };
    assert!(matches!(
        store.create_instance_tx(&new, &seed).await,
        Err(StoreError::IntegrityViolation(_))
    ));
}

#[tokio::test]
async fn schema_check_rejects_rows_that_bypass_validation() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_api_service(&store).await;
    let instance = create_api_instance(&store, &user, &service, "direct").await;

    // Write a row violating credential-shape straight through the pool;
    // the schema CHECK is the second line of defense.
    let result = sqlx::query(
        "UPDATE credentials SET client_id = 'c', client_secret = 's' WHERE instance_id = ?1",
    )
    .bind(instance.id.to_string())
    .execute(store.pool())
    .await;
    assert!(result.is_err(), "CHECK constraint must reject mixed shape");
}

#[tokio::test]
async fn patch_updates_fields_and_bumps_version() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_api_service(&store).await;
    let instance = create_api_instance(&store, &user, &service, "patchme").await;

    let patch = InstancePatch {
        status: Some(InstanceStatus::Inactive),
        custom_name: Some("renamed".to_owned()),
        ..Default::default()
    };
    let updated = store
        .update_instance_fields(instance.id, user.id, &patch)
        .await
        .expect("patched");
    assert_eq!(updated.status, InstanceStatus::Inactive);
    assert_eq!(updated.custom_name, "renamed");
    assert_eq!(updated.version, instance.version + 1);

    // Deactivation releases the registry's active slot.
    let service = store.get_service_type(service.id).await.expect("service");
    assert_eq!(service.active_count, 0);
}

#[tokio::test]
async fn patch_is_scoped_to_the_owner() {
    let store = memory_store().await;
    let owner = seed_user(&store, 5).await;
    let stranger = seed_user(&store, 5).await;
    let service = seed_api_service(&store).await;
    let instance = create_api_instance(&store, &owner, &service, "mine").await;

    let patch = InstancePatch {
        custom_name: Some("stolen".to_owned()),
        ..Default::default()
    };
    assert!(matches!(
        store
            .update_instance_fields(instance.id, stranger.id, &patch)
            .await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn delete_cascades_to_credentials() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_api_service(&store).await;
    let instance = create_api_instance(&store, &user, &service, "gone").await;

    store
        .delete_instance(instance.id, user.id)
        .await
        .expect("deleted");
    assert!(matches!(
        store.get_credentials(instance.id).await,
        Err(StoreError::NotFound)
    ));
    assert!(matches!(
        store.get_instance(instance.id).await,
        Err(StoreError::NotFound)
    ));

    let service = store.get_service_type(service.id).await.expect("service");
    assert_eq!(service.active_count, 0);
}

#[tokio::test]
async fn deleting_a_user_cascades_transitively() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_api_service(&store).await;
    let instance = create_api_instance(&store, &user, &service, "cascade").await;

    store.delete_user(user.id).await.expect("user deleted");
    assert!(matches!(
        store.get_instance(instance.id).await,
        Err(StoreError::NotFound)
    ));
    assert!(matches!(
        store.get_plan(user.id).await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn usage_touch_bumps_counters() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_api_service(&store).await;
    let instance = create_api_instance(&store, &user, &service, "busy").await;

    store.touch_usage(instance.id).await.expect("touched");
    store.touch_usage(instance.id).await.expect("touched");

    let row = store.get_instance(instance.id).await.expect("row");
    assert_eq!(row.usage_count, 2);
    assert!(row.last_used_at.is_some());

    assert!(matches!(
        store.touch_usage(Uuid::new_v4()).await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn listing_honors_filters() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_api_service(&store).await;
    let first = create_api_instance(&store, &user, &service, "a").await;
    create_api_instance(&store, &user, &service, "b").await;

    store
        .update_instance_fields(
            first.id,
            user.id,
            &InstancePatch {
                status: Some(InstanceStatus::Inactive),
                ..Default::default()
            },
        )
        .await
        .expect("patched");

    let all = store
        .list_user_instances(user.id, &InstanceFilter::default())
        .await
        .expect("list");
    assert_eq!(all.len(), 2);

    let inactive = store
        .list_user_instances(
            user.id,
            &InstanceFilter {
                status: Some(InstanceStatus::Inactive),
                ..Default::default()
            },
        )
        .await
        .expect("list");
    assert_eq!(inactive.len(), 1);
    assert_eq!(inactive[0].id, first.id);
}

#[tokio::test]
async fn expiry_sweep_includes_the_boundary_instant() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_api_service(&store).await;

    let seed = CredentialsSeed {
        api_key: Some("key-exp".to_owned()),
        ..Default::default()
    };
    let expires_at = Utc::now();
    let new = NewInstance {
        user_id: user.id,
        service_type_id: service.id,
        custom_name: "deadline".to_owned(),
        expires_at: Some(expires_at),
    };
    let (instance, _) = store.create_instance_tx(&new, &seed).await.expect("created");

    // An instance with expires_at == now is already due.
    let due = store
        .list_expired_instances(expires_at, 10)
        .await
        .expect("due list");
    assert!(due.iter().any(|i| i.id == instance.id));

    let marked = store.bulk_mark_expired(&[instance.id]).await.expect("marked");
    assert_eq!(marked, 1);
    let row = store.get_instance(instance.id).await.expect("row");
    assert_eq!(row.status, InstanceStatus::Expired);

    // Second sweep finds nothing and marking is idempotent.
    let due = store
        .list_expired_instances(Utc::now(), 10)
        .await
        .expect("due list");
    assert!(due.is_empty());
    assert_eq!(store.bulk_mark_expired(&[instance.id]).await.expect("ok"), 0);
}

#[tokio::test]
async fn stale_pending_sweep_finds_old_flows() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_oauth_service(&store).await;
    let instance = create_oauth_instance(&store, &user, &service, "stuck").await;

    // Rows younger than the cutoff stay.
    let fresh = store
        .list_stale_pending_oauth(Utc::now() - Duration::minutes(5), 10)
        .await
        .expect("list");
    assert!(fresh.is_empty());

    // With the cutoff ahead of the row's updated_at, it is stale.
    let stale = store
        .list_stale_pending_oauth(Utc::now() + Duration::seconds(1), 10)
        .await
        .expect("list");
    assert!(stale.iter().any(|i| i.id == instance.id));
}

#[tokio::test]
async fn renewal_reactivates_and_counts() {
    let store = memory_store().await;
    let user = seed_user(&store, 5).await;
    let service = seed_api_service(&store).await;

    let seed = CredentialsSeed {
        api_key: Some("key-renew".to_owned()),
        ..Default::default()
    };
    let new = NewInstance {
        user_id: user.id,
        service_type_id: service.id,
        custom_name: "renewable".to_owned(),
        expires_at: Some(Utc::now() - Duration::hours(1)),
    };
    let (instance, _) = store.create_instance_tx(&new, &seed).await.expect("created");
    store.bulk_mark_expired(&[instance.id]).await.expect("expired");

    let later = Utc::now() + Duration::days(30);
    let renewed = store
        .renew_instance(instance.id, user.id, Some(later))
        .await
        .expect("renewed");
    assert_eq!(renewed.status, InstanceStatus::Active);
    assert_eq!(renewed.renewed_count, 1);
    assert!(renewed.last_renewed_at.is_some());
    // Renewal does not touch the OAuth state machine.
    assert_eq!(renewed.oauth_status, instance.oauth_status);

    let service = store.get_service_type(service.id).await.expect("service");
    assert_eq!(service.active_count, 1);
}
