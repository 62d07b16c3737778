//! Plan administration: tier changes, quotas, and the features document.

use straylight::store::models::PlanFeatures;
use straylight::types::PlanKind;

use crate::support::{create_api_instance, memory_store, seed_api_service, seed_user};

#[tokio::test]
async fn upgrading_to_pro_lifts_the_quota() {
    let store = memory_store().await;
    let user = seed_user(&store, 1).await;
    let service = seed_api_service(&store).await;

    create_api_instance(&store, &user, &service, "only-slot").await;

    // `None` encodes an unlimited quota.
    let plan = store
        .set_plan(user.id, PlanKind::Pro, None, None)
        .await
        .expect("upgraded");
    assert_eq!(plan.kind, PlanKind::Pro);
    assert_eq!(plan.max_instances, None);

    for name in ["second", "third", "fourth"] {
        create_api_instance(&store, &user, &service, name).await;
    }
    assert_eq!(
        store.count_active_completed(user.id).await.expect("count"),
        4
    );
}

#[tokio::test]
async fn features_document_round_trips() {
    let store = memory_store().await;
    let user = seed_user(&store, 1).await;

    let features = PlanFeatures {
        api_access: true,
        priority_refresh: true,
        max_requests_per_day: Some(10_000),
    };
    store
        .set_plan_features(user.id, &features)
        .await
        .expect("features written");

    let plan = store.get_plan(user.id).await.expect("plan");
    assert_eq!(plan.features, features);
}

#[tokio::test]
async fn downgrade_restores_a_finite_quota() {
    let store = memory_store().await;
    let user = seed_user(&store, 1).await;

    store
        .set_plan(user.id, PlanKind::Pro, None, None)
        .await
        .expect("upgraded");
    let plan = store
        .set_plan(user.id, PlanKind::Free, Some(3), None)
        .await
        .expect("downgraded");
    assert_eq!(plan.kind, PlanKind::Free);
    assert_eq!(plan.max_instances, Some(3));
}
