//! User plan operations.
//!
//! Plans are materialized at user creation (see `create_user`); these
//! operations read and administer them afterwards.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::PlanKind;

use super::models::{PlanFeatures, UserPlanRow};
use super::{Store, StoreError};

impl Store {
    /// Fetch a user's plan.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the user has no plan row.
    pub async fn get_plan(&self, user_id: Uuid) -> Result<UserPlanRow, StoreError> {
        let row = sqlx::query("SELECT * FROM user_plans WHERE user_id = ?1")
            .bind(user_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        UserPlanRow::from_row(&row)
    }

    /// Replace a user's plan tier and quota. `max_instances = None` encodes
    /// an unlimited quota (the `pro` tier).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the user has no plan row.
    pub async fn set_plan(
        &self,
        user_id: Uuid,
        kind: PlanKind,
        max_instances: Option<i64>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<UserPlanRow, StoreError> {
        let result = sqlx::query(
            "UPDATE user_plans \
             SET kind = ?1, max_instances = ?2, expires_at = ?3, updated_at = ?4 \
             WHERE user_id = ?5",
        )
        .bind(kind.as_str())
        .bind(max_instances)
        .bind(expires_at)
        .bind(Utc::now())
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_plan(user_id).await
    }

    /// Replace a plan's feature document.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the user has no plan row.
    pub async fn set_plan_features(
        &self,
        user_id: Uuid,
        features: &PlanFeatures,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(features)?;
        let result = sqlx::query(
            "UPDATE user_plans SET features_json = ?1, updated_at = ?2 WHERE user_id = ?3",
        )
        .bind(json)
        .bind(Utc::now())
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
