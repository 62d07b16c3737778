//! Instance, user, and registry operations.
//!
//! `create_instance_tx` carries the create-under-limit contract: the plan
//! counter bump is the transaction's first write, which acquires SQLite's
//! write lock up front and serializes concurrent creators, so the locked
//! count cannot go stale between the check and the insert.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{InstanceStatus, OauthStatus};

use super::models::{
    CredentialsRow, CredentialsSeed, InstanceFilter, InstancePatch, InstanceRow, NewInstance,
    NewServiceType, ServiceTypeRow, UserRow,
};
use super::{Store, StoreError};

impl Store {
    // ── Users ───────────────────────────────────────────────────────────

    /// Create a user and materialize their `free` plan in one transaction.
    ///
    /// `free_max_active` seeds the plan's active-instance quota.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityViolation` on duplicate email, `Unavailable` on
    /// backend failure.
    pub async fn create_user(
        &self,
        email: &str,
        name: Option<&str>,
        free_max_active: u32,
    ) -> Result<UserRow, StoreError> {
        let now = Utc::now();
        let user_id = Uuid::new_v4();
        let plan_id = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO users (id, email, name, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(user_id.to_string())
        .bind(email)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO user_plans \
             (id, user_id, kind, max_instances, total_created, features_json, created_at, updated_at) \
             VALUES (?1, ?2, 'free', ?3, 0, '{}', ?4, ?5)",
        )
        .bind(plan_id.to_string())
        .bind(user_id.to_string())
        .bind(i64::from(free_max_active))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(UserRow {
            id: user_id,
            email: email.to_owned(),
            name: name.map(str::to_owned),
            created_at: now,
            updated_at: now,
        })
    }

    /// Delete a user. Instances, credentials, and plans cascade.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no such user exists.
    pub async fn delete_user(&self, user_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?1")
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ── Registry ────────────────────────────────────────────────────────

    /// Insert a registry entry. Seeded at bootstrap or by an administrator.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityViolation` on duplicate short name or port.
    pub async fn create_service_type(
        &self,
        new: &NewServiceType,
    ) -> Result<ServiceTypeRow, StoreError> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO service_types \
             (id, short_name, display_name, description, icon_url, port, auth_kind, \
              is_active, total_created, active_count, token_url, authorize_url, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, 0, 0, ?8, ?9, ?10, ?11)",
        )
        .bind(id.to_string())
        .bind(&new.short_name)
        .bind(&new.display_name)
        .bind(&new.description)
        .bind(&new.icon_url)
        .bind(new.port)
        .bind(new.auth_kind.as_str())
        .bind(&new.token_url)
        .bind(&new.authorize_url)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_service_type(id).await
    }

    /// Fetch a registry entry by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no such entry exists.
    pub async fn get_service_type(&self, id: Uuid) -> Result<ServiceTypeRow, StoreError> {
        let row = sqlx::query("SELECT * FROM service_types WHERE id = ?1")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        ServiceTypeRow::from_row(&row)
    }

    /// Activate or deactivate a registry entry (administrator action).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no such entry exists.
    pub async fn set_service_type_active(
        &self,
        id: Uuid,
        is_active: bool,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE service_types SET is_active = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(is_active)
                .bind(Utc::now())
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ── Instances ───────────────────────────────────────────────────────

    /// Fetch an instance by id, owner unchecked. Used by the auth pipeline,
    /// where the owner is resolved from the row itself.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no such instance exists.
    pub async fn get_instance(&self, id: Uuid) -> Result<InstanceRow, StoreError> {
        let row = sqlx::query("SELECT * FROM instances WHERE id = ?1")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        InstanceRow::from_row(&row)
    }

    /// Fetch an instance by id, scoped to its owner. Used by the instance
    /// manager so one user can never address another user's instance.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no such instance exists for this owner.
    pub async fn get_instance_for_user(
        &self,
        id: Uuid,
        owner: Uuid,
    ) -> Result<InstanceRow, StoreError> {
        let row = sqlx::query("SELECT * FROM instances WHERE id = ?1 AND user_id = ?2")
            .bind(id.to_string())
            .bind(owner.to_string())
            .fetch_one(&self.pool)
            .await?;
        InstanceRow::from_row(&row)
    }

    /// List a user's instances, newest first, honoring the filter.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on backend failure.
    pub async fn list_user_instances(
        &self,
        user_id: Uuid,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM instances \
             WHERE user_id = ?1 \
               AND (?2 IS NULL OR status = ?2) \
               AND (?3 IS NULL OR oauth_status = ?3) \
               AND (?4 IS NULL OR service_type_id = ?4) \
             ORDER BY created_at DESC",
        )
        .bind(user_id.to_string())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.oauth_status.map(|s| s.as_str()))
        .bind(filter.service_type_id.map(|s| s.to_string()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(InstanceRow::from_row).collect()
    }

    /// Atomically create an instance and its credentials, enforcing the
    /// plan's active-instance quota inside the same transaction.
    ///
    /// The quota counts rows in `status = active AND oauth_status =
    /// completed`. Api-key seeds complete immediately; OAuth seeds start
    /// `pending` and only count once the flow finishes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LimitReached`] when the quota is exhausted,
    /// `IntegrityViolation` when the seed violates credential-shape, and
    /// `NotFound` when the user has no plan or the service type is missing.
    pub async fn create_instance_tx(
        &self,
        new: &NewInstance,
        seed: &CredentialsSeed,
    ) -> Result<(InstanceRow, CredentialsRow), StoreError> {
        seed.validate_shape()?;
        let now = Utc::now();
        let instance_id = Uuid::new_v4();
        let credentials_id = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;

        // First write in the transaction takes SQLite's write lock, so
        // concurrent creators for any user serialize here and the count
        // below cannot go stale before commit.
        let bumped = sqlx::query(
            "UPDATE user_plans \
             SET total_created = total_created + 1, updated_at = ?1 \
             WHERE user_id = ?2",
        )
        .bind(now)
        .bind(new.user_id.to_string())
        .execute(&mut *tx)
        .await?;
        if bumped.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        let max_instances: Option<i64> =
            sqlx::query_scalar("SELECT max_instances FROM user_plans WHERE user_id = ?1")
                .bind(new.user_id.to_string())
                .fetch_one(&mut *tx)
                .await?;

        let current: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM instances \
             WHERE user_id = ?1 AND status = 'active' AND oauth_status = 'completed'",
        )
        .bind(new.user_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        if let Some(max) = max_instances {
            if current >= max {
                // Dropping the transaction rolls back the counter bump.
                return Err(StoreError::LimitReached {
                    current: u32::try_from(current).unwrap_or(u32::MAX),
                    max: u32::try_from(max).unwrap_or(u32::MAX),
                });
            }
        }

        let service_row = sqlx::query("SELECT * FROM service_types WHERE id = ?1")
            .bind(new.service_type_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let service = ServiceTypeRow::from_row(&service_row)?;

        // Api-key instances have no exchange to run; they are completed on
        // creation. OAuth instances wait for the callback sink.
        let (oauth_status, oauth_completed_at) = if seed.is_api_key() {
            (OauthStatus::Completed, Some(now))
        } else {
            (OauthStatus::Pending, None)
        };
        if seed.is_api_key() != matches!(service.auth_kind, crate::types::AuthKind::ApiKey) {
            return Err(StoreError::IntegrityViolation(format!(
                "credential shape does not match service type auth kind {}",
                service.auth_kind.as_str()
            )));
        }

        sqlx::query(
            "INSERT INTO instances \
             (id, user_id, service_type_id, custom_name, status, oauth_status, expires_at, \
              usage_count, renewed_count, version, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, 0, 0, 1, ?7, ?8)",
        )
        .bind(instance_id.to_string())
        .bind(new.user_id.to_string())
        .bind(new.service_type_id.to_string())
        .bind(&new.custom_name)
        .bind(oauth_status.as_str())
        .bind(new.expires_at)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO credentials \
             (id, instance_id, api_key, client_id, client_secret, token_scope, \
              oauth_status, oauth_completed_at, oauth_authorization_url, oauth_state, \
              version, last_modified, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?12, ?13)",
        )
        .bind(credentials_id.to_string())
        .bind(instance_id.to_string())
        .bind(&seed.api_key)
        .bind(&seed.client_id)
        .bind(&seed.client_secret)
        .bind(&seed.token_scope)
        .bind(oauth_status.as_str())
        .bind(oauth_completed_at)
        .bind(&seed.oauth_authorization_url)
        .bind(&seed.oauth_state)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE service_types \
             SET total_created = total_created + 1, active_count = active_count + 1, \
                 updated_at = ?1 \
             WHERE id = ?2",
        )
        .bind(now)
        .bind(new.service_type_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let instance = self.get_instance(instance_id).await?;
        let creds = self.get_credentials(instance_id).await?;
        Ok((instance, creds))
    }

    /// Apply a selective update to an instance owned by `owner`.
    ///
    /// Reads the row, applies the patch, writes every field back, and bumps
    /// the version counter.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no such instance exists for this owner.
    pub async fn update_instance_fields(
        &self,
        id: Uuid,
        owner: Uuid,
        patch: &InstancePatch,
    ) -> Result<InstanceRow, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM instances WHERE id = ?1 AND user_id = ?2")
            .bind(id.to_string())
            .bind(owner.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let current = InstanceRow::from_row(&row)?;

        let custom_name = patch.custom_name.clone().unwrap_or(current.custom_name);
        let status = patch.status.unwrap_or(current.status);
        let oauth_status = patch.oauth_status.unwrap_or(current.oauth_status);
        let expires_at = match patch.expires_at {
            Some(value) => value,
            None => current.expires_at,
        };

        sqlx::query(
            "UPDATE instances \
             SET custom_name = ?1, status = ?2, oauth_status = ?3, expires_at = ?4, \
                 version = version + 1, updated_at = ?5 \
             WHERE id = ?6",
        )
        .bind(&custom_name)
        .bind(status.as_str())
        .bind(oauth_status.as_str())
        .bind(expires_at)
        .bind(now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        // Keep the registry's active counter in step with status flips.
        let delta = match (current.status, status) {
            (InstanceStatus::Active, s) if s != InstanceStatus::Active => Some(-1),
            (s, InstanceStatus::Active) if s != InstanceStatus::Active => Some(1),
            _ => None,
        };
        if let Some(delta) = delta {
            sqlx::query(
                "UPDATE service_types SET active_count = active_count + ?1, updated_at = ?2 \
                 WHERE id = ?3",
            )
            .bind(delta)
            .bind(now)
            .bind(current.service_type_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.get_instance(id).await
    }

    /// Delete an instance owned by `owner`. Credentials cascade.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no such instance exists for this owner.
    pub async fn delete_instance(&self, id: Uuid, owner: Uuid) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM instances WHERE id = ?1 AND user_id = ?2")
            .bind(id.to_string())
            .bind(owner.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let current = InstanceRow::from_row(&row)?;

        sqlx::query("DELETE FROM instances WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        if current.status == InstanceStatus::Active {
            sqlx::query(
                "UPDATE service_types SET active_count = active_count - 1, updated_at = ?1 \
                 WHERE id = ?2",
            )
            .bind(now)
            .bind(current.service_type_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Count a user's instances in `status = active AND oauth_status =
    /// completed` — the quota-relevant set.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on backend failure.
    pub async fn count_active_completed(&self, user_id: Uuid) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM instances \
             WHERE user_id = ?1 AND status = 'active' AND oauth_status = 'completed'",
        )
        .bind(user_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Best-effort usage bookkeeping: bump `usage_count` and `last_used_at`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the instance vanished.
    pub async fn touch_usage(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE instances \
             SET usage_count = usage_count + 1, last_used_at = ?1, updated_at = ?1 \
             WHERE id = ?2",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Renew an expired or expiring instance: new expiry, back to `active`,
    /// renewal counters bumped. OAuth status is untouched — stale tokens
    /// refresh lazily on the next authenticated call.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no such instance exists for this owner.
    pub async fn renew_instance(
        &self,
        id: Uuid,
        owner: Uuid,
        new_expires_at: Option<DateTime<Utc>>,
    ) -> Result<InstanceRow, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM instances WHERE id = ?1 AND user_id = ?2")
            .bind(id.to_string())
            .bind(owner.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let current = InstanceRow::from_row(&row)?;

        sqlx::query(
            "UPDATE instances \
             SET status = 'active', expires_at = ?1, renewed_count = renewed_count + 1, \
                 last_renewed_at = ?2, version = version + 1, updated_at = ?2 \
             WHERE id = ?3",
        )
        .bind(new_expires_at)
        .bind(now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        if current.status != InstanceStatus::Active {
            sqlx::query(
                "UPDATE service_types SET active_count = active_count + 1, updated_at = ?1 \
                 WHERE id = ?2",
            )
            .bind(now)
            .bind(current.service_type_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.get_instance(id).await
    }

    // ── Sweep queries (maintenance) ─────────────────────────────────────

    /// Instances in one lifecycle status, oldest update first.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on backend failure.
    pub async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
        limit: u32,
    ) -> Result<Vec<InstanceRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM instances WHERE status = ?1 ORDER BY updated_at ASC LIMIT ?2",
        )
        .bind(status.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(InstanceRow::from_row).collect()
    }

    /// Instances whose `expires_at` has passed but whose status has not
    /// caught up. An instance expiring exactly at `now` is due.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on backend failure.
    pub async fn list_expired_instances(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<InstanceRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM instances \
             WHERE expires_at IS NOT NULL AND expires_at <= ?1 AND status != 'expired' \
             ORDER BY expires_at ASC LIMIT ?2",
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(InstanceRow::from_row).collect()
    }

    /// Instances whose OAuth flow failed.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on backend failure.
    pub async fn list_failed_oauth_instances(
        &self,
        limit: u32,
    ) -> Result<Vec<InstanceRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM instances WHERE oauth_status = 'failed' \
             ORDER BY updated_at ASC LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(InstanceRow::from_row).collect()
    }

    /// Instances stuck in `pending` OAuth since before `older_than`.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on backend failure.
    pub async fn list_stale_pending_oauth(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<InstanceRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM instances \
             WHERE oauth_status = 'pending' AND updated_at < ?1 \
             ORDER BY updated_at ASC LIMIT ?2",
        )
        .bind(older_than)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(InstanceRow::from_row).collect()
    }

    /// Flip a batch of instances to `expired` in one transaction, keeping
    /// the registry's active counters in step.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on backend failure.
    pub async fn bulk_mark_expired(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut updated = 0u64;

        for id in ids {
            let row = sqlx::query("SELECT * FROM instances WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else { continue };
            let current = InstanceRow::from_row(&row)?;
            if current.status == InstanceStatus::Expired {
                continue;
            }

            sqlx::query(
                "UPDATE instances \
                 SET status = 'expired', version = version + 1, updated_at = ?1 \
                 WHERE id = ?2",
            )
            .bind(now)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

            if current.status == InstanceStatus::Active {
                sqlx::query(
                    "UPDATE service_types SET active_count = active_count - 1, updated_at = ?1 \
                     WHERE id = ?2",
                )
                .bind(now)
                .bind(current.service_type_id.to_string())
                .execute(&mut *tx)
                .await?;
            }
            updated += 1;
        }

        tx.commit().await?;
        Ok(updated)
    }

    /// Set only the instance-side OAuth status (the credentials row is
    /// handled by its own operations).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no such instance exists.
    pub async fn mark_instance_oauth_status(
        &self,
        id: Uuid,
        status: OauthStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE instances \
             SET oauth_status = ?1, version = version + 1, updated_at = ?2 \
             WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
