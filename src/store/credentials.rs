//! Credentials row operations.
//!
//! Token writes are serialized by the version counter: `update_credentials_cas`
//! supplies the expected version and fails with `Conflict` on mismatch, and
//! the unconditional variant exists for the losing writer to accept
//! latest-writer-wins. Every token write also stamps the parent instance's
//! `credentials_updated_at`, which is what cache reconciliation compares
//! against.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{CredentialsRow, TokenWrite};
use super::{Store, StoreError};

impl Store {
    /// Fetch the credentials child row for an instance.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the instance has no credentials row.
    pub async fn get_credentials(&self, instance_id: Uuid) -> Result<CredentialsRow, StoreError> {
        let row = sqlx::query("SELECT * FROM credentials WHERE instance_id = ?1")
            .bind(instance_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        CredentialsRow::from_row(&row)
    }

    /// Compare-and-swap token write: succeeds only when the stored version
    /// still equals `expected_version`, and bumps it by exactly one.
    ///
    /// Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when another writer got there first, `NotFound`
    /// when the row does not exist.
    pub async fn update_credentials_cas(
        &self,
        instance_id: Uuid,
        expected_version: i64,
        write: &TokenWrite,
    ) -> Result<i64, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE credentials \
             SET access_token = ?1, \
                 refresh_token = COALESCE(?2, refresh_token), \
                 token_expires_at = ?3, \
                 token_scope = COALESCE(?4, token_scope), \
                 version = version + 1, last_modified = ?5, updated_at = ?5 \
             WHERE instance_id = ?6 AND version = ?7",
        )
        .bind(&write.access_token)
        .bind(&write.refresh_token)
        .bind(write.token_expires_at)
        .bind(&write.token_scope)
        .bind(now)
        .bind(instance_id.to_string())
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a lost race from a missing row.
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT version FROM credentials WHERE instance_id = ?1")
                    .bind(instance_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?;
            return match exists {
                Some(_) => Err(StoreError::Conflict),
                None => Err(StoreError::NotFound),
            };
        }

        self.stamp_credentials_updated(&mut tx, instance_id, now).await?;
        tx.commit().await?;
        Ok(expected_version + 1)
    }

    /// Unconditional token write, used after a CAS conflict: another
    /// process already refreshed; accept this write as the new baseline.
    ///
    /// Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the row does not exist.
    pub async fn update_credentials_unconditional(
        &self,
        instance_id: Uuid,
        write: &TokenWrite,
    ) -> Result<i64, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE credentials \
             SET access_token = ?1, \
                 refresh_token = COALESCE(?2, refresh_token), \
                 token_expires_at = ?3, \
                 token_scope = COALESCE(?4, token_scope), \
                 version = version + 1, last_modified = ?5, updated_at = ?5 \
             WHERE instance_id = ?6",
        )
        .bind(&write.access_token)
        .bind(&write.refresh_token)
        .bind(write.token_expires_at)
        .bind(&write.token_scope)
        .bind(now)
        .bind(instance_id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        let version: i64 =
            sqlx::query_scalar("SELECT version FROM credentials WHERE instance_id = ?1")
                .bind(instance_id.to_string())
                .fetch_one(&mut *tx)
                .await?;

        self.stamp_credentials_updated(&mut tx, instance_id, now).await?;
        tx.commit().await?;
        Ok(version)
    }

    /// Transition both credentials and instance to `failed` after a
    /// rejected refresh token or an abandoned flow. Stored tokens are left
    /// untouched; a completion timestamp is set if the row never had one.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the row does not exist.
    pub async fn mark_oauth_failed(&self, instance_id: Uuid) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE credentials \
             SET oauth_status = 'failed', \
                 oauth_completed_at = COALESCE(oauth_completed_at, ?1), \
                 version = version + 1, last_modified = ?1, updated_at = ?1 \
             WHERE instance_id = ?2",
        )
        .bind(now)
        .bind(instance_id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        sqlx::query(
            "UPDATE instances \
             SET oauth_status = 'failed', version = version + 1, updated_at = ?1 \
             WHERE id = ?2",
        )
        .bind(now)
        .bind(instance_id.to_string())
        .execute(&mut *tx)
        .await?;

        self.stamp_credentials_updated(&mut tx, instance_id, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Complete an authorization flow: write the first token set, clear the
    /// flow bookkeeping, and flip both rows to `completed`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the row does not exist.
    pub async fn complete_oauth(
        &self,
        instance_id: Uuid,
        write: &TokenWrite,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE credentials \
             SET access_token = ?1, refresh_token = ?2, token_expires_at = ?3, \
                 token_scope = COALESCE(?4, token_scope), \
                 oauth_status = 'completed', oauth_completed_at = ?5, \
                 oauth_authorization_url = NULL, oauth_state = NULL, \
                 version = version + 1, last_modified = ?5, updated_at = ?5 \
             WHERE instance_id = ?6",
        )
        .bind(&write.access_token)
        .bind(&write.refresh_token)
        .bind(write.token_expires_at)
        .bind(&write.token_scope)
        .bind(now)
        .bind(instance_id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        sqlx::query(
            "UPDATE instances \
             SET oauth_status = 'completed', version = version + 1, updated_at = ?1 \
             WHERE id = ?2",
        )
        .bind(now)
        .bind(instance_id.to_string())
        .execute(&mut *tx)
        .await?;

        self.stamp_credentials_updated(&mut tx, instance_id, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Restart a failed flow: back to `pending` with fresh flow
    /// bookkeeping and no completion timestamp.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the row does not exist.
    pub async fn reset_oauth_pending(
        &self,
        instance_id: Uuid,
        authorization_url: &str,
        state: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE credentials \
             SET oauth_status = 'pending', oauth_completed_at = NULL, \
                 oauth_authorization_url = ?1, oauth_state = ?2, \
                 version = version + 1, last_modified = ?3, updated_at = ?3 \
             WHERE instance_id = ?4",
        )
        .bind(authorization_url)
        .bind(state)
        .bind(now)
        .bind(instance_id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        sqlx::query(
            "UPDATE instances \
             SET oauth_status = 'pending', version = version + 1, updated_at = ?1 \
             WHERE id = ?2",
        )
        .bind(now)
        .bind(instance_id.to_string())
        .execute(&mut *tx)
        .await?;

        self.stamp_credentials_updated(&mut tx, instance_id, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Transition a completed credential whose token is past hard expiry
    /// (and unrefreshable) to `expired`, on both rows.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the row does not exist.
    pub async fn mark_token_expired(&self, instance_id: Uuid) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE credentials \
             SET oauth_status = 'expired', \
                 oauth_completed_at = COALESCE(oauth_completed_at, ?1), \
                 version = version + 1, last_modified = ?1, updated_at = ?1 \
             WHERE instance_id = ?2 AND oauth_status = 'completed'",
        )
        .bind(now)
        .bind(instance_id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        sqlx::query(
            "UPDATE instances \
             SET oauth_status = 'expired', version = version + 1, updated_at = ?1 \
             WHERE id = ?2",
        )
        .bind(now)
        .bind(instance_id.to_string())
        .execute(&mut *tx)
        .await?;

        self.stamp_credentials_updated(&mut tx, instance_id, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Instance ids whose completed credentials hold a dead access token
    /// and no refresh token to renew it with. The maintenance loop flips
    /// these to `expired`.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on backend failure.
    pub async fn list_unrefreshable_expired_tokens(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT instance_id FROM credentials \
             WHERE oauth_status = 'completed' \
               AND token_expires_at IS NOT NULL AND token_expires_at <= ?1 \
               AND (refresh_token IS NULL OR refresh_token = '') \
             ORDER BY token_expires_at ASC LIMIT ?2",
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|s| super::models::parse_uuid("credentials.instance_id", s))
            .collect()
    }

    /// Stamp the parent instance's `credentials_updated_at` inside an open
    /// transaction.
    async fn stamp_credentials_updated(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        instance_id: Uuid,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE instances SET credentials_updated_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(instance_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}
