//! Append-only audit log for token operations.
//!
//! Audit writes are advisory: a request must never fail because its audit
//! entry could not be recorded. In particular, a deployment without the
//! `audit_log` table (trimmed by an operator) is tolerated — the append is
//! logged and dropped.

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::types::{AuditOperation, AuditStatus, RefreshMethod};

use super::models::{AuditAggregateRow, AuditEntryRow, AuditFilter, NewAuditEntry};
use super::{Store, StoreError};

impl Store {
    /// Append an audit entry.
    ///
    /// A missing `audit_log` table is treated as non-fatal: the entry is
    /// dropped with a warning and `Ok(())` is returned.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on backend failure other than a missing table.
    pub async fn append_audit(&self, entry: &NewAuditEntry) -> Result<(), StoreError> {
        let metadata_json = serde_json::to_string(&entry.metadata)?;
        let result = sqlx::query(
            "INSERT INTO audit_log \
             (instance_id, user_id, operation, status, method, error_kind, error_message, \
              metadata_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(entry.instance_id.to_string())
        .bind(entry.user_id.map(|u| u.to_string()))
        .bind(entry.operation.as_str())
        .bind(entry.status.as_str())
        .bind(entry.method.map(|m| m.as_str()))
        .bind(&entry.error_kind)
        .bind(&entry.error_message)
        .bind(metadata_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_missing_table(&e) => {
                warn!(
                    instance_id = %entry.instance_id,
                    operation = entry.operation.as_str(),
                    "audit table missing, dropping entry"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Query an instance's audit entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on backend failure.
    pub async fn query_audit(
        &self,
        instance_id: Uuid,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditEntryRow>, StoreError> {
        let limit = i64::from(filter.limit.unwrap_or(100));
        let rows = sqlx::query(
            "SELECT * FROM audit_log \
             WHERE instance_id = ?1 \
               AND (?2 IS NULL OR operation = ?2) \
               AND (?3 IS NULL OR status = ?3) \
             ORDER BY created_at DESC, id DESC LIMIT ?4",
        )
        .bind(instance_id.to_string())
        .bind(filter.operation.map(|o| o.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(AuditEntryRow::from_row).collect()
    }

    /// Aggregate audit entries since `window_start`, grouped by operation
    /// and outcome, with the mean recorded exchange duration per group.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on backend failure.
    pub async fn aggregate_audit(
        &self,
        window_start: DateTime<Utc>,
    ) -> Result<Vec<AuditAggregateRow>, StoreError> {
        let rows: Vec<(String, String, i64, Option<f64>)> = sqlx::query_as(
            "SELECT operation, status, COUNT(*), \
                    AVG(json_extract(metadata_json, '$.response_time_ms')) \
             FROM audit_log \
             WHERE created_at >= ?1 \
             GROUP BY operation, status \
             ORDER BY operation, status",
        )
        .bind(window_start)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(operation, status, count, avg)| {
                Ok(AuditAggregateRow {
                    operation: AuditOperation::parse(&operation)?,
                    status: AuditStatus::parse(&status)?,
                    count,
                    avg_response_time_ms: avg,
                })
            })
            .collect()
    }

    /// Delete audit entries older than `older_than`. Returns the count
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` on backend failure other than a missing table.
    pub async fn cleanup_audit(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM audit_log WHERE created_at < ?1")
            .bind(older_than)
            .execute(&self.pool)
            .await;
        match result {
            Ok(done) => Ok(done.rows_affected()),
            Err(e) if is_missing_table(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether a sqlx error is SQLite's "no such table".
fn is_missing_table(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.message().contains("no such table"))
}

// Convenience constructors used by the refresh coordinator and manager.
impl NewAuditEntry {
    /// A successful token operation.
    pub fn success(
        instance_id: Uuid,
        user_id: Option<Uuid>,
        operation: AuditOperation,
        method: RefreshMethod,
    ) -> Self {
        Self {
            instance_id,
            user_id,
            operation,
            status: AuditStatus::Success,
            method: Some(method),
            error_kind: None,
            error_message: None,
            metadata: Default::default(),
        }
    }

    /// A failed token operation.
    pub fn failure(
        instance_id: Uuid,
        user_id: Option<Uuid>,
        operation: AuditOperation,
        error_kind: &str,
        error_message: &str,
    ) -> Self {
        Self {
            instance_id,
            user_id,
            operation,
            status: AuditStatus::Failure,
            method: None,
            error_kind: Some(error_kind.to_owned()),
            error_message: Some(error_message.to_owned()),
            metadata: Default::default(),
        }
    }
}
