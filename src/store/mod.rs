//! Durable store over SQLite.
//!
//! The [`Store`] is the sole gateway to the gateway database: registry,
//! instances, credentials, plans, and the audit log all live here. Writers
//! rely on SQLite's single-writer serialization; the create-under-limit path
//! opens its transaction with a write so concurrent creators are serialized,
//! and credential updates use a version counter for compare-and-swap.
//!
//! All timestamps are bound from Rust (`chrono::Utc::now()`) so TEXT
//! comparisons stay within one format. Never mix in `datetime('now')`.

pub mod audit;
pub mod credentials;
pub mod instances;
pub mod models;
pub mod plans;
mod schema;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

use crate::types::InvalidEnumValue;

/// Store operation failures.
///
/// `Conflict` is recoverable by the caller (retry or fall back to an
/// unconditional write); the rest propagate.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic-lock version mismatch.
    #[error("version conflict")]
    Conflict,
    /// No matching row.
    #[error("row not found")]
    NotFound,
    /// A schema CHECK or application-side invariant was violated.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    /// The backend is down or the query failed for I/O reasons.
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
    /// Creating the row would exceed the user's plan quota.
    #[error("active instance limit reached ({current}/{max})")]
    LimitReached {
        /// Instances currently counted against the quota.
        current: u32,
        /// The plan's maximum concurrently active instances.
        max: u32,
    },
}

impl StoreError {
    /// Default mapping into the gateway taxonomy for instance-scoped
    /// operations: `NotFound` means the instance, `LimitReached` carries
    /// its counts. Callers with a different subject map their own.
    pub fn into_gateway(self) -> crate::types::GatewayError {
        use crate::types::GatewayError;
        match self {
            Self::NotFound => GatewayError::InstanceNotFound,
            Self::Conflict => GatewayError::Conflict,
            Self::LimitReached { current, max } => {
                GatewayError::ActiveLimitReached { current, max }
            }
            Self::IntegrityViolation(msg) => GatewayError::InvalidCredentialsShape(msg),
            Self::Unavailable(msg) => GatewayError::Internal(msg),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound,
            sqlx::Error::Database(db) => {
                let msg = db.message().to_owned();
                if msg.contains("CHECK constraint failed")
                    || msg.contains("UNIQUE constraint failed")
                    || msg.contains("FOREIGN KEY constraint failed")
                    || msg.contains("NOT NULL constraint failed")
                {
                    Self::IntegrityViolation(msg)
                } else {
                    Self::Unavailable(msg)
                }
            }
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl From<InvalidEnumValue> for StoreError {
    fn from(e: InvalidEnumValue) -> Self {
        Self::IntegrityViolation(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::IntegrityViolation(format!("malformed JSON document: {e}"))
    }
}

/// Durable store handle. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `url` and ensure the
    /// schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the database cannot be
    /// opened or the schema cannot be created.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(url, "datastore opened");
        Ok(store)
    }

    /// Open a private in-memory database (used by tests).
    ///
    /// A single connection keeps the in-memory database alive for the
    /// lifetime of the pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the pool cannot be built.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Unavailable(format!("invalid database url: {e}")))?
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create all tables and indexes if they do not exist.
    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in schema::STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// The underlying pool. Exposed for wiring and test fixtures only;
    /// application code goes through the typed operations.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
