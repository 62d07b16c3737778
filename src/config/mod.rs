//! Configuration loading and management.
//!
//! Loads gateway configuration from `./config.toml` (or
//! `$STRAYLIGHT_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level gateway configuration loaded from TOML.
///
/// Path: `./config.toml` or `$STRAYLIGHT_CONFIG_PATH`.
/// Env vars override file values; file values override defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Datastore connection settings.
    pub database: DatabaseConfig,
    /// Outbound OAuth settings.
    pub oauth: OauthConfig,
    /// Process-local credential cache settings.
    pub cache: CacheConfig,
    /// Background maintenance loop settings.
    pub maintenance: MaintenanceConfig,
    /// Audit log retention settings.
    pub audit: AuditConfig,
    /// Plan quota defaults applied when materializing new plans.
    pub plan: PlanConfig,
    /// Refresh coordinator settings.
    pub refresh: RefreshConfig,
    /// Filesystem paths for logs.
    pub paths: PathsConfig,
}

/// `[database]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite connection URL.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://straylight.db".to_owned(),
        }
    }
}

/// `[oauth]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OauthConfig {
    /// Internal OAuth helper endpoint. Empty/absent forces direct calls.
    pub service_url: Option<String>,
    /// Per-attempt timeout for outbound token requests, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for OauthConfig {
    fn default() -> Self {
        Self {
            service_url: None,
            timeout_ms: 10_000,
        }
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached entries; 0 means unbounded.
    pub capacity: usize,
    /// Number of lock shards. Must be at least 1.
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            shards: 16,
        }
    }
}

/// `[maintenance]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Interval between maintenance ticks, in milliseconds.
    pub interval_ms: u64,
    /// Age after which a pending OAuth flow is reaped, in milliseconds.
    pub pending_ttl_ms: u64,
    /// Maximum rows each duty processes per tick.
    pub tick_quota: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: 300_000,
            pending_ttl_ms: 300_000,
            tick_quota: 500,
        }
    }
}

/// `[audit]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Days audit entries are retained before cleanup.
    pub retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { retention_days: 90 }
    }
}

/// `[plan]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    /// Maximum concurrently active completed instances on the free tier.
    pub free_max_active: u32,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self { free_max_active: 1 }
    }
}

/// `[refresh]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Maximum wait for an in-flight refresh, in milliseconds.
    /// Absent means the OAuth timeout plus a small buffer.
    pub singleflight_timeout_ms: Option<u64>,
    /// Skew buffer subtracted from token expiry when judging freshness,
    /// in seconds.
    pub expiry_skew_secs: u64,
}

/// `[paths]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory for rotated JSON log files.
    pub logs_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            logs_dir: "logs".to_owned(),
        }
    }
}

/// Buffer added to the OAuth timeout when deriving the singleflight wait.
const SINGLEFLIGHT_BUFFER_MS: u64 = 2_000;

impl GatewayConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$STRAYLIGHT_CONFIG_PATH` or `./config.toml`.
    /// If the file does not exist, returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: GatewayConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(GatewayConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config file path.
    ///
    /// Checks `$STRAYLIGHT_CONFIG_PATH` first, then `./config.toml`.
    fn config_path() -> PathBuf {
        std::env::var("STRAYLIGHT_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var`
    /// in tests).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("STRAYLIGHT_DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = env("STRAYLIGHT_OAUTH_SERVICE_URL") {
            self.oauth.service_url = if v.trim().is_empty() { None } else { Some(v) };
        }
        override_num(&mut self.oauth.timeout_ms, "STRAYLIGHT_OAUTH_TIMEOUT_MS", &env);
        override_num(&mut self.cache.capacity, "STRAYLIGHT_CACHE_CAPACITY", &env);
        override_num(
            &mut self.maintenance.interval_ms,
            "STRAYLIGHT_MAINTENANCE_INTERVAL_MS",
            &env,
        );
        override_num(
            &mut self.maintenance.pending_ttl_ms,
            "STRAYLIGHT_PENDING_TTL_MS",
            &env,
        );
        override_num(
            &mut self.audit.retention_days,
            "STRAYLIGHT_AUDIT_RETENTION_DAYS",
            &env,
        );
        override_num(
            &mut self.plan.free_max_active,
            "STRAYLIGHT_FREE_MAX_ACTIVE",
            &env,
        );
        if let Some(v) = env("STRAYLIGHT_SINGLEFLIGHT_TIMEOUT_MS") {
            match v.parse() {
                Ok(n) => self.refresh.singleflight_timeout_ms = Some(n),
                Err(_) => tracing::warn!(
                    var = "STRAYLIGHT_SINGLEFLIGHT_TIMEOUT_MS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("STRAYLIGHT_LOGS_DIR") {
            self.paths.logs_dir = v;
        }
    }

    /// Per-attempt timeout for outbound OAuth calls.
    pub fn oauth_timeout(&self) -> Duration {
        Duration::from_millis(self.oauth.timeout_ms)
    }

    /// Maximum wait on an in-flight refresh before surfacing a transient
    /// failure. Defaults to the OAuth timeout plus a buffer.
    pub fn singleflight_timeout(&self) -> Duration {
        Duration::from_millis(
            self.refresh
                .singleflight_timeout_ms
                .unwrap_or(self.oauth.timeout_ms + SINGLEFLIGHT_BUFFER_MS),
        )
    }

    /// Skew buffer applied when judging whether a cached token is fresh.
    pub fn expiry_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.refresh.expiry_skew_secs).unwrap_or(0))
    }
}

/// Parse-and-assign helper for numeric env overrides; invalid values are
/// logged and ignored.
fn override_num<T: std::str::FromStr>(
    slot: &mut T,
    key: &'static str,
    env: &impl Fn(&str) -> Option<String>,
) {
    if let Some(v) = env(key) {
        match v.parse() {
            Ok(n) => *slot = n,
            Err(_) => tracing::warn!(var = key, value = %v, "ignoring invalid env override"),
        }
    }
}
