//! Process-local credential cache.
//!
//! Maps instance ids to the current bearer and refresh bookkeeping. The
//! cache is a coherence layer over stored credentials: authoritative only
//! for freshness within its TTL, never for identity or long-term token
//! state. It has no cross-process synchronization — the maintenance loop
//! reconciles it against the store.
//!
//! Locking is sharded by instance id so concurrent reads of different
//! instances are independent. Lock hold times are bounded to map
//! operations; nothing suspends while holding a shard lock.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::types::InstanceStatus;

/// Window within which an entry counts as "recently used" in stats.
const RECENT_USE_WINDOW_MINS: i64 = 15;

/// One cached credential record.
#[derive(Clone)]
pub struct CacheRecord {
    /// Current access token.
    pub bearer: String,
    /// Refresh token, mirrored for refresh bookkeeping.
    pub refresh_token: Option<String>,
    /// Bearer hard expiry.
    pub expires_at: DateTime<Utc>,
    /// Owner of the instance.
    pub user_id: Uuid,
    /// Last cache hit.
    pub last_used: DateTime<Utc>,
    /// Consecutive failed refresh attempts since the last success.
    pub refresh_attempts: u32,
    /// When this record was written.
    pub cached_at: DateTime<Utc>,
    /// Last refresh attempt, successful or not.
    pub last_refresh_attempt: Option<DateTime<Utc>>,
    /// Last successful refresh.
    pub last_successful_refresh: Option<DateTime<Utc>>,
    /// Granted scope.
    pub scope: Option<String>,
    /// Mirrored instance status; `inactive`/`expired` records never hit.
    pub status: Option<InstanceStatus>,
}

impl std::fmt::Debug for CacheRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRecord")
            .field("bearer", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("user_id", &self.user_id)
            .field("refresh_attempts", &self.refresh_attempts)
            .field("cached_at", &self.cached_at)
            .field("status", &self.status)
            .finish()
    }
}

impl CacheRecord {
    /// Build a fresh record for a bearer obtained now.
    pub fn new(bearer: String, expires_at: DateTime<Utc>, user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            bearer,
            refresh_token: None,
            expires_at,
            user_id,
            last_used: now,
            refresh_attempts: 0,
            cached_at: now,
            last_refresh_attempt: None,
            last_successful_refresh: None,
            scope: None,
            status: Some(InstanceStatus::Active),
        }
    }

    /// Whether the bearer is dead at `now` (strict: expiring exactly now
    /// counts as expired).
    fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether the record is served by `get`.
    fn servable(&self, now: DateTime<Utc>) -> bool {
        if self.expired_at(now) {
            return false;
        }
        !matches!(
            self.status,
            Some(InstanceStatus::Inactive) | Some(InstanceStatus::Expired)
        )
    }
}

/// Selective in-place update for a cached record.
#[derive(Debug, Clone, Default)]
pub struct CachePatch {
    /// New mirrored status.
    pub status: Option<InstanceStatus>,
    /// New bearer expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// New bearer.
    pub bearer: Option<String>,
    /// New refresh token.
    pub refresh_token: Option<String>,
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    /// Entries currently held, including expired ones.
    pub size: usize,
    /// Entries whose bearer has expired.
    pub expired: usize,
    /// Entries used within the last fifteen minutes.
    pub recently_used: usize,
    /// Mean minutes until expiry across live entries.
    pub avg_minutes_to_expiry: Option<f64>,
}

/// Sharded in-process credential cache.
///
/// Constructed once at process start and passed by reference where needed.
pub struct CredentialCache {
    shards: Vec<Mutex<HashMap<Uuid, CacheRecord>>>,
    /// Maximum entries per shard; 0 means unbounded.
    per_shard_capacity: usize,
}

impl CredentialCache {
    /// Build a cache with `capacity` total entries (0 = unbounded) spread
    /// over `shards` lock shards.
    pub fn new(capacity: usize, shards: usize) -> Self {
        let shard_count = shards.max(1);
        let per_shard_capacity = if capacity == 0 {
            0
        } else {
            capacity.div_ceil(shard_count).max(1)
        };
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
            per_shard_capacity,
        }
    }

    fn shard(&self, id: &Uuid) -> &Mutex<HashMap<Uuid, CacheRecord>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    fn lock_shard(&self, id: &Uuid) -> std::sync::MutexGuard<'_, HashMap<Uuid, CacheRecord>> {
        self.shard(id)
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Fetch a servable record and bump its `last_used`.
    ///
    /// Returns `None` when absent, when the bearer has expired, or when the
    /// mirrored status is `inactive` or `expired`. Expired entries are left
    /// in place for stats and reconciliation.
    pub fn get(&self, id: &Uuid) -> Option<CacheRecord> {
        let now = Utc::now();
        let mut shard = self.lock_shard(id);
        let record = shard.get_mut(id)?;
        if !record.servable(now) {
            return None;
        }
        record.last_used = now;
        Some(record.clone())
    }

    /// Fetch a record without side effects, regardless of freshness.
    pub fn peek(&self, id: &Uuid) -> Option<CacheRecord> {
        self.lock_shard(id).get(id).cloned()
    }

    /// Insert or replace a record. When the cache is bounded and the shard
    /// is full, the least-recently-used entry in the shard is evicted — the
    /// store remains authoritative, so eviction is always safe.
    pub fn put(&self, id: Uuid, record: CacheRecord) {
        let mut shard = self.lock_shard(&id);
        if self.per_shard_capacity > 0
            && !shard.contains_key(&id)
            && shard.len() >= self.per_shard_capacity
        {
            if let Some(evict) = shard
                .iter()
                .min_by_key(|(_, r)| r.last_used)
                .map(|(k, _)| *k)
            {
                shard.remove(&evict);
            }
        }
        shard.insert(id, record);
    }

    /// Update selected fields in place. Returns whether an entry existed.
    pub fn patch(&self, id: &Uuid, patch: &CachePatch) -> bool {
        let mut shard = self.lock_shard(id);
        let Some(record) = shard.get_mut(id) else {
            return false;
        };
        if let Some(status) = patch.status {
            record.status = Some(status);
        }
        if let Some(expires_at) = patch.expires_at {
            record.expires_at = expires_at;
        }
        if let Some(bearer) = &patch.bearer {
            record.bearer = bearer.clone();
        }
        if let Some(refresh_token) = &patch.refresh_token {
            record.refresh_token = Some(refresh_token.clone());
        }
        true
    }

    /// Remove a record. Returns whether one existed.
    pub fn delete(&self, id: &Uuid) -> bool {
        self.lock_shard(id).remove(id).is_some()
    }

    /// Drop every record.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clear();
        }
    }

    /// All cached instance ids.
    pub fn ids(&self) -> Vec<Uuid> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            out.extend(shard.keys().copied());
        }
        out
    }

    /// Record a failed refresh attempt. Returns the new attempt count, or
    /// `None` when no entry exists.
    pub fn increment_refresh_attempts(&self, id: &Uuid) -> Option<u32> {
        let mut shard = self.lock_shard(id);
        let record = shard.get_mut(id)?;
        record.refresh_attempts = record.refresh_attempts.saturating_add(1);
        record.last_refresh_attempt = Some(Utc::now());
        Some(record.refresh_attempts)
    }

    /// Clear the attempt counter after a successful refresh.
    pub fn reset_refresh_attempts(&self, id: &Uuid) {
        let mut shard = self.lock_shard(id);
        if let Some(record) = shard.get_mut(id) {
            record.refresh_attempts = 0;
            let now = Utc::now();
            record.last_refresh_attempt = Some(now);
            record.last_successful_refresh = Some(now);
        }
    }

    /// Aggregate statistics across all shards.
    pub fn stats(&self) -> CacheStats {
        let now = Utc::now();
        let recent_cutoff = now - Duration::minutes(RECENT_USE_WINDOW_MINS);
        let mut size = 0usize;
        let mut expired = 0usize;
        let mut recently_used = 0usize;
        let mut live_minutes = 0f64;
        let mut live_count = 0usize;

        for shard in &self.shards {
            let shard = shard
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for record in shard.values() {
                size += 1;
                if record.expired_at(now) {
                    expired += 1;
                } else {
                    live_count += 1;
                    live_minutes +=
                        (record.expires_at - now).num_seconds() as f64 / 60.0;
                }
                if record.last_used >= recent_cutoff {
                    recently_used += 1;
                }
            }
        }

        CacheStats {
            size,
            expired,
            recently_used,
            avg_minutes_to_expiry: (live_count > 0)
                .then(|| live_minutes / live_count as f64),
        }
    }
}
