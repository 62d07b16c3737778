//! Idempotent schema bootstrap.
//!
//! Invariants live in the schema as well as in application code: the
//! credential-shape CHECK (api-key XOR client pair) and the oauth-status
//! consistency CHECK (pending has no completion timestamp, everything else
//! does) reject malformed rows even if a code path slips.

/// Executed in order on startup. Every statement is `IF NOT EXISTS` so the
/// bootstrap is safe to repeat.
pub(super) const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        name TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS service_types (
        id TEXT PRIMARY KEY,
        short_name TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        description TEXT,
        icon_url TEXT,
        port INTEGER UNIQUE,
        auth_kind TEXT NOT NULL CHECK (auth_kind IN ('api_key', 'oauth')),
        is_active INTEGER NOT NULL DEFAULT 1,
        total_created INTEGER NOT NULL DEFAULT 0,
        active_count INTEGER NOT NULL DEFAULT 0,
        token_url TEXT,
        authorize_url TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS instances (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        service_type_id TEXT NOT NULL REFERENCES service_types(id) ON DELETE CASCADE,
        custom_name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active'
            CHECK (status IN ('active', 'inactive', 'expired')),
        oauth_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (oauth_status IN ('pending', 'completed', 'failed', 'expired')),
        expires_at TEXT,
        last_used_at TEXT,
        usage_count INTEGER NOT NULL DEFAULT 0,
        renewed_count INTEGER NOT NULL DEFAULT 0,
        last_renewed_at TEXT,
        credentials_updated_at TEXT,
        version INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_instances_user ON instances(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_instances_service_type ON instances(service_type_id)",
    "CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status)",
    "CREATE INDEX IF NOT EXISTS idx_instances_expires_at ON instances(expires_at)",
    "CREATE TABLE IF NOT EXISTS credentials (
        id TEXT PRIMARY KEY,
        instance_id TEXT NOT NULL UNIQUE REFERENCES instances(id) ON DELETE CASCADE,
        api_key TEXT,
        client_id TEXT,
        client_secret TEXT,
        access_token TEXT,
        refresh_token TEXT,
        token_expires_at TEXT,
        token_scope TEXT,
        oauth_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (oauth_status IN ('pending', 'completed', 'failed', 'expired')),
        oauth_completed_at TEXT,
        oauth_authorization_url TEXT,
        oauth_state TEXT,
        version INTEGER NOT NULL DEFAULT 1,
        last_modified TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        CHECK (
            (api_key IS NOT NULL
                AND client_id IS NULL AND client_secret IS NULL
                AND access_token IS NULL AND refresh_token IS NULL)
            OR (api_key IS NULL
                AND client_id IS NOT NULL AND client_secret IS NOT NULL)
        ),
        CHECK (
            (oauth_status = 'pending' AND oauth_completed_at IS NULL)
            OR (oauth_status != 'pending' AND oauth_completed_at IS NOT NULL)
        )
    )",
    "CREATE INDEX IF NOT EXISTS idx_credentials_token_expires_at
        ON credentials(token_expires_at)",
    "CREATE TABLE IF NOT EXISTS user_plans (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
        kind TEXT NOT NULL DEFAULT 'free' CHECK (kind IN ('free', 'pro')),
        max_instances INTEGER,
        total_created INTEGER NOT NULL DEFAULT 0,
        features_json TEXT NOT NULL DEFAULT '{}',
        expires_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        instance_id TEXT NOT NULL,
        user_id TEXT,
        operation TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('success', 'failure', 'pending')),
        method TEXT CHECK (method IN ('oauth_service', 'direct_oauth')),
        error_kind TEXT,
        error_message TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_audit_instance_created
        ON audit_log(instance_id, created_at)",
];
