//! v001 -- Initial schema creation.
//!
//! Mirrored chain entities (`admin_profiles`, `admin_prices`, `user_profiles`,
//! `funding_requests`), the router's `dispatches` idempotency index, the
//! public half of session handshakes and the single-row `checkpoint`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Admin profiles (one per service ChainCard)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS admin_profiles (
    authority   TEXT PRIMARY KEY NOT NULL,    -- hex-encoded 32-byte pubkey
    comm_pubkey TEXT NOT NULL,                -- hex-encoded X25519 pubkey
    balance     INTEGER NOT NULL CHECK (balance >= 0),
    last_seq    INTEGER NOT NULL,
    closed      INTEGER NOT NULL DEFAULT 0,   -- boolean 0/1, tombstone
    created_at  TEXT NOT NULL,                -- RFC-3339
    updated_at  TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Admin price lists (ordered)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS admin_prices (
    authority  TEXT NOT NULL,                 -- FK -> admin_profiles(authority)
    position   INTEGER NOT NULL,
    command_id INTEGER NOT NULL,
    price      INTEGER NOT NULL CHECK (price >= 0),

    PRIMARY KEY (authority, position),
    FOREIGN KEY (authority) REFERENCES admin_profiles(authority) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- User profiles, keyed by (user, admin)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_profiles (
    authority   TEXT NOT NULL,
    admin       TEXT NOT NULL,
    comm_pubkey TEXT NOT NULL,
    deposit     INTEGER NOT NULL CHECK (deposit >= 0),
    last_seq    INTEGER NOT NULL,
    closed      INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,

    PRIMARY KEY (authority, admin)
);

CREATE INDEX IF NOT EXISTS idx_user_profiles_admin ON user_profiles(admin);

-- ----------------------------------------------------------------
-- Funding requests
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS funding_requests (
    request      TEXT PRIMARY KEY NOT NULL,   -- hex-encoded request address
    requester    TEXT NOT NULL,
    target_admin TEXT NOT NULL,
    amount       INTEGER NOT NULL CHECK (amount >= 0),
    status       TEXT NOT NULL,               -- pending | approved | rejected | expired
    last_seq     INTEGER NOT NULL,
    created_at   TEXT NOT NULL,
    resolved_at  TEXT
);

CREATE INDEX IF NOT EXISTS idx_funding_admin ON funding_requests(target_admin, status);

-- ----------------------------------------------------------------
-- Command dispatches (idempotency index + confirmation tracking)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS dispatches (
    user_key          TEXT NOT NULL,
    admin_key         TEXT NOT NULL,
    command_id        INTEGER NOT NULL,
    correlation_id    TEXT NOT NULL,
    direction         TEXT NOT NULL,          -- user_to_admin | admin_to_user
    payload_ref       TEXT NOT NULL,          -- BLAKE3 reference of the ciphertext
    price             INTEGER NOT NULL CHECK (price >= 0),
    status            TEXT NOT NULL,
    submission_id     TEXT,
    failure           TEXT,
    late_confirmation INTEGER NOT NULL DEFAULT 0,
    deadline_ms       INTEGER,                -- unix millis, set when awaiting
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,

    PRIMARY KEY (user_key, admin_key, command_id, correlation_id)
);

CREATE INDEX IF NOT EXISTS idx_dispatches_status ON dispatches(status, deadline_ms);

-- ----------------------------------------------------------------
-- Session handshakes (public material only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS session_exchanges (
    session_id       TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    user_key         TEXT NOT NULL,
    admin_key        TEXT NOT NULL,
    ephemeral_pubkey TEXT NOT NULL,
    user_envelope    BLOB NOT NULL,
    status           TEXT NOT NULL,              -- active | expired | closed
    created_at       TEXT NOT NULL,
    expires_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_pair ON session_exchanges(user_key, admin_key);

-- ----------------------------------------------------------------
-- Event checkpoint (single row)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS checkpoint (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    slot       INTEGER NOT NULL,
    seq        INTEGER NOT NULL,
    signature  TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
