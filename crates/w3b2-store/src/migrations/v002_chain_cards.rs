//! v002 -- Per-relationship ChainCards.
//!
//! One card per (holder, service) pair, its secret sealed under the keystore
//! master key, plus free-form string metadata.

use rusqlite::Connection;

/// SQL executed when upgrading from version 1 to version 2.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS chain_cards (
    holder        TEXT NOT NULL,              -- hex-encoded 32-byte pubkey
    service       TEXT NOT NULL,              -- admin authority of the relationship
    card_pubkey   TEXT NOT NULL UNIQUE,
    sealed_secret BLOB NOT NULL,              -- nonce || XChaCha20-Poly1305 ciphertext
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,

    PRIMARY KEY (holder, service)
);

CREATE TABLE IF NOT EXISTS chain_card_metadata (
    holder  TEXT NOT NULL,
    service TEXT NOT NULL,
    key     TEXT NOT NULL,
    value   TEXT NOT NULL,

    PRIMARY KEY (holder, service, key),
    FOREIGN KEY (holder, service) REFERENCES chain_cards(holder, service) ON DELETE CASCADE
);
"#;

/// Apply the chain card migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
