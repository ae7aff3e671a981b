use rusqlite::{params, OptionalExtension};

use w3b2_shared::types::Pubkey;

use crate::codec::{amount, amount_at, pubkey_at, timestamp_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::UserProfile;

const SELECT_USER: &str =
    "SELECT authority, admin, comm_pubkey, deposit, last_seq, closed, created_at, updated_at
     FROM user_profiles";

impl Database {
    pub fn upsert_user(&self, user: &UserProfile) -> Result<()> {
        self.conn().execute(
            "INSERT INTO user_profiles
                (authority, admin, comm_pubkey, deposit, last_seq, closed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(authority, admin) DO UPDATE SET
                comm_pubkey = excluded.comm_pubkey,
                deposit     = excluded.deposit,
                last_seq    = excluded.last_seq,
                closed      = excluded.closed,
                updated_at  = excluded.updated_at",
            params![
                user.authority.to_hex(),
                user.admin.to_hex(),
                user.communication_pubkey.to_hex(),
                amount(user.deposit, "deposit")?,
                amount(user.last_seq, "last_seq")?,
                user.closed,
                user.created_at.to_rfc3339(),
                user.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn find_user(&self, authority: &Pubkey, admin: &Pubkey) -> Result<Option<UserProfile>> {
        self.conn()
            .query_row(
                &format!("{SELECT_USER} WHERE authority = ?1 AND admin = ?2"),
                params![authority.to_hex(), admin.to_hex()],
                row_to_user,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn get_user(&self, authority: &Pubkey, admin: &Pubkey) -> Result<UserProfile> {
        self.find_user(authority, admin)?.ok_or(StoreError::NotFound)
    }

    /// Open user profiles linked to one admin.
    pub fn list_users_for_admin(&self, admin: &Pubkey) -> Result<Vec<UserProfile>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_USER} WHERE admin = ?1 AND closed = 0 ORDER BY created_at ASC, authority ASC"
        ))?;
        let rows = stmt.query_map(params![admin.to_hex()], row_to_user)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    Ok(UserProfile {
        authority: pubkey_at(row, 0)?,
        admin: pubkey_at(row, 1)?,
        communication_pubkey: pubkey_at(row, 2)?,
        deposit: amount_at(row, 3)?,
        last_seq: amount_at(row, 4)?,
        closed: row.get(5)?,
        created_at: timestamp_at(row, 6)?,
        updated_at: timestamp_at(row, 7)?,
    })
}
