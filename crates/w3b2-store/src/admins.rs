use rusqlite::{params, OptionalExtension};

use w3b2_shared::protocol::PriceEntry;
use w3b2_shared::types::Pubkey;

use crate::codec::{amount, amount_at, pubkey_at, timestamp_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::AdminProfile;

const SELECT_ADMIN: &str =
    "SELECT authority, comm_pubkey, balance, last_seq, closed, created_at, updated_at
     FROM admin_profiles";

impl Database {
    /// Insert or replace an admin profile together with its price list.
    pub fn upsert_admin(&self, admin: &AdminProfile) -> Result<()> {
        let authority = admin.authority.to_hex();
        self.conn().execute(
            "INSERT INTO admin_profiles
                (authority, comm_pubkey, balance, last_seq, closed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(authority) DO UPDATE SET
                comm_pubkey = excluded.comm_pubkey,
                balance     = excluded.balance,
                last_seq    = excluded.last_seq,
                closed      = excluded.closed,
                updated_at  = excluded.updated_at",
            params![
                authority,
                admin.communication_pubkey.to_hex(),
                amount(admin.balance, "balance")?,
                amount(admin.last_seq, "last_seq")?,
                admin.closed,
                admin.created_at.to_rfc3339(),
                admin.updated_at.to_rfc3339(),
            ],
        )?;

        self.conn().execute(
            "DELETE FROM admin_prices WHERE authority = ?1",
            params![authority],
        )?;
        let mut stmt = self.conn().prepare(
            "INSERT INTO admin_prices (authority, position, command_id, price)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (position, entry) in admin.prices.iter().enumerate() {
            stmt.execute(params![
                authority,
                position as i64,
                amount(entry.command_id, "command_id")?,
                amount(entry.price, "price")?,
            ])?;
        }
        Ok(())
    }

    pub fn find_admin(&self, authority: &Pubkey) -> Result<Option<AdminProfile>> {
        let admin = self
            .conn()
            .query_row(
                &format!("{SELECT_ADMIN} WHERE authority = ?1"),
                params![authority.to_hex()],
                row_to_admin,
            )
            .optional()?;

        match admin {
            Some(mut admin) => {
                admin.prices = self.admin_prices(authority)?;
                Ok(Some(admin))
            }
            None => Ok(None),
        }
    }

    pub fn get_admin(&self, authority: &Pubkey) -> Result<AdminProfile> {
        self.find_admin(authority)?.ok_or(StoreError::NotFound)
    }

    /// List admin profiles ordered by creation. Tombstoned rows are skipped
    /// unless `include_closed` is set.
    pub fn list_admins(&self, include_closed: bool) -> Result<Vec<AdminProfile>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_ADMIN} WHERE (?1 OR closed = 0) ORDER BY created_at ASC, authority ASC"
        ))?;
        let rows = stmt.query_map(params![include_closed], row_to_admin)?;

        let mut admins = Vec::new();
        for row in rows {
            let mut admin = row?;
            admin.prices = self.admin_prices(&admin.authority)?;
            admins.push(admin);
        }
        Ok(admins)
    }

    fn admin_prices(&self, authority: &Pubkey) -> Result<Vec<PriceEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT command_id, price FROM admin_prices
             WHERE authority = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![authority.to_hex()], |row| {
            Ok(PriceEntry {
                command_id: amount_at(row, 0)?,
                price: amount_at(row, 1)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_admin(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdminProfile> {
    Ok(AdminProfile {
        authority: pubkey_at(row, 0)?,
        communication_pubkey: pubkey_at(row, 1)?,
        prices: Vec::new(),
        balance: amount_at(row, 2)?,
        last_seq: amount_at(row, 3)?,
        closed: row.get(4)?,
        created_at: timestamp_at(row, 5)?,
        updated_at: timestamp_at(row, 6)?,
    })
}
