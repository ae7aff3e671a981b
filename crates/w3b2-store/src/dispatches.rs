use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use w3b2_shared::types::{Direction, DispatchStatus, Pubkey};

use crate::codec::{amount, amount_at, millis_to_timestamp, parsed_at, pubkey_at, timestamp_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{DispatchKey, DispatchRecord};

const SELECT_DISPATCH: &str = "SELECT user_key, admin_key, command_id, correlation_id, direction,
            payload_ref, price, status, submission_id, failure, late_confirmation,
            deadline_ms, created_at, updated_at
     FROM dispatches";

const KEY_FILTER: &str =
    "user_key = ?1 AND admin_key = ?2 AND command_id = ?3 AND correlation_id = ?4";

impl Database {
    /// Record a new dispatch. Fails with [`StoreError::Duplicate`] when the
    /// idempotency key is already taken, whatever the existing record's status.
    pub fn insert_dispatch(&self, record: &DispatchRecord) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO dispatches
                (user_key, admin_key, command_id, correlation_id, direction, payload_ref,
                 price, status, submission_id, failure, late_confirmation, deadline_ms,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.key.user.to_hex(),
                record.key.admin.to_hex(),
                amount(record.key.command_id, "command_id")?,
                record.key.correlation_id.as_str(),
                record.direction.as_str(),
                record.payload_ref,
                amount(record.price, "price")?,
                record.status.as_str(),
                record.submission_id,
                record.failure,
                record.late_confirmation,
                record.deadline.map(|d| d.timestamp_millis()),
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Duplicate(record.key.to_string()))
            }
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    /// Persist the mutable part of a dispatch (status, submission, failure,
    /// anomaly flag, deadline).
    pub fn update_dispatch(&self, record: &DispatchRecord) -> Result<()> {
        let affected = self.conn().execute(
            &format!(
                "UPDATE dispatches SET
                    status = ?5, submission_id = ?6, failure = ?7,
                    late_confirmation = ?8, deadline_ms = ?9, updated_at = ?10
                 WHERE {KEY_FILTER}"
            ),
            params![
                record.key.user.to_hex(),
                record.key.admin.to_hex(),
                amount(record.key.command_id, "command_id")?,
                record.key.correlation_id.as_str(),
                record.status.as_str(),
                record.submission_id,
                record.failure,
                record.late_confirmation,
                record.deadline.map(|d| d.timestamp_millis()),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn find_dispatch(&self, key: &DispatchKey) -> Result<Option<DispatchRecord>> {
        self.conn()
            .query_row(
                &format!("{SELECT_DISPATCH} WHERE {KEY_FILTER}"),
                params![
                    key.user.to_hex(),
                    key.admin.to_hex(),
                    amount(key.command_id, "command_id")?,
                    key.correlation_id.as_str(),
                ],
                row_to_dispatch,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn get_dispatch(&self, key: &DispatchKey) -> Result<DispatchRecord> {
        self.find_dispatch(key)?.ok_or(StoreError::NotFound)
    }

    /// Dispatches not yet finalized (the durable pending index).
    pub fn list_pending_dispatches(&self) -> Result<Vec<DispatchRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_DISPATCH} WHERE status IN ('submitted', 'awaiting_confirmation')
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([], row_to_dispatch)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Awaiting dispatches whose confirmation deadline is at or before `now`.
    pub fn list_overdue_dispatches(&self, now: DateTime<Utc>) -> Result<Vec<DispatchRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_DISPATCH} WHERE status = 'awaiting_confirmation' AND deadline_ms <= ?1
             ORDER BY deadline_ms ASC"
        ))?;
        let rows = stmt.query_map(params![now.timestamp_millis()], row_to_dispatch)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Sum of prices held by unfinalized user->admin dispatches for a pair.
    pub fn reserved_amount(&self, user: &Pubkey, admin: &Pubkey) -> Result<u64> {
        let mut stmt = self.conn().prepare(
            "SELECT price FROM dispatches
             WHERE user_key = ?1 AND admin_key = ?2 AND direction = ?3
               AND status IN ('submitted', 'awaiting_confirmation')",
        )?;
        let rows = stmt.query_map(
            params![
                user.to_hex(),
                admin.to_hex(),
                Direction::UserToAdmin.as_str()
            ],
            |row| amount_at(row, 0),
        )?;

        let mut total = 0u64;
        for price in rows {
            total = total
                .checked_add(price?)
                .ok_or(StoreError::Overflow("price"))?;
        }
        Ok(total)
    }

    pub fn count_dispatches(&self, status: DispatchStatus) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM dispatches WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

fn row_to_dispatch(row: &rusqlite::Row<'_>) -> rusqlite::Result<DispatchRecord> {
    let deadline_ms: Option<i64> = row.get(11)?;
    Ok(DispatchRecord {
        key: DispatchKey {
            user: pubkey_at(row, 0)?,
            admin: pubkey_at(row, 1)?,
            command_id: amount_at(row, 2)?,
            correlation_id: parsed_at(row, 3)?,
        },
        direction: parsed_at(row, 4)?,
        payload_ref: row.get(5)?,
        price: amount_at(row, 6)?,
        status: parsed_at(row, 7)?,
        submission_id: row.get(8)?,
        failure: row.get(9)?,
        late_confirmation: row.get(10)?,
        deadline: millis_to_timestamp(11, deadline_ms)?,
        created_at: timestamp_at(row, 12)?,
        updated_at: timestamp_at(row, 13)?,
    })
}
