use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use w3b2_shared::types::EventPosition;

use crate::codec::{amount, amount_at};
use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Last durably processed position, or genesis on a fresh database.
    pub fn load_checkpoint(&self) -> Result<EventPosition> {
        let position = self
            .conn()
            .query_row(
                "SELECT slot, seq, signature FROM checkpoint WHERE id = 1",
                [],
                |row| {
                    Ok(EventPosition {
                        slot: amount_at(row, 0)?,
                        seq: amount_at(row, 1)?,
                        signature: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::Sqlite)?;
        Ok(position.unwrap_or_else(EventPosition::genesis))
    }

    pub fn save_checkpoint(&self, position: &EventPosition) -> Result<()> {
        self.conn().execute(
            "INSERT INTO checkpoint (id, slot, seq, signature, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                slot = excluded.slot,
                seq = excluded.seq,
                signature = excluded.signature,
                updated_at = excluded.updated_at",
            params![
                amount(position.slot, "slot")?,
                amount(position.seq, "seq")?,
                position.signature,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}
