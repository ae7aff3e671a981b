use rusqlite::{params, OptionalExtension};

use w3b2_shared::types::{FundingStatus, Pubkey};

use crate::codec::{amount, amount_at, opt_timestamp_at, parsed_at, pubkey_at, timestamp_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::FundingRequest;

const SELECT_FUNDING: &str =
    "SELECT request, requester, target_admin, amount, status, last_seq, created_at, resolved_at
     FROM funding_requests";

impl Database {
    pub fn upsert_funding(&self, funding: &FundingRequest) -> Result<()> {
        self.conn().execute(
            "INSERT INTO funding_requests
                (request, requester, target_admin, amount, status, last_seq, created_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(request) DO UPDATE SET
                status      = excluded.status,
                last_seq    = excluded.last_seq,
                resolved_at = excluded.resolved_at",
            params![
                funding.request.to_hex(),
                funding.requester.to_hex(),
                funding.target_admin.to_hex(),
                amount(funding.amount, "amount")?,
                funding.status.as_str(),
                amount(funding.last_seq, "last_seq")?,
                funding.created_at.to_rfc3339(),
                funding.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn find_funding(&self, request: &Pubkey) -> Result<Option<FundingRequest>> {
        self.conn()
            .query_row(
                &format!("{SELECT_FUNDING} WHERE request = ?1"),
                params![request.to_hex()],
                row_to_funding,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn get_funding(&self, request: &Pubkey) -> Result<FundingRequest> {
        self.find_funding(request)?.ok_or(StoreError::NotFound)
    }

    /// Funding requests addressed to `admin`, optionally filtered by status.
    pub fn list_funding_for_admin(
        &self,
        admin: &Pubkey,
        status: Option<FundingStatus>,
    ) -> Result<Vec<FundingRequest>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_FUNDING} WHERE target_admin = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(
            params![admin.to_hex(), status.map(|s| s.as_str())],
            row_to_funding,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_funding(row: &rusqlite::Row<'_>) -> rusqlite::Result<FundingRequest> {
    Ok(FundingRequest {
        request: pubkey_at(row, 0)?,
        requester: pubkey_at(row, 1)?,
        target_admin: pubkey_at(row, 2)?,
        amount: amount_at(row, 3)?,
        status: parsed_at(row, 4)?,
        last_seq: amount_at(row, 5)?,
        created_at: timestamp_at(row, 6)?,
        resolved_at: opt_timestamp_at(row, 7)?,
    })
}
