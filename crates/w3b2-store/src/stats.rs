use w3b2_shared::types::DispatchStatus;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::StoreStats;

impl Database {
    /// Aggregate counters served by the statistics endpoint.
    pub fn stats(&self) -> Result<StoreStats> {
        let (admins, total_admin_balance) = self.count_and_sum(
            "SELECT COUNT(*), COALESCE(SUM(balance), 0) FROM admin_profiles WHERE closed = 0",
        )?;
        let (users, total_user_deposits) = self.count_and_sum(
            "SELECT COUNT(*), COALESCE(SUM(deposit), 0) FROM user_profiles WHERE closed = 0",
        )?;
        let (funding_pending, _) = self.count_and_sum(
            "SELECT COUNT(*), 0 FROM funding_requests WHERE status = 'pending'",
        )?;
        let (active_sessions, _) = self.count_and_sum(
            "SELECT COUNT(*), 0 FROM session_exchanges WHERE status = 'active'",
        )?;

        Ok(StoreStats {
            admins,
            users,
            total_admin_balance,
            total_user_deposits,
            funding_pending,
            dispatches_submitted: self.count_dispatches(DispatchStatus::Submitted)?,
            dispatches_awaiting: self.count_dispatches(DispatchStatus::AwaitingConfirmation)?,
            dispatches_confirmed: self.count_dispatches(DispatchStatus::Confirmed)?,
            dispatches_failed: self.count_dispatches(DispatchStatus::Failed)?,
            active_sessions,
        })
    }

    fn count_and_sum(&self, sql: &str) -> Result<(u64, u64)> {
        let (count, sum): (i64, i64) = self
            .conn()
            .query_row(sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let count = u64::try_from(count).map_err(|_| StoreError::Overflow("count"))?;
        let sum = u64::try_from(sum).map_err(|_| StoreError::Overflow("sum"))?;
        Ok((count, sum))
    }
}
