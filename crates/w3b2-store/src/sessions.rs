use rusqlite::{params, OptionalExtension};

use w3b2_shared::types::{SessionId, SessionStatus};

use crate::codec::{parsed_at, pubkey_at, timestamp_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::SessionRecord;

impl Database {
    pub fn insert_session(&self, session: &SessionRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO session_exchanges
                (session_id, user_key, admin_key, ephemeral_pubkey, user_envelope,
                 status, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session.session_id.to_string(),
                session.user.to_hex(),
                session.admin.to_hex(),
                session.ephemeral_pubkey.to_hex(),
                session.user_envelope,
                session.status.as_str(),
                session.created_at.to_rfc3339(),
                session.expires_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn find_session(&self, id: &SessionId) -> Result<Option<SessionRecord>> {
        self.conn()
            .query_row(
                "SELECT session_id, user_key, admin_key, ephemeral_pubkey, user_envelope,
                        status, created_at, expires_at
                 FROM session_exchanges WHERE session_id = ?1",
                params![id.to_string()],
                row_to_session,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// Returns `false` when no such session was recorded.
    pub fn set_session_status(&self, id: &SessionId, status: SessionStatus) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE session_exchanges SET status = ?2 WHERE session_id = ?1",
            params![id.to_string(), status.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Mark every still-active session expired. Used at startup: keys live
    /// only in memory, so sessions from a previous run cannot be resumed.
    pub fn expire_stale_sessions(&self) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE session_exchanges SET status = 'expired' WHERE status = 'active'",
            [],
        )?;
        Ok(affected)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        session_id: parsed_at(row, 0)?,
        user: pubkey_at(row, 1)?,
        admin: pubkey_at(row, 2)?,
        ephemeral_pubkey: pubkey_at(row, 3)?,
        user_envelope: row.get(4)?,
        status: parsed_at(row, 5)?,
        created_at: timestamp_at(row, 6)?,
        expires_at: timestamp_at(row, 7)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use w3b2_shared::types::Pubkey;

    use super::*;

    fn session() -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            session_id: SessionId::new(),
            user: Pubkey([1; 32]),
            admin: Pubkey([2; 32]),
            ephemeral_pubkey: Pubkey([3; 32]),
            user_envelope: vec![1, 2, 3],
            status: SessionStatus::Active,
            created_at: now,
            expires_at: now + Duration::minutes(15),
        }
    }

    #[test]
    fn insert_and_close() {
        let db = Database::open_in_memory().unwrap();
        let record = session();
        db.insert_session(&record).unwrap();

        assert_eq!(db.find_session(&record.session_id).unwrap(), Some(record.clone()));
        assert!(db
            .set_session_status(&record.session_id, SessionStatus::Closed)
            .unwrap());
        assert_eq!(
            db.find_session(&record.session_id).unwrap().unwrap().status,
            SessionStatus::Closed
        );
        assert!(!db
            .set_session_status(&SessionId::new(), SessionStatus::Closed)
            .unwrap());
    }

    #[test]
    fn stale_sessions_expire_on_restart() {
        let db = Database::open_in_memory().unwrap();
        db.insert_session(&session()).unwrap();
        db.insert_session(&session()).unwrap();
        assert_eq!(db.expire_stale_sessions().unwrap(), 2);
        assert_eq!(db.expire_stale_sessions().unwrap(), 0);
    }
}
