//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation. Callers that need several
//! writes to land together wrap them in [`Database::atomically`].

use std::path::{Path, PathBuf};

use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a database at an explicit path, creating the parent
    /// directory if needed.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }

    /// Run `f` inside a single SQLite transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise,
    /// including when `f` panics, so a failed closure leaves no partial writes
    /// behind. Not reentrant.
    pub fn atomically<T, E>(
        &self,
        f: impl FnOnce(&Self) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<StoreError>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(StoreError::from)?;
        let tx = OpenTransaction {
            conn: &self.conn,
            committed: false,
        };

        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }

    /// Drop every mirrored entity and the checkpoint so the mirror can be
    /// rebuilt from genesis. Dispatch records and session offers are kept.
    pub fn reset_mirror(&self) -> Result<()> {
        self.atomically(|db| {
            db.conn.execute_batch(
                "DELETE FROM admin_prices;
                 DELETE FROM admin_profiles;
                 DELETE FROM user_profiles;
                 DELETE FROM funding_requests;
                 DELETE FROM checkpoint;",
            )?;
            Ok::<_, StoreError>(())
        })?;
        tracing::warn!("mirror state cleared, replay from genesis required");
        Ok(())
    }
}

/// Rolls back on drop unless committed.
struct OpenTransaction<'a> {
    conn: &'a Connection,
    committed: bool,
}

impl OpenTransaction<'_> {
    fn commit(mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for OpenTransaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            tracing::error!(error = %e, "transaction rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");

        let db = Database::open_at(&path).expect("should open");
        assert!(db.path().is_some());
        assert!(path.exists());
    }

    #[test]
    fn failed_closure_rolls_back() {
        let db = Database::open_in_memory().unwrap();

        let result: Result<()> = db.atomically(|db| {
            db.conn().execute(
                "INSERT INTO checkpoint (id, slot, seq, signature, updated_at)
                 VALUES (1, 1, 1, 'sig', '2024-01-01T00:00:00Z')",
                [],
            )?;
            Err(StoreError::NotFound)
        });
        assert!(result.is_err());

        let rows: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM checkpoint", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn panicking_closure_rolls_back() {
        let db = Database::open_in_memory().unwrap();

        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<()> = db.atomically(|db| {
                db.conn().execute(
                    "INSERT INTO checkpoint (id, slot, seq, signature, updated_at)
                     VALUES (1, 1, 1, 'sig', '2024-01-01T00:00:00Z')",
                    [],
                )?;
                panic!("closure died mid-transaction");
            });
        }));
        assert!(unwound.is_err());
        assert!(db.conn().is_autocommit());

        // The connection accepts a new transaction.
        let rows: i64 = db
            .atomically(|db| {
                db.conn()
                    .query_row("SELECT COUNT(*) FROM checkpoint", [], |row| row.get(0))
                    .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(rows, 0);
    }
}
