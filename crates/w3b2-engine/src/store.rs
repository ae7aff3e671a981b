use std::sync::{Arc, Mutex, MutexGuard};

use w3b2_store::{Database, StoreError};

use crate::error::{BridgeError, Result};

/// Shared handle to the durable store.
///
/// One connection behind a mutex: writers are serialized, and every read
/// runs against a single consistent snapshot.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Database>>,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    // A writer that panicked has already rolled its transaction back.
    fn lock(&self) -> MutexGuard<'_, Database> {
        self.db
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run read-only queries.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Database) -> std::result::Result<T, StoreError>,
    ) -> Result<T> {
        let db = self.lock();
        f(&db).map_err(BridgeError::from)
    }

    /// Run `f` inside one transaction; nothing is written unless it succeeds.
    pub fn write<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let db = self.lock();
        db.atomically(f)
    }
}
