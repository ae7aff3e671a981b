//! # w3b2-store
//!
//! Durable state of the bridge, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for the mirrored
//! chain entities, the dispatch idempotency index, session handshakes, sealed
//! per-relationship ChainCards and the event checkpoint.

pub mod admins;
pub mod cards;
pub mod checkpoint;
pub mod database;
pub mod dispatches;
pub mod funding;
pub mod migrations;
pub mod models;
pub mod sessions;
pub mod stats;
pub mod users;

mod codec;
mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
