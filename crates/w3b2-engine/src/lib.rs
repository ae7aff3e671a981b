//! Synchronization and session engine of the W3B2 bridge.
//!
//! The [`Bridge`] owns one listener driver that keeps the [`MirrorStore`] in
//! step with the chain, a [`SessionManager`] for end-to-end encrypted
//! channels, a [`CommandRouter`] for dispatches and other instructions, a
//! [`Keystore`] holding one sealed ChainCard per relationship, and a
//! [`NotificationHub`] that fans everything out to subscribers.

pub mod bridge;
pub mod config;
pub mod connector;
pub mod error;
pub mod fanout;
pub mod keystore;
pub mod listener;
pub mod mirror;
pub mod router;
pub mod session;
pub mod store;

pub use bridge::{Bridge, BridgeStats};
pub use config::EngineConfig;
pub use connector::{ChannelConnector, Connector, ConnectorError};
pub use error::{BridgeError, Result};
pub use fanout::{Notice, NotificationHub, NotificationRecord, SyncStatus, Topic};
pub use keystore::{CardInfo, Keystore, MasterKey, MetadataUpdate};
pub use mirror::MirrorStore;
pub use router::{CommandRouter, DispatchRequest, DispatchUpdate};
pub use session::{SessionInfo, SessionManager};
