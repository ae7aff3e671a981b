//! Domain model structs persisted in the bridge database.
//!
//! Every struct derives `Serialize` so it can be handed directly to the HTTP
//! layer as JSON, except [`CardRecord`], which carries a sealed secret.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use w3b2_shared::protocol::PriceEntry;
use w3b2_shared::types::{
    CommandId, CorrelationId, Direction, DispatchStatus, FundingStatus, Pubkey, SessionId,
    SessionStatus,
};

// ---------------------------------------------------------------------------
// Admin profile
// ---------------------------------------------------------------------------

/// A service registered on the bridge program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminProfile {
    pub authority: Pubkey,
    pub communication_pubkey: Pubkey,
    /// Ordered price list (command id -> price).
    pub prices: Vec<PriceEntry>,
    /// Accrued balance from paid commands.
    pub balance: u64,
    /// Sequence number of the last event applied to this row.
    pub last_seq: u64,
    /// Tombstone set by a closure event.
    pub closed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AdminProfile {
    pub fn price_of(&self, command_id: CommandId) -> Option<u64> {
        self.prices
            .iter()
            .find(|entry| entry.command_id == command_id)
            .map(|entry| entry.price)
    }
}

// ---------------------------------------------------------------------------
// User profile
// ---------------------------------------------------------------------------

/// A user's relationship to one service. Keyed by (authority, admin).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub authority: Pubkey,
    pub admin: Pubkey,
    pub communication_pubkey: Pubkey,
    pub deposit: u64,
    pub last_seq: u64,
    pub closed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Funding request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FundingRequest {
    pub request: Pubkey,
    pub requester: Pubkey,
    pub target_admin: Pubkey,
    pub amount: u64,
    pub status: FundingStatus,
    pub last_seq: u64,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Idempotency key of a dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DispatchKey {
    pub user: Pubkey,
    pub admin: Pubkey,
    pub command_id: CommandId,
    pub correlation_id: CorrelationId,
}

impl std::fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.user.short(),
            self.admin.short(),
            self.command_id,
            self.correlation_id
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchRecord {
    pub key: DispatchKey,
    pub direction: Direction,
    /// BLAKE3 reference of the encrypted payload; the payload itself is not stored.
    pub payload_ref: String,
    /// Price reserved against the user's deposit (zero for admin->user).
    pub price: u64,
    pub status: DispatchStatus,
    pub submission_id: Option<String>,
    pub failure: Option<String>,
    /// A confirmation arrived after the record had already failed locally.
    pub late_confirmation: bool,
    /// Confirmation deadline while awaiting.
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Session exchange
// ---------------------------------------------------------------------------

/// Durable public half of a session handshake. The session key is never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub user: Pubkey,
    pub admin: Pubkey,
    pub ephemeral_pubkey: Pubkey,
    pub user_envelope: Vec<u8>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Chain cards
// ---------------------------------------------------------------------------

/// The relationship a ChainCard signs for: `holder` acting toward the service
/// run by admin `service`. An admin's own card has `holder == service`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CardScope {
    pub holder: Pubkey,
    pub service: Pubkey,
}

impl std::fmt::Display for CardScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.holder.short(), self.service.short())
    }
}

/// A stored ChainCard. The secret only ever lands here sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardRecord {
    pub scope: CardScope,
    pub card_pubkey: Pubkey,
    pub sealed_secret: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub admins: u64,
    pub users: u64,
    pub total_admin_balance: u64,
    pub total_user_deposits: u64,
    pub funding_pending: u64,
    pub dispatches_submitted: u64,
    pub dispatches_awaiting: u64,
    pub dispatches_confirmed: u64,
    pub dispatches_failed: u64,
    pub active_sessions: u64,
}
