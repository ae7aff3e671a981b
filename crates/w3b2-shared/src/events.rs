//! Domain events emitted by the on-chain bridge program.
//!
//! The connector hands over [`RawEvent`] records: a log position, a tag naming
//! the event and a bincode-encoded body. [`decode`] turns them into a typed
//! [`BridgeEvent`]. Tags this build does not know are reported as
//! [`Decoded::Unknown`] so newer programs never stall older bridges.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::types::{CommandId, CorrelationId, EventPosition, FundingStatus, Pubkey};

// --- Admin lifecycle ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminProfileRegistered {
    pub authority: Pubkey,
    pub communication_pubkey: Pubkey,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminCommKeyUpdated {
    pub authority: Pubkey,
    pub new_comm_pubkey: Pubkey,
    pub ts: i64,
}

/// Replaces the whole price list; order is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminPricesUpdated {
    pub authority: Pubkey,
    pub new_prices: Vec<(CommandId, u64)>,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminFundsWithdrawn {
    pub authority: Pubkey,
    pub amount: u64,
    pub destination: Pubkey,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminProfileClosed {
    pub authority: Pubkey,
    pub ts: i64,
}

// --- User lifecycle & funds ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfileCreated {
    pub authority: Pubkey,
    pub target_admin: Pubkey,
    pub communication_pubkey: Pubkey,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCommKeyUpdated {
    pub authority: Pubkey,
    pub target_admin: Pubkey,
    pub new_comm_pubkey: Pubkey,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFundsDeposited {
    pub authority: Pubkey,
    pub target_admin: Pubkey,
    pub amount: u64,
    /// Deposit balance reported by the program after the transaction.
    pub new_deposit_balance: u64,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFundsWithdrawn {
    pub authority: Pubkey,
    pub target_admin: Pubkey,
    pub amount: u64,
    pub destination: Pubkey,
    pub new_deposit_balance: u64,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfileClosed {
    pub authority: Pubkey,
    pub target_admin: Pubkey,
    pub ts: i64,
}

// --- Command dispatch ---

/// A user called a (possibly paid) admin command. Confirms a user->admin dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCommandDispatched {
    pub sender: Pubkey,
    pub target_admin: Pubkey,
    pub command_id: CommandId,
    pub price_paid: u64,
    pub correlation_id: CorrelationId,
    pub payload: Vec<u8>,
    pub ts: i64,
}

/// An admin pushed a command to one of its users. Confirms an admin->user dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminCommandDispatched {
    pub sender: Pubkey,
    pub target_user: Pubkey,
    pub command_id: CommandId,
    pub correlation_id: CorrelationId,
    pub payload: Vec<u8>,
    pub ts: i64,
}

/// The program rejected a dispatch transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailed {
    pub user: Pubkey,
    pub admin: Pubkey,
    pub command_id: CommandId,
    pub correlation_id: CorrelationId,
    pub reason: String,
    pub ts: i64,
}

// --- Funding ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingRequested {
    /// Address of the funding request account.
    pub request: Pubkey,
    pub requester: Pubkey,
    pub target_admin: Pubkey,
    pub amount: u64,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingResolved {
    pub request: Pubkey,
    pub target_admin: Pubkey,
    pub status: FundingStatus,
    pub ts: i64,
}

// --- Operational ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffChainActionLogged {
    pub actor: Pubkey,
    pub session_id: u64,
    pub action_code: u16,
    pub ts: i64,
}

/// Every event the bridge program is known to emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum BridgeEvent {
    AdminProfileRegistered(AdminProfileRegistered),
    AdminCommKeyUpdated(AdminCommKeyUpdated),
    AdminPricesUpdated(AdminPricesUpdated),
    AdminFundsWithdrawn(AdminFundsWithdrawn),
    AdminProfileClosed(AdminProfileClosed),
    UserProfileCreated(UserProfileCreated),
    UserCommKeyUpdated(UserCommKeyUpdated),
    UserFundsDeposited(UserFundsDeposited),
    UserFundsWithdrawn(UserFundsWithdrawn),
    UserProfileClosed(UserProfileClosed),
    UserCommandDispatched(UserCommandDispatched),
    AdminCommandDispatched(AdminCommandDispatched),
    CommandFailed(CommandFailed),
    FundingRequested(FundingRequested),
    FundingResolved(FundingResolved),
    OffChainActionLogged(OffChainActionLogged),
}

impl BridgeEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::AdminProfileRegistered(_) => "AdminProfileRegistered",
            Self::AdminCommKeyUpdated(_) => "AdminCommKeyUpdated",
            Self::AdminPricesUpdated(_) => "AdminPricesUpdated",
            Self::AdminFundsWithdrawn(_) => "AdminFundsWithdrawn",
            Self::AdminProfileClosed(_) => "AdminProfileClosed",
            Self::UserProfileCreated(_) => "UserProfileCreated",
            Self::UserCommKeyUpdated(_) => "UserCommKeyUpdated",
            Self::UserFundsDeposited(_) => "UserFundsDeposited",
            Self::UserFundsWithdrawn(_) => "UserFundsWithdrawn",
            Self::UserProfileClosed(_) => "UserProfileClosed",
            Self::UserCommandDispatched(_) => "UserCommandDispatched",
            Self::AdminCommandDispatched(_) => "AdminCommandDispatched",
            Self::CommandFailed(_) => "CommandFailed",
            Self::FundingRequested(_) => "FundingRequested",
            Self::FundingResolved(_) => "FundingResolved",
            Self::OffChainActionLogged(_) => "OffChainActionLogged",
        }
    }

    /// Public keys an event is relevant to (used to route notifications).
    pub fn involved_keys(&self) -> Vec<Pubkey> {
        match self {
            Self::AdminProfileRegistered(e) => vec![e.authority],
            Self::AdminCommKeyUpdated(e) => vec![e.authority],
            Self::AdminPricesUpdated(e) => vec![e.authority],
            Self::AdminFundsWithdrawn(e) => vec![e.authority],
            Self::AdminProfileClosed(e) => vec![e.authority],
            Self::UserProfileCreated(e) => vec![e.authority, e.target_admin],
            Self::UserCommKeyUpdated(e) => vec![e.authority, e.target_admin],
            Self::UserFundsDeposited(e) => vec![e.authority, e.target_admin],
            Self::UserFundsWithdrawn(e) => vec![e.authority, e.target_admin],
            Self::UserProfileClosed(e) => vec![e.authority, e.target_admin],
            Self::UserCommandDispatched(e) => vec![e.sender, e.target_admin],
            Self::AdminCommandDispatched(e) => vec![e.sender, e.target_user],
            Self::CommandFailed(e) => vec![e.user, e.admin],
            Self::FundingRequested(e) => vec![e.requester, e.target_admin],
            Self::FundingResolved(e) => vec![e.target_admin],
            Self::OffChainActionLogged(e) => vec![e.actor],
        }
    }

    /// Encode into the raw record shape the connector delivers.
    pub fn to_raw(&self, position: EventPosition) -> Result<RawEvent, DecodeError> {
        let data = match self {
            Self::AdminProfileRegistered(e) => bincode::serialize(e)?,
            Self::AdminCommKeyUpdated(e) => bincode::serialize(e)?,
            Self::AdminPricesUpdated(e) => bincode::serialize(e)?,
            Self::AdminFundsWithdrawn(e) => bincode::serialize(e)?,
            Self::AdminProfileClosed(e) => bincode::serialize(e)?,
            Self::UserProfileCreated(e) => bincode::serialize(e)?,
            Self::UserCommKeyUpdated(e) => bincode::serialize(e)?,
            Self::UserFundsDeposited(e) => bincode::serialize(e)?,
            Self::UserFundsWithdrawn(e) => bincode::serialize(e)?,
            Self::UserProfileClosed(e) => bincode::serialize(e)?,
            Self::UserCommandDispatched(e) => bincode::serialize(e)?,
            Self::AdminCommandDispatched(e) => bincode::serialize(e)?,
            Self::CommandFailed(e) => bincode::serialize(e)?,
            Self::FundingRequested(e) => bincode::serialize(e)?,
            Self::FundingResolved(e) => bincode::serialize(e)?,
            Self::OffChainActionLogged(e) => bincode::serialize(e)?,
        };
        Ok(RawEvent {
            position,
            tag: self.tag().to_string(),
            data,
        })
    }
}

/// An undecoded record as streamed by the connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub position: EventPosition,
    pub tag: String,
    pub data: Vec<u8>,
}

/// A decoded event together with its log position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub position: EventPosition,
    pub event: BridgeEvent,
}

impl EventEnvelope {
    pub fn seq(&self) -> u64 {
        self.position.seq
    }
}

/// Outcome of decoding a raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Known(BridgeEvent),
    /// A tag this build does not recognise; carries the tag for logging.
    Unknown(String),
}

fn body<T: for<'de> Deserialize<'de>>(tag: &str, data: &[u8]) -> Result<T, DecodeError> {
    bincode::deserialize(data).map_err(|e| DecodeError::Body {
        tag: tag.to_string(),
        reason: e.to_string(),
    })
}

/// Decode a raw record into a typed event.
pub fn decode(raw: &RawEvent) -> Result<Decoded, DecodeError> {
    let tag = raw.tag.as_str();
    let data = raw.data.as_slice();
    let event = match tag {
        "AdminProfileRegistered" => BridgeEvent::AdminProfileRegistered(body(tag, data)?),
        "AdminCommKeyUpdated" => BridgeEvent::AdminCommKeyUpdated(body(tag, data)?),
        "AdminPricesUpdated" => BridgeEvent::AdminPricesUpdated(body(tag, data)?),
        "AdminFundsWithdrawn" => BridgeEvent::AdminFundsWithdrawn(body(tag, data)?),
        "AdminProfileClosed" => BridgeEvent::AdminProfileClosed(body(tag, data)?),
        "UserProfileCreated" => BridgeEvent::UserProfileCreated(body(tag, data)?),
        "UserCommKeyUpdated" => BridgeEvent::UserCommKeyUpdated(body(tag, data)?),
        "UserFundsDeposited" => BridgeEvent::UserFundsDeposited(body(tag, data)?),
        "UserFundsWithdrawn" => BridgeEvent::UserFundsWithdrawn(body(tag, data)?),
        "UserProfileClosed" => BridgeEvent::UserProfileClosed(body(tag, data)?),
        "UserCommandDispatched" => BridgeEvent::UserCommandDispatched(body(tag, data)?),
        "AdminCommandDispatched" => BridgeEvent::AdminCommandDispatched(body(tag, data)?),
        "CommandFailed" => BridgeEvent::CommandFailed(body(tag, data)?),
        "FundingRequested" => BridgeEvent::FundingRequested(body(tag, data)?),
        "FundingResolved" => BridgeEvent::FundingResolved(body(tag, data)?),
        "OffChainActionLogged" => BridgeEvent::OffChainActionLogged(body(tag, data)?),
        other => return Ok(Decoded::Unknown(other.to_string())),
    };
    Ok(Decoded::Known(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(seq: u64) -> EventPosition {
        EventPosition {
            slot: seq * 10,
            seq,
            signature: format!("sig-{seq}"),
        }
    }

    #[test]
    fn test_decode_known_event() {
        let event = BridgeEvent::UserCommandDispatched(UserCommandDispatched {
            sender: Pubkey([1u8; 32]),
            target_admin: Pubkey([2u8; 32]),
            command_id: 5,
            price_paid: 300_000,
            correlation_id: CorrelationId::new("req-1").unwrap(),
            payload: vec![9, 9, 9],
            ts: 1_700_000_000,
        });

        let raw = event.to_raw(position(4)).unwrap();
        assert_eq!(raw.tag, "UserCommandDispatched");
        assert_eq!(decode(&raw).unwrap(), Decoded::Known(event));
    }

    #[test]
    fn test_unknown_tag_is_not_an_error() {
        let raw = RawEvent {
            position: position(1),
            tag: "SomethingFromTheFuture".to_string(),
            data: vec![1, 2, 3],
        };
        assert_eq!(
            decode(&raw).unwrap(),
            Decoded::Unknown("SomethingFromTheFuture".to_string())
        );
    }

    #[test]
    fn test_malformed_body_is_rejected() {
        let raw = RawEvent {
            position: position(1),
            tag: "UserFundsDeposited".to_string(),
            data: vec![0xff],
        };
        assert!(matches!(decode(&raw), Err(DecodeError::Body { .. })));
    }

    #[test]
    fn test_involved_keys_cover_both_parties() {
        let event = BridgeEvent::UserProfileCreated(UserProfileCreated {
            authority: Pubkey([1u8; 32]),
            target_admin: Pubkey([2u8; 32]),
            communication_pubkey: Pubkey([3u8; 32]),
            ts: 0,
        });
        assert_eq!(
            event.involved_keys(),
            vec![Pubkey([1u8; 32]), Pubkey([2u8; 32])]
        );
    }

    #[test]
    fn test_json_shape_is_tagged() {
        let event = BridgeEvent::AdminProfileClosed(AdminProfileClosed {
            authority: Pubkey([1u8; 32]),
            ts: 7,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "AdminProfileClosed");
        assert_eq!(json["data"]["ts"], 7);
    }
}
