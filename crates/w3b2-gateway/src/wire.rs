//! JSON request and response bodies. Binary fields travel as base64.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use w3b2_engine::{DispatchRequest, MetadataUpdate};
use w3b2_shared::events::RawEvent;
use w3b2_shared::protocol::{SessionOffer, SignedSubmission, SubmissionId};
use w3b2_shared::types::{
    CommandId, CorrelationId, Direction, EventPosition, FundingStatus, Pubkey, SessionId,
};

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.trim()).map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Deserialize)]
pub struct RegisterAdminRequest {
    pub authority: Pubkey,
    pub communication_pubkey: Pubkey,
}

#[derive(Deserialize)]
pub struct RegisterUserRequest {
    pub authority: Pubkey,
    pub target_admin: Pubkey,
    pub communication_pubkey: Pubkey,
}

#[derive(Deserialize)]
pub struct FundingRequestBody {
    pub requester: Pubkey,
    pub target_admin: Pubkey,
    pub amount: u64,
}

#[derive(Deserialize)]
pub struct FundingQuery {
    pub status: Option<FundingStatus>,
}

/// Fire-and-track acknowledgement; the effect arrives later as chain events.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmittedResponse {
    pub submission_id: SubmissionId,
    pub instruction: String,
}

#[derive(Deserialize)]
pub struct DispatchBody {
    pub direction: Direction,
    pub user: Pubkey,
    pub admin: Pubkey,
    pub command_id: CommandId,
    pub correlation_id: CorrelationId,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
}

impl From<DispatchBody> for DispatchRequest {
    fn from(body: DispatchBody) -> Self {
        DispatchRequest {
            direction: body.direction,
            user: body.user,
            admin: body.admin,
            command_id: body.command_id,
            correlation_id: body.correlation_id,
            payload: body.payload,
        }
    }
}

#[derive(Deserialize)]
pub struct OpenSessionRequest {
    pub user: Pubkey,
    pub admin: Pubkey,
}

/// Public handshake material handed to both parties.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionOfferView {
    pub session_id: SessionId,
    pub user: Pubkey,
    pub admin: Pubkey,
    pub ephemeral_pubkey: Pubkey,
    #[serde(with = "b64")]
    pub user_envelope: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<SessionOffer> for SessionOfferView {
    fn from(offer: SessionOffer) -> Self {
        Self {
            session_id: offer.session_id,
            user: offer.user,
            admin: offer.admin,
            ephemeral_pubkey: offer.ephemeral_pubkey,
            user_envelope: offer.user_envelope,
            created_at: offer.created_at,
            expires_at: offer.expires_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DataBody {
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// A raw record as posted by an external indexer.
#[derive(Deserialize)]
pub struct RawEventBody {
    pub position: EventPosition,
    pub tag: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

impl From<RawEventBody> for RawEvent {
    fn from(body: RawEventBody) -> Self {
        RawEvent {
            position: body.position,
            tag: body.tag,
            data: body.data,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub accepted: usize,
}

/// A queued submission for the external relayer.
#[derive(Debug, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub submission_id: SubmissionId,
    /// Decoded instruction name, `unknown` if the bytes do not decode.
    pub name: String,
    pub signer: Pubkey,
    #[serde(with = "b64")]
    pub instruction: Vec<u8>,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

impl OutboxEntry {
    pub fn new(submission_id: SubmissionId, submission: SignedSubmission) -> Self {
        let name = submission
            .decode_instruction()
            .map(|i| i.name().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            submission_id,
            name,
            signer: submission.signer,
            instruction: submission.instruction,
            signature: submission.signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_is_base64() {
        let body: DispatchBody = serde_json::from_value(serde_json::json!({
            "direction": "user_to_admin",
            "user": "05".repeat(32),
            "admin": "ad".repeat(32),
            "command_id": 5,
            "correlation_id": "order-1",
            "payload": "aGVsbG8=",
        }))
        .unwrap();
        assert_eq!(body.payload, b"hello");

        let encoded = serde_json::to_value(DataBody {
            data: b"hello".to_vec(),
        })
        .unwrap();
        assert_eq!(encoded["data"], "aGVsbG8=");
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let result: Result<DataBody, _> =
            serde_json::from_value(serde_json::json!({ "data": "not base64!" }));
        assert!(result.is_err());
    }
}

#[derive(Deserialize)]
pub struct CardsQuery {
    pub holder: Option<Pubkey>,
}

#[derive(Deserialize)]
pub struct CreateCardRequest {
    pub holder: Pubkey,
    pub service: Pubkey,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// `{"replace": {..}}`, `{"set": {"key": .., "value": ..}}` or `{"delete": ".."}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataPatch {
    Replace(BTreeMap<String, String>),
    Set { key: String, value: String },
    Delete(String),
}

impl From<MetadataPatch> for MetadataUpdate {
    fn from(patch: MetadataPatch) -> Self {
        match patch {
            MetadataPatch::Replace(metadata) => MetadataUpdate::Replace(metadata),
            MetadataPatch::Set { key, value } => MetadataUpdate::Set { key, value },
            MetadataPatch::Delete(key) => MetadataUpdate::Delete(key),
        }
    }
}
