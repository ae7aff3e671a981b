use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, IdentityError};
use crate::identity::{verify_signature, ChainCard};
use crate::types::{CommandId, CorrelationId, Pubkey, SessionId};

/// One entry of an admin's ordered price list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub command_id: CommandId,
    pub price: u64,
}

impl From<(CommandId, u64)> for PriceEntry {
    fn from((command_id, price): (CommandId, u64)) -> Self {
        Self { command_id, price }
    }
}

/// All instructions the bridge submits to the on-chain program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    AdminRegister {
        authority: Pubkey,
        communication_pubkey: Pubkey,
    },
    AdminUpdateCommKey {
        authority: Pubkey,
        new_key: Pubkey,
    },
    AdminUpdatePrices {
        authority: Pubkey,
        prices: Vec<PriceEntry>,
    },
    AdminWithdraw {
        authority: Pubkey,
        amount: u64,
        destination: Pubkey,
    },
    AdminClose {
        authority: Pubkey,
    },
    UserCreate {
        authority: Pubkey,
        target_admin: Pubkey,
        communication_pubkey: Pubkey,
    },
    UserUpdateCommKey {
        authority: Pubkey,
        target_admin: Pubkey,
        new_key: Pubkey,
    },
    UserDeposit {
        authority: Pubkey,
        target_admin: Pubkey,
        amount: u64,
    },
    UserWithdraw {
        authority: Pubkey,
        target_admin: Pubkey,
        amount: u64,
        destination: Pubkey,
    },
    UserClose {
        authority: Pubkey,
        target_admin: Pubkey,
    },
    RequestFunding {
        requester: Pubkey,
        target_admin: Pubkey,
        amount: u64,
    },
    ResolveFunding {
        authority: Pubkey,
        request: Pubkey,
        approve: bool,
    },
    /// A command dispatch. `payload` is ciphertext under the pair's session key.
    DispatchCommand {
        sender: Pubkey,
        recipient: Pubkey,
        command_id: CommandId,
        /// Maximum price the sender accepts; zero for admin->user pushes.
        max_price: u64,
        correlation_id: CorrelationId,
        payload: Vec<u8>,
    },
    LogAction {
        actor: Pubkey,
        session_id: u64,
        action_code: u16,
    },
}

impl Instruction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AdminRegister { .. } => "admin_register",
            Self::AdminUpdateCommKey { .. } => "admin_update_comm_key",
            Self::AdminUpdatePrices { .. } => "admin_update_prices",
            Self::AdminWithdraw { .. } => "admin_withdraw",
            Self::AdminClose { .. } => "admin_close",
            Self::UserCreate { .. } => "user_create",
            Self::UserUpdateCommKey { .. } => "user_update_comm_key",
            Self::UserDeposit { .. } => "user_deposit",
            Self::UserWithdraw { .. } => "user_withdraw",
            Self::UserClose { .. } => "user_close",
            Self::RequestFunding { .. } => "request_funding",
            Self::ResolveFunding { .. } => "resolve_funding",
            Self::DispatchCommand { .. } => "dispatch_command",
            Self::LogAction { .. } => "log_action",
        }
    }

    /// The ChainCard on whose behalf the instruction acts.
    pub fn authority(&self) -> &Pubkey {
        match self {
            Self::AdminRegister { authority, .. }
            | Self::AdminUpdateCommKey { authority, .. }
            | Self::AdminUpdatePrices { authority, .. }
            | Self::AdminWithdraw { authority, .. }
            | Self::AdminClose { authority }
            | Self::UserCreate { authority, .. }
            | Self::UserUpdateCommKey { authority, .. }
            | Self::UserDeposit { authority, .. }
            | Self::UserWithdraw { authority, .. }
            | Self::UserClose { authority, .. }
            | Self::ResolveFunding { authority, .. } => authority,
            Self::RequestFunding { requester, .. } => requester,
            Self::DispatchCommand { sender, .. } => sender,
            Self::LogAction { actor, .. } => actor,
        }
    }
}

/// A bincode-encoded instruction signed by the ChainCard of the relationship it
/// acts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedSubmission {
    pub instruction: Vec<u8>,
    pub signer: Pubkey,
    pub signature: Vec<u8>,
}

impl SignedSubmission {
    pub fn sign(card: &ChainCard, instruction: &Instruction) -> Result<Self, DecodeError> {
        let bytes = bincode::serialize(instruction)?;
        let signature = card.sign(&bytes).to_bytes().to_vec();
        Ok(Self {
            instruction: bytes,
            signer: card.pubkey(),
            signature,
        })
    }

    pub fn verify(&self) -> Result<(), IdentityError> {
        verify_signature(&self.signer, &self.instruction, &self.signature)
    }

    pub fn decode_instruction(&self) -> Result<Instruction, DecodeError> {
        Ok(bincode::deserialize(&self.instruction)?)
    }
}

/// Identifier the connector returns for an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub String);

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Public half of a session handshake, delivered to both parties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOffer {
    pub session_id: SessionId,
    pub user: Pubkey,
    pub admin: Pubkey,
    pub ephemeral_pubkey: Pubkey,
    /// Session key encrypted for the user (nonce || ciphertext).
    pub user_envelope: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_submission_verifies() {
        let card = ChainCard::generate();
        let instruction = Instruction::UserDeposit {
            authority: Pubkey([1u8; 32]),
            target_admin: Pubkey([2u8; 32]),
            amount: 1_000_000,
        };

        let submission = SignedSubmission::sign(&card, &instruction).unwrap();
        assert!(submission.verify().is_ok());
        assert_eq!(submission.signer, card.pubkey());
        assert_eq!(submission.decode_instruction().unwrap(), instruction);
    }

    #[test]
    fn test_tampered_submission_fails() {
        let card = ChainCard::generate();
        let mut submission = SignedSubmission::sign(
            &card,
            &Instruction::AdminClose {
                authority: Pubkey([1u8; 32]),
            },
        )
        .unwrap();
        submission.instruction.push(0);
        assert!(submission.verify().is_err());
    }

    #[test]
    fn test_instruction_authority() {
        let instruction = Instruction::RequestFunding {
            requester: Pubkey([4u8; 32]),
            target_admin: Pubkey([2u8; 32]),
            amount: 10,
        };
        assert_eq!(instruction.authority(), &Pubkey([4u8; 32]));
        assert_eq!(instruction.name(), "request_funding");
    }
}
