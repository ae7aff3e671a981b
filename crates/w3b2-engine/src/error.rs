use thiserror::Error;

use w3b2_shared::error::{CryptoError, DecodeError};
use w3b2_shared::types::{CommandId, DispatchStatus, SessionId};
use w3b2_store::StoreError;

/// Error taxonomy of the bridge engine.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Transport to the chain failed; retried with backoff.
    #[error("Chain unavailable: {0}")]
    ChainUnavailable(String),

    #[error("Invalid event at seq {seq}: {reason}")]
    InvalidEvent { seq: u64, reason: String },

    /// The mirror disagrees with the chain. Apply halts until a re-sync.
    #[error("Mirror divergence: {0}")]
    MirrorDivergence(String),

    #[error("No such profile: {0}")]
    NoSuchProfile(String),

    #[error("Insufficient deposit: price {required}, available {available}")]
    InsufficientDeposit { required: u64, available: u64 },

    #[error("Unknown command id {0}")]
    UnknownCommand(CommandId),

    #[error("Duplicate command: {0}")]
    DuplicateCommand(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Confirmation timeout: {0}")]
    ConfirmationTimeout(String),

    #[error("Session expired: {0}")]
    SessionExpired(SessionId),

    #[error("No such session: {0}")]
    NoSuchSession(SessionId),

    #[error("Dispatch cannot be cancelled in status {0}")]
    NotCancellable(DispatchStatus),

    /// The request or event is structurally invalid for the current state.
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for BridgeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => BridgeError::NotFound("record".into()),
            other => BridgeError::Store(other),
        }
    }
}

impl BridgeError {
    /// Transient failures a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ChainUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
