use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Key exchange produced a non-contributory shared secret")]
    NonContributory,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid hex key: {0}")]
    InvalidHex(String),

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Invalid correlation id: {0}")]
    InvalidCorrelationId(String),
}

/// Failures while turning raw connector records into typed values.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed body for event '{tag}': {reason}")]
    Body { tag: String, reason: String },

    #[error("Unknown {kind} value: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}
