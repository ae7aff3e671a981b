use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::IdentityError;
use crate::types::Pubkey;

/// An isolated Ed25519 key pair used to sign on-chain actions.
#[derive(Clone)]
pub struct ChainCard {
    signing_key: SigningKey,
}

impl ChainCard {
    /// Generate a new random card
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore a card from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    /// Restore a card from a 64-character hex secret
    pub fn from_secret_hex(hex_secret: &str) -> Result<Self, IdentityError> {
        let secret = Pubkey::from_hex(hex_secret)?;
        Ok(Self::from_secret_bytes(&secret.0))
    }

    /// The card's authority key
    pub fn pubkey(&self) -> Pubkey {
        Pubkey(self.signing_key.verifying_key().to_bytes())
    }

    /// Get the raw secret key bytes
    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for ChainCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainCard")
            .field("pubkey", &self.pubkey().short())
            .finish_non_exhaustive()
    }
}

/// Verify a signature against a card's public key
pub fn verify_signature(
    pubkey: &Pubkey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(&pubkey.0).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| IdentityError::InvalidSignature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}
