use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{
    KDF_CONTEXT_CARD_WRAP, KDF_CONTEXT_PAYLOAD_REF, KDF_CONTEXT_SESSION_KEY,
    KDF_CONTEXT_SESSION_WRAP, NONCE_SIZE,
};
use crate::error::CryptoError;
use crate::types::Pubkey;

pub type SymmetricKey = [u8; 32];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Derive a symmetric key from a passphrase using BLAKE3 KDF.
pub fn derive_key_from_passphrase(passphrase: &[u8], context: &str) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(passphrase);
    *hasher.finalize().as_bytes()
}

// ---------------------------------------------------------------------------
// ChainCard secrets at rest
// ---------------------------------------------------------------------------

// Each card gets its own wrap key, bound to the relationship it signs for, so
// a sealed secret copied onto another row does not open.
fn card_wrap_key(master: &SymmetricKey, holder: &Pubkey, service: &Pubkey) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_CARD_WRAP);
    hasher.update(master);
    hasher.update(&holder.0);
    hasher.update(&service.0);
    *hasher.finalize().as_bytes()
}

/// Seal a card secret for storage under the keystore master key.
pub fn seal_card_secret(
    master: &SymmetricKey,
    holder: &Pubkey,
    service: &Pubkey,
    secret: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    encrypt(&card_wrap_key(master, holder, service), secret)
}

pub fn open_card_secret(
    master: &SymmetricKey,
    holder: &Pubkey,
    service: &Pubkey,
    sealed: &[u8],
) -> Result<[u8; 32], CryptoError> {
    let bytes = decrypt(&card_wrap_key(master, holder, service), sealed)?;
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)
}

// ---------------------------------------------------------------------------
// Communication keys (X25519)
// ---------------------------------------------------------------------------

/// Generate a fresh X25519 communication secret.
pub fn generate_comm_secret() -> [u8; 32] {
    StaticSecret::random_from_rng(rand::rngs::OsRng).to_bytes()
}

/// The public half of a communication secret, as published on-chain.
pub fn comm_public_key(secret: &[u8; 32]) -> Pubkey {
    let secret = StaticSecret::from(*secret);
    Pubkey(PublicKey::from(&secret).to_bytes())
}

fn diffie_hellman(secret: &StaticSecret, public: &Pubkey) -> Result<[u8; 32], CryptoError> {
    let shared = secret.diffie_hellman(&PublicKey::from(public.0));
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }
    Ok(shared.to_bytes())
}

// BLAKE3 KDF with domain separation, bound to the (user, admin) pair and the
// ephemeral public key of the exchange.
fn derive_bound_key(
    context: &str,
    shared_secret: &[u8; 32],
    user: &Pubkey,
    admin: &Pubkey,
    ephemeral_pubkey: &Pubkey,
) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(shared_secret);
    hasher.update(&user.0);
    hasher.update(&admin.0);
    hasher.update(&ephemeral_pubkey.0);
    *hasher.finalize().as_bytes()
}

/// Result of a session key agreement performed by the bridge.
pub struct SessionKeyExchange {
    /// Public half of the ephemeral key pair; the only value the admin needs.
    pub ephemeral_pubkey: Pubkey,
    /// The session key wrapped for the user under their communication key.
    pub user_envelope: Vec<u8>,
    /// The derived session key. Never persisted.
    pub session_key: SymmetricKey,
}

/// Agree on a session key between a user and an admin.
///
/// An ephemeral X25519 pair `e` is generated. The session key is derived from
/// `ECDH(e, admin_comm)`, so the admin can recompute it from `e_pub`. The same
/// key is wrapped for the user under a key derived from `ECDH(e, user_comm)`.
/// The ephemeral secret is dropped before returning.
pub fn establish_session_key(
    user: &Pubkey,
    admin: &Pubkey,
    user_comm: &Pubkey,
    admin_comm: &Pubkey,
) -> Result<SessionKeyExchange, CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_pubkey = Pubkey(PublicKey::from(&ephemeral).to_bytes());

    let admin_shared = diffie_hellman(&ephemeral, admin_comm)?;
    let session_key = derive_bound_key(
        KDF_CONTEXT_SESSION_KEY,
        &admin_shared,
        user,
        admin,
        &ephemeral_pubkey,
    );

    let user_shared = diffie_hellman(&ephemeral, user_comm)?;
    let wrap_key = derive_bound_key(
        KDF_CONTEXT_SESSION_WRAP,
        &user_shared,
        user,
        admin,
        &ephemeral_pubkey,
    );
    let user_envelope = encrypt(&wrap_key, &session_key)?;

    Ok(SessionKeyExchange {
        ephemeral_pubkey,
        user_envelope,
        session_key,
    })
}

/// Recompute the session key on the admin side.
pub fn recover_session_key_as_admin(
    admin_comm_secret: &[u8; 32],
    ephemeral_pubkey: &Pubkey,
    user: &Pubkey,
    admin: &Pubkey,
) -> Result<SymmetricKey, CryptoError> {
    let secret = StaticSecret::from(*admin_comm_secret);
    let shared = diffie_hellman(&secret, ephemeral_pubkey)?;
    Ok(derive_bound_key(
        KDF_CONTEXT_SESSION_KEY,
        &shared,
        user,
        admin,
        ephemeral_pubkey,
    ))
}

/// Unwrap the session key on the user side.
pub fn recover_session_key_as_user(
    user_comm_secret: &[u8; 32],
    ephemeral_pubkey: &Pubkey,
    user_envelope: &[u8],
    user: &Pubkey,
    admin: &Pubkey,
) -> Result<SymmetricKey, CryptoError> {
    let secret = StaticSecret::from(*user_comm_secret);
    let shared = diffie_hellman(&secret, ephemeral_pubkey)?;
    let wrap_key = derive_bound_key(
        KDF_CONTEXT_SESSION_WRAP,
        &shared,
        user,
        admin,
        ephemeral_pubkey,
    );
    let bytes = decrypt(&wrap_key, user_envelope)?;
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)
}

/// Content reference for an (encrypted) payload, stored instead of the payload.
pub fn payload_reference(data: &[u8]) -> String {
    hex::encode(blake3::derive_key(KDF_CONTEXT_PAYLOAD_REF, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_symmetric_key();
        let plaintext = b"dispatch payload";

        let encrypted = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &encrypted).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = generate_symmetric_key();
        let key2 = generate_symmetric_key();

        let encrypted = encrypt(&key1, b"Secret message").unwrap();
        assert_eq!(decrypt(&key2, &encrypted), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = generate_symmetric_key();

        let mut encrypted = encrypt(&key, b"Important data").unwrap();
        let len = encrypted.len();
        encrypted[len - 1] ^= 0xFF;

        assert!(decrypt(&key, &encrypted).is_err());
    }

    #[test]
    fn test_empty_data_fails() {
        let key = generate_symmetric_key();
        assert!(decrypt(&key, &[]).is_err());
    }

    #[test]
    fn test_both_parties_recover_session_key() {
        let user = Pubkey([1u8; 32]);
        let admin = Pubkey([2u8; 32]);
        let user_secret = generate_comm_secret();
        let admin_secret = generate_comm_secret();

        let exchange = establish_session_key(
            &user,
            &admin,
            &comm_public_key(&user_secret),
            &comm_public_key(&admin_secret),
        )
        .unwrap();

        let admin_key =
            recover_session_key_as_admin(&admin_secret, &exchange.ephemeral_pubkey, &user, &admin)
                .unwrap();
        let user_key = recover_session_key_as_user(
            &user_secret,
            &exchange.ephemeral_pubkey,
            &exchange.user_envelope,
            &user,
            &admin,
        )
        .unwrap();

        assert_eq!(admin_key, exchange.session_key);
        assert_eq!(user_key, exchange.session_key);
    }

    #[test]
    fn test_session_key_bound_to_pair() {
        let user = Pubkey([1u8; 32]);
        let admin = Pubkey([2u8; 32]);
        let admin_secret = generate_comm_secret();
        let exchange = establish_session_key(
            &user,
            &admin,
            &comm_public_key(&generate_comm_secret()),
            &comm_public_key(&admin_secret),
        )
        .unwrap();

        let other_user = Pubkey([3u8; 32]);
        let key = recover_session_key_as_admin(
            &admin_secret,
            &exchange.ephemeral_pubkey,
            &other_user,
            &admin,
        )
        .unwrap();
        assert_ne!(key, exchange.session_key);
    }

    #[test]
    fn test_user_envelope_rejects_wrong_secret() {
        let user = Pubkey([1u8; 32]);
        let admin = Pubkey([2u8; 32]);
        let exchange = establish_session_key(
            &user,
            &admin,
            &comm_public_key(&generate_comm_secret()),
            &comm_public_key(&generate_comm_secret()),
        )
        .unwrap();

        let result = recover_session_key_as_user(
            &generate_comm_secret(),
            &exchange.ephemeral_pubkey,
            &exchange.user_envelope,
            &user,
            &admin,
        );
        assert_eq!(result, Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_low_order_comm_key_rejected() {
        let result = establish_session_key(
            &Pubkey([1u8; 32]),
            &Pubkey([2u8; 32]),
            &comm_public_key(&generate_comm_secret()),
            &Pubkey([0u8; 32]),
        );
        assert!(matches!(result, Err(CryptoError::NonContributory)));
    }

    #[test]
    fn test_payload_reference_deterministic() {
        assert_eq!(payload_reference(b"abc"), payload_reference(b"abc"));
        assert_ne!(payload_reference(b"abc"), payload_reference(b"abd"));
        assert_eq!(payload_reference(b"abc").len(), 64);
    }

    #[test]
    fn test_card_secret_opens_only_for_its_relationship() {
        let master = derive_key_from_passphrase(b"operator passphrase", "w3b2-test");
        let (holder, service) = (Pubkey([1u8; 32]), Pubkey([2u8; 32]));
        let secret = [7u8; 32];

        let sealed = seal_card_secret(&master, &holder, &service, &secret).unwrap();
        assert!(!sealed.windows(32).any(|w| w == secret));
        assert_eq!(open_card_secret(&master, &holder, &service, &sealed), Ok(secret));

        assert_eq!(
            open_card_secret(&master, &holder, &Pubkey([3u8; 32]), &sealed),
            Err(CryptoError::DecryptionFailed)
        );
        let other_master = derive_key_from_passphrase(b"another passphrase", "w3b2-test");
        assert!(open_card_secret(&other_master, &holder, &service, &sealed).is_err());
    }
}
