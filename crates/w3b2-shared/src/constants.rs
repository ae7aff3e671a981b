/// Bridge protocol version advertised by the gateway
pub const PROTOCOL_VERSION: &str = "/w3b2-bridge/1.0.0";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Ed25519 / X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum dispatch payload size in bytes (64 KiB)
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Maximum length of a client supplied correlation id
pub const MAX_CORRELATION_ID_LEN: usize = 64;

/// Default HTTP API port (gateway)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_SESSION_KEY: &str = "w3b2-session-key-v1";
pub const KDF_CONTEXT_SESSION_WRAP: &str = "w3b2-session-wrap-v1";
pub const KDF_CONTEXT_PAYLOAD_REF: &str = "w3b2-payload-ref-v1";
pub const KDF_CONTEXT_KEYSTORE_MASTER: &str = "w3b2-keystore-master-v1";
pub const KDF_CONTEXT_CARD_WRAP: &str = "w3b2-card-wrap-v1";
