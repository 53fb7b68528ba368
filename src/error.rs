use std::io;

use thiserror::Error;

/// Error taxonomy for the security engine.
///
/// Variants exist so the host side can log what actually failed. Callers
/// sitting on the trust boundary must treat every variant identically
/// toward the remote peer: the connection simply does not progress, and no
/// error detail crosses the wire.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 encoding")]
    Base64(#[from] base64::DecodeError),
    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("malformed token")]
    MalformedToken,
    #[error("unknown or revoked token")]
    UnknownToken,
    #[error("token expired")]
    TokenExpired,
    #[error("token timestamp outside tolerance")]
    TokenSkew,
    #[error("token signature mismatch")]
    TokenSignature,

    #[error("rate limit exceeded")]
    RateLimited,
    #[error("source temporarily blocked")]
    Blocked,
    #[error("source address is not on the local network")]
    NotLan,

    #[error("unknown pending connection")]
    UnknownPending,
    #[error("pairing challenge expired")]
    PinExpired,
    #[error("too many PIN attempts")]
    TooManyAttempts,
    #[error("PIN mismatch")]
    PinMismatch,

    #[error("no session key established")]
    NoSessionKey,
    #[error("paired session expired")]
    SessionExpired,
    #[error("no pending key exchange for this session")]
    NoKeyExchange,
    #[error("invalid peer public key")]
    InvalidPeerKey,
    #[error("message timestamp outside tolerance")]
    StaleMessage,
    #[error("non-monotonic message sequence")]
    SequenceReplay,
    #[error("duplicate message nonce")]
    NonceReplay,
    #[error("unsupported envelope version")]
    UnsupportedVersion,
    #[error("invalid envelope encoding")]
    InvalidEnvelope,
    #[error("encryption failure")]
    Encrypt(#[source] aes_gcm::aead::Error),
    #[error("decryption failure")]
    Decrypt(#[source] aes_gcm::aead::Error),
    #[error("message signature mismatch")]
    SignatureMismatch,
    #[error("unsigned message rejected")]
    UnsignedRejected,
}
