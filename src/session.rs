use std::collections::{HashSet, VecDeque};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::SecurityError;
use crate::secret::HostSecret;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const ENVELOPE_VERSION: u8 = 1;

const SIGNALING_INFO: &[u8] = b"breakwater/signaling-v1";
const ROTATION_INFO: &[u8] = b"breakwater/key-rotation";

/// Wire form of an encrypted signaling message. `v` distinguishes AEAD
/// framing from anything older; only version 1 is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub encrypted: bool,
    pub v: u8,
    pub ct: String,
    pub n: String,
    pub ts: i64,
    pub seq: u64,
}

/// Bounded set of nonces already accepted under the current session.
/// Overflow trims to the most recent entries, oldest first.
#[derive(Debug)]
pub(crate) struct NonceCache {
    seen: HashSet<String>,
    order: VecDeque<String>,
    max: usize,
    trim: usize,
}

impl NonceCache {
    pub(crate) fn new(max: usize, trim: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            max,
            trim,
        }
    }

    /// Records `nonce`; returns `false` when it was already present.
    pub(crate) fn insert(&mut self, nonce: &str) -> bool {
        if self.seen.contains(nonce) {
            return false;
        }
        self.seen.insert(nonce.to_string());
        self.order.push_back(nonce.to_string());
        if self.seen.len() > self.max {
            while self.seen.len() > self.trim {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                } else {
                    break;
                }
            }
        }
        true
    }
}

/// Per-connection authenticated-encryption state.
///
/// The session key is established either through an ephemeral x25519
/// exchange or directly from the pairing token and host secret; both paths
/// run the result through HKDF-SHA256 with the token as binding context, so
/// a captured key is useless once the token rotates. The key ratchets
/// forward every `rotation_interval` messages and is never persisted.
pub struct SessionCrypto {
    session_key: Option<[u8; KEY_LEN]>,
    message_count: u64,
    sequence: u64,
    peer_sequence: u64,
    nonces: NonceCache,
    rotation_interval: u64,
    max_message_age_secs: i64,
    exchange_secret: Option<StaticSecret>,
}

impl SessionCrypto {
    pub fn new(
        rotation_interval: u64,
        max_message_age_secs: i64,
        nonce_cache_max: usize,
        nonce_cache_trim: usize,
    ) -> Self {
        Self {
            session_key: None,
            message_count: 0,
            sequence: 0,
            peer_sequence: 0,
            nonces: NonceCache::new(nonce_cache_max, nonce_cache_trim),
            rotation_interval,
            max_message_age_secs,
            exchange_secret: Some(StaticSecret::random_from_rng(OsRng)),
        }
    }

    pub fn has_session_key(&self) -> bool {
        self.session_key.is_some()
    }

    /// Our half of the ephemeral key exchange, base64 encoded.
    pub fn public_key_b64(&self) -> Result<String, SecurityError> {
        let secret = self
            .exchange_secret
            .as_ref()
            .ok_or(SecurityError::NoKeyExchange)?;
        Ok(BASE64_STANDARD.encode(PublicKey::from(secret).as_bytes()))
    }

    /// Key-exchange mode: Diffie-Hellman against the peer's public key,
    /// then HKDF with the session token as salt.
    pub fn establish_from_peer(
        &mut self,
        peer_public_b64: &str,
        token: &str,
    ) -> Result<(), SecurityError> {
        let secret = self
            .exchange_secret
            .as_ref()
            .ok_or(SecurityError::NoKeyExchange)?;
        let raw = BASE64_STANDARD.decode(peer_public_b64)?;
        let peer_bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| SecurityError::InvalidPeerKey)?;
        let shared = secret.diffie_hellman(&PublicKey::from(peer_bytes));

        let salt_len = token.len().min(KEY_LEN);
        let key = derive_key(shared.as_bytes(), &token.as_bytes()[..salt_len], SIGNALING_INFO)?;
        self.install_key(key);
        tracing::debug!(target: "breakwater::session", "session key established via key exchange");
        Ok(())
    }

    /// Token-bound mode: no exchange round trip, key derived from the token
    /// and the host secret.
    pub fn establish_from_token(
        &mut self,
        token: &str,
        secret: &HostSecret,
    ) -> Result<(), SecurityError> {
        let key = derive_key(token.as_bytes(), secret.kdf_salt(), SIGNALING_INFO)?;
        self.install_key(key);
        tracing::debug!(target: "breakwater::session", "session key established from token");
        Ok(())
    }

    /// Encrypts one signaling message with AES-256-GCM under a fresh random
    /// 96-bit nonce. The timestamp and monotonic sequence travel as AAD, so
    /// tampering with either invalidates the tag.
    pub fn encrypt(&mut self, message: &Value, now: i64) -> Result<SealedEnvelope, SecurityError> {
        let key = self.session_key.ok_or(SecurityError::NoSessionKey)?;
        let plaintext = serde_json::to_vec(message)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        self.sequence += 1;
        let aad = format!("{now}:{}", self.sequence);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(SecurityError::Encrypt)?;

        let envelope = SealedEnvelope {
            encrypted: true,
            v: ENVELOPE_VERSION,
            ct: BASE64_STANDARD.encode(ciphertext),
            n: BASE64_STANDARD.encode(nonce),
            ts: now,
            seq: self.sequence,
        };

        self.message_count += 1;
        if self.message_count >= self.rotation_interval {
            self.rotate_key()?;
        }
        Ok(envelope)
    }

    /// Authenticates and decrypts an inbound envelope.
    ///
    /// Guards run in a fixed order before the AEAD open: framing version,
    /// message age, strict sequence monotonicity, nonce uniqueness. A guard
    /// that fires consumes its state transition; a burned sequence number
    /// stays burned.
    pub fn decrypt(&mut self, envelope: &SealedEnvelope, now: i64) -> Result<Value, SecurityError> {
        let key = self.session_key.ok_or(SecurityError::NoSessionKey)?;
        if envelope.v != ENVELOPE_VERSION {
            return Err(SecurityError::UnsupportedVersion);
        }
        if (now - envelope.ts).abs() > self.max_message_age_secs {
            return Err(SecurityError::StaleMessage);
        }
        if envelope.seq <= self.peer_sequence {
            return Err(SecurityError::SequenceReplay);
        }
        self.peer_sequence = envelope.seq;
        if !self.nonces.insert(&envelope.n) {
            return Err(SecurityError::NonceReplay);
        }

        let nonce = BASE64_STANDARD.decode(&envelope.n)?;
        if nonce.len() != NONCE_LEN {
            return Err(SecurityError::InvalidEnvelope);
        }
        let ciphertext = BASE64_STANDARD.decode(&envelope.ct)?;
        let aad = format!("{}:{}", envelope.ts, envelope.seq);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(SecurityError::Decrypt)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// One-way ratchet: the next key is derived from the current one with a
    /// fresh random salt, then the current one is overwritten. A later key
    /// leak does not expose earlier traffic.
    fn rotate_key(&mut self) -> Result<(), SecurityError> {
        let Some(old_key) = self.session_key else {
            return Ok(());
        };
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        self.session_key = Some(derive_key(&old_key, &salt, ROTATION_INFO)?);
        self.message_count = 0;
        tracing::debug!(target: "breakwater::session", "session key rotated");
        Ok(())
    }

    fn install_key(&mut self, key: [u8; KEY_LEN]) {
        self.session_key = Some(key);
        self.message_count = 0;
        self.sequence = 0;
    }
}

fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; KEY_LEN], SecurityError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = [0u8; KEY_LEN];
    hk.expand(info, &mut out)
        .map_err(|_| SecurityError::Kdf("hkdf expand failure".into()))?;
    Ok(out)
}
