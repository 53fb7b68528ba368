use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::SecurityConfig;
use crate::error::SecurityError;
use crate::secret::HostSecret;
use crate::session::{NonceCache, SealedEnvelope, SessionCrypto};
use crate::token::constant_time_eq;

type HmacSha256 = Hmac<Sha256>;

/// Hex characters of the HMAC kept on signed-fallback messages.
const FALLBACK_SIG_LEN: usize = 32;
const FALLBACK_NONCE_BYTES: usize = 8;

/// One wrap/unwrap contract over both protection modes.
///
/// With a session key established, messages go through the AEAD engine.
/// Without one (for instance while a key exchange is still in flight),
/// outbound messages carry a timestamp, nonce, and HMAC-SHA256 signature so
/// even unestablished sessions get tamper evidence.
pub struct SignalingWrapper {
    token: String,
    crypto: SessionCrypto,
    sign_key: [u8; 32],
    fallback_nonces: NonceCache,
    max_message_age_secs: i64,
    allow_unsigned: bool,
}

impl SignalingWrapper {
    /// Token-bound mode: the session key is derived immediately, no
    /// exchange round trip.
    pub fn keyed(
        token: &str,
        secret: &HostSecret,
        config: &SecurityConfig,
    ) -> Result<Self, SecurityError> {
        let mut wrapper = Self::pending_exchange(token, secret, config);
        wrapper.crypto.establish_from_token(token, secret)?;
        Ok(wrapper)
    }

    /// Key-exchange mode: an ephemeral keypair is ready but no session key
    /// exists yet; wrap falls back to signing until the exchange completes.
    pub fn pending_exchange(token: &str, secret: &HostSecret, config: &SecurityConfig) -> Self {
        Self {
            token: token.to_string(),
            crypto: SessionCrypto::new(
                config.key_rotation_interval,
                config.max_message_age_secs,
                config.nonce_cache_max,
                config.nonce_cache_trim,
            ),
            sign_key: derive_sign_key(secret, token),
            fallback_nonces: NonceCache::new(config.nonce_cache_max, config.nonce_cache_trim),
            max_message_age_secs: config.max_message_age_secs,
            allow_unsigned: config.allow_unsigned,
        }
    }

    pub fn has_session_key(&self) -> bool {
        self.crypto.has_session_key()
    }

    pub fn public_key_b64(&self) -> Result<String, SecurityError> {
        self.crypto.public_key_b64()
    }

    pub fn establish_from_peer(&mut self, peer_public_b64: &str) -> Result<(), SecurityError> {
        let token = self.token.clone();
        self.crypto.establish_from_peer(peer_public_b64, &token)
    }

    /// Protects an outbound signaling message.
    pub fn wrap(&mut self, message: &Value, now: i64) -> Result<Value, SecurityError> {
        if self.crypto.has_session_key() {
            let envelope = self.crypto.encrypt(message, now)?;
            return Ok(serde_json::to_value(envelope)?);
        }
        self.sign(message, now)
    }

    /// Authenticates an inbound envelope and returns the inner message.
    /// Every rejection maps to a typed error for local logging; toward the
    /// remote peer all of them must look the same.
    pub fn unwrap(&mut self, value: &Value, now: i64) -> Result<Value, SecurityError> {
        if value.get("encrypted").and_then(Value::as_bool) == Some(true) {
            let envelope: SealedEnvelope = serde_json::from_value(value.clone())?;
            return self.crypto.decrypt(&envelope, now);
        }
        if value.get("sig").is_some() {
            return self.verify_signed(value, now);
        }
        if self.allow_unsigned {
            tracing::warn!(
                target: "breakwater::envelope",
                "passing through unsigned legacy message; allow_unsigned is enabled"
            );
            return Ok(value.clone());
        }
        Err(SecurityError::UnsignedRejected)
    }

    fn sign(&self, message: &Value, now: i64) -> Result<Value, SecurityError> {
        let Value::Object(fields) = message else {
            return Err(SecurityError::InvalidEnvelope);
        };
        let mut signed = fields.clone();
        let mut nonce = [0u8; FALLBACK_NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);
        signed.insert("ts".into(), Value::from(now));
        signed.insert("nonce".into(), Value::from(hex::encode(nonce)));

        let sig = self.compute_signature(&Value::Object(signed.clone()))?;
        signed.insert("sig".into(), Value::from(sig));
        Ok(Value::Object(signed))
    }

    fn verify_signed(&mut self, value: &Value, now: i64) -> Result<Value, SecurityError> {
        let Value::Object(fields) = value else {
            return Err(SecurityError::InvalidEnvelope);
        };
        let mut fields = fields.clone();
        let sig = match fields.remove("sig") {
            Some(Value::String(sig)) => sig,
            _ => return Err(SecurityError::InvalidEnvelope),
        };

        let ts = fields.get("ts").and_then(Value::as_i64).unwrap_or(0);
        if (now - ts).abs() > self.max_message_age_secs {
            return Err(SecurityError::StaleMessage);
        }

        if let Some(nonce) = fields.get("nonce").and_then(Value::as_str) {
            if !nonce.is_empty() {
                let nonce = nonce.to_string();
                if !self.fallback_nonces.insert(&nonce) {
                    return Err(SecurityError::NonceReplay);
                }
            }
        }

        let expected = self.compute_signature(&Value::Object(fields.clone()))?;
        if !constant_time_eq(sig.as_bytes(), expected.as_bytes()) {
            return Err(SecurityError::SignatureMismatch);
        }

        fields.remove("ts");
        fields.remove("nonce");
        Ok(Value::Object(fields))
    }

    /// HMAC over the canonical JSON form (serde_json's default map keeps
    /// keys sorted), hex encoded and truncated.
    fn compute_signature(&self, message: &Value) -> Result<String, SecurityError> {
        let canonical = serde_json::to_string(message)?;
        let mut mac = HmacSha256::new_from_slice(&self.sign_key)
            .map_err(|err| SecurityError::Kdf(err.to_string()))?;
        mac.update(canonical.as_bytes());
        let mut sig = hex::encode(mac.finalize().into_bytes());
        sig.truncate(FALLBACK_SIG_LEN);
        Ok(sig)
    }
}

fn derive_sign_key(secret: &HostSecret, token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}
