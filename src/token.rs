use std::collections::HashMap;

use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::SecurityError;
use crate::secret::HostSecret;

/// Characters of the derived signature kept in the token string.
const SIGNATURE_LEN: usize = 16;
/// Raw bytes fed to the signature encoding.
const SIGNATURE_KDF_LEN: usize = 16;
const RANDOM_LEN: usize = 24;

/// A short-lived pairing token, handed to the peer inside the QR
/// credential. Format on the wire: `random:timestamp:signature`.
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub token: String,
    pub created_at: i64,
    pub expires_at: i64,
    /// Set once a signaling session has been established from this token.
    pub used: bool,
}

impl SessionToken {
    pub fn is_valid(&self, now: i64) -> bool {
        now <= self.expires_at
    }
}

/// Issues and validates pairing tokens bound to the host secret.
///
/// At most one token is "current" at a time; older tokens stay valid until
/// their own expiry or an explicit revoke.
#[derive(Debug)]
pub struct TokenAuthority {
    ttl_secs: i64,
    skew_secs: i64,
    tokens: HashMap<String, SessionToken>,
    current: Option<String>,
}

impl TokenAuthority {
    pub fn new(ttl_secs: i64, skew_secs: i64) -> Self {
        Self {
            ttl_secs,
            skew_secs,
            tokens: HashMap::new(),
            current: None,
        }
    }

    /// Generates a fresh token and records it as current.
    pub fn issue(&mut self, secret: &HostSecret, now: i64) -> Result<SessionToken, SecurityError> {
        let mut random = [0u8; RANDOM_LEN];
        OsRng.fill_bytes(&mut random);
        let random_part = URL_SAFE_NO_PAD.encode(random);

        let signature = sign(secret, &format!("{random_part}:{now}"))?;
        let token = format!("{random_part}:{now}:{signature}");

        let session = SessionToken {
            token: token.clone(),
            created_at: now,
            expires_at: now + self.ttl_secs,
            used: false,
        };
        self.tokens.insert(token.clone(), session.clone());
        self.current = Some(token);
        tracing::debug!(target: "breakwater::token", expires_at = session.expires_at, "token issued");
        Ok(session)
    }

    /// Validates a presented token string.
    ///
    /// Checks, in order: shape, presence and stored expiry, embedded
    /// timestamp skew (a pre-computed token replayed much later fails here
    /// even with a valid signature), then the recomputed signature in
    /// constant time.
    pub fn validate(
        &mut self,
        secret: &HostSecret,
        token: &str,
        now: i64,
    ) -> Result<(), SecurityError> {
        let parts: Vec<&str> = token.split(':').collect();
        if parts.len() != 3 {
            return Err(SecurityError::MalformedToken);
        }
        let (random_part, timestamp_str, provided_sig) = (parts[0], parts[1], parts[2]);
        let timestamp: i64 = timestamp_str
            .parse()
            .map_err(|_| SecurityError::MalformedToken)?;

        match self.tokens.get(token) {
            None => return Err(SecurityError::UnknownToken),
            Some(session) if !session.is_valid(now) => {
                self.remove(token);
                return Err(SecurityError::TokenExpired);
            }
            Some(_) => {}
        }

        if (now - timestamp).abs() > self.skew_secs {
            return Err(SecurityError::TokenSkew);
        }

        let expected = sign(secret, &format!("{random_part}:{timestamp}"))?;
        if !constant_time_eq(provided_sig.as_bytes(), expected.as_bytes()) {
            return Err(SecurityError::TokenSignature);
        }
        Ok(())
    }

    /// The current token, if it has not expired.
    pub fn current(&self, now: i64) -> Option<&SessionToken> {
        self.current
            .as_deref()
            .and_then(|t| self.tokens.get(t))
            .filter(|session| session.is_valid(now))
    }

    pub fn mark_used(&mut self, token: &str) {
        if let Some(session) = self.tokens.get_mut(token) {
            session.used = true;
        }
    }

    pub fn revoke(&mut self, token: &str) {
        self.remove(token);
    }

    pub fn revoke_all(&mut self) {
        self.tokens.clear();
        self.current = None;
    }

    /// Drops expired tokens; returns how many were removed.
    pub fn sweep(&mut self, now: i64) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, session| session.is_valid(now));
        if let Some(current) = self.current.as_deref() {
            if !self.tokens.contains_key(current) {
                self.current = None;
            }
        }
        before - self.tokens.len()
    }

    fn remove(&mut self, token: &str) {
        self.tokens.remove(token);
        if self.current.as_deref() == Some(token) {
            self.current = None;
        }
    }
}

/// Derives the token signature: Argon2id over the `random:timestamp` pair,
/// salted with the host secret, truncated for the wire.
fn sign(secret: &HostSecret, data: &str) -> Result<String, SecurityError> {
    let mut out = [0u8; SIGNATURE_KDF_LEN];
    Argon2::default()
        .hash_password_into(data.as_bytes(), secret.kdf_salt(), &mut out)
        .map_err(|err| SecurityError::Kdf(err.to_string()))?;
    let mut sig = URL_SAFE_NO_PAD.encode(out);
    sig.truncate(SIGNATURE_LEN);
    Ok(sig)
}

/// Fixed-time byte comparison. Length mismatch short-circuits: the lengths
/// here are public protocol constants, not secrets.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
