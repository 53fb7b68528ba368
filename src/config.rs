use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;

use crate::error::SecurityError;

/// Tunables for the security engine.
///
/// Two validity constants are easy to conflate and deliberately kept apart:
/// `token_ttl_secs` governs the short-lived QR/pairing token, while
/// `session_ttl_secs` governs how long a paired session stays valid before
/// the peer must re-pair. Key rotation is message-count driven
/// (`key_rotation_interval`), not time driven.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Directory holding the host secret and the device whitelist.
    pub config_dir: PathBuf,
    /// Validity of an issued pairing token (the QR credential).
    pub token_ttl_secs: i64,
    /// Validity of a paired session.
    pub session_ttl_secs: i64,
    /// Maximum deviation between a token's embedded timestamp and local
    /// time, even when the signature checks out.
    pub token_skew_secs: i64,
    /// Time a requester has to enter the pairing PIN.
    pub pin_ttl_secs: i64,
    /// PIN attempt budget before the pending connection is rejected.
    pub max_pin_attempts: u32,
    /// Trailing window for the connection-attempt counter.
    pub rate_window_secs: i64,
    /// Attempts allowed per identifier within the window.
    pub max_attempts_per_window: usize,
    /// Duration of a temporary block after repeated failures.
    pub block_secs: i64,
    /// Maximum age of an inbound signaling message.
    pub max_message_age_secs: i64,
    /// Messages sent before the session key ratchets forward.
    pub key_rotation_interval: u64,
    /// Nonce replay cache: cap and post-overflow size.
    pub nonce_cache_max: usize,
    pub nonce_cache_trim: usize,
    /// Let unsigned legacy messages through `unwrap`. Off by default; the
    /// downgrade path exists only for documented compatibility cases.
    pub allow_unsigned: bool,
    /// Period of the background sweeper.
    pub sweep_interval: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir().unwrap_or_else(|_| PathBuf::from(".breakwater")),
            token_ttl_secs: 60,
            session_ttl_secs: 300,
            token_skew_secs: 600,
            pin_ttl_secs: 60,
            max_pin_attempts: 3,
            rate_window_secs: 60,
            max_attempts_per_window: 5,
            block_secs: 300,
            max_message_age_secs: 30,
            key_rotation_interval: 100,
            nonce_cache_max: 10_000,
            nonce_cache_trim: 5_000,
            allow_unsigned: false,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

pub fn default_config_dir() -> Result<PathBuf, SecurityError> {
    let base = BaseDirs::new()
        .ok_or_else(|| SecurityError::Config("unable to determine home directory".into()))?;
    Ok(base.home_dir().join(".breakwater"))
}
