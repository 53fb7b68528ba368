use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::config::SecurityConfig;
use crate::envelope::SignalingWrapper;
use crate::error::SecurityError;
use crate::net::is_lan_ip;
use crate::pairing::{NoEvents, Notice, PairingEvents, PairingRegistry, PendingConnection};
use crate::rate_limit::{RateGuard, SHARED_BUCKET};
use crate::secret::HostSecret;
use crate::token::{SessionToken, TokenAuthority};
use crate::trust::{AuthorizedDevice, TrustStore};

const SECRET_FILE: &str = "machine_secret";
const DEVICES_FILE: &str = "authorized_devices.json";
const CREDENTIAL_VERSION: u8 = 2;

/// Payload embedded in the QR code a peer scans to connect. The engine
/// consumes only the `token` field on the way back in; everything else is
/// addressing for the transport collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCredential {
    pub version: u8,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub machine_id: String,
    pub token: String,
    pub timestamp: i64,
    pub expires: i64,
    pub requires_pin: bool,
    pub encryption: String,
}

struct SessionEntry {
    wrapper: SignalingWrapper,
    established_at: i64,
}

struct Inner {
    tokens: TokenAuthority,
    trust: TrustStore,
    pairing: PairingRegistry,
    rate: RateGuard,
    sessions: HashMap<String, SessionEntry>,
}

/// Owner of all shared security state for one host.
///
/// Explicitly constructed and passed by handle into the signaling layer —
/// deliberately not a process-wide singleton, so the lock scope and
/// lifetime stay visible and testable. One mutex serializes every public
/// operation; nothing slow runs under it (the device-store write-through is
/// a small local file, and pairing notifications fire after the guard
/// drops).
pub struct SecurityManager {
    config: SecurityConfig,
    secret: HostSecret,
    events: Arc<dyn PairingEvents>,
    inner: Mutex<Inner>,
}

impl SecurityManager {
    pub fn new(config: SecurityConfig) -> Result<Arc<Self>, SecurityError> {
        Self::with_events(config, Arc::new(NoEvents))
    }

    pub fn with_events(
        config: SecurityConfig,
        events: Arc<dyn PairingEvents>,
    ) -> Result<Arc<Self>, SecurityError> {
        fs::create_dir_all(&config.config_dir)?;
        let secret = HostSecret::load_or_generate(&config.config_dir.join(SECRET_FILE))?;
        let trust = TrustStore::load(config.config_dir.join(DEVICES_FILE));
        let inner = Inner {
            tokens: TokenAuthority::new(config.token_ttl_secs, config.token_skew_secs),
            trust,
            pairing: PairingRegistry::new(config.pin_ttl_secs, config.max_pin_attempts),
            rate: RateGuard::new(config.rate_window_secs, config.max_attempts_per_window),
            sessions: HashMap::new(),
        };
        Ok(Arc::new(Self {
            config,
            secret,
            events,
            inner: Mutex::new(inner),
        }))
    }

    // ---- tokens ----

    pub fn issue_token(&self) -> Result<SessionToken, SecurityError> {
        let now = unix_now();
        self.inner.lock().tokens.issue(&self.secret, now)
    }

    pub fn validate_token(&self, token: &str) -> Result<(), SecurityError> {
        let now = unix_now();
        self.inner.lock().tokens.validate(&self.secret, token, now)
    }

    pub fn current_token(&self) -> Option<String> {
        let now = unix_now();
        self.inner
            .lock()
            .tokens
            .current(now)
            .map(|session| session.token.clone())
    }

    pub fn revoke_token(&self, token: &str) {
        self.inner.lock().tokens.revoke(token);
    }

    /// Revokes every outstanding token, e.g. when streaming stops.
    pub fn revoke_all_tokens(&self) {
        self.inner.lock().tokens.revoke_all();
    }

    // ---- rate limiting and source policy ----

    /// Records a connection attempt. `None` identifiers share one
    /// conservative bucket instead of bypassing the limiter.
    pub fn check_rate(&self, identifier: Option<&str>) -> bool {
        let now = unix_now();
        self.inner
            .lock()
            .rate
            .allow(identifier.unwrap_or(SHARED_BUCKET), now)
    }

    /// Records a failed attempt; once the window is exhausted the source is
    /// blocked for `block_secs`. Returns `true` when the block was
    /// installed.
    pub fn register_failure(&self, identifier: &str) -> bool {
        let now = unix_now();
        let mut inner = self.inner.lock();
        if inner.rate.allow(identifier, now) {
            return false;
        }
        inner.rate.block(identifier, self.config.block_secs, now);
        tracing::warn!(
            target: "breakwater::manager",
            identifier,
            block_secs = self.config.block_secs,
            "source blocked after repeated failures"
        );
        true
    }

    pub fn block(&self, identifier: &str, duration_secs: i64) {
        let now = unix_now();
        self.inner.lock().rate.block(identifier, duration_secs, now);
    }

    pub fn is_blocked(&self, identifier: &str) -> bool {
        let now = unix_now();
        self.inner.lock().rate.is_blocked(identifier, now)
    }

    /// Gate applied before any protocol handling: blocked sources and
    /// publicly routed addresses never progress.
    pub fn validate_source(&self, addr: IpAddr) -> Result<(), SecurityError> {
        if self.is_blocked(&addr.to_string()) {
            return Err(SecurityError::Blocked);
        }
        if !is_lan_ip(addr) {
            return Err(SecurityError::NotLan);
        }
        Ok(())
    }

    // ---- device trust ----

    pub fn is_device_known(&self, device_id: &str) -> bool {
        self.inner.lock().trust.is_known(device_id)
    }

    pub fn is_device_trusted(&self, device_id: &str) -> bool {
        self.inner.lock().trust.is_trusted(device_id)
    }

    pub fn set_device_trusted(&self, device_id: &str, trusted: bool) -> Result<bool, SecurityError> {
        self.inner.lock().trust.set_trusted(device_id, trusted)
    }

    pub fn revoke_device(&self, device_id: &str) -> Result<bool, SecurityError> {
        self.inner.lock().trust.revoke(device_id)
    }

    pub fn authorized_devices(&self) -> Vec<AuthorizedDevice> {
        self.inner.lock().trust.devices()
    }

    // ---- pairing ----

    pub fn request_pairing(&self, device_id: &str, device_name: &str) -> PendingConnection {
        let now = unix_now();
        let mut notices = Vec::new();
        let pending = {
            let mut inner = self.inner.lock();
            inner
                .pairing
                .request(device_id, device_name, now, &mut notices)
        };
        self.emit(notices);
        pending
    }

    pub fn verify_pin(&self, connection_id: &str, candidate: &str) -> Result<(), SecurityError> {
        let now = unix_now();
        let mut notices = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            let Inner { pairing, trust, .. } = &mut *inner;
            pairing.verify_pin(trust, connection_id, candidate, now, &mut notices)
        };
        self.emit(notices);
        result
    }

    pub fn approve_pending(&self, connection_id: &str) -> Result<(), SecurityError> {
        let now = unix_now();
        let mut notices = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            let Inner { pairing, trust, .. } = &mut *inner;
            pairing.approve(trust, connection_id, now, &mut notices)
        };
        self.emit(notices);
        result
    }

    pub fn reject_pending(&self, connection_id: &str) -> Result<(), SecurityError> {
        let mut notices = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            inner.pairing.reject(connection_id, &mut notices)
        };
        self.emit(notices);
        result
    }

    pub fn pending_connections(&self) -> Vec<PendingConnection> {
        let now = unix_now();
        self.inner.lock().pairing.pending(now)
    }

    // ---- signaling sessions ----

    /// Validates the token and establishes the token-bound session for it.
    /// Idempotent for an already-established session.
    pub fn ensure_session(&self, token: &str) -> Result<(), SecurityError> {
        let now = unix_now();
        let mut inner = self.inner.lock();
        let Inner {
            tokens, sessions, ..
        } = &mut *inner;
        tokens.validate(&self.secret, token, now)?;
        if let Entry::Vacant(slot) = sessions.entry(token.to_string()) {
            slot.insert(SessionEntry {
                wrapper: SignalingWrapper::keyed(token, &self.secret, &self.config)?,
                established_at: now,
            });
            tokens.mark_used(token);
        }
        Ok(())
    }

    /// Validates the token, prepares an exchange-mode session, and returns
    /// this side's ephemeral public key for the peer.
    pub fn begin_key_exchange(&self, token: &str) -> Result<String, SecurityError> {
        let now = unix_now();
        let mut inner = self.inner.lock();
        let Inner {
            tokens, sessions, ..
        } = &mut *inner;
        tokens.validate(&self.secret, token, now)?;
        let entry = match sessions.entry(token.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                tokens.mark_used(token);
                slot.insert(SessionEntry {
                    wrapper: SignalingWrapper::pending_exchange(token, &self.secret, &self.config),
                    established_at: now,
                })
            }
        };
        entry.wrapper.public_key_b64()
    }

    /// Completes the exchange with the peer's public key; the session key
    /// replaces any token-bound key already in place.
    pub fn complete_key_exchange(
        &self,
        token: &str,
        peer_public_b64: &str,
    ) -> Result<(), SecurityError> {
        let now = unix_now();
        let mut inner = self.inner.lock();
        let entry = session_entry(&mut inner, token, now, self.config.session_ttl_secs)?;
        entry.wrapper.establish_from_peer(peer_public_b64)
    }

    pub fn wrap_message(&self, token: &str, message: &Value) -> Result<Value, SecurityError> {
        let now = unix_now();
        let mut inner = self.inner.lock();
        let entry = session_entry(&mut inner, token, now, self.config.session_ttl_secs)?;
        entry.wrapper.wrap(message, now)
    }

    pub fn unwrap_message(&self, token: &str, value: &Value) -> Result<Value, SecurityError> {
        let now = unix_now();
        let result = {
            let mut inner = self.inner.lock();
            let entry = session_entry(&mut inner, token, now, self.config.session_ttl_secs)?;
            entry.wrapper.unwrap(value, now)
        };
        if let Err(err) = &result {
            // reason stays local; the remote peer sees only a dead session
            tracing::debug!(
                target: "breakwater::manager",
                error = %err,
                "inbound signaling message rejected"
            );
        }
        result
    }

    /// Drops the session's crypto state and revokes its token. There is no
    /// graceful drain; in-flight envelopes fail from here on.
    pub fn teardown_session(&self, token: &str) {
        let mut inner = self.inner.lock();
        inner.sessions.remove(token);
        inner.tokens.revoke(token);
    }

    // ---- credential ----

    /// Issues a fresh token and assembles the QR payload for it.
    pub fn connection_credential(
        &self,
        address: &str,
        port: u16,
        hostname: &str,
    ) -> Result<ConnectionCredential, SecurityError> {
        let now = unix_now();
        let session = self.inner.lock().tokens.issue(&self.secret, now)?;
        Ok(ConnectionCredential {
            version: CREDENTIAL_VERSION,
            name: hostname.to_string(),
            address: address.to_string(),
            port,
            machine_id: machine_id(hostname),
            token: session.token,
            timestamp: now,
            expires: session.expires_at,
            requires_pin: true,
            encryption: "aes-256-gcm".to_string(),
        })
    }

    // ---- maintenance ----

    /// Purges expired tokens, pairing challenges, rate windows, blocks, and
    /// paired sessions past their lifetime.
    pub fn sweep(&self) {
        let now = unix_now();
        let mut notices = Vec::new();
        {
            let mut inner = self.inner.lock();
            let expired_tokens = inner.tokens.sweep(now);
            let expired_pairings = inner.pairing.sweep(now, &mut notices);
            inner.rate.sweep(now);
            let session_ttl = self.config.session_ttl_secs;
            let sessions_before = inner.sessions.len();
            inner
                .sessions
                .retain(|_, entry| now - entry.established_at <= session_ttl);
            let expired_sessions = sessions_before - inner.sessions.len();
            if expired_tokens > 0 || expired_pairings > 0 || expired_sessions > 0 {
                tracing::debug!(
                    target: "breakwater::manager",
                    expired_tokens,
                    expired_pairings,
                    expired_sessions,
                    "sweep removed expired state"
                );
            }
        }
        self.emit(notices);
    }

    /// Spawns the periodic sweeper. The thread holds only a weak handle, so
    /// dropping the last manager reference stops it on its next tick.
    pub fn start_sweeper(self: &Arc<Self>) {
        let weak: Weak<SecurityManager> = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        let spawned = thread::Builder::new()
            .name("breakwater-sweeper".into())
            .spawn(move || loop {
                thread::sleep(interval);
                match weak.upgrade() {
                    Some(manager) => manager.sweep(),
                    None => break,
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(
                target: "breakwater::manager",
                error = %err,
                "failed to spawn sweeper thread"
            );
        }
    }

    fn emit(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::Requested(pending) => self.events.on_pairing_requested(&pending),
                Notice::Authorized {
                    device_id,
                    device_name,
                } => {
                    tracing::info!(
                        target: "breakwater::manager",
                        device_id = %device_id,
                        "device authorized"
                    );
                    self.events.on_authorized(&device_id, &device_name);
                }
                Notice::Rejected { device_id, reason } => {
                    tracing::debug!(
                        target: "breakwater::manager",
                        device_id = %device_id,
                        reason,
                        "pairing rejected"
                    );
                    self.events.on_rejected(&device_id, reason);
                }
            }
        }
    }
}

/// Looks up a live session, lazily expiring one past the paired-session
/// lifetime.
fn session_entry<'a>(
    inner: &'a mut Inner,
    token: &str,
    now: i64,
    session_ttl_secs: i64,
) -> Result<&'a mut SessionEntry, SecurityError> {
    match inner.sessions.entry(token.to_string()) {
        Entry::Occupied(entry) => {
            if now - entry.get().established_at > session_ttl_secs {
                entry.remove();
                return Err(SecurityError::SessionExpired);
            }
            Ok(entry.into_mut())
        }
        Entry::Vacant(_) => Err(SecurityError::NoSessionKey),
    }
}

fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Stable identifier for this host, surfaced in the QR payload.
fn machine_id(hostname: &str) -> String {
    if let Ok(raw) = fs::read_to_string("/etc/machine-id") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return trimmed.chars().take(16).collect();
        }
    }
    let digest = Sha256::digest(hostname.as_bytes());
    hex::encode(digest)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
            })
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    impl PairingEvents for Recorder {
        fn on_pairing_requested(&self, pending: &PendingConnection) {
            self.log.lock().push(format!("requested:{}", pending.device_id));
        }

        fn on_authorized(&self, device_id: &str, _device_name: &str) {
            self.log.lock().push(format!("authorized:{device_id}"));
        }

        fn on_rejected(&self, device_id: &str, reason: &str) {
            self.log.lock().push(format!("rejected:{device_id}:{reason}"));
        }
    }

    fn test_config() -> SecurityConfig {
        SecurityConfig {
            config_dir: std::env::temp_dir().join(format!("breakwater-mgr-{}", Uuid::new_v4())),
            ..SecurityConfig::default()
        }
    }

    #[test]
    fn token_issue_validate_revoke() {
        let manager = SecurityManager::new(test_config()).expect("manager");
        let session = manager.issue_token().expect("issue");
        manager.validate_token(&session.token).expect("validate");
        assert_eq!(manager.current_token(), Some(session.token.clone()));

        manager.revoke_token(&session.token);
        assert!(manager.validate_token(&session.token).is_err());
        assert_eq!(manager.current_token(), None);
    }

    #[test]
    fn end_to_end_signaling_round_trip() {
        let manager = SecurityManager::new(test_config()).expect("manager");
        let token = manager.issue_token().expect("issue").token;
        manager.ensure_session(&token).expect("session");

        let envelope = manager
            .wrap_message(&token, &json!({"type": "ping"}))
            .expect("wrap");
        assert_eq!(envelope["encrypted"], Value::Bool(true));
        assert_eq!(envelope["seq"], json!(1));

        let message = manager.unwrap_message(&token, &envelope).expect("unwrap");
        assert_eq!(message, json!({"type": "ping"}));
    }

    #[test]
    fn wrap_requires_established_session() {
        let manager = SecurityManager::new(test_config()).expect("manager");
        let token = manager.issue_token().expect("issue").token;
        assert!(matches!(
            manager.wrap_message(&token, &json!({"type": "ping"})),
            Err(SecurityError::NoSessionKey)
        ));
    }

    #[test]
    fn teardown_discards_session_and_token() {
        let manager = SecurityManager::new(test_config()).expect("manager");
        let token = manager.issue_token().expect("issue").token;
        manager.ensure_session(&token).expect("session");
        manager.teardown_session(&token);

        assert!(matches!(
            manager.wrap_message(&token, &json!({"type": "ping"})),
            Err(SecurityError::NoSessionKey)
        ));
        assert!(manager.validate_token(&token).is_err());
    }

    #[test]
    fn key_exchange_with_remote_peer() {
        let host = SecurityManager::new(test_config()).expect("host");
        let token = host.issue_token().expect("issue").token;

        let host_pub = host.begin_key_exchange(&token).expect("host pub");
        // the peer learned the token from the QR credential and holds its
        // own machine secret; only the token must match for the exchanged
        // keys to agree
        let peer_secret = HostSecret::from_bytes([9u8; 32]);
        let mut peer_wrapper =
            SignalingWrapper::pending_exchange(&token, &peer_secret, &test_config());
        let peer_pub = peer_wrapper.public_key_b64().expect("peer pub");
        host.complete_key_exchange(&token, &peer_pub).expect("host key");
        peer_wrapper.establish_from_peer(&host_pub).expect("peer key");

        let envelope = host
            .wrap_message(&token, &json!({"sdp": "offer"}))
            .expect("wrap");
        let message = peer_wrapper.unwrap(&envelope, unix_now()).expect("unwrap");
        assert_eq!(message, json!({"sdp": "offer"}));
    }

    #[test]
    fn pairing_flow_emits_events_and_records_device() {
        let recorder = Recorder::new();
        let manager =
            SecurityManager::with_events(test_config(), recorder.clone()).expect("manager");

        let pending = manager.request_pairing("dev-1", "Pixel");
        assert_eq!(manager.pending_connections().len(), 1);
        manager
            .verify_pin(&pending.connection_id, &pending.pin)
            .expect("correct pin");

        assert!(manager.is_device_known("dev-1"));
        assert!(!manager.is_device_trusted("dev-1"));
        assert!(manager.pending_connections().is_empty());
        let entries = recorder.entries();
        assert_eq!(entries[0], "requested:dev-1");
        assert_eq!(entries[1], "authorized:dev-1");
    }

    #[test]
    fn pin_budget_exhaustion_reports_rejection() {
        let recorder = Recorder::new();
        let manager =
            SecurityManager::with_events(test_config(), recorder.clone()).expect("manager");
        let pending = manager.request_pairing("dev-1", "Pixel");

        // a non-digit candidate can never match the six-digit PIN
        for _ in 0..2 {
            assert!(matches!(
                manager.verify_pin(&pending.connection_id, "x"),
                Err(SecurityError::PinMismatch)
            ));
        }
        assert!(matches!(
            manager.verify_pin(&pending.connection_id, "x"),
            Err(SecurityError::TooManyAttempts)
        ));
        assert!(matches!(
            manager.verify_pin(&pending.connection_id, &pending.pin),
            Err(SecurityError::UnknownPending)
        ));
        assert!(recorder
            .entries()
            .contains(&"rejected:dev-1:too many attempts".to_string()));
    }

    #[test]
    fn operator_approval_and_trust_flag() {
        let manager = SecurityManager::new(test_config()).expect("manager");
        let pending = manager.request_pairing("dev-2", "Laptop");
        manager.approve_pending(&pending.connection_id).expect("approve");

        assert!(manager.is_device_known("dev-2"));
        assert!(manager.set_device_trusted("dev-2", true).expect("persist"));
        assert!(manager.is_device_trusted("dev-2"));
        assert!(manager.revoke_device("dev-2").expect("persist"));
        assert!(!manager.is_device_known("dev-2"));
    }

    #[test]
    fn rate_guard_escalates_to_block() {
        let manager = SecurityManager::new(test_config()).expect("manager");
        let ip = "192.168.1.77";
        for _ in 0..5 {
            assert!(!manager.register_failure(ip));
        }
        assert!(manager.register_failure(ip));
        assert!(manager.is_blocked(ip));
        assert!(matches!(
            manager.validate_source(ip.parse().expect("ip")),
            Err(SecurityError::Blocked)
        ));
    }

    #[test]
    fn public_sources_rejected() {
        let manager = SecurityManager::new(test_config()).expect("manager");
        assert!(matches!(
            manager.validate_source("8.8.8.8".parse().expect("ip")),
            Err(SecurityError::NotLan)
        ));
        manager
            .validate_source("192.168.0.2".parse().expect("ip"))
            .expect("lan source");
    }

    #[test]
    fn anonymous_attempts_share_one_bucket() {
        let manager = SecurityManager::new(test_config()).expect("manager");
        for _ in 0..5 {
            assert!(manager.check_rate(None));
        }
        assert!(!manager.check_rate(None));
        // attributed traffic is unaffected
        assert!(manager.check_rate(Some("192.168.1.9")));
    }

    #[test]
    fn credential_carries_fresh_token() {
        let manager = SecurityManager::new(test_config()).expect("manager");
        let credential = manager
            .connection_credential("192.168.1.4", 8443, "studio")
            .expect("credential");
        assert_eq!(credential.version, CREDENTIAL_VERSION);
        assert!(credential.requires_pin);
        assert_eq!(credential.encryption, "aes-256-gcm");
        assert_eq!(credential.machine_id.len(), 16);
        assert!(credential.expires > credential.timestamp);
        manager.validate_token(&credential.token).expect("token valid");
    }

    #[test]
    fn sweep_is_safe_on_fresh_state() {
        let manager = SecurityManager::new(test_config()).expect("manager");
        manager.issue_token().expect("issue");
        manager.request_pairing("dev-1", "Pixel");
        manager.sweep();
        // nothing expired yet
        assert_eq!(manager.pending_connections().len(), 1);
        assert!(manager.current_token().is_some());
    }
}
