// Breakwater security engine
// Pairs and authenticates short-lived peer connections over an untrusted
// local network and protects the signaling traffic that follows: token
// issuance, PIN pairing, device trust, rate limiting, and per-session
// authenticated encryption.

pub mod config;
pub mod envelope;
pub mod error;
pub mod manager;
pub mod net;
pub mod pairing;
pub mod rate_limit;
pub mod secret;
pub mod session;
pub mod token;
pub mod trust;

pub use config::SecurityConfig;
pub use envelope::SignalingWrapper;
pub use error::SecurityError;
pub use manager::{ConnectionCredential, SecurityManager};
pub use net::is_lan_ip;
pub use pairing::{NoEvents, PairingEvents, PendingConnection};
pub use rate_limit::RateGuard;
pub use secret::HostSecret;
pub use session::{SealedEnvelope, SessionCrypto};
pub use token::SessionToken;
pub use trust::AuthorizedDevice;
