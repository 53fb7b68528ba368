use std::collections::HashMap;

use rand::rngs::OsRng;
use rand::Rng;
use uuid::Uuid;

use crate::error::SecurityError;
use crate::token::constant_time_eq;
use crate::trust::TrustStore;

const PIN_DIGITS: usize = 6;

/// A connection attempt from an unknown or untrusted device, waiting for
/// the 6-digit PIN or an operator decision. The record is destroyed on any
/// terminal transition (authorized, rejected, expired) and never reused.
#[derive(Debug, Clone)]
pub struct PendingConnection {
    pub connection_id: String,
    pub device_id: String,
    pub device_name: String,
    pub pin: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub attempts: u32,
}

/// Callbacks into the local pairing UI. All methods default to no-ops so an
/// embedder only implements what it surfaces. Callbacks fire outside the
/// manager lock; re-entering the manager from inside one is safe.
pub trait PairingEvents: Send + Sync {
    fn on_pairing_requested(&self, _pending: &PendingConnection) {}
    fn on_authorized(&self, _device_id: &str, _device_name: &str) {}
    fn on_rejected(&self, _device_id: &str, _reason: &str) {}
}

/// Events sink for embedders without a pairing UI.
pub struct NoEvents;

impl PairingEvents for NoEvents {}

/// Notification produced inside a locked critical section, emitted by the
/// manager after the lock is released.
#[derive(Debug)]
pub(crate) enum Notice {
    Requested(PendingConnection),
    Authorized {
        device_id: String,
        device_name: String,
    },
    Rejected {
        device_id: String,
        reason: &'static str,
    },
}

/// Pending-connection state machine: (absent) -> Pending -> Authorized,
/// Rejected, or Expired.
#[derive(Debug)]
pub struct PairingRegistry {
    ttl_secs: i64,
    max_attempts: u32,
    pending: HashMap<String, PendingConnection>,
}

impl PairingRegistry {
    pub fn new(ttl_secs: i64, max_attempts: u32) -> Self {
        Self {
            ttl_secs,
            max_attempts,
            pending: HashMap::new(),
        }
    }

    /// Creates a PIN challenge for the requesting device.
    pub(crate) fn request(
        &mut self,
        device_id: &str,
        device_name: &str,
        now: i64,
        notices: &mut Vec<Notice>,
    ) -> PendingConnection {
        let pending = PendingConnection {
            connection_id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            pin: generate_pin(),
            created_at: now,
            expires_at: now + self.ttl_secs,
            attempts: 0,
        };
        self.pending
            .insert(pending.connection_id.clone(), pending.clone());
        tracing::debug!(
            target: "breakwater::pairing",
            device_id,
            connection_id = %pending.connection_id,
            "pairing requested"
        );
        notices.push(Notice::Requested(pending.clone()));
        pending
    }

    /// Checks a PIN candidate against the pending challenge.
    ///
    /// A mismatch leaves the record pending until the attempt budget is
    /// exhausted; the final failed attempt rejects the connection
    /// permanently, so a later call (even with the right PIN) finds no
    /// record.
    pub(crate) fn verify_pin(
        &mut self,
        trust: &mut TrustStore,
        connection_id: &str,
        candidate: &str,
        now: i64,
        notices: &mut Vec<Notice>,
    ) -> Result<(), SecurityError> {
        enum Verdict {
            Expired,
            Exhausted,
            Mismatch,
            Matched,
        }

        let verdict = {
            let pending = self
                .pending
                .get_mut(connection_id)
                .ok_or(SecurityError::UnknownPending)?;
            if now > pending.expires_at {
                Verdict::Expired
            } else {
                pending.attempts += 1;
                if pending.attempts > self.max_attempts {
                    Verdict::Exhausted
                } else if constant_time_eq(pending.pin.as_bytes(), candidate.as_bytes()) {
                    Verdict::Matched
                } else if pending.attempts >= self.max_attempts {
                    Verdict::Exhausted
                } else {
                    Verdict::Mismatch
                }
            }
        };

        match verdict {
            Verdict::Expired => {
                let pending = self.take(connection_id);
                notices.push(Notice::Rejected {
                    device_id: pending.device_id,
                    reason: "pin expired",
                });
                Err(SecurityError::PinExpired)
            }
            Verdict::Exhausted => {
                let pending = self.take(connection_id);
                notices.push(Notice::Rejected {
                    device_id: pending.device_id,
                    reason: "too many attempts",
                });
                Err(SecurityError::TooManyAttempts)
            }
            Verdict::Mismatch => Err(SecurityError::PinMismatch),
            Verdict::Matched => {
                let pending = self.take(connection_id);
                authorize(trust, pending, now, notices);
                Ok(())
            }
        }
    }

    /// Operator-driven approval from the UI, bypassing PIN entry.
    pub(crate) fn approve(
        &mut self,
        trust: &mut TrustStore,
        connection_id: &str,
        now: i64,
        notices: &mut Vec<Notice>,
    ) -> Result<(), SecurityError> {
        if !self.pending.contains_key(connection_id) {
            return Err(SecurityError::UnknownPending);
        }
        let pending = self.take(connection_id);
        authorize(trust, pending, now, notices);
        Ok(())
    }

    /// Operator-driven denial.
    pub(crate) fn reject(
        &mut self,
        connection_id: &str,
        notices: &mut Vec<Notice>,
    ) -> Result<(), SecurityError> {
        if !self.pending.contains_key(connection_id) {
            return Err(SecurityError::UnknownPending);
        }
        let pending = self.take(connection_id);
        notices.push(Notice::Rejected {
            device_id: pending.device_id,
            reason: "rejected by operator",
        });
        Ok(())
    }

    /// Purges expired challenges regardless of whether a PIN was ever
    /// tried; each purge surfaces as a rejection to the UI.
    pub(crate) fn sweep(&mut self, now: i64, notices: &mut Vec<Notice>) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now > p.expires_at)
            .map(|(id, _)| id.clone())
            .collect();
        for connection_id in &expired {
            let pending = self.take(connection_id);
            notices.push(Notice::Rejected {
                device_id: pending.device_id,
                reason: "pin expired",
            });
        }
        expired.len()
    }

    pub(crate) fn pending(&self, now: i64) -> Vec<PendingConnection> {
        let mut list: Vec<PendingConnection> = self
            .pending
            .values()
            .filter(|p| now <= p.expires_at)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// Removes a record that is known to exist.
    fn take(&mut self, connection_id: &str) -> PendingConnection {
        self.pending
            .remove(connection_id)
            .unwrap_or_else(|| unreachable!("pending record vanished under the manager lock"))
    }
}

fn authorize(
    trust: &mut TrustStore,
    pending: PendingConnection,
    now: i64,
    notices: &mut Vec<Notice>,
) {
    if let Err(err) = trust.record_success(&pending.device_id, &pending.device_name, now) {
        tracing::warn!(
            target: "breakwater::pairing",
            device_id = %pending.device_id,
            error = %err,
            "device authorized but whitelist write failed"
        );
    }
    notices.push(Notice::Authorized {
        device_id: pending.device_id,
        device_name: pending.device_name,
    });
}

fn generate_pin() -> String {
    let value: u32 = OsRng.gen_range(0..10u32.pow(PIN_DIGITS as u32));
    format!("{value:06}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_trust() -> TrustStore {
        TrustStore::load(
            std::env::temp_dir()
                .join(format!("breakwater-pairing-{}", Uuid::new_v4()))
                .join("authorized_devices.json"),
        )
    }

    fn new_registry() -> PairingRegistry {
        PairingRegistry::new(60, 3)
    }

    #[test]
    fn pin_is_six_digits() {
        for _ in 0..32 {
            let pin = generate_pin();
            assert_eq!(pin.len(), 6);
            assert!(pin.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn correct_pin_authorizes_device() {
        let mut registry = new_registry();
        let mut trust = scratch_trust();
        let mut notices = Vec::new();
        let pending = registry.request("dev-1", "Pixel", 100, &mut notices);

        registry
            .verify_pin(&mut trust, &pending.connection_id, &pending.pin, 110, &mut notices)
            .expect("correct pin");
        assert!(trust.is_known("dev-1"));
        assert!(matches!(notices.last(), Some(Notice::Authorized { .. })));
        // terminal transition destroyed the record
        assert!(matches!(
            registry.verify_pin(&mut trust, &pending.connection_id, &pending.pin, 111, &mut notices),
            Err(SecurityError::UnknownPending)
        ));
    }

    #[test]
    fn wrong_pin_keeps_record_until_budget_exhausted() {
        let mut registry = new_registry();
        let mut trust = scratch_trust();
        let mut notices = Vec::new();
        let pending = registry.request("dev-1", "Pixel", 100, &mut notices);

        for _ in 0..2 {
            assert!(matches!(
                registry.verify_pin(&mut trust, &pending.connection_id, "000000", 110, &mut notices),
                Err(SecurityError::PinMismatch)
            ));
        }
        // third wrong attempt exhausts the budget and rejects permanently
        assert!(matches!(
            registry.verify_pin(&mut trust, &pending.connection_id, "000000", 110, &mut notices),
            Err(SecurityError::TooManyAttempts)
        ));
        // a fourth call, even with the correct PIN, finds no record
        assert!(matches!(
            registry.verify_pin(&mut trust, &pending.connection_id, &pending.pin, 110, &mut notices),
            Err(SecurityError::UnknownPending)
        ));
        assert!(!trust.is_known("dev-1"));
    }

    #[test]
    fn expired_challenge_rejected_on_verify() {
        let mut registry = new_registry();
        let mut trust = scratch_trust();
        let mut notices = Vec::new();
        let pending = registry.request("dev-1", "Pixel", 100, &mut notices);

        assert!(matches!(
            registry.verify_pin(&mut trust, &pending.connection_id, &pending.pin, 161, &mut notices),
            Err(SecurityError::PinExpired)
        ));
        assert!(matches!(
            notices.last(),
            Some(Notice::Rejected { reason: "pin expired", .. })
        ));
    }

    #[test]
    fn approve_bypasses_pin() {
        let mut registry = new_registry();
        let mut trust = scratch_trust();
        let mut notices = Vec::new();
        let pending = registry.request("dev-2", "Laptop", 100, &mut notices);

        registry
            .approve(&mut trust, &pending.connection_id, 110, &mut notices)
            .expect("approve");
        assert!(trust.is_known("dev-2"));
        assert!(matches!(
            registry.reject(&pending.connection_id, &mut notices),
            Err(SecurityError::UnknownPending)
        ));
    }

    #[test]
    fn reject_is_terminal() {
        let mut registry = new_registry();
        let mut trust = scratch_trust();
        let mut notices = Vec::new();
        let pending = registry.request("dev-3", "Phone", 100, &mut notices);

        registry
            .reject(&pending.connection_id, &mut notices)
            .expect("reject");
        assert!(matches!(
            notices.last(),
            Some(Notice::Rejected { reason: "rejected by operator", .. })
        ));
        assert!(matches!(
            registry.verify_pin(&mut trust, &pending.connection_id, &pending.pin, 110, &mut notices),
            Err(SecurityError::UnknownPending)
        ));
        assert!(!trust.is_known("dev-3"));
    }

    #[test]
    fn sweep_purges_expired_records() {
        let mut registry = new_registry();
        let mut notices = Vec::new();
        registry.request("dev-1", "A", 100, &mut notices);
        registry.request("dev-2", "B", 130, &mut notices);

        notices.clear();
        assert_eq!(registry.sweep(161, &mut notices), 1);
        assert_eq!(notices.len(), 1);
        assert_eq!(registry.pending(161).len(), 1);
    }
}
