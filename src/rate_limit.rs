use std::collections::HashMap;

/// Bucket used when a caller cannot attribute an attempt to a concrete
/// network identifier. Fail conservative: anonymous attempts all share one
/// window instead of bypassing the limiter.
pub const SHARED_BUCKET: &str = "unidentified";

/// Sliding-window attempt counter per network identifier, with a temporary
/// hard blocklist layered on top. Windows are pruned lazily on each check.
#[derive(Debug)]
pub struct RateGuard {
    window_secs: i64,
    max_per_window: usize,
    windows: HashMap<String, Vec<i64>>,
    blocks: HashMap<String, i64>,
}

impl RateGuard {
    pub fn new(window_secs: i64, max_per_window: usize) -> Self {
        Self {
            window_secs,
            max_per_window,
            windows: HashMap::new(),
            blocks: HashMap::new(),
        }
    }

    /// Records an attempt for `identifier` unless the window is already
    /// full. Returns `true` when the attempt is allowed.
    pub fn allow(&mut self, identifier: &str, now: i64) -> bool {
        let window_secs = self.window_secs;
        let attempts = self.windows.entry(identifier.to_string()).or_default();
        attempts.retain(|t| now - t < window_secs);
        if attempts.len() >= self.max_per_window {
            return false;
        }
        attempts.push(now);
        true
    }

    /// Installs a hard deny for `identifier`, overriding the window logic.
    pub fn block(&mut self, identifier: &str, duration_secs: i64, now: i64) {
        self.blocks
            .insert(identifier.to_string(), now + duration_secs);
    }

    /// Checks the blocklist, lazily clearing an expired entry.
    pub fn is_blocked(&mut self, identifier: &str, now: i64) -> bool {
        match self.blocks.get(identifier) {
            Some(until) if now < *until => true,
            Some(_) => {
                self.blocks.remove(identifier);
                false
            }
            None => false,
        }
    }

    /// Drops empty windows and expired blocks.
    pub fn sweep(&mut self, now: i64) {
        let window_secs = self.window_secs;
        self.windows.retain(|_, attempts| {
            attempts.retain(|t| now - t < window_secs);
            !attempts.is_empty()
        });
        self.blocks.retain(|_, until| now < *until);
    }
}
