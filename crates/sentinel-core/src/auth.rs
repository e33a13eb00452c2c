//! Authentication and rate limiting for the gateway surface.
//!
//! - PIN verification against a secret loaded at startup. Comparison is
//!   constant-time over the byte length to avoid a trivial timing oracle.
//! - Fixed-window rate limiting per client identity (not per session, so
//!   identity rotation cannot evade the budget). Blocked requests count
//!   against the window — the scanning work was already spent.
//! - Lockout: N consecutive auth failures from one identity lock it out
//!   for a cooldown window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use sentinel_types::errors::SentinelError;

/// Verifies the gateway PIN.
#[derive(Debug)]
pub struct PinVerifier {
    expected: Option<String>,
}

impl PinVerifier {
    /// A verifier that requires the given PIN.
    pub fn with_pin(pin: &str) -> Self {
        Self {
            expected: Some(pin.trim().to_string()),
        }
    }

    /// A verifier that accepts everything (PIN auth disabled).
    pub fn disabled() -> Self {
        Self { expected: None }
    }

    /// Load the PIN from a secret file.
    pub fn from_file(path: &str) -> Result<Self, SentinelError> {
        let pin = std::fs::read_to_string(path)
            .map_err(|e| SentinelError::Fatal(format!("cannot read PIN file {path}: {e}")))?;
        if pin.trim().is_empty() {
            return Err(SentinelError::Fatal(format!("PIN file {path} is empty")));
        }
        Ok(Self::with_pin(&pin))
    }

    /// Check a presented PIN.
    pub fn verify(&self, presented: Option<&str>) -> Result<(), SentinelError> {
        let Some(expected) = &self.expected else {
            return Ok(());
        };
        let presented =
            presented.ok_or_else(|| SentinelError::Auth("missing PIN".to_string()))?;
        if constant_time_eq(expected.as_bytes(), presented.trim().as_bytes()) {
            Ok(())
        } else {
            Err(SentinelError::Auth("invalid PIN".to_string()))
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Fixed-window request counter per client identity.
pub struct FixedWindowRateLimiter {
    window: Duration,
    limit: u32,
    counters: Mutex<HashMap<String, (Instant, u32)>>,
}

impl FixedWindowRateLimiter {
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            window,
            limit,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Count a request against the identity's window.
    pub fn check(&self, identity: &str) -> Result<(), SentinelError> {
        let now = Instant::now();
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(identity.to_string()).or_insert((now, 0));

        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        entry.1 += 1;

        if entry.1 > self.limit {
            let retry_after = self.window.saturating_sub(now.duration_since(entry.0));
            warn!(event = "rate_limit_exceeded", identity);
            return Err(SentinelError::RateLimitExceeded(format!(
                "limit {} per {}s exceeded, retry after {}s",
                self.limit,
                self.window.as_secs(),
                retry_after.as_secs()
            )));
        }
        Ok(())
    }
}

/// Tracks consecutive auth failures per identity with a cooldown lockout.
pub struct LockoutTracker {
    max_failures: u32,
    cooldown: Duration,
    state: Mutex<HashMap<String, FailureState>>,
}

struct FailureState {
    consecutive: u32,
    locked_until: Option<Instant>,
}

impl LockoutTracker {
    pub fn new(max_failures: u32, cooldown: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            cooldown,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Reject identities inside a lockout window.
    pub fn check(&self, identity: &str) -> Result<(), SentinelError> {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.get_mut(identity) {
            if let Some(until) = entry.locked_until {
                if Instant::now() < until {
                    return Err(SentinelError::Auth(format!(
                        "identity locked out for {}s",
                        (until - Instant::now()).as_secs().max(1)
                    )));
                }
                // Cooldown elapsed; start fresh.
                entry.locked_until = None;
                entry.consecutive = 0;
            }
        }
        Ok(())
    }

    /// Record a failed authentication.
    pub fn record_failure(&self, identity: &str) {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(identity.to_string()).or_insert(FailureState {
            consecutive: 0,
            locked_until: None,
        });
        entry.consecutive += 1;
        if entry.consecutive >= self.max_failures {
            entry.locked_until = Some(Instant::now() + self.cooldown);
            warn!(
                event = "auth_lockout",
                identity,
                failures = entry.consecutive,
            );
        }
    }

    /// Record a successful authentication, clearing the failure streak.
    pub fn record_success(&self, identity: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.get_mut(identity) {
            entry.consecutive = 0;
        }
    }
}

// ============================================================
// Tests
// ============================================================
