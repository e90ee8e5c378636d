use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use crate::utils::SweepGate;

const DEFAULT_CLEANUP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone)]
struct PendingPasscode {
    code: String,
    expires_at: Instant,
}

/// Single-use sign-in codes keyed by normalized email. Process-local: a
/// restart invalidates outstanding codes.
///
/// Codes nobody verifies are dropped by a sweep on `issue` once the map
/// grows past the cleanup threshold.
#[derive(Clone)]
pub struct PasscodeStore {
    pending: Arc<DashMap<String, PendingPasscode>>,
    ttl: Duration,
    sweep: Arc<SweepGate>,
}

impl PasscodeStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_cleanup_threshold(ttl, DEFAULT_CLEANUP_THRESHOLD)
    }

    pub fn with_cleanup_threshold(ttl: Duration, cleanup_threshold: usize) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            ttl,
            sweep: Arc::new(SweepGate::new(cleanup_threshold, ttl)),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Replaces any outstanding code for `email`.
    pub fn issue(&self, email: &str) -> String {
        let code = format!("{:06}", rand::rng().random_range(0..1_000_000u32));
        let now = Instant::now();

        self.pending.insert(
            email.to_string(),
            PendingPasscode {
                code: code.clone(),
                expires_at: now + self.ttl,
            },
        );

        debug!(email, "Passcode issued");

        if self.sweep.try_claim(self.pending.len(), now) {
            self.remove_expired(now);
        }

        code
    }

    /// Consumes the code on success. Wrong guesses leave it in place; the
    /// verification limiter bounds how many there can be.
    pub fn verify(&self, email: &str, code: &str) -> bool {
        let now = Instant::now();

        let removed = self.pending.remove_if(email, |_, pending| {
            pending.expires_at <= now || constant_time_eq(&pending.code, code)
        });

        match removed {
            Some((_, pending)) => pending.expires_at > now,
            None => false,
        }
    }

    fn remove_expired(&self, now: Instant) {
        let before = self.pending.len();
        self.pending.retain(|_, pending| pending.expires_at > now);

        debug!(
            removed = before.saturating_sub(self.pending.len()),
            "Expired passcodes removed"
        );
    }
}

fn constant_time_eq(expected: &str, given: &str) -> bool {
    if expected.len() != given.len() {
        return false;
    }

    expected
        .bytes()
        .zip(given.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
