//! Global requests-per-second spacing gate, shared by every worker.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Serializes dispatch across all workers to one request every `1s / rps`.
///
/// `reserve` claims the next dispatch slot and returns how long the caller
/// must sleep before proceeding; the instant advances from
/// `max(next_allowed, now)` so idle periods are not banked as burst credit.
/// Ordering beyond first-come-first-served is not guaranteed.
pub(crate) struct RpsGate {
    interval: Duration,
    next_allowed: Mutex<Instant>,
}

impl RpsGate {
    pub fn new(start: Instant, rps: u64) -> Option<Self> {
        if rps == 0 {
            return None;
        }
        Some(Self {
            interval: Duration::from_secs_f64(1.0 / rps as f64),
            next_allowed: Mutex::new(start),
        })
    }

    pub fn reserve(&self, now: Instant) -> Duration {
        let mut next = self
            .next_allowed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let wait = next.saturating_duration_since(now);
        if now > *next {
            *next = now;
        }
        *next += self.interval;
        wait
    }
}
