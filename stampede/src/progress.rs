//! Progress snapshot delivery: rate-limited unless forced.

use stampede_core::{ProgressSnapshot, PROGRESS_INTERVAL};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Receives progress snapshots from a running load test.
///
/// Implemented for plain closures and for
/// `tokio::sync::mpsc::UnboundedSender<ProgressSnapshot>`. Implementations
/// must not block: workers emit from their hot loop.
pub trait ProgressSink: Send + Sync + 'static {
    fn emit(&self, snapshot: ProgressSnapshot);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressSnapshot) + Send + Sync + 'static,
{
    fn emit(&self, snapshot: ProgressSnapshot) {
        self(snapshot)
    }
}

impl ProgressSink for tokio::sync::mpsc::UnboundedSender<ProgressSnapshot> {
    fn emit(&self, snapshot: ProgressSnapshot) {
        // A closed receiver just means nobody is watching anymore.
        let _ = self.send(snapshot);
    }
}

const NEVER: u64 = u64::MAX;

/// Coalesces non-forced snapshots to one per [`PROGRESS_INTERVAL`].
///
/// Forced emissions (user spawn/exit, abort, completion) always go through;
/// the UI and tests rely on those never being dropped.
pub(crate) struct ProgressEmitter {
    sink: Option<Box<dyn ProgressSink>>,
    start: Instant,
    min_interval: Duration,
    last_emit_ms: AtomicU64,
}

impl ProgressEmitter {
    pub fn new(sink: Option<Box<dyn ProgressSink>>, start: Instant) -> Self {
        Self {
            sink,
            start,
            min_interval: PROGRESS_INTERVAL,
            last_emit_ms: AtomicU64::new(NEVER),
        }
    }

    pub fn emit(&self, snapshot: ProgressSnapshot, force: bool) {
        let Some(sink) = &self.sink else { return };

        let now_ms = self.start.elapsed().as_millis() as u64;
        if force {
            self.last_emit_ms.store(now_ms, Ordering::Relaxed);
        } else {
            let last = self.last_emit_ms.load(Ordering::Relaxed);
            if last != NEVER && now_ms.saturating_sub(last) < self.min_interval.as_millis() as u64 {
                return;
            }
            // Claim the slot; losing the race means another worker just
            // emitted an equivalent snapshot.
            if self
                .last_emit_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
            {
                return;
            }
        }

        sink.emit(snapshot);
    }
}
