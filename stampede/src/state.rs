//! Shared run state and the context handed to every spawned task.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metrics_util::AtomicBucket;
use stampede_core::{
    AdaptiveSummary, LoadConfig, ProgressSnapshot, RequestTemplate, MIN_ABORT_SAMPLES,
};
use tokio_util::sync::CancellationToken;

use crate::controllers::{AdaptiveWindow, WindowStats};
use crate::limiter::RpsGate;
use crate::progress::ProgressEmitter;

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counters and controller knobs shared by every task of one run.
///
/// Workers only touch atomics and the latency bucket on the hot path; the
/// mutexes guard cold-path bookkeeping.
pub(crate) struct RunState {
    pub total_requests: AtomicU64,
    pub successful_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    /// Iteration slots handed out so far. Reserving a slot is the only gate
    /// on the iteration budget.
    pub issued: AtomicU64,
    pub active_users: AtomicU64,
    /// Concurrency ceiling workers compare their user number against.
    pub target_users: AtomicU64,
    /// Cleared by the adaptive controller on the first failure-rate breach.
    pub allow_ramping: AtomicBool,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    pub response_times: AtomicBucket<Duration>,
    failure_status_counts: Mutex<BTreeMap<String, u64>>,
    adaptive: Mutex<AdaptiveSummary>,
}

impl RunState {
    pub fn new(initial_target: u64, summary: AdaptiveSummary) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            issued: AtomicU64::new(0),
            active_users: AtomicU64::new(0),
            target_users: AtomicU64::new(initial_target),
            allow_ramping: AtomicBool::new(true),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            response_times: AtomicBucket::new(),
            failure_status_counts: Mutex::new(BTreeMap::new()),
            adaptive: Mutex::new(summary),
        }
    }

    /// Claims one slot of the iteration budget. Always succeeds on
    /// duration-bounded runs.
    pub fn reserve_slot(&self, iterations: Option<u64>) -> bool {
        let Some(limit) = iterations else {
            return true;
        };
        self.issued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                (cur < limit).then(|| cur + 1)
            })
            .is_ok()
    }

    pub fn record_outcome(&self, status: u16, timing: Duration, failure: bool) {
        self.response_times.push(timing);
        if failure {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
            // Transport errors land under the synthetic status "0".
            *lock_or_recover(&self.failure_status_counts)
                .entry(status.to_string())
                .or_insert(0) += 1;
        } else {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        }

        #[cfg(feature = "metrics")]
        {
            metrics::histogram!("load_test_latency").record(timing.as_nanos() as f64);
            if failure {
                metrics::counter!("load_test_error").increment(1);
            } else {
                metrics::counter!("load_test_success").increment(1);
            }
        }
    }

    /// One-shot: the first caller wins and its reason sticks.
    pub fn abort(&self, reason: String) -> bool {
        if self
            .aborted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *lock_or_recover(&self.abort_reason) = Some(reason);
            true
        } else {
            false
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn abort_reason(&self) -> Option<String> {
        lock_or_recover(&self.abort_reason).clone()
    }

    /// Checks the global failure-rate abort condition, returning the abort
    /// reason when it trips.
    pub fn check_failure_rate(&self, threshold: f64) -> Option<String> {
        let successful = self.successful_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let completed = successful + failed;
        if completed < MIN_ABORT_SAMPLES {
            return None;
        }
        let rate = failed as f64 / completed as f64;
        if rate >= threshold {
            Some(format!(
                "Failure rate {:.1}% exceeded threshold {:.1}%",
                rate * 100.0,
                threshold * 100.0
            ))
        } else {
            None
        }
    }

    pub fn failure_status_counts(&self) -> BTreeMap<String, u64> {
        lock_or_recover(&self.failure_status_counts).clone()
    }

    pub fn lock_adaptive(&self) -> MutexGuard<'_, AdaptiveSummary> {
        lock_or_recover(&self.adaptive)
    }
}

/// Everything one run's tasks share, behind a single `Arc`.
pub(crate) struct RunContext<E> {
    pub config: LoadConfig,
    pub request_id: String,
    pub template: Arc<RequestTemplate>,
    pub executor: E,
    pub state: RunState,
    pub emitter: ProgressEmitter,
    pub limiter: Option<RpsGate>,
    window: Option<Mutex<AdaptiveWindow>>,
    /// External cancellation, from the caller.
    pub cancel: CancellationToken,
    /// Internal stop signal: deadline, stop condition, abort, stabilization.
    pub stopper: CancellationToken,
    pub started: Instant,
    pub started_at_ms: i64,
    pub stop_at: Option<Instant>,
}

impl<E> RunContext<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LoadConfig,
        request_id: String,
        template: Arc<RequestTemplate>,
        executor: E,
        state: RunState,
        emitter: ProgressEmitter,
        cancel: CancellationToken,
        started: Instant,
        started_at_ms: i64,
    ) -> Self {
        let limiter = config
            .requests_per_second
            .and_then(|rps| RpsGate::new(started, rps));
        let window = config
            .adaptive
            .as_ref()
            .map(|a| Mutex::new(AdaptiveWindow::new(a.window_secs)));
        let stop_at = config.duration.map(|d| started + d);
        Self {
            config,
            request_id,
            template,
            executor,
            state,
            emitter,
            limiter,
            window,
            cancel,
            stopper: CancellationToken::new(),
            started,
            started_at_ms,
            stop_at,
        }
    }

    pub fn halted(&self) -> bool {
        self.cancel.is_cancelled() || self.stopper.is_cancelled() || self.state.is_aborted()
    }

    pub fn past_deadline(&self) -> bool {
        self.stop_at.is_some_and(|at| Instant::now() >= at)
    }

    pub fn stop(&self) {
        self.stopper.cancel();
    }

    /// Sleeps for `dur`, waking early on cancellation or stop. Returns
    /// `true` when the full wait elapsed undisturbed.
    pub async fn wait_or_stop(&self, dur: Duration) -> bool {
        if dur.is_zero() {
            return true;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = self.stopper.cancelled() => false,
            _ = tokio::time::sleep(dur) => true,
        }
    }

    pub fn record_window(&self, failure: bool) {
        if let Some(window) = &self.window {
            lock_or_recover(window).record(self.started.elapsed().as_secs(), failure);
        }
    }

    pub fn window_stats(&self, now_sec: u64) -> Option<WindowStats> {
        self.window
            .as_ref()
            .and_then(|w| lock_or_recover(w).stats(now_sec))
    }

    /// Builds a snapshot from the live counters and hands it to the sink.
    pub fn emit(&self, force: bool, done: bool) {
        let successful = self.state.successful_requests.load(Ordering::Relaxed);
        let failed = self.state.failed_requests.load(Ordering::Relaxed);
        let aborted = self.state.is_aborted();
        let snapshot = ProgressSnapshot {
            request_id: self.request_id.clone(),
            started_at: self.started_at_ms,
            planned_duration_ms: self.config.duration.map(|d| d.as_millis() as u64),
            active_users: self.state.active_users.load(Ordering::Relaxed),
            max_users: self.config.max_users,
            total_sent: self.state.total_requests.load(Ordering::Relaxed),
            successful,
            failed,
            done,
            cancelled: self.cancel.is_cancelled(),
            aborted,
            abort_reason: if aborted {
                self.state.abort_reason()
            } else {
                None
            },
        };
        self.emitter.emit(snapshot, force);
    }
}
