//! Adaptive capacity discovery.
//!
//! While the windowed failure rate stays under the configured target the
//! ramp controller keeps raising concurrency toward `max_users`. The first
//! breach flips the run into backoff: ramping is frozen and the target is
//! stepped down, one cooldown apart, until the window is healthy again.
//! Holding healthy for `stable_secs` settles the run; backing off below one
//! user aborts it.

use std::time::{Duration, Instant};

use stampede_core::{
    AdaptiveConfig, AdaptivePhase, AdaptiveSummary, ADAPTIVE_TICK, MIN_TARGET_USERS,
    MIN_WINDOW_SAMPLES,
};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::window::WindowStats;
use crate::executor::{ExecutorResult, RequestExecutor};
use crate::state::RunContext;

/// What one controller tick decided. Applied by the driver loop, which owns
/// the shared state the pure state machine never touches.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct StepOutcome {
    pub disable_ramping: bool,
    pub set_target: Option<u64>,
    pub stop: bool,
    pub abort_reason: Option<String>,
}

#[derive(Debug)]
pub(crate) struct AdaptiveController {
    cfg: AdaptiveConfig,
    max_users: u64,
    saw_instability: bool,
    stable_since: Option<Instant>,
    last_adjust: Option<Instant>,
    backoff_steps: u64,
}

impl AdaptiveController {
    pub fn new(cfg: AdaptiveConfig, max_users: u64) -> Self {
        Self {
            cfg,
            max_users,
            saw_instability: false,
            stable_since: None,
            last_adjust: None,
            backoff_steps: 0,
        }
    }

    /// Advances the state machine by one tick.
    ///
    /// `window` is the aggregate over the sliding window, `None` when no
    /// request finished in range. Verdicts about the shared run state come
    /// back in the [`StepOutcome`]; `summary` is updated in place.
    pub fn step(
        &mut self,
        now: Instant,
        elapsed_ms: u64,
        target_users: u64,
        window: Option<WindowStats>,
        summary: &mut AdaptiveSummary,
    ) -> StepOutcome {
        let mut outcome = StepOutcome::default();

        let Some(stats) = window else {
            return outcome;
        };
        if stats.sent < MIN_WINDOW_SAMPLES {
            return outcome;
        }

        let unhealthy = stats.failure_rate > self.cfg.failure_rate;

        if !self.saw_instability {
            if unhealthy {
                // First breach: freeze the ramp and remember where it broke.
                self.saw_instability = true;
                self.stable_since = None;
                self.last_adjust = Some(now);
                summary.phase = AdaptivePhase::BackingOff;
                summary.peak_users = Some(target_users);
                summary.time_to_first_failure_ms = Some(elapsed_ms);
                summary.peak_window_failure_rate = Some(stats.failure_rate);
                summary.peak_window_rps = Some(stats.rps);
                outcome.disable_ramping = true;
                warn!(
                    target_users,
                    failure_rate = stats.failure_rate,
                    "Failure rate breached target, backing off"
                );
                return outcome;
            }

            // Healthy all the way up: once the ramp has delivered the full
            // concurrency, hold it for the stabilization interval.
            if target_users >= self.max_users {
                let since = *self.stable_since.get_or_insert(now);
                if now.duration_since(since) >= Duration::from_secs(self.cfg.stable_secs) {
                    summary.phase = AdaptivePhase::Stable;
                    summary.stabilized = Some(true);
                    summary.peak_users = Some(self.max_users);
                    summary.stable_users = Some(self.max_users);
                    summary.backoff_steps = Some(0);
                    summary.peak_window_failure_rate = Some(stats.failure_rate);
                    summary.peak_window_rps = Some(stats.rps);
                    summary.stable_window_failure_rate = Some(stats.failure_rate);
                    summary.stable_window_rps = Some(stats.rps);
                    outcome.stop = true;
                    info!(
                        stable_users = self.max_users,
                        "Stable at full concurrency"
                    );
                }
            }
            return outcome;
        }

        // Backing off.
        if unhealthy {
            self.stable_since = None;
            let cooled = self
                .last_adjust
                .map_or(true, |t| now.duration_since(t) >= self.cfg.cooldown);
            if !cooled {
                return outcome;
            }
            self.last_adjust = Some(now);
            let next = target_users
                .saturating_sub(self.cfg.backoff_step_users)
                .max(MIN_TARGET_USERS);
            if next < target_users {
                self.backoff_steps += 1;
                summary.backoff_steps = Some(self.backoff_steps);
                outcome.set_target = Some(next);
                debug!(from = target_users, to = next, "Backing off concurrency");
            }
            if next <= MIN_TARGET_USERS {
                summary.phase = AdaptivePhase::Exhausted;
                summary.stabilized = Some(false);
                outcome.stop = true;
                outcome.abort_reason = Some("Adaptive backoff exhausted".to_string());
            }
            return outcome;
        }

        // Healthy after at least one breach: start (or continue) the
        // stabilization timer at the current reduced target.
        let since = *self.stable_since.get_or_insert(now);
        if now.duration_since(since) >= Duration::from_secs(self.cfg.stable_secs) {
            summary.phase = AdaptivePhase::Stable;
            summary.stabilized = Some(true);
            summary.stable_users = Some(target_users);
            summary.backoff_steps = Some(self.backoff_steps);
            summary.stable_window_failure_rate = Some(stats.failure_rate);
            summary.stable_window_rps = Some(stats.rps);
            outcome.stop = true;
            info!(stable_users = target_users, "Stable after backoff");
        }
        outcome
    }
}

/// Drives the adaptive state machine until the run halts or settles.
pub(crate) async fn run_adaptive<E, F>(ctx: std::sync::Arc<RunContext<E>>)
where
    E: RequestExecutor<F>,
    F: std::future::Future<Output = ExecutorResult> + Send + 'static,
{
    let Some(cfg) = ctx.config.adaptive.clone() else {
        return;
    };

    let mut controller = AdaptiveController::new(cfg, ctx.config.max_users);
    let mut interval = tokio::time::interval(ADAPTIVE_TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            _ = ctx.stopper.cancelled() => return,
            _ = interval.tick() => {}
        }
        if ctx.halted() || ctx.past_deadline() {
            return;
        }

        let elapsed = ctx.started.elapsed();
        let target = ctx.state.target_users.load(std::sync::atomic::Ordering::Relaxed);
        let stats = ctx.window_stats(elapsed.as_secs());

        let outcome = {
            let mut summary = ctx.state.lock_adaptive();
            controller.step(
                Instant::now(),
                elapsed.as_millis() as u64,
                target,
                stats,
                &mut summary,
            )
        };

        if outcome.disable_ramping {
            ctx.state
                .allow_ramping
                .store(false, std::sync::atomic::Ordering::Relaxed);
        }
        if let Some(next) = outcome.set_target {
            ctx.state
                .target_users
                .store(next, std::sync::atomic::Ordering::Relaxed);
        }
        if let Some(reason) = outcome.abort_reason {
            if ctx.state.abort(reason) {
                ctx.emit(true, false);
            }
        }
        if outcome.stop {
            ctx.stop();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AdaptiveConfig {
        AdaptiveConfig {
            failure_rate: 0.05,
            window_secs: 10,
            stable_secs: 20,
            cooldown: Duration::from_secs(5),
            backoff_step_users: 2,
        }
    }

    fn stats(sent: u64, failed: u64) -> Option<WindowStats> {
        Some(WindowStats {
            sent,
            failed,
            failure_rate: failed as f64 / sent as f64,
            rps: sent as f64 / 10.0,
        })
    }

    #[test]
    fn ignores_thin_windows() {
        let mut c = AdaptiveController::new(cfg(), 50);
        let mut summary = AdaptiveSummary::default();
        let t0 = Instant::now();

        assert_eq!(c.step(t0, 0, 10, None, &mut summary), StepOutcome::default());
        // 10 samples, all failing, still below the minimum sample count.
        assert_eq!(
            c.step(t0, 0, 10, stats(10, 10), &mut summary),
            StepOutcome::default()
        );
        assert!(!c.saw_instability);
    }

    #[test]
    fn first_breach_freezes_the_ramp_and_records_the_peak() {
        let mut c = AdaptiveController::new(cfg(), 50);
        let mut summary = AdaptiveSummary::default();
        let t0 = Instant::now();

        let outcome = c.step(t0, 3_000, 24, stats(100, 10), &mut summary);
        assert!(outcome.disable_ramping);
        assert!(!outcome.stop);
        assert_eq!(outcome.set_target, None);
        assert_eq!(summary.phase, AdaptivePhase::BackingOff);
        assert_eq!(summary.peak_users, Some(24));
        assert_eq!(summary.time_to_first_failure_ms, Some(3_000));
        assert_eq!(summary.peak_window_failure_rate, Some(0.1));
    }

    #[test]
    fn backoff_steps_are_cooldown_gated() {
        let mut c = AdaptiveController::new(cfg(), 50);
        let mut summary = AdaptiveSummary::default();
        let t0 = Instant::now();

        c.step(t0, 0, 24, stats(100, 10), &mut summary);

        // Still cooling down: no adjustment.
        let outcome = c.step(t0 + Duration::from_secs(1), 1_000, 24, stats(100, 10), &mut summary);
        assert_eq!(outcome, StepOutcome::default());

        // One cooldown later the target drops by one step.
        let outcome = c.step(t0 + Duration::from_secs(5), 5_000, 24, stats(100, 10), &mut summary);
        assert_eq!(outcome.set_target, Some(22));
        assert_eq!(summary.backoff_steps, Some(1));
    }

    #[test]
    fn stabilizes_after_holding_healthy() {
        let mut c = AdaptiveController::new(cfg(), 50);
        let mut summary = AdaptiveSummary::default();
        let t0 = Instant::now();

        c.step(t0, 0, 24, stats(100, 10), &mut summary);
        c.step(t0 + Duration::from_secs(5), 5_000, 24, stats(100, 10), &mut summary);

        // Healthy at 22 users; the stability timer starts here.
        let outcome = c.step(t0 + Duration::from_secs(6), 6_000, 22, stats(100, 1), &mut summary);
        assert!(!outcome.stop);

        let outcome = c.step(t0 + Duration::from_secs(26), 26_000, 22, stats(100, 1), &mut summary);
        assert!(outcome.stop);
        assert_eq!(outcome.abort_reason, None);
        assert_eq!(summary.phase, AdaptivePhase::Stable);
        assert_eq!(summary.stabilized, Some(true));
        assert_eq!(summary.stable_users, Some(22));
        assert_eq!(summary.backoff_steps, Some(1));
    }

    #[test]
    fn a_breach_resets_the_stability_timer() {
        let mut c = AdaptiveController::new(cfg(), 50);
        let mut summary = AdaptiveSummary::default();
        let t0 = Instant::now();

        c.step(t0, 0, 24, stats(100, 10), &mut summary);
        // Healthy for 15s, then another breach.
        c.step(t0 + Duration::from_secs(6), 6_000, 24, stats(100, 1), &mut summary);
        c.step(t0 + Duration::from_secs(21), 21_000, 24, stats(100, 10), &mut summary);
        // Healthy again, but the 20s clock restarted.
        let outcome = c.step(t0 + Duration::from_secs(30), 30_000, 22, stats(100, 1), &mut summary);
        assert!(!outcome.stop);
    }

    #[test]
    fn exhausts_when_backed_off_to_one_user() {
        let mut c = AdaptiveController::new(cfg(), 50);
        let mut summary = AdaptiveSummary::default();
        let t0 = Instant::now();

        c.step(t0, 0, 3, stats(100, 50), &mut summary);
        let outcome = c.step(t0 + Duration::from_secs(5), 5_000, 3, stats(100, 50), &mut summary);
        assert_eq!(outcome.set_target, Some(MIN_TARGET_USERS));
        assert!(outcome.stop);
        assert_eq!(
            outcome.abort_reason.as_deref(),
            Some("Adaptive backoff exhausted")
        );
        assert_eq!(summary.phase, AdaptivePhase::Exhausted);
        assert_eq!(summary.stabilized, Some(false));
    }

    #[test]
    fn stabilizes_at_full_concurrency_without_a_breach() {
        let mut c = AdaptiveController::new(cfg(), 30);
        let mut summary = AdaptiveSummary::default();
        let t0 = Instant::now();

        // Below max: no timer yet.
        let outcome = c.step(t0, 0, 20, stats(100, 0), &mut summary);
        assert_eq!(outcome, StepOutcome::default());

        c.step(t0 + Duration::from_secs(10), 10_000, 30, stats(100, 0), &mut summary);
        let outcome = c.step(t0 + Duration::from_secs(30), 30_000, 30, stats(100, 0), &mut summary);
        assert!(outcome.stop);
        assert_eq!(summary.phase, AdaptivePhase::Stable);
        assert_eq!(summary.peak_users, Some(30));
        assert_eq!(summary.stable_users, Some(30));
        assert_eq!(summary.backoff_steps, Some(0));
        // Peak and stable window stats both come from the healthy window.
        assert_eq!(summary.peak_window_failure_rate, Some(0.0));
        assert_eq!(summary.peak_window_rps, summary.stable_window_rps);
    }
}
