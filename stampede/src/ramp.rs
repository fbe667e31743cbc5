//! User spawning: the initial cohort plus the ramp toward `max_users`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use stampede_core::MIN_SPAWN_INTERVAL;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::executor::{ExecutorResult, RequestExecutor};
use crate::state::RunContext;
use crate::worker::run_user;

/// Spawns `start_users` immediately, then feeds in the rest at the
/// configured pace. Every join handle goes to `handle_tx` so the supervisor
/// can drain them.
///
/// On adaptive runs the concurrency ceiling is raised one user at a time as
/// the ramp proceeds, and the ramp stops for good once the controller clears
/// `allow_ramping`.
pub(crate) async fn run_ramp<E, F>(
    ctx: Arc<RunContext<E>>,
    handle_tx: mpsc::UnboundedSender<JoinHandle<()>>,
) where
    E: RequestExecutor<F>,
    F: std::future::Future<Output = ExecutorResult> + Send + 'static,
{
    let adaptive = ctx.config.adaptive.is_some();
    let max_users = ctx.config.max_users;
    let mut spawned: u64 = 0;

    for _ in 0..ctx.config.start_users.min(max_users) {
        if ctx.halted() {
            return;
        }
        spawned += 1;
        let handle = tokio::spawn(run_user(ctx.clone(), spawned));
        if handle_tx.send(handle).is_err() {
            return;
        }
    }

    let remaining = max_users.saturating_sub(spawned);
    if remaining == 0 {
        return;
    }

    let spawn_interval = spawn_interval(&ctx.config, remaining);
    debug!(
        remaining,
        interval_ms = spawn_interval.map(|d| d.as_millis() as u64),
        "Ramping up"
    );

    for _ in 0..remaining {
        if let Some(interval) = spawn_interval {
            if !ctx.wait_or_stop(interval).await {
                return;
            }
        }
        if ctx.halted() || ctx.past_deadline() {
            return;
        }
        if adaptive && !ctx.state.allow_ramping.load(Ordering::Relaxed) {
            debug!(spawned, "Ramp frozen by the adaptive controller");
            return;
        }

        spawned += 1;
        if adaptive {
            // Lift the ceiling so the new user is inside it.
            ctx.state.target_users.store(spawned, Ordering::Relaxed);
        }
        let handle = tokio::spawn(run_user(ctx.clone(), spawned));
        if handle_tx.send(handle).is_err() {
            return;
        }
    }
}

/// The pause between two ramp spawns, `None` for spawn-all-at-once.
///
/// An explicit `spawn_rate` wins; otherwise a `ramp_up` duration is spread
/// evenly over the remaining users.
fn spawn_interval(config: &stampede_core::LoadConfig, remaining: u64) -> Option<Duration> {
    let rate = config.spawn_rate.or_else(|| {
        config.ramp_up.map(|ramp| {
            let secs = ramp.as_secs_f64();
            if secs <= 0.0 {
                remaining
            } else {
                (remaining as f64 / secs).ceil() as u64
            }
            .max(1)
        })
    })?;
    Some(Duration::from_millis(1000 / rate.max(1)).max(MIN_SPAWN_INTERVAL))
}
