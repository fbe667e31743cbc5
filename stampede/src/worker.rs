//! The per-user request loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::executor::{ExecutorResult, RequestExecutor};
use crate::state::RunContext;

/// Keeps the active-user gauge honest even when the loop unwinds.
struct ActiveUserGuard<'a, E> {
    ctx: &'a RunContext<E>,
}

impl<'a, E> ActiveUserGuard<'a, E> {
    fn enter(ctx: &'a RunContext<E>) -> Self {
        ctx.state.active_users.fetch_add(1, Ordering::Relaxed);
        ctx.emit(true, false);
        Self { ctx }
    }
}

impl<E> Drop for ActiveUserGuard<'_, E> {
    fn drop(&mut self) {
        self.ctx.state.active_users.fetch_sub(1, Ordering::Relaxed);
        self.ctx.emit(true, false);
    }
}

/// One virtual user. Runs until the iteration budget is spent, the run
/// halts, or the adaptive controller demotes this user number.
///
/// Demotion is permanent: the highest-numbered users exit first and are
/// never re-promoted within a run.
pub(crate) async fn run_user<E, F>(ctx: Arc<RunContext<E>>, user_number: u64)
where
    E: RequestExecutor<F>,
    F: std::future::Future<Output = ExecutorResult> + Send + 'static,
{
    let _guard = ActiveUserGuard::enter(&ctx);
    let mut rng = SmallRng::from_entropy();

    loop {
        if ctx.halted() {
            return;
        }
        if ctx.config.adaptive.is_some()
            && user_number > ctx.state.target_users.load(Ordering::Relaxed)
        {
            debug!(user_number, "User demoted, exiting");
            return;
        }
        if ctx.past_deadline() {
            ctx.stop();
            return;
        }
        if !ctx.state.reserve_slot(ctx.config.iterations) {
            return;
        }

        // The slot is claimed; from here this request counts as sent.
        ctx.state.total_requests.fetch_add(1, Ordering::Relaxed);
        ctx.emit(false, false);

        if let Some(gate) = &ctx.limiter {
            let wait = gate.reserve(Instant::now());
            if !ctx.wait_or_stop(wait).await {
                return;
            }
            if ctx.halted() {
                return;
            }
        }

        let call_start = Instant::now();
        let (status, timing) = match (ctx.executor)(ctx.template.clone()).await {
            Ok(executed) => (
                executed.status,
                executed.timing.unwrap_or_else(|| call_start.elapsed()),
            ),
            Err(err) => {
                debug!(user_number, error = %err, "Request failed in transport");
                (0, call_start.elapsed())
            }
        };
        let failure = status == 0 || status >= 400;
        ctx.state.record_outcome(status, timing, failure);
        ctx.record_window(failure);

        if let Some(threshold) = ctx.config.failure_rate_threshold {
            if let Some(reason) = ctx.state.check_failure_rate(threshold) {
                if ctx.state.abort(reason) {
                    ctx.emit(true, false);
                }
                return;
            }
        }
        if ctx.state.is_aborted() {
            return;
        }

        let think = think_time(&ctx, &mut rng);
        if !ctx.wait_or_stop(think).await {
            return;
        }
    }
}

fn think_time<E>(ctx: &RunContext<E>, rng: &mut SmallRng) -> Duration {
    match ctx.config.wait {
        Some(range) => {
            let lo = range.min.min(range.max).as_millis() as u64;
            let hi = range.min.max(range.max).as_millis() as u64;
            if lo == hi {
                Duration::from_millis(lo)
            } else {
                Duration::from_millis(rng.gen_range(lo..=hi))
            }
        }
        None => ctx.config.delay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressEmitter;
    use crate::state::RunState;
    use stampede_core::{
        AdaptiveConfig, AdaptiveSummary, ExecutedRequest, LoadConfig, RequestTemplate,
    };
    use tokio_util::sync::CancellationToken;

    fn context(config: LoadConfig, initial_target: u64) -> Arc<RunContext<impl RequestExecutor<std::future::Ready<ExecutorResult>>>> {
        let executor =
            |_t: Arc<RequestTemplate>| std::future::ready(Ok(ExecutedRequest::with_status(200)));
        Arc::new(RunContext::new(
            config,
            "test".to_string(),
            Arc::new(RequestTemplate::new("GET", "http://localhost/health")),
            executor,
            RunState::new(initial_target, AdaptiveSummary::default()),
            ProgressEmitter::new(None, Instant::now()),
            CancellationToken::new(),
            Instant::now(),
            0,
        ))
    }

    #[tokio::test]
    async fn spends_the_iteration_budget_exactly() {
        let config = LoadConfig {
            iterations: Some(5),
            duration: None,
            delay: Duration::ZERO,
            ..LoadConfig::default()
        };
        let ctx = context(config, 1);

        run_user(ctx.clone(), 1).await;

        assert_eq!(ctx.state.total_requests.load(Ordering::Relaxed), 5);
        assert_eq!(ctx.state.successful_requests.load(Ordering::Relaxed), 5);
        assert_eq!(ctx.state.active_users.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn demoted_user_exits_without_sending() {
        let config = LoadConfig {
            iterations: Some(100),
            duration: None,
            delay: Duration::ZERO,
            adaptive: Some(AdaptiveConfig {
                failure_rate: 0.01,
                window_secs: 15,
                stable_secs: 20,
                cooldown: Duration::from_secs(5),
                backoff_step_users: 2,
            }),
            ..LoadConfig::default()
        };
        // Target is 2, user number 3 is above the ceiling.
        let ctx = context(config, 2);

        run_user(ctx.clone(), 3).await;

        assert_eq!(ctx.state.total_requests.load(Ordering::Relaxed), 0);
        assert_eq!(ctx.state.issued.load(Ordering::Relaxed), 0);
    }

    async fn panicking_request(_t: Arc<RequestTemplate>) -> ExecutorResult {
        panic!("executor blew up");
    }

    #[tokio::test]
    async fn active_user_gauge_survives_a_panicking_executor() {
        let config = LoadConfig {
            iterations: Some(10),
            duration: None,
            delay: Duration::ZERO,
            ..LoadConfig::default()
        };
        let ctx = Arc::new(RunContext::new(
            config,
            "test".to_string(),
            Arc::new(RequestTemplate::new("GET", "http://localhost/health")),
            panicking_request,
            RunState::new(1, AdaptiveSummary::default()),
            ProgressEmitter::new(None, Instant::now()),
            CancellationToken::new(),
            Instant::now(),
            0,
        ));

        let handle = tokio::spawn(run_user(ctx.clone(), 1));
        assert!(handle.await.is_err());

        // The drop guard ran during unwinding.
        assert_eq!(ctx.state.active_users.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lowering_the_target_demotes_the_highest_numbers_only() {
        let config = LoadConfig {
            iterations: None,
            duration: Some(Duration::from_secs(30)),
            max_users: 4,
            delay: Duration::from_millis(10),
            adaptive: Some(AdaptiveConfig {
                failure_rate: 0.01,
                window_secs: 15,
                stable_secs: 20,
                cooldown: Duration::from_secs(5),
                backoff_step_users: 2,
            }),
            ..LoadConfig::default()
        };
        let executor = |_t: Arc<RequestTemplate>| async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(ExecutedRequest::with_status(200))
        };
        let ctx = Arc::new(RunContext::new(
            config,
            "test".to_string(),
            Arc::new(RequestTemplate::new("GET", "http://localhost/health")),
            executor,
            RunState::new(4, AdaptiveSummary::default()),
            ProgressEmitter::new(None, Instant::now()),
            CancellationToken::new(),
            Instant::now(),
            0,
        ));

        let handles: Vec<_> = (1..=4)
            .map(|n| tokio::spawn(run_user(ctx.clone(), n)))
            .collect();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ctx.state.active_users.load(Ordering::Relaxed), 4);

        ctx.state.target_users.store(2, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Users 3 and 4 exited; 1 and 2 kept running.
        assert!(handles[2].is_finished());
        assert!(handles[3].is_finished());
        assert!(!handles[0].is_finished());
        assert!(!handles[1].is_finished());
        assert_eq!(ctx.state.active_users.load(Ordering::Relaxed), 2);

        ctx.stop();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn halts_after_a_failure_rate_abort() {
        let executor =
            |_t: Arc<RequestTemplate>| std::future::ready(Ok(ExecutedRequest::with_status(500)));
        let config = LoadConfig {
            iterations: Some(1_000),
            duration: None,
            delay: Duration::ZERO,
            failure_rate_threshold: Some(0.5),
            ..LoadConfig::default()
        };
        let ctx = Arc::new(RunContext::new(
            config,
            "test".to_string(),
            Arc::new(RequestTemplate::new("GET", "http://localhost/health")),
            executor,
            RunState::new(1, AdaptiveSummary::default()),
            ProgressEmitter::new(None, Instant::now()),
            CancellationToken::new(),
            Instant::now(),
            0,
        ));

        run_user(ctx.clone(), 1).await;

        // The monitor arms at 20 completed requests and trips immediately.
        assert_eq!(ctx.state.total_requests.load(Ordering::Relaxed), 20);
        assert!(ctx.state.is_aborted());
        assert_eq!(
            ctx.state.abort_reason().as_deref(),
            Some("Failure rate 100.0% exceeded threshold 50.0%")
        );
    }
}
