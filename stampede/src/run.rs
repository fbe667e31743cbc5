//! The public load-test handle and the supervisor that drives a run.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use stampede_core::{
    calculate_metrics, AdaptivePhase, AdaptiveSummary, LoadConfig, LoadTestMetrics,
    RequestTemplate, RunRecord, PROGRESS_INTERVAL,
};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::controllers::run_adaptive;
use crate::error::LoadTestError;
use crate::executor::{ExecutorResult, RequestExecutor};
use crate::progress::{ProgressEmitter, ProgressSink};
use crate::ramp::run_ramp;
use crate::state::{RunContext, RunState};

/// A configured load test. Awaiting it runs the test to completion and
/// yields the final [`LoadTestMetrics`].
///
/// ```no_run
/// use stampede::prelude::*;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = LoadConfig::from_json(r#"{"duration": "30s", "users": 10}"#)?;
/// let template = RequestTemplate::new("GET", "http://localhost:8080/health");
/// let metrics = LoadTest::new("run-1", template, config, |_t: Arc<RequestTemplate>| async {
///     Ok::<_, ExecutorError>(ExecutedRequest::with_status(200))
/// })?
/// .await;
/// println!("{} rps", metrics.requests_per_second);
/// # Ok(())
/// # }
/// ```
#[pin_project::pin_project]
pub struct LoadTest<E> {
    executor: E,
    request_id: String,
    template: Arc<RequestTemplate>,
    config: LoadConfig,
    progress: Option<Box<dyn ProgressSink>>,
    cancel: CancellationToken,
    runner_fut: Option<Pin<Box<dyn Future<Output = LoadTestMetrics> + Send>>>,
}

impl<E> LoadTest<E> {
    pub fn new(
        request_id: &str,
        template: RequestTemplate,
        config: LoadConfig,
        executor: E,
    ) -> Result<Self, LoadTestError> {
        if request_id.trim().is_empty() {
            return Err(LoadTestError::MissingRequestId);
        }
        if template.method.trim().is_empty() || template.url.trim().is_empty() {
            return Err(LoadTestError::MissingMethodOrUrl);
        }
        Ok(Self {
            executor,
            request_id: request_id.to_string(),
            template: Arc::new(template),
            config,
            progress: None,
            cancel: CancellationToken::new(),
            runner_fut: None,
        })
    }

    /// Streams progress snapshots to `sink` while the test runs.
    pub fn progress(mut self, sink: impl ProgressSink) -> Self {
        self.progress = Some(Box::new(sink));
        self
    }

    /// Binds an external cancellation token. Cancelling it winds the run
    /// down and still produces final metrics.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

// Bound on `Fn` directly rather than `RequestExecutor` so the `Output`
// associated-type binding constrains `F` in this impl.
impl<E, F> Future for LoadTest<E>
where
    E: Fn(Arc<RequestTemplate>) -> F + Send + Sync + Clone + 'static,
    F: Future<Output = ExecutorResult> + Send + 'static,
{
    type Output = LoadTestMetrics;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if this.runner_fut.is_none() {
            let executor = this.executor.clone();
            let request_id = this.request_id.clone();
            let template = this.template.clone();
            let config = this.config.clone();
            let progress = this.progress.take();
            let cancel = this.cancel.clone();
            *this.runner_fut = Some(Box::pin(run_load_test(
                request_id, template, config, executor, progress, cancel,
            )));
        }

        if let Some(runner) = this.runner_fut {
            runner.as_mut().poll(cx)
        } else {
            unreachable!()
        }
    }
}

#[instrument(name = "load_test", skip_all, fields(request_id = %request_id))]
async fn run_load_test<E, F>(
    request_id: String,
    template: Arc<RequestTemplate>,
    config: LoadConfig,
    executor: E,
    progress: Option<Box<dyn ProgressSink>>,
    cancel: CancellationToken,
) -> LoadTestMetrics
where
    E: RequestExecutor<F>,
    F: Future<Output = ExecutorResult> + Send + 'static,
{
    info!("Starting load test with config {:?}", &config);

    let started = Instant::now();
    let started_at_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    let adaptive_enabled = config.adaptive_enabled();
    let initial_target = if adaptive_enabled {
        config.start_users
    } else {
        config.max_users
    };
    let summary = AdaptiveSummary {
        enabled: adaptive_enabled,
        phase: if adaptive_enabled {
            AdaptivePhase::Ramping
        } else {
            AdaptivePhase::Disabled
        },
        ..AdaptiveSummary::default()
    };

    let ctx = Arc::new(RunContext::new(
        config,
        request_id,
        template,
        executor,
        RunState::new(initial_target, summary),
        ProgressEmitter::new(progress, started),
        cancel,
        started,
        started_at_ms,
    ));
    ctx.emit(true, false);

    let (handle_tx, mut handle_rx) = mpsc::unbounded_channel();
    let ramp = tokio::spawn(run_ramp(ctx.clone(), handle_tx));
    let controller = adaptive_enabled.then(|| tokio::spawn(run_adaptive(ctx.clone())));

    // Resolves once the ramp has stopped handing out users and every
    // spawned user has returned.
    let mut users_done = tokio::spawn(async move {
        while let Some(handle) = handle_rx.recv().await {
            handle.await.ok();
        }
    });

    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = async {
        match ctx.stop_at {
            Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut deadline_fired = false;

    let cancelled = loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break true,
            res = &mut users_done => {
                res.ok();
                break false;
            }
            _ = &mut deadline, if !deadline_fired => {
                deadline_fired = true;
                debug!("Planned duration elapsed");
                ctx.stop();
            }
            _ = ticker.tick() => ctx.emit(false, false),
        }
    };

    ctx.stop();
    ramp.await.ok();
    if let Some(controller) = controller {
        controller.await.ok();
    }
    if cancelled {
        users_done.await.ok();
    }

    let end_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(started_at_ms);

    let mut response_times_ms = Vec::new();
    ctx.state.response_times.clear_with(|timings| {
        response_times_ms.extend(timings.iter().map(|d| d.as_secs_f64() * 1000.0));
    });

    let record = RunRecord {
        total_requests: ctx.state.total_requests.load(Ordering::Relaxed),
        successful_requests: ctx.state.successful_requests.load(Ordering::Relaxed),
        failed_requests: ctx.state.failed_requests.load(Ordering::Relaxed),
        failure_status_counts: ctx.state.failure_status_counts(),
        response_times_ms,
        start_time_ms: started_at_ms,
        end_time_ms: end_ms,
        cancelled,
        aborted: ctx.state.is_aborted(),
        abort_reason: ctx.state.abort_reason(),
        planned_duration_ms: ctx.config.duration.map(|d| d.as_millis() as u64),
        adaptive: adaptive_enabled.then(|| ctx.state.lock_adaptive().clone()),
    };

    ctx.emit(true, true);

    let metrics = calculate_metrics(&record);
    info!(
        total = metrics.total_requests,
        failed = metrics.failed_requests,
        "Load test finished in {}",
        humantime::format_duration(started.elapsed())
    );
    metrics
}
