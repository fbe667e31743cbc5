//! Raw, alias-rich load-test configuration and its canonical form.

use crate::constants::*;
use crate::parse::*;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid load-test config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The configuration exactly as callers supply it. Every field is optional
/// and loosely typed; most have alias siblings. Nothing here is validated:
/// [`LoadConfig::normalize`] turns this into the one canonical shape the
/// engine runs on.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawLoadConfig {
    // Stop conditions.
    pub iterations: Option<Scalar>,
    pub amount: Option<Scalar>,
    pub requests: Option<Scalar>,
    pub count: Option<Scalar>,
    pub duration: Option<Scalar>,
    pub runtime: Option<Scalar>,
    pub time: Option<Scalar>,

    // Concurrency.
    pub concurrent: Option<Scalar>,
    pub users: Option<Scalar>,
    pub concurrency: Option<Scalar>,
    pub start: Option<Scalar>,
    pub start_users: Option<Scalar>,
    pub max: Option<Scalar>,
    pub max_users: Option<Scalar>,

    // Pacing.
    pub spawn_rate: Option<Scalar>,
    pub ramp_up: Option<Scalar>,
    pub delay: Option<Scalar>,
    pub wait_min: Option<Scalar>,
    pub wait_max: Option<Scalar>,
    pub requests_per_second: Option<Scalar>,

    // Failure policy.
    pub failure_rate_threshold: Option<Scalar>,

    // Adaptive capacity discovery.
    pub adaptive: Option<Scalar>,
    pub adaptive_failure_rate: Option<Scalar>,
    pub adaptive_window: Option<Scalar>,
    pub adaptive_stable: Option<Scalar>,
    pub adaptive_cooldown: Option<Scalar>,
    pub adaptive_backoff_step: Option<Scalar>,
}

/// Pacing bounds for the per-user think time. The worker draws a uniform
/// wait in `[min(min, max), max(min, max)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitRange {
    pub min: Duration,
    pub max: Duration,
}

/// Adaptive-mode settings; present only when adaptive mode is on.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    /// Windowed failure-rate target, a fraction in `(0, 1]`.
    pub failure_rate: f64,
    pub window_secs: u64,
    pub stable_secs: u64,
    pub cooldown: Duration,
    pub backoff_step_users: u64,
}

/// Canonical, validated load-test configuration. Immutable once built.
///
/// Exactly one of `iterations` / `duration` is `Some`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadConfig {
    pub iterations: Option<u64>,
    pub duration: Option<Duration>,
    pub start_users: u64,
    pub max_users: u64,
    pub spawn_rate: Option<u64>,
    pub ramp_up: Option<Duration>,
    pub delay: Duration,
    pub wait: Option<WaitRange>,
    pub requests_per_second: Option<u64>,
    pub failure_rate_threshold: Option<f64>,
    pub adaptive: Option<AdaptiveConfig>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self::normalize(&RawLoadConfig::default())
    }
}

impl LoadConfig {
    /// Parses caller-supplied JSON and normalizes it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: RawLoadConfig = serde_json::from_str(json)?;
        Ok(Self::normalize(&raw))
    }

    /// Collapses the alias families of a raw config into the canonical
    /// shape and applies every default. Total: bad values fall back rather
    /// than error.
    pub fn normalize(raw: &RawLoadConfig) -> Self {
        // Shared concurrency aliases feed both ends of the ramp.
        let shared = parse_positive(raw.concurrent.as_ref())
            .or_else(|| parse_positive(raw.users.as_ref()))
            .or_else(|| parse_positive(raw.concurrency.as_ref()));
        let max_users = parse_positive(raw.max_users.as_ref())
            .or_else(|| parse_positive(raw.max.as_ref()))
            .or(shared)
            .unwrap_or(1)
            .max(1);
        // An explicit startUsers of zero is honored; the default is one.
        let start_users = non_negative(raw.start_users.as_ref())
            .or_else(|| non_negative(raw.start.as_ref()))
            .or(shared)
            .unwrap_or(1)
            .min(max_users);

        let iterations = parse_positive(raw.iterations.as_ref())
            .or_else(|| parse_positive(raw.amount.as_ref()))
            .or_else(|| parse_positive(raw.requests.as_ref()))
            .or_else(|| parse_positive(raw.count.as_ref()));
        let duration_ms = parse_duration_ms(raw.duration.as_ref())
            .or_else(|| parse_duration_ms(raw.runtime.as_ref()))
            .or_else(|| parse_duration_ms(raw.time.as_ref()))
            .filter(|ms| *ms > 0);

        // Exactly one stop condition survives. A wall-clock bound beats an
        // iteration budget when the caller supplied both.
        let (iterations, duration) = match (iterations, duration_ms) {
            (it, None) => (Some(it.unwrap_or(DEFAULT_ITERATIONS)), None),
            (it, Some(ms)) => {
                if it.is_some() {
                    debug!("both iterations and duration supplied; duration wins");
                }
                (None, Some(Duration::from_millis(ms)))
            }
        };

        let wait_min = parse_duration_ms(raw.wait_min.as_ref()).unwrap_or(0);
        let wait_max = parse_duration_ms(raw.wait_max.as_ref()).unwrap_or(0);
        let wait = (wait_min > 0 || wait_max > 0).then_some(WaitRange {
            min: Duration::from_millis(wait_min),
            max: Duration::from_millis(wait_max),
        });

        let adaptive = parse_flag(raw.adaptive.as_ref()).then(|| AdaptiveConfig {
            failure_rate: parse_failure_rate_threshold(raw.adaptive_failure_rate.as_ref())
                .filter(|fr| *fr > 0.0)
                .unwrap_or(DEFAULT_ADAPTIVE_FAILURE_RATE),
            window_secs: parse_seconds(raw.adaptive_window.as_ref(), DEFAULT_ADAPTIVE_WINDOW_SECS),
            stable_secs: parse_seconds(raw.adaptive_stable.as_ref(), DEFAULT_ADAPTIVE_STABLE_SECS),
            cooldown: Duration::from_secs(parse_seconds(
                raw.adaptive_cooldown.as_ref(),
                DEFAULT_ADAPTIVE_COOLDOWN_SECS,
            )),
            backoff_step_users: parse_count(
                raw.adaptive_backoff_step.as_ref(),
                DEFAULT_BACKOFF_STEP_USERS as i64,
            )
            .max(1) as u64,
        });

        Self {
            iterations,
            duration,
            start_users,
            max_users,
            spawn_rate: parse_positive(raw.spawn_rate.as_ref()),
            ramp_up: parse_duration_ms(raw.ramp_up.as_ref())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            delay: Duration::from_millis(parse_duration_ms(raw.delay.as_ref()).unwrap_or(0)),
            wait,
            requests_per_second: parse_positive(raw.requests_per_second.as_ref()),
            failure_rate_threshold: parse_failure_rate_threshold(
                raw.failure_rate_threshold.as_ref(),
            ),
            adaptive,
        }
    }

    pub fn adaptive_enabled(&self) -> bool {
        self.adaptive.is_some()
    }
}
