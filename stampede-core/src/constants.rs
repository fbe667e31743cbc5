use std::time::Duration;

/// Stop-condition fallback when the caller supplies neither an iteration
/// count nor a duration.
pub const DEFAULT_ITERATIONS: u64 = 10;

/// The default windowed failure rate target for adaptive runs (1%).
pub const DEFAULT_ADAPTIVE_FAILURE_RATE: f64 = 0.01;

pub const DEFAULT_ADAPTIVE_WINDOW_SECS: u64 = 15;
pub const DEFAULT_ADAPTIVE_STABLE_SECS: u64 = 20;
pub const DEFAULT_ADAPTIVE_COOLDOWN_SECS: u64 = 5;
pub const DEFAULT_BACKOFF_STEP_USERS: u64 = 2;

/// The global failure-rate abort monitor stays quiet below this many
/// completed requests.
pub const MIN_ABORT_SAMPLES: u64 = 20;

/// The adaptive controller ignores the sliding window until it holds at
/// least this many samples.
pub const MIN_WINDOW_SAMPLES: u64 = 20;

/// Window buckets older than `window + slack` seconds are pruned.
pub const WINDOW_RETENTION_SLACK_SECS: u64 = 2;

/// The concurrency ceiling never backs off below one user.
pub const MIN_TARGET_USERS: u64 = 1;

/// Non-forced progress snapshots are coalesced to this cadence.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Poll cadence of the adaptive controller loop.
pub const ADAPTIVE_TICK: Duration = Duration::from_millis(500);

/// Floor for the delay between two ramp-controller spawns.
pub const MIN_SPAWN_INTERVAL: Duration = Duration::from_millis(1);
