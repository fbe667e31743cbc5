use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A fully-hydrated request the executor performs verbatim. Placeholder
/// resolution happens before the engine ever sees this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
}

impl RequestTemplate {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }
}

/// What the request executor hands back for one completed call.
///
/// `status == 0` is the synthetic code for transport-level errors. `timing`
/// is the executor's own measurement; when absent the engine falls back to
/// the elapsed time around the call.
#[derive(Debug, Clone, Default)]
pub struct ExecutedRequest {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timing: Option<Duration>,
}

impl ExecutedRequest {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

/// Phase of the adaptive capacity-discovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptivePhase {
    #[default]
    Disabled,
    Ramping,
    BackingOff,
    Stable,
    Exhausted,
}

/// Bookkeeping the adaptive controller leaves behind for the final report.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveSummary {
    pub enabled: bool,
    pub phase: AdaptivePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stabilized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_users: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stable_users: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_first_failure_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_steps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_window_failure_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stable_window_failure_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_window_rps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stable_window_rps: Option<f64>,
}

/// Point-in-time view of a run, pushed to the progress sink.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub request_id: String,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planned_duration_ms: Option<u64>,
    pub active_users: u64,
    pub max_users: u64,
    pub total_sent: u64,
    pub successful: u64,
    pub failed: u64,
    pub done: bool,
    pub cancelled: bool,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

/// The raw outcome of a finished run, snapshotted from the shared state
/// right before metrics are derived.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub failure_status_counts: BTreeMap<String, u64>,
    #[serde(rename = "responseTimes")]
    pub response_times_ms: Vec<f64>,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub cancelled: bool,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planned_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<AdaptiveSummary>,
}
