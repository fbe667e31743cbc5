//! Final summary statistics, derived once from a finished run.

use crate::data::{AdaptiveSummary, RunRecord};
use serde::Serialize;
use std::collections::BTreeMap;

/// JSON-serializable summary of a load-test run.
///
/// All rates default to zero on an empty run; nothing here is ever `NaN`.
/// `error_rate` is a fraction in `[0, 1]`, response times are milliseconds
/// and `duration` is seconds.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub failure_status_counts: BTreeMap<String, u64>,
    pub requests_per_second: f64,
    pub average_response_time: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
    pub error_rate: f64,
    pub duration: f64,
    pub cancelled: bool,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planned_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<AdaptiveSummary>,
}

/// Nearest-rank percentile: the element at `floor(len * p)` of the sorted
/// samples, clamped to the last index. No interpolation.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * p).floor() as usize).min(sorted.len() - 1);
    sorted[idx]
}

pub fn calculate_metrics(record: &RunRecord) -> LoadTestMetrics {
    let mut sorted = record.response_times_ms.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let duration = (record.end_time_ms - record.start_time_ms).max(0) as f64 / 1_000.0;
    let requests_per_second = if duration > 0.0 {
        record.total_requests as f64 / duration
    } else {
        0.0
    };
    let error_rate = if record.total_requests > 0 {
        record.failed_requests as f64 / record.total_requests as f64
    } else {
        0.0
    };
    let average_response_time = if sorted.is_empty() {
        0.0
    } else {
        statistical::mean(&sorted)
    };

    LoadTestMetrics {
        total_requests: record.total_requests,
        successful_requests: record.successful_requests,
        failed_requests: record.failed_requests,
        failure_status_counts: record.failure_status_counts.clone(),
        requests_per_second,
        average_response_time,
        p50: percentile(&sorted, 0.5),
        p95: percentile(&sorted, 0.95),
        p99: percentile(&sorted, 0.99),
        min_response_time: sorted.first().copied().unwrap_or(0.0),
        max_response_time: sorted.last().copied().unwrap_or(0.0),
        error_rate,
        duration,
        cancelled: record.cancelled,
        aborted: record.aborted,
        abort_reason: record.abort_reason.clone(),
        planned_duration: record.planned_duration_ms.map(|ms| ms as f64 / 1_000.0),
        adaptive: record.adaptive.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_times(times: &[f64]) -> RunRecord {
        RunRecord {
            total_requests: times.len() as u64,
            successful_requests: times.len() as u64,
            response_times_ms: times.to_vec(),
            start_time_ms: 0,
            end_time_ms: 2_000,
            ..RunRecord::default()
        }
    }

    #[test]
    fn nearest_rank_percentiles() {
        let metrics = calculate_metrics(&record_with_times(&[50.0, 100.0, 200.0, 300.0, 400.0]));
        assert_eq!(metrics.p50, 200.0);
        assert_eq!(metrics.p95, 400.0);
        assert_eq!(metrics.p99, 400.0);
        assert_eq!(metrics.min_response_time, 50.0);
        assert_eq!(metrics.max_response_time, 400.0);
        assert_eq!(metrics.average_response_time, 210.0);
    }

    #[test]
    fn unsorted_input_is_sorted_first() {
        let metrics = calculate_metrics(&record_with_times(&[400.0, 50.0, 300.0, 100.0, 200.0]));
        assert_eq!(metrics.p50, 200.0);
        assert_eq!(metrics.min_response_time, 50.0);
    }

    #[test]
    fn empty_run_is_all_zeroes_never_nan() {
        let metrics = calculate_metrics(&RunRecord::default());
        assert_eq!(metrics.requests_per_second, 0.0);
        assert_eq!(metrics.average_response_time, 0.0);
        assert_eq!(metrics.error_rate, 0.0);
        assert_eq!(metrics.p50, 0.0);
        assert_eq!(metrics.p99, 0.0);
        assert_eq!(metrics.min_response_time, 0.0);
        assert_eq!(metrics.max_response_time, 0.0);
    }

    #[test]
    fn rates_and_duration() {
        let mut record = record_with_times(&[10.0, 20.0, 30.0, 40.0]);
        record.successful_requests = 3;
        record.failed_requests = 1;
        let metrics = calculate_metrics(&record);
        assert_eq!(metrics.duration, 2.0);
        assert_eq!(metrics.requests_per_second, 2.0);
        assert_eq!(metrics.error_rate, 0.25);
    }

    #[test]
    fn serializes_to_camel_case_json() {
        let metrics = calculate_metrics(&record_with_times(&[1.0]));
        let json = serde_json::to_value(&metrics).unwrap();
        assert!(json.get("totalRequests").is_some());
        assert!(json.get("requestsPerSecond").is_some());
        assert!(json.get("abortReason").is_none());
    }
}
