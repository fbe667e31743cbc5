use std::collections::VecDeque;

use stampede_core::WINDOW_RETENTION_SLACK_SECS;

/// Per-second counters for the adaptive sliding window.
#[derive(Debug, Clone, Copy)]
struct WindowBucket {
    sec: u64,
    sent: u64,
    failed: u64,
}

/// Sliding window of per-second request outcomes, keyed by whole seconds
/// since run start. Buckets arrive mostly in order; a clock reading that
/// lands behind the newest bucket is folded into it rather than creating
/// an out-of-order entry.
#[derive(Debug)]
pub(crate) struct AdaptiveWindow {
    window_secs: u64,
    buckets: VecDeque<WindowBucket>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WindowStats {
    pub sent: u64,
    pub failed: u64,
    pub failure_rate: f64,
    pub rps: f64,
}

impl AdaptiveWindow {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs: window_secs.max(1),
            buckets: VecDeque::new(),
        }
    }

    /// Records one finished request in the bucket for second `sec`.
    pub fn record(&mut self, sec: u64, failure: bool) {
        match self.buckets.back_mut() {
            Some(back) if back.sec >= sec => {
                back.sent += 1;
                if failure {
                    back.failed += 1;
                }
            }
            _ => {
                self.buckets.push_back(WindowBucket {
                    sec,
                    sent: 1,
                    failed: u64::from(failure),
                });
            }
        }

        let oldest_kept = sec.saturating_sub(self.window_secs + WINDOW_RETENTION_SLACK_SECS);
        while let Some(front) = self.buckets.front() {
            if front.sec < oldest_kept {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// Aggregates the buckets covering the last `window_secs` whole seconds
    /// ending at `now_sec`. Returns `None` when nothing was sent in range.
    pub fn stats(&self, now_sec: u64) -> Option<WindowStats> {
        let from = now_sec.saturating_sub(self.window_secs.saturating_sub(1));
        let (mut sent, mut failed) = (0u64, 0u64);
        for bucket in &self.buckets {
            if bucket.sec >= from && bucket.sec <= now_sec {
                sent += bucket.sent;
                failed += bucket.failed;
            }
        }
        if sent == 0 {
            return None;
        }
        Some(WindowStats {
            sent,
            failed,
            failure_rate: failed as f64 / sent as f64,
            rps: sent as f64 / self.window_secs as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_has_no_stats() {
        let window = AdaptiveWindow::new(10);
        assert_eq!(window.stats(5), None);
    }

    #[test]
    fn aggregates_over_the_window_only() {
        let mut window = AdaptiveWindow::new(3);
        window.record(0, false); // falls outside [2, 4]
        window.record(2, true);
        window.record(3, false);
        window.record(4, false);

        let stats = window.stats(4).unwrap();
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.failed, 1);
        assert!((stats.failure_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((stats.rps - 1.0).abs() < 1e-9);
    }

    #[test]
    fn clock_going_backwards_folds_into_newest_bucket() {
        let mut window = AdaptiveWindow::new(5);
        window.record(10, false);
        window.record(9, true);

        let stats = window.stats(10).unwrap();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn old_buckets_are_pruned() {
        let mut window = AdaptiveWindow::new(2);
        for sec in 0..100 {
            window.record(sec, false);
        }
        assert!(window.buckets.len() <= (2 + WINDOW_RETENTION_SLACK_SECS + 1) as usize);
        assert_eq!(window.stats(0), None);
    }

    #[test]
    fn multiple_records_in_one_second_share_a_bucket() {
        let mut window = AdaptiveWindow::new(4);
        for _ in 0..10 {
            window.record(7, false);
        }
        for _ in 0..5 {
            window.record(7, true);
        }
        let stats = window.stats(7).unwrap();
        assert_eq!(stats.sent, 15);
        assert_eq!(stats.failed, 5);
        assert!((stats.failure_rate - 5.0 / 15.0).abs() < 1e-9);
    }
}
