//! Periodic statistics rollup.
//!
//! Components that accumulate counters implement [`Reporter`]; each daemon
//! collects its reporters and runs [`run_reporting_loop`] to emit a rollup
//! through `tracing` at the configured interval. Counters reset on read so
//! each report covers exactly one interval.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

/// A source of periodic statistics.
pub trait Reporter: Send + Sync {
    /// Short human name for the report heading.
    fn name(&self) -> String;

    /// Render accumulated statistics. When `reset` is true the counters
    /// are zeroed after rendering so the next report covers a fresh
    /// interval.
    fn report(&self, reset: bool) -> String;
}

/// Emit every reporter's rollup at `interval` until the task is aborted.
///
/// An interval of zero disables reporting and returns immediately.
pub async fn run_reporting_loop(interval: Duration, reporters: Vec<Arc<dyn Reporter>>) {
    if interval.is_zero() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // First tick completes immediately, skip it.

    loop {
        ticker.tick().await;
        for reporter in &reporters {
            let body = reporter.report(true);
            if !body.is_empty() {
                info!(report = %reporter.name(), "\n{body}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingReporter {
        count: AtomicU64,
    }

    impl Reporter for CountingReporter {
        fn name(&self) -> String {
            "counting".to_string()
        }

        fn report(&self, reset: bool) -> String {
            let n = self.count.load(Ordering::Relaxed);
            if reset {
                self.count.store(0, Ordering::Relaxed);
            }
            format!("count={n}")
        }
    }

    #[test]
    fn test_reset_on_read() {
        let r = CountingReporter {
            count: AtomicU64::new(3),
        };
        assert_eq!(r.report(true), "count=3");
        assert_eq!(r.report(false), "count=0");
    }

    #[tokio::test]
    async fn test_zero_interval_returns() {
        // Must not hang.
        run_reporting_loop(Duration::ZERO, vec![]).await;
    }
}
