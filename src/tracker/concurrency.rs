//! Peak-concurrency counter.
//!
//! Tracks how many requests are in flight so the reporter can show the
//! peak concurrency over a reporting period.
//!
//! # Example
//!
//! ```
//! use trustydns::tracker::ConcurrencyCounter;
//!
//! let counter = ConcurrencyCounter::default();
//! counter.add();
//! // ... do some work ...
//! counter.done();
//! assert_eq!(counter.peak(true), 1);
//! ```

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Counts {
    current: u64, // count of pending done() calls
    peak: u64,    // max current has ever reached
}

/// Tracks current and peak concurrent request counts.
#[derive(Debug, Default)]
pub struct ConcurrencyCounter {
    counts: Mutex<Counts>,
}

impl ConcurrencyCounter {
    /// Increment the in-flight count. Returns true if this set a new peak.
    pub fn add(&self) -> bool {
        let mut counts = self.counts.lock();
        counts.current += 1;
        if counts.current > counts.peak {
            counts.peak = counts.current;
            return true;
        }
        false
    }

    /// Decrement the in-flight count.
    ///
    /// # Panics
    ///
    /// Panics when called without a matching [`ConcurrencyCounter::add`];
    /// that is a contract violation by the caller, not an input error.
    pub fn done(&self) {
        let mut counts = self.counts.lock();
        assert!(counts.current > 0, "ConcurrencyCounter::done() lacks matching add()");
        counts.current -= 1;
    }

    /// The peak concurrency seen. With `reset`, the peak is set back to
    /// the *current* concurrency (not zero) after the return value is
    /// taken, so the effect is only visible on a subsequent call.
    pub fn peak(&self, reset: bool) -> u64 {
        let mut counts = self.counts.lock();
        let peak = counts.peak;
        if reset {
            counts.peak = counts.current;
        }
        peak
    }
}
