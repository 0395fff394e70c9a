//! Latency-weighted best-server policy.
//!
//! Tracks a weighted moving average of per-server latency and keeps the
//! fastest non-failing server as the current best. The best is reassessed
//! when it reports a failure, after [`LatencyConfig::reassess_count`]
//! outcome reports, or after [`LatencyConfig::reassess_after`] of wall
//! time. Roughly one in [`LatencyConfig::sample_others_every`] reports
//! temporarily promotes a non-failing, non-best server so latency data is
//! gathered for the whole set over time.
//!
//! A failed server is excluded from selection until it has been idle for
//! [`LatencyConfig::reset_failed_after`], at which point its statistics are
//! zeroed and it becomes a candidate again. If every server is failing,
//! selection simply rotates to the next one in line.
//!
//! The sampling process is approximate: whether a promoted sample server is
//! actually handed out depends on the interleaving of `best()` and
//! `result()` calls across concurrent requests. Over time the intended
//! sample rate is achieved even if individual windows over- or
//! under-sample.

use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::{BestServer, ServerSet};
use crate::error::{DnsError, DnsResult};

/// Tuning parameters for the latency policy.
///
/// A zero value for any field selects the default for that field, so a
/// `LatencyConfig::default()` with one or two overrides is the common way
/// to construct one.
#[derive(Debug, Clone, Copy)]
pub struct LatencyConfig {
    /// Reassess the best server after this much wall time.
    pub reassess_after: Duration,
    /// Reassess the best server after this many `result()` calls.
    pub reassess_count: u32,
    /// Zero a failed server's statistics once it has been idle this long.
    pub reset_failed_after: Duration,
    /// Promote a non-best server roughly once every this many `result()`
    /// calls so its latency stays current.
    pub sample_others_every: u32,
    /// Percent weight of the latest latency in the moving average (0-100).
    pub weight_for_latest: u32,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            reassess_after: Duration::from_secs(61),
            reassess_count: 1061,
            reset_failed_after: Duration::from_secs(3 * 60),
            sample_others_every: 20, // 1 in 20 = 5%
            weight_for_latest: 67,
        }
    }
}

impl LatencyConfig {
    /// Validate ranges and replace zero fields with defaults.
    fn normalize(mut self) -> DnsResult<Self> {
        if self.weight_for_latest > 100 {
            return Err(DnsError::config_field(
                format!("weight_for_latest is not in range 0-100: {}", self.weight_for_latest),
                "weight_for_latest",
            ));
        }

        let defaults = Self::default();
        if self.reassess_after == Duration::ZERO {
            self.reassess_after = defaults.reassess_after;
        }
        if self.reassess_count == 0 {
            self.reassess_count = defaults.reassess_count;
        }
        if self.reset_failed_after == Duration::ZERO {
            self.reset_failed_after = defaults.reset_failed_after;
        }
        if self.sample_others_every == 0 {
            self.sample_others_every = defaults.sample_others_every;
        }
        if self.weight_for_latest == 0 {
            self.weight_for_latest = defaults.weight_for_latest;
        }

        Ok(self)
    }
}

/// Why the most recent reassessment chose the server it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReassessRationale {
    /// No reassessment has happened yet.
    #[default]
    None,
    /// Only one server in the set, not many choices.
    OnlyOne,
    /// First non-failing server found, no latency data to compare.
    FirstCab,
    /// A server with known latency displaced a first-cab with none.
    SecondCab,
    /// Lowest weighted average latency won.
    Fastest,
    /// Every server is failing, rotated to the next in line.
    AllBad,
}

#[derive(Debug, Clone, Copy, Default)]
struct ServerStats {
    last_status_time: Option<Instant>,
    last_status_was_failure: bool,
    weighted_average: Duration,
}

#[derive(Debug, Default)]
struct Inner {
    stats: Vec<ServerStats>,
    best_index: usize,
    save_best_index: usize, // source of truth while a sample server is promoted
    assess_count: u32,
    sample_count: u32,
    sample_index: usize,
    best_expires: Option<Instant>,
    rationale: ReassessRationale,
}

/// Best-server set using the latency policy.
#[derive(Debug)]
pub struct LatencyServers {
    config: LatencyConfig,
    set: ServerSet,
    inner: RwLock<Inner>,
}

impl LatencyServers {
    /// Construct a latency-policy set over `servers`.
    ///
    /// # Errors
    ///
    /// Returns a config error if the list is empty, contains duplicates, or
    /// `config.weight_for_latest` is out of range.
    pub fn new(config: LatencyConfig, servers: Vec<String>) -> DnsResult<Self> {
        let set = ServerSet::new(servers)?;
        let config = config.normalize()?;
        let inner = Inner {
            stats: vec![ServerStats::default(); set.len()],
            ..Inner::default()
        };

        Ok(Self {
            config,
            set,
            inner: RwLock::new(inner),
        })
    }

    /// Why the best server is currently the best. For reporting.
    pub fn rationale(&self) -> ReassessRationale {
        self.inner.read().rationale
    }

    /// The weighted average latency recorded for `server`, if any.
    pub fn average_latency(&self, server: &str) -> Option<Duration> {
        let ix = self.set.index_of(server)?;
        let avg = self.inner.read().stats[ix].weighted_average;
        (avg > Duration::ZERO).then_some(avg)
    }

    /// Check the latest report and, if it concerns the best server and a
    /// reassessment trigger fired, search for a new best. Also advance the
    /// sampling machinery.
    ///
    /// A reassessment is only performed when the report is about the best
    /// server; a report about a non-best server means the caller is simply
    /// out of date.
    fn assess(&self, inner: &mut Inner, now: Instant, ix: usize, success: bool) {
        inner.assess_count += 1;
        if ix == inner.best_index {
            let expired = inner.best_expires.is_none_or(|exp| now > exp);
            if !success || inner.assess_count >= self.config.reassess_count || expired {
                self.reassess_best(inner, now);
                inner.save_best_index = inner.best_index;
                inner.assess_count = 0;
            }
        }

        // Time to sample one of the other servers?

        inner.sample_count += 1;
        if inner.sample_count < self.config.sample_others_every {
            inner.best_index = inner.save_best_index; // not sampling, revert to real best
            return;
        }

        inner.sample_index = (inner.sample_index + 1) % self.set.len(); // next in sequence but
        if !inner.stats[inner.sample_index].last_status_was_failure {   // only if not failing
            inner.best_index = inner.sample_index;
            inner.sample_count = 0; // only reset if the sample server is good, otherwise try next call
        }
    }

    /// Search for the server with the lowest weighted average latency.
    /// Also rehabilitate servers that have been sidelined long enough.
    fn reassess_best(&self, inner: &mut Inner, now: Instant) {
        inner.rationale = ReassessRationale::None;
        if self.set.len() == 1 {
            inner.rationale = ReassessRationale::OnlyOne;
            return;
        }

        let mut new_best: Option<usize> = None;
        for ix in 0..self.set.len() {
            let stats = inner.stats[ix];
            if stats.last_status_was_failure {
                // Time to rehabilitate?
                if stats.last_status_time.is_some_and(|t| t + self.config.reset_failed_after < now) {
                    inner.stats[ix] = ServerStats::default();
                }
                continue;
            }
            match new_best {
                // First good alternative, take it as a tentative best.
                None => {
                    inner.rationale = ReassessRationale::FirstCab;
                    new_best = Some(ix);
                }
                Some(best) => {
                    if stats.weighted_average == Duration::ZERO {
                        // Ignore servers with unknown latency
                    } else if inner.stats[best].weighted_average == Duration::ZERO {
                        // Replace the first cab with a known quantity.
                        inner.rationale = ReassessRationale::SecondCab;
                        new_best = Some(ix);
                    } else if stats.weighted_average < inner.stats[best].weighted_average {
                        inner.rationale = ReassessRationale::Fastest;
                        new_best = Some(ix);
                    }
                }
            }
        }

        inner.best_index = match new_best {
            Some(best) => best,
            None => {
                // No good servers found, simply move on to the next one.
                inner.rationale = ReassessRationale::AllBad;
                (inner.best_index + 1) % self.set.len()
            }
        };
        inner.best_expires = Some(now + self.config.reassess_after);
    }
}

impl BestServer for LatencyServers {
    fn algorithm(&self) -> &'static str {
        "latency"
    }

    fn best(&self) -> (String, usize) {
        let inner = self.inner.read();
        (self.set.name(inner.best_index).to_string(), inner.best_index)
    }

    fn result(&self, server: &str, success: bool, now: Instant, latency: Duration) -> bool {
        let Some(ix) = self.set.index_of(server) else {
            return false;
        };

        let mut inner = self.inner.write();
        let stats = &mut inner.stats[ix];
        stats.last_status_was_failure = !success;
        stats.last_status_time = Some(now);
        if success {
            // Latency is only meaningful on success, a failure could have
            // been a timeout.
            if stats.weighted_average == Duration::ZERO {
                stats.weighted_average = latency;
            } else {
                let w = self.config.weight_for_latest;
                let current = latency * w;
                let historic = stats.weighted_average * (100 - w);
                stats.weighted_average = (current + historic) / 100;
            }
        }

        self.assess(&mut inner, now, ix, success);

        true
    }

    fn servers(&self) -> Vec<String> {
        self.set.names()
    }

    fn len(&self) -> usize {
        self.set.len()
    }
}
