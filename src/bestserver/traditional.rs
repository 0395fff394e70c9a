//! Traditional best-server policy.
//!
//! Linear fail-over just as `res_send()` does: keep using the current
//! server until it fails, then move to the next one in line, wrapping at
//! the end of the list. Successes never move the selection and latency is
//! ignored.

use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::{BestServer, ServerSet};
use crate::error::DnsResult;

/// Best-server set using the traditional fail-over policy.
#[derive(Debug)]
pub struct TraditionalServers {
    set: ServerSet,
    best_index: RwLock<usize>,
}

impl TraditionalServers {
    /// Construct a traditional-policy set over `servers`.
    ///
    /// # Errors
    ///
    /// Returns a config error if the list is empty or contains duplicates.
    pub fn new(servers: Vec<String>) -> DnsResult<Self> {
        Ok(Self {
            set: ServerSet::new(servers)?,
            best_index: RwLock::new(0),
        })
    }
}

impl BestServer for TraditionalServers {
    fn algorithm(&self) -> &'static str {
        "traditional"
    }

    fn best(&self) -> (String, usize) {
        let ix = *self.best_index.read();
        (self.set.name(ix).to_string(), ix)
    }

    fn result(&self, server: &str, success: bool, _now: Instant, _latency: Duration) -> bool {
        let Some(ix) = self.set.index_of(server) else {
            return false;
        };

        if success {
            return true;
        }

        let mut best = self.best_index.write();
        if ix == *best {
            // If best failed, move to the next server.
            *best = (*best + 1) % self.set.len();
        }

        true
    }

    fn servers(&self) -> Vec<String> {
        self.set.names()
    }

    fn len(&self) -> usize {
        self.set.len()
    }
}
