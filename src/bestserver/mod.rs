//! Best-server selection for upstream pools.
//!
//! This module tracks which server in a fixed set is currently the "best"
//! one to send the next query to. Two policies are provided:
//!
//! - [`latency::LatencyServers`]: pick the fastest, most reliable server
//!   using a weighted moving average, with opportunistic sampling of
//!   non-best servers and rehabilitation of failed ones
//! - [`traditional::TraditionalServers`]: pick until it fails, then move to
//!   the next in line, just as `res_send()` does
//!
//! Callers drive the selection loop with two calls: [`BestServer::best`]
//! to obtain the server for the next query, and [`BestServer::result`] to
//! report how that query went. The value handed back to `result` must be
//! exactly the value `best` returned; fabricated names are rejected.
//!
//! # Ordering guarantee
//!
//! Two calls to `best()` with no intervening `result()` return the same
//! server. Concurrent callers may interleave, in which case the sampling
//! behavior of the latency policy is approximate (see `latency`).

pub mod latency;
pub mod traditional;

pub use latency::{LatencyConfig, LatencyServers};
pub use traditional::TraditionalServers;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{DnsError, DnsResult};

/// Selection interface shared by all best-server policies.
pub trait BestServer: Send + Sync {
    /// Short name of the selection policy ("latency" or "traditional").
    fn algorithm(&self) -> &'static str;

    /// The current best server and its index in the set.
    ///
    /// Deterministic until the next `result()` call for that server.
    fn best(&self) -> (String, usize);

    /// Report the outcome of a query against `server`.
    ///
    /// `server` must be a value previously returned by [`BestServer::best`];
    /// an unknown name returns `false` and changes nothing. `latency` is
    /// only meaningful when `success` is true, as a failure may have been a
    /// timeout.
    fn result(&self, server: &str, success: bool, now: Instant, latency: Duration) -> bool;

    /// All server names, in construction order.
    fn servers(&self) -> Vec<String>;

    /// Number of servers in the set.
    fn len(&self) -> usize;

    /// Whether the set is empty. Construction rejects empty sets, so this
    /// is always false for a built set.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed-order, insertion-unique server list with a name-to-index map.
///
/// Shared plumbing for the policy implementations. The name is the server
/// identity; duplicates are rejected at construction.
#[derive(Debug)]
pub(crate) struct ServerSet {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl ServerSet {
    pub(crate) fn new(names: Vec<String>) -> DnsResult<Self> {
        if names.is_empty() {
            return Err(DnsError::config("no servers in list"));
        }

        let mut index = HashMap::with_capacity(names.len());
        for (ix, name) in names.iter().enumerate() {
            if index.insert(name.clone(), ix).is_some() {
                return Err(DnsError::config(format!("duplicate server in list: {name}")));
            }
        }

        Ok(Self { names, index })
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub(crate) fn name(&self, ix: usize) -> &str {
        &self.names[ix]
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.names.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.names.len()
    }
}
