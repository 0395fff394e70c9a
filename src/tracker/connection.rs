//! Per-connection and per-session tracking.
//!
//! Tracks connections for statistical purposes, ostensibly inbound HTTPS
//! connections but generic enough for any keyed connection. The goal is
//! occupancy and concurrency per listen address, plus session concurrency
//! within connections that multiplex (HTTP/2).
//!
//! The key can be any string so long as it uniquely and consistently
//! identifies one connection; a remote `address:port` is the usual choice.
//! Drive it with [`ConnectionTracker::conn_state`] as the connection moves
//! through its lifecycle, and [`ConnectionTracker::session_add`] /
//! [`ConnectionTracker::session_done`] around each request on the
//! connection.
//!
//! State checks are deliberately lenient: this is a statistics gatherer,
//! not a protocol validator. When a transition does not make sense the
//! mismatch is counted in an error bucket, the internal state is
//! reconciled in favour of the newest information, and tracking carries
//! on.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::report::Reporter;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Connection accepted.
    New,
    /// A request is being serviced on the connection.
    Active,
    /// The connection is open but idle between requests.
    Idle,
    /// The connection was taken over by another subsystem.
    Hijacked,
    /// The connection closed.
    Closed,
}

#[derive(Debug, Default, Clone, Copy)]
struct Connection {
    conn_start: Option<Instant>,
    active_start: Option<Instant>,
    active_for: Duration,
    current_sessions: u64,
    peak_sessions: u64,
}

/// Error buckets for nonsensical transitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackerErrors {
    /// State change for a connection that was never tracked.
    pub no_conn_in_map: u64,
    /// Session add/done for a connection that was never tracked.
    pub no_conn_for_session: u64,
    /// New connection over the top of an existing one.
    pub dangling_conn: u64,
    /// More session-done than session-add calls.
    pub negative_concurrency: u64,
    /// Connection closed while sessions were still active.
    pub conns_lost: u64,
    /// A state this tracker does not know about.
    pub unknown_state: u64,
}

impl TrackerErrors {
    fn total(&self) -> u64 {
        self.no_conn_in_map
            + self.no_conn_for_session
            + self.dangling_conn
            + self.negative_concurrency
            + self.conns_lost
            + self.unknown_state
    }
}

#[derive(Debug, Default)]
struct Inner {
    conns: HashMap<String, Connection>,
    peak_conns: usize,
    peak_sessions: u64,
    conn_for: Duration,   // total connection lifetimes, can exceed elapsed
    active_for: Duration, // total connection active time
    errors: TrackerErrors,
}

/// Tracks connections and sessions for one listener.
#[derive(Debug)]
pub struct ConnectionTracker {
    name: String,
    inner: Mutex<Inner>,
}

impl ConnectionTracker {
    /// Construct a tracker named for its listener.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record a connection state transition at `now`.
    ///
    /// Returns true when the transition made sense for the tracked
    /// connection; false transitions are reconciled and counted.
    pub fn conn_state(&self, key: &str, now: Instant, state: ConnState) -> bool {
        let mut inner = self.inner.lock();

        if state == ConnState::New {
            // Always insert fresh, overwriting any dangling connection.
            let dangling = inner
                .conns
                .insert(
                    key.to_string(),
                    Connection {
                        conn_start: Some(now),
                        ..Connection::default()
                    },
                )
                .is_some();
            if dangling {
                inner.errors.dangling_conn += 1;
            }
            let count = inner.conns.len();
            if count > inner.peak_conns {
                inner.peak_conns = count;
            }
            return !dangling;
        }

        let Some(mut conn) = inner.conns.get(key).copied() else {
            inner.errors.no_conn_in_map += 1;
            return false;
        };

        match state {
            ConnState::New => unreachable!("handled above"),
            ConnState::Active => {
                conn.active_start = Some(now);
                inner.conns.insert(key.to_string(), conn);
                true
            }
            ConnState::Idle => {
                if let Some(active_start) = conn.active_start.take() {
                    conn.active_for += now.duration_since(active_start);
                }
                inner.conns.insert(key.to_string(), conn);
                true
            }
            ConnState::Hijacked | ConnState::Closed => {
                if let Some(start) = conn.conn_start {
                    inner.conn_for += now.duration_since(start);
                }
                if let Some(active_start) = conn.active_start {
                    conn.active_for += now.duration_since(active_start);
                }
                inner.active_for += conn.active_for;

                inner.conns.remove(key);
                if conn.current_sessions > 0 {
                    inner.errors.conns_lost += 1;
                    return false;
                }
                if conn.peak_sessions > inner.peak_sessions {
                    inner.peak_sessions = conn.peak_sessions;
                }
                true
            }
        }
    }

    /// Increment the session count within a connection. Returns false if
    /// the connection is unknown.
    pub fn session_add(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(conn) = inner.conns.get_mut(key) else {
            inner.errors.no_conn_for_session += 1;
            return false;
        };

        conn.current_sessions += 1;
        if conn.current_sessions > conn.peak_sessions {
            conn.peak_sessions = conn.current_sessions;
        }
        true
    }

    /// Undo a [`ConnectionTracker::session_add`].
    pub fn session_done(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(conn) = inner.conns.get_mut(key) else {
            inner.errors.no_conn_for_session += 1;
            return false;
        };

        if conn.current_sessions == 0 {
            inner.errors.negative_concurrency += 1;
            return false;
        }
        conn.current_sessions -= 1;
        true
    }

    /// Number of currently tracked connections.
    pub fn current_conns(&self) -> usize {
        self.inner.lock().conns.len()
    }

    /// A copy of the error buckets.
    pub fn errors(&self) -> TrackerErrors {
        self.inner.lock().errors
    }
}

impl Reporter for ConnectionTracker {
    fn name(&self) -> String {
        format!("connections ({})", self.name)
    }

    fn report(&self, reset: bool) -> String {
        let mut inner = self.inner.lock();
        let line = format!(
            "open={} peak={} peak-sessions={} conn-time={:?} active-time={:?} errors={}",
            inner.conns.len(),
            inner.peak_conns,
            inner.peak_sessions,
            inner.conn_for,
            inner.active_for,
            inner.errors.total(),
        );
        if reset {
            inner.peak_conns = inner.conns.len();
            inner.peak_sessions = 0;
            inner.conn_for = Duration::ZERO;
            inner.active_for = Duration::ZERO;
            inner.errors = TrackerErrors::default();
        }
        line
    }
}
