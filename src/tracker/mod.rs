//! Request and connection bookkeeping for reporting purposes.

pub mod concurrency;
pub mod connection;

pub use concurrency::ConcurrencyCounter;
pub use connection::{ConnState, ConnectionTracker};
