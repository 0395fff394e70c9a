//! trustydns: a DNS over HTTPS proxy and server (RFC 8484).
//!
//! Two cooperating daemons are built from this crate:
//!
//! - `trustydns-proxy` accepts conventional DNS queries over UDP and TCP
//!   and forwards them as DoH requests to upstream HTTPS resolvers
//! - `trustydns-server` accepts DoH requests and resolves them through a
//!   conventional recursive resolver reached via resolv.conf
//!
//! Deploy both and encrypted transport is interposed between DNS clients
//! and the recursive resolvers you trust, with fine-grained control over
//! EDNS0 Client Subnet disclosure, RFC 8467 padding, split-horizon
//! routing and upstream server selection.
//!
//! # Architecture
//!
//! ```text
//! DNS client → proxy → (bailiwick check) ─┬→ local stub resolver
//!                                         └→ DoH client → HTTPS →
//!                                               DoH server → local stub
//!                                                 resolver → recursive
//! ```
//!
//! # Features
//!
//! - **Best-server selection**: latency-weighted upstream choice with
//!   opportunistic sampling and failure rehabilitation
//! - **ECS control**: remove, set, request-synthesis and redaction of
//!   EDNS0 Client Subnet on both sides
//! - **RFC 8467 padding**: query padding to 128, response padding to 468
//! - **Truncation fidelity**: UDP responses trimmed to the client's EDNS0
//!   limit without ever clearing an upstream TC bit
//! - **Split horizon**: locally-scoped names answered by a stub resolver
//!   over the resolv.conf name servers

pub mod bestserver;
pub mod constants;
pub mod dnsutil;
pub mod error;
pub mod proxy;
pub mod report;
pub mod resolver;
pub mod server;
pub mod signals;
pub mod tlsutil;
pub mod tracker;

pub use constants::VERSION;
pub use error::{DnsError, DnsResult};
