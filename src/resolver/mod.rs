//! Resolver interface shared by the DoH client and the local stub resolver.
//!
//! A [`Resolver`] answers two questions: whether a query name belongs to it
//! ([`Resolver::in_bailiwick`]) and, given a query, what the answer is
//! ([`Resolver::resolve`]). The proxy front end holds one mandatory DoH
//! resolver and an optional local resolver and routes between them on the
//! bailiwick check; the DoH server holds a single local resolver.

pub mod doh;
pub mod local;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::error::DnsResult;

/// Transport a query arrived on or a response was obtained over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DnsTransport {
    /// Transport not known.
    #[default]
    Undefined,
    /// DoH exchange.
    Http,
    /// Conventional DNS over UDP.
    Udp,
    /// Conventional DNS over TCP.
    Tcp,
}

impl DnsTransport {
    /// Canonical lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undefined => "",
            Self::Http => "http",
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

impl fmt::Display for DnsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata about the inbound query passed to [`Resolver::resolve`].
///
/// DNS messages, unlike more recent protocols, have almost no room for
/// per-exchange metadata, so anything the resolver should know about how
/// the query arrived travels here.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryMetaData {
    /// Transport of the original inbound query.
    pub transport: DnsTransport,
}

/// Metadata about a completed resolution, produced by every successful
/// [`Resolver::resolve`]. Mostly statistical and trace information.
#[derive(Debug, Clone)]
pub struct ResponseMetaData {
    /// Final transport used for the successful exchange.
    pub transport: DnsTransport,
    /// Time spent moving bytes, excluding the remote resolution itself.
    pub transport_duration: Duration,
    /// Time the resolving system took.
    pub resolution_duration: Duration,
    /// Packed size of the response in bytes.
    pub payload_size: usize,
    /// Number of resolution attempts made.
    pub query_tries: u32,
    /// Number of distinct servers tried.
    pub server_tries: u32,
    /// Name of the last server attempted.
    pub final_server_used: String,
}

impl Default for ResponseMetaData {
    fn default() -> Self {
        Self {
            transport: DnsTransport::Undefined,
            transport_duration: Duration::ZERO,
            resolution_duration: Duration::ZERO,
            payload_size: 0,
            query_tries: 0,
            server_tries: 0,
            final_server_used: String::new(),
        }
    }
}

/// A resolver of DNS messages.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Whether this resolver handles `qname`.
    fn in_bailiwick(&self, qname: &str) -> bool;

    /// Resolve `query`, returning the response and resolution metadata.
    async fn resolve(
        &self,
        query: &Message,
        query_meta: &QueryMetaData,
    ) -> DnsResult<(Message, ResponseMetaData)>;
}
