//! Error types shared across both daemons.
//!
//! [`DnsError`] categorizes every failure the core can produce, from
//! malformed wire data to upstream transport faults. Errors carry enough
//! context to identify the server and query involved.
//!
//! # Error categories
//!
//! - **Config errors**: invalid or mutually-exclusive settings, fatal at
//!   start-up
//! - **Network errors**: socket I/O and HTTPS transport failures
//! - **Timeout errors**: a per-request or cumulative budget was exceeded
//! - **Upstream errors**: a specific server misbehaved
//! - **Protocol errors**: HTTP status/content-type mismatches, undersized
//!   bodies, base64 or DNS decode failures
//! - **Budget errors**: resolution attempts exhausted
//!
//! # Example
//!
//! ```
//! use trustydns::error::DnsError;
//!
//! let err = DnsError::timeout("query to 8.8.8.8:53", std::time::Duration::from_secs(5));
//! assert!(err.is_recoverable());
//! assert!(err.to_string().contains("timed out"));
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Error type for all DNS and DoH operations.
///
/// # Recoverability
///
/// Errors are classified as recoverable (transient, a retry or a different
/// server may succeed) or non-recoverable (the request or configuration is
/// at fault).
#[derive(Debug, Error)]
pub enum DnsError {
    /// Invalid configuration. Fatal at start-up.
    #[error("Invalid configuration: {reason}")]
    Config {
        /// Description of the configuration error
        reason: String,
        /// The configuration field at fault, if known
        field: Option<String>,
    },

    /// Network I/O failure (socket bind/send/recv, TCP connect, HTTPS dial).
    #[error("Network error: {reason}")]
    Network {
        /// Description of the network failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// A timeout budget was exceeded.
    #[error("Query timed out after {timeout:?}: {context}")]
    Timeout {
        /// What timed out
        context: String,
        /// The budget that was exceeded
        timeout: Duration,
    },

    /// A specific upstream server failed us.
    #[error("Upstream server error ({server}): {reason}")]
    Upstream {
        /// The server URL or address
        server: String,
        /// Description of the failure
        reason: String,
    },

    /// Protocol-level fault in an otherwise-delivered exchange: bad HTTP
    /// status, content-type mismatch, undersized body, decode failure.
    #[error("Protocol error: {reason}")]
    Protocol {
        /// Description of the protocol violation
        reason: String,
    },

    /// DNS message could not be serialized.
    #[error("Failed to pack DNS message: {reason}")]
    Serialize {
        /// Description of the pack failure
        reason: String,
    },

    /// DNS message could not be parsed.
    #[error("Failed to parse DNS message: {reason}")]
    Parse {
        /// Description of the parse failure
        reason: String,
    },

    /// The per-resolve attempt or time budget ran out.
    #[error("{reason}")]
    Budget {
        /// Which budget ran out
        reason: String,
    },

    /// Unexpected internal state. Should be rare.
    #[error("Internal error: {reason}")]
    Internal {
        /// Description of the internal error
        reason: String,
    },
}

impl DnsError {
    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the field at fault.
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    /// Create a network error.
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a network error wrapping an I/O error.
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::Network {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error.
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            context: context.into(),
            timeout,
        }
    }

    /// Create an upstream server error.
    pub fn upstream(server: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Upstream {
            server: server.into(),
            reason: reason.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialize(reason: impl Into<String>) -> Self {
        Self::Serialize {
            reason: reason.into(),
        }
    }

    /// Create a parse error.
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    /// Create a budget-exhaustion error.
    pub fn budget(reason: impl Into<String>) -> Self {
        Self::Budget {
            reason: reason.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Whether a retry or a different server might succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::Upstream { .. }
        )
    }

    /// Whether this is a start-up configuration error.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Whether this is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether a specific upstream server was at fault.
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream { .. })
    }

    /// Whether an attempt or time budget ran out.
    #[must_use]
    pub fn is_budget(&self) -> bool {
        matches!(self, Self::Budget { .. })
    }

    /// The upstream server associated with this error, if any.
    #[must_use]
    pub fn upstream_addr(&self) -> Option<&str> {
        match self {
            Self::Upstream { server, .. } => Some(server),
            _ => None,
        }
    }
}

impl From<io::Error> for DnsError {
    fn from(err: io::Error) -> Self {
        Self::Network {
            reason: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<hickory_proto::error::ProtoError> for DnsError {
    fn from(err: hickory_proto::error::ProtoError) -> Self {
        Self::Parse {
            reason: err.to_string(),
        }
    }
}

/// Type alias for `Result` with [`DnsError`].
pub type DnsResult<T> = std::result::Result<T, DnsError>;

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Creation Tests
    // ========================================================================

    #[test]
    fn test_config_error() {
        let err = DnsError::config("empty server list");
        assert!(matches!(err, DnsError::Config { .. }));
        assert!(err.to_string().contains("empty server list"));
        assert!(err.is_config());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_config_error_with_field() {
        let err = DnsError::config_field("must be in range 0-32", "ecs_request_ipv4_prefix_len");
        assert!(matches!(err, DnsError::Config { field: Some(_), .. }));
    }

    #[test]
    fn test_network_error() {
        let err = DnsError::network("connection refused");
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_network_error_with_io() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = DnsError::network_io("connect failed", io_err);
        assert!(matches!(err, DnsError::Network { source: Some(_), .. }));
    }

    #[test]
    fn test_timeout_error() {
        let err = DnsError::timeout("query to 8.8.8.8", Duration::from_secs(5));
        assert!(err.is_timeout());
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("timed out"));
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn test_upstream_error() {
        let err = DnsError::upstream("https://dns.example/dns-query", "HTTP 502");
        assert!(err.is_upstream());
        assert!(err.is_recoverable());
        assert_eq!(err.upstream_addr(), Some("https://dns.example/dns-query"));
    }

    #[test]
    fn test_budget_error() {
        let err = DnsError::budget("Query attempts exceeded: 3");
        assert!(err.is_budget());
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "Query attempts exceeded: 3");
    }

    // ========================================================================
    // Conversion Tests
    // ========================================================================

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let err: DnsError = io_err.into();
        assert!(matches!(err, DnsError::Network { .. }));
        assert!(err.is_recoverable());
    }

    // ========================================================================
    // Classification Tests
    // ========================================================================

    #[test]
    fn test_recoverable_split() {
        assert!(DnsError::network("x").is_recoverable());
        assert!(DnsError::timeout("x", Duration::from_secs(1)).is_recoverable());
        assert!(DnsError::upstream("s", "x").is_recoverable());

        assert!(!DnsError::config("x").is_recoverable());
        assert!(!DnsError::protocol("x").is_recoverable());
        assert!(!DnsError::serialize("x").is_recoverable());
        assert!(!DnsError::parse("x").is_recoverable());
        assert!(!DnsError::budget("x").is_recoverable());
        assert!(!DnsError::internal("x").is_recoverable());
    }

    #[test]
    fn test_upstream_addr_extraction() {
        assert_eq!(
            DnsError::upstream("1.1.1.1:53", "err").upstream_addr(),
            Some("1.1.1.1:53")
        );
        assert_eq!(DnsError::parse("err").upstream_addr(), None);
    }
}
