//! Configuration for the DoH server daemon.

use std::time::Duration;

use crate::error::{DnsError, DnsResult};
use crate::resolver::local::LocalConfig;

/// Default IPv4 prefix length for ECS synthesized from the HTTPS peer.
pub const DEFAULT_ECS_SET_IPV4_PREFIX_LEN: u8 = 24;

/// Default IPv6 prefix length for ECS synthesized from the HTTPS peer.
pub const DEFAULT_ECS_SET_IPV6_PREFIX_LEN: u8 = 64;

/// Configuration for the DoH server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Addresses to listen on, `ip:port` form.
    pub listen_addresses: Vec<String>,

    /// Local recursive resolver reached via resolv.conf.
    pub local: LocalConfig,

    /// Strip any ECS arriving in queries.
    pub ecs_remove: bool,

    /// Unconditionally synthesize ECS from the HTTPS peer address using
    /// the prefix lengths below. An `X-trustydns-Synth` request header
    /// overrides the lengths.
    pub ecs_set: bool,

    /// IPv4 prefix length for synthesized ECS.
    pub ecs_set_ipv4_prefix_len: u8,

    /// IPv6 prefix length for synthesized ECS.
    pub ecs_set_ipv6_prefix_len: u8,

    /// PEM certificate chain for HTTPS. Plain HTTP when absent.
    pub tls_cert_file: Option<String>,

    /// PEM private key matching `tls_cert_file`.
    pub tls_key_file: Option<String>,

    /// Interval between statistics reports. Zero disables reporting.
    pub report_interval: Duration,

    /// Log each inbound client query.
    pub log_client_in: bool,

    /// Log each outbound client response.
    pub log_client_out: bool,

    /// Echo TLS handshake failures from clients to the log.
    pub log_tls_errors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addresses: Vec::new(),
            local: LocalConfig::default(),
            ecs_remove: false,
            ecs_set: false,
            ecs_set_ipv4_prefix_len: DEFAULT_ECS_SET_IPV4_PREFIX_LEN,
            ecs_set_ipv6_prefix_len: DEFAULT_ECS_SET_IPV6_PREFIX_LEN,
            tls_cert_file: None,
            tls_key_file: None,
            report_interval: Duration::ZERO,
            log_client_in: false,
            log_client_out: false,
            log_tls_errors: false,
        }
    }
}

impl ServerConfig {
    /// Check listener plumbing and option ranges.
    pub fn validate(&self) -> DnsResult<()> {
        if self.listen_addresses.is_empty() {
            return Err(DnsError::config("no listen addresses configured"));
        }
        if self.tls_cert_file.is_some() != self.tls_key_file.is_some() {
            return Err(DnsError::config(
                "TLS certificate and key files must be supplied together",
            ));
        }
        if self.ecs_set_ipv4_prefix_len > 32 {
            return Err(DnsError::config_field(
                format!(
                    "IPv4 prefix length of {} is not in range 0-32",
                    self.ecs_set_ipv4_prefix_len
                ),
                "ecs_set_ipv4_prefix_len",
            ));
        }
        if self.ecs_set_ipv6_prefix_len > 128 {
            return Err(DnsError::config_field(
                format!(
                    "IPv6 prefix length of {} is not in range 0-128",
                    self.ecs_set_ipv6_prefix_len
                ),
                "ecs_set_ipv6_prefix_len",
            ));
        }
        Ok(())
    }
}
