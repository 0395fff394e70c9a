//! Configuration for the proxy daemon.

use std::time::Duration;

use crate::error::{DnsError, DnsResult};
use crate::resolver::doh::DohConfig;
use crate::resolver::local::LocalConfig;
use crate::tlsutil::ClientTlsOptions;

/// Default interval between status reports. Zero disables them.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(0);

/// Configuration for the DNS front end.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Addresses to listen on, `ip:port` form.
    pub listen_addresses: Vec<String>,

    /// Accept queries over UDP.
    pub udp: bool,

    /// Accept queries over TCP.
    pub tcp: bool,

    /// Upstream DoH resolver settings.
    pub doh: DohConfig,

    /// Split-horizon stub resolver; in-bailiwick names are resolved here
    /// instead of over DoH.
    pub local: Option<LocalConfig>,

    /// TLS trust and credentials for the upstream HTTPS exchanges.
    pub tls: ClientTlsOptions,

    /// Interval between statistics reports. Zero disables reporting.
    pub report_interval: Duration,

    /// Log each inbound client query.
    pub log_client_in: bool,

    /// Log each outbound client response.
    pub log_client_out: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addresses: Vec::new(),
            udp: true,
            tcp: true,
            doh: DohConfig::default(),
            local: None,
            tls: ClientTlsOptions::default(),
            report_interval: DEFAULT_REPORT_INTERVAL,
            log_client_in: false,
            log_client_out: false,
        }
    }
}

impl ProxyConfig {
    /// Check listener plumbing; resolver configs validate themselves at
    /// resolver construction.
    pub fn validate(&self) -> DnsResult<()> {
        if self.listen_addresses.is_empty() {
            return Err(DnsError::config("no listen addresses configured"));
        }
        if !self.udp && !self.tcp {
            return Err(DnsError::config("at least one of UDP and TCP must be enabled"));
        }
        Ok(())
    }
}
