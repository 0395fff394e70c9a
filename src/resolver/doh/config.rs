//! Configuration for the DoH client resolver.

use std::net::IpAddr;
use std::time::Duration;

use crate::bestserver::LatencyConfig;
use crate::error::{DnsError, DnsResult};

/// Default per-request HTTPS timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Default cap on connections to any one upstream host.
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 10;

/// A fixed ECS value to place in outgoing queries, parsed from CIDR
/// notation. Mutually exclusive with the request-synthesis prefix lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcsSet {
    /// Network address. Masked to `prefix_len` before use.
    pub ip: IpAddr,
    /// Prefix length in bits, within the family range.
    pub prefix_len: u8,
}

impl EcsSet {
    /// Parse CIDR notation such as `10.0.120.0/24` or `2001:db8::/48`.
    ///
    /// # Errors
    ///
    /// Returns a config error on malformed notation or a prefix length
    /// outside the address family's range.
    pub fn parse(cidr: &str) -> DnsResult<Self> {
        let (ip_part, len_part) = cidr
            .split_once('/')
            .ok_or_else(|| DnsError::config(format!("malformed CIDR (expected ip/len): {cidr}")))?;

        let ip: IpAddr = ip_part
            .parse()
            .map_err(|e| DnsError::config(format!("malformed CIDR address {ip_part}: {e}")))?;
        let prefix_len: u8 = len_part
            .parse()
            .map_err(|e| DnsError::config(format!("malformed CIDR prefix length {len_part}: {e}")))?;

        let max = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(DnsError::config(format!(
                "CIDR mask size {prefix_len} exceeds family limit of {max}: {cidr}"
            )));
        }

        Ok(Self { ip, prefix_len })
    }
}

/// Configuration for [`super::DohResolver`].
#[derive(Debug, Clone)]
pub struct DohConfig {
    /// Upstream DoH endpoints. Missing scheme defaults to `https`; a bare
    /// hostname is acceptable.
    pub server_urls: Vec<String>,

    /// Use HTTP GET instead of the default POST.
    pub use_get: bool,

    /// Apply RFC 8467 padding to queries and strip it from responses.
    pub generate_padding: bool,

    /// Strip any ECS from outgoing queries.
    pub ecs_remove: bool,

    /// Strip ECS from replies when this client synthesized or set the
    /// query's ECS.
    pub ecs_redact_response: bool,

    /// Insert this fixed ECS when no ECS remains in the query.
    pub ecs_set: Option<EcsSet>,

    /// Ask the server to synthesize IPv4 ECS with this prefix length from
    /// the HTTPS peer address. Zero means do not synthesize.
    pub ecs_request_ipv4_prefix_len: u8,

    /// Ask the server to synthesize IPv6 ECS with this prefix length from
    /// the HTTPS peer address. Zero means do not synthesize.
    pub ecs_request_ipv6_prefix_len: u8,

    /// Best-server selection tuning.
    pub latency: LatencyConfig,

    /// Per-request HTTPS timeout.
    pub request_timeout: Duration,

    /// Cap on pooled connections per upstream host.
    pub max_connections_per_host: usize,
}

impl Default for DohConfig {
    fn default() -> Self {
        Self {
            server_urls: Vec::new(),
            use_get: false,
            generate_padding: false,
            ecs_remove: false,
            ecs_redact_response: false,
            ecs_set: None,
            ecs_request_ipv4_prefix_len: 0,
            ecs_request_ipv6_prefix_len: 0,
            latency: LatencyConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
        }
    }
}

impl DohConfig {
    /// Validate option combinations and ranges, and normalize server URLs.
    ///
    /// Called by the resolver constructor; a daemon cannot be relied on to
    /// have checked any of this.
    pub(crate) fn validate(&mut self) -> DnsResult<()> {
        if self.server_urls.is_empty() {
            return Err(DnsError::config("no DoH server URLs configured"));
        }

        let requests_synthesis =
            self.ecs_request_ipv4_prefix_len != 0 || self.ecs_request_ipv6_prefix_len != 0;

        if self.use_get && (self.ecs_set.is_some() || requests_synthesis) {
            return Err(DnsError::config(
                "cannot have any ECS synthesis options active when using HTTP GET",
            ));
        }
        if self.ecs_set.is_some() && requests_synthesis {
            return Err(DnsError::config(
                "cannot have an ECS set CIDR active with ECS request prefix lengths",
            ));
        }
        if self.ecs_request_ipv4_prefix_len > 32 {
            return Err(DnsError::config_field(
                format!(
                    "invalid IPv4 prefix length: {}. Must be in range 0-32",
                    self.ecs_request_ipv4_prefix_len
                ),
                "ecs_request_ipv4_prefix_len",
            ));
        }
        // ecs_request_ipv6_prefix_len is a u8 so the 0-128 range still
        // needs the upper check.
        if self.ecs_request_ipv6_prefix_len > 128 {
            return Err(DnsError::config_field(
                format!(
                    "invalid IPv6 prefix length: {}. Must be in range 0-128",
                    self.ecs_request_ipv6_prefix_len
                ),
                "ecs_request_ipv6_prefix_len",
            ));
        }

        for url in &mut self.server_urls {
            *url = normalize_server_url(url)?;
        }

        Ok(())
    }
}

/// Promote a bare hostname or schemeless URL to an `https` URL and check it
/// has a host component.
fn normalize_server_url(url: &str) -> DnsResult<String> {
    let candidate = if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{url}")
    };

    let uri: http::Uri = candidate
        .parse()
        .map_err(|e| DnsError::config(format!("bad DoH server URL {url}: {e}")))?;
    if uri.host().is_none() {
        return Err(DnsError::config(format!("DoH server URL has no host: {url}")));
    }

    Ok(candidate)
}
