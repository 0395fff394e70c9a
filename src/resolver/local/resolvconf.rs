//! BIND-style resolv.conf parsing.
//!
//! Only the directives the stub resolver cares about are extracted:
//! `nameserver`, `domain`, `search` and the `attempts`/`timeout` options.
//! Anything else is ignored, as stub resolvers have always done.
//!
//! `domain` and `search` overwrite each other; whichever appears last
//! wins. That mirrors how the platform resolver libraries read the file,
//! surprising as it is.

use std::path::Path;

use crate::error::{DnsError, DnsResult};

/// Default name-server port.
const DEFAULT_PORT: u16 = 53;

/// Default resolution attempts across the server list.
const DEFAULT_ATTEMPTS: u32 = 2;

/// Default cumulative resolve budget in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// The extracted contents of a resolv.conf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvConf {
    /// Name servers as written: bare IPs or explicit `ip:port` /
    /// `[v6]:port` forms.
    pub servers: Vec<String>,
    /// Search suffixes from `domain`/`search`.
    pub search: Vec<String>,
    /// Port appended to port-less name servers.
    pub port: u16,
    /// Resolution attempts across the server list.
    pub attempts: u32,
    /// Cumulative resolve budget in seconds.
    pub timeout_secs: u64,
}

impl Default for ResolvConf {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            search: Vec::new(),
            port: DEFAULT_PORT,
            attempts: DEFAULT_ATTEMPTS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ResolvConf {
    /// Load and parse `path`.
    ///
    /// # Errors
    ///
    /// Returns a config error if the file cannot be read. A file with no
    /// `nameserver` entries parses successfully; the resolver constructor
    /// rejects the empty server list.
    pub fn from_file(path: impl AsRef<Path>) -> DnsResult<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(DnsError::config("empty resolv.conf path is invalid"));
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            DnsError::config(format!("cannot read resolv.conf {}: {e}", path.display()))
        })?;
        Ok(Self::from_str_lossy(&content))
    }

    /// Parse resolv.conf content. Unknown directives are ignored.
    pub fn from_str_lossy(content: &str) -> Self {
        let mut conf = Self::default();

        for line in content.lines() {
            let line = line
                .split(['#', ';'])
                .next()
                .unwrap_or("")
                .trim();
            if line.is_empty() {
                continue;
            }

            let mut words = line.split_whitespace();
            match words.next() {
                Some("nameserver") => {
                    if let Some(server) = words.next() {
                        conf.servers.push(server.to_string());
                    }
                }
                Some("domain") => {
                    if let Some(domain) = words.next() {
                        conf.search = vec![domain.to_string()];
                    }
                }
                Some("search") => {
                    conf.search = words.map(str::to_string).collect();
                }
                Some("options") => {
                    for option in words {
                        if let Some(n) = option.strip_prefix("attempts:") {
                            if let Ok(n) = n.parse::<u32>() {
                                conf.attempts = n.max(1);
                            }
                        } else if let Some(n) = option.strip_prefix("timeout:") {
                            if let Ok(n) = n.parse::<u64>() {
                                conf.timeout_secs = n.max(1);
                            }
                        }
                    }
                }
                _ => {} // ignored, as stub resolvers do
            }
        }

        if conf.attempts == 0 {
            conf.attempts = 1;
        }
        if conf.timeout_secs == 0 {
            conf.timeout_secs = 1;
        }

        conf
    }
}
