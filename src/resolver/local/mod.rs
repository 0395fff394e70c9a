//! Local stub resolver over a static name-server list.
//!
//! Re-implements `res_send(3)` semantics: iterate over the name servers
//! (traditional best-server selection) until an acceptable response
//! arrives or the attempt or time budget runs out. A truncated UDP reply
//! with rcode NoError triggers an immediate TCP re-exchange with the same
//! server; if TCP succeeds its reply is used, otherwise the truncated UDP
//! reply stands and the caller can deal with TC=1 as it sees fit.
//!
//! The split between "server failed" and "query failed" drives iteration:
//! server-attributable rcodes (SERVFAIL, REFUSED) demote the server and
//! retry, query-attributable ones (FORMERR, NXDOMAIN) stop and return.
//! Not-Implemented is treated as per-server since every server could be
//! running a different implementation.

pub mod config;
pub mod exchange;
pub mod resolvconf;

pub use config::LocalConfig;
pub use exchange::{Exchanger, TcpExchanger, UdpExchanger};
pub use resolvconf::ResolvConf;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use parking_lot::RwLock;

use crate::bestserver::{BestServer, TraditionalServers};
use crate::error::{DnsError, DnsResult};
use crate::report::Reporter;
use crate::resolver::{DnsTransport, QueryMetaData, Resolver, ResponseMetaData};

/// Per-server failure buckets, mirroring the rcode classification.
#[derive(Debug, Default, Clone, Copy)]
struct FailureCounts {
    exchange_error: u64,
    format_error: u64,
    server_fail: u64,
    refused: u64,
    not_implemented: u64,
    other: u64,
}

impl FailureCounts {
    fn total(&self) -> u64 {
        self.exchange_error
            + self.format_error
            + self.server_fail
            + self.refused
            + self.not_implemented
            + self.other
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ServerStats {
    success: u64,
    tcp_fallback: u64,
    tcp_superior: u64,
    latency: Duration,
    failures: FailureCounts,
}

#[derive(Debug, Default)]
struct Stats {
    servers: Vec<ServerStats>,
    success: u64,
    timeouts: u64,
    attempts_exceeded: u64,
    total_latency: Duration,
}

/// How one exchange outcome steers the resolution loop.
struct Classification {
    success: bool,
    iterate: bool,
    failure: Option<FailureIndex>,
}

#[derive(Debug, Clone, Copy)]
enum FailureIndex {
    ExchangeError,
    FormatError,
    ServerFail,
    Refused,
    NotImplemented,
    Other,
}

fn classify(rcode: ResponseCode) -> Classification {
    match rcode {
        ResponseCode::NoError => Classification {
            success: true,
            iterate: false,
            failure: None,
        },
        ResponseCode::FormErr => Classification {
            // Assume the query is bogus, stop iterating.
            success: true,
            iterate: false,
            failure: Some(FailureIndex::FormatError),
        },
        ResponseCode::ServFail => Classification {
            success: false,
            iterate: true,
            failure: Some(FailureIndex::ServerFail),
        },
        ResponseCode::NXDomain => Classification {
            // NXDomain is actually a good return.
            success: true,
            iterate: false,
            failure: None,
        },
        ResponseCode::Refused => Classification {
            // Assume a server access control issue.
            success: false,
            iterate: true,
            failure: Some(FailureIndex::Refused),
        },
        ResponseCode::NotImp => Classification {
            success: true,
            iterate: true,
            failure: Some(FailureIndex::NotImplemented),
        },
        _ => Classification {
            // All other rcodes are returned to the caller.
            success: true,
            iterate: false,
            failure: Some(FailureIndex::Other),
        },
    }
}

/// Stub resolver over the name servers of a resolv.conf.
#[derive(Debug)]
pub struct LocalResolver {
    domains: Vec<String>, // normalized with guard dots, deduped
    attempts: u32,
    time_budget: Duration,
    best: TraditionalServers,
    udp: Arc<dyn Exchanger>,
    tcp: Arc<dyn Exchanger>,
    stats: RwLock<Stats>,
}

impl LocalResolver {
    /// Construct from configuration, loading the resolv.conf and using the
    /// production UDP and TCP exchangers.
    pub fn new(config: LocalConfig) -> DnsResult<Self> {
        let resolv = ResolvConf::from_file(&config.resolv_conf_path)?;
        Self::with_exchangers(
            config,
            resolv,
            Arc::new(UdpExchanger::default()),
            Arc::new(TcpExchanger::default()),
        )
    }

    /// Construct over an already-parsed [`ResolvConf`] with caller-supplied
    /// exchangers. This is the seam used by tests and embedders.
    pub fn with_exchangers(
        config: LocalConfig,
        resolv: ResolvConf,
        udp: Arc<dyn Exchanger>,
        tcp: Arc<dyn Exchanger>,
    ) -> DnsResult<Self> {
        let domains = normalize_domains(&resolv.search, &config.local_domains)?;

        // Name servers become ip:port strings to suit the exchangers.
        // IPv6 addresses get bracketed so the port can be appended safely.
        let mut servers = Vec::with_capacity(resolv.servers.len());
        for s in &resolv.servers {
            let formatted = if s.parse::<std::net::SocketAddr>().is_ok() {
                s.clone()
            } else if s.contains(':') {
                format!("[{s}]:{}", resolv.port)
            } else {
                format!("{s}:{}", resolv.port)
            };
            servers.push(formatted);
        }

        let best = TraditionalServers::new(servers)
            .map_err(|e| DnsError::config(format!("loading '{}': {e}", config.resolv_conf_path)))?;

        let stats = Stats {
            servers: vec![ServerStats::default(); best.len()],
            ..Stats::default()
        };

        Ok(Self {
            domains,
            attempts: resolv.attempts,
            time_budget: Duration::from_secs(resolv.timeout_secs),
            best,
            udp,
            tcp,
            stats: RwLock::new(stats),
        })
    }

    /// The local domains handled by this resolver, guard dots removed.
    pub fn in_bailiwick_domains(&self) -> Vec<String> {
        self.domains
            .iter()
            .map(|d| d[1..d.len() - 1].to_string())
            .collect()
    }

    /// The formatted name-server list.
    pub fn servers(&self) -> Vec<String> {
        self.best.servers()
    }

    fn add_server_outcome(
        &self,
        ix: usize,
        failure: Option<FailureIndex>,
        tcp_fallback: bool,
        tcp_superior: bool,
        rtt: Duration,
    ) {
        let mut stats = self.stats.write();
        let s = &mut stats.servers[ix];
        if tcp_fallback {
            s.tcp_fallback += 1;
        }
        if tcp_superior {
            s.tcp_superior += 1;
        }
        match failure {
            None => {
                s.success += 1;
                s.latency += rtt;
            }
            Some(FailureIndex::ExchangeError) => s.failures.exchange_error += 1,
            Some(FailureIndex::FormatError) => s.failures.format_error += 1,
            Some(FailureIndex::ServerFail) => s.failures.server_fail += 1,
            Some(FailureIndex::Refused) => s.failures.refused += 1,
            Some(FailureIndex::NotImplemented) => s.failures.not_implemented += 1,
            Some(FailureIndex::Other) => s.failures.other += 1,
        }
    }
}

/// Build the normalized local-domain list: lowercase, a guarding leading
/// dot and a trailing dot so comparisons cannot span labels, deduped in
/// order. Double dots anywhere make a bogus name and are rejected.
fn normalize_domains(search: &[String], extras: &[String]) -> DnsResult<Vec<String>> {
    let mut seen = std::collections::HashSet::new();
    let mut domains = Vec::new();

    for domain in search.iter().chain(extras.iter()) {
        if domain.is_empty() {
            continue;
        }
        let mut domain = domain.to_lowercase();
        if !domain.starts_with('.') {
            domain.insert(0, '.');
        }
        if !domain.ends_with('.') {
            domain.push('.');
        }
        if domain.contains("..") {
            return Err(DnsError::config(format!(
                "double dots in local domain name: {domain}"
            )));
        }
        if seen.insert(domain.clone()) {
            domains.push(domain);
        }
    }

    Ok(domains)
}

#[async_trait]
impl Resolver for LocalResolver {
    /// Suffix match against the local domains, on label boundaries only:
    /// `feedme.lulu.example.net` matches a local domain of
    /// `lulu.example.net` but `feedmelulu.example.net` does not.
    ///
    /// An unqualified name (no dot at all) is considered local whenever at
    /// least one local domain is configured. This mirrors stub-resolver
    /// search-list behavior, surprising as it may be: a name that will not
    /// resolve remotely is at least given a chance locally.
    fn in_bailiwick(&self, qname: &str) -> bool {
        if !qname.contains('.') {
            return !self.domains.is_empty();
        }

        let mut qname = format!(".{}", qname.to_lowercase());
        if !qname.ends_with('.') {
            qname.push('.');
        }

        self.domains.iter().any(|d| qname.ends_with(d.as_str()))
    }

    async fn resolve(
        &self,
        query: &Message,
        query_meta: &QueryMetaData,
    ) -> DnsResult<(Message, ResponseMetaData)> {
        let mut time_used = Duration::ZERO;
        let mut resp_meta = ResponseMetaData {
            transport: query_meta.transport,
            // No transport leg of our own; pretend the API takes a
            // nanosecond so duration sums stay positive.
            transport_duration: Duration::from_nanos(1),
            ..ResponseMetaData::default()
        };

        // No point trying a server more than it deserves.
        let max_attempts = self.attempts.min(u32::try_from(self.best.len()).unwrap_or(u32::MAX));

        for _ in 0..max_attempts {
            resp_meta.server_tries += 1;
            let (server, bsix) = self.best.best();
            resp_meta.final_server_used = server.clone();
            resp_meta.transport = DnsTransport::Udp; // in happy anticipation
            resp_meta.query_tries += 1;

            let mut tcp_fallback = false;
            let mut tcp_superior = false;
            let mut rtt = Duration::ZERO;

            let udp_result = self.udp.exchange(query, &server).await;
            let (classification, reply) = match udp_result {
                Err(_) => (
                    // Packet exchange failed. Assume a network or server
                    // issue and move on.
                    Classification {
                        success: false,
                        iterate: true,
                        failure: Some(FailureIndex::ExchangeError),
                    },
                    None,
                ),
                Ok((mut reply, udp_rtt)) => {
                    rtt += udp_rtt;
                    if reply.response_code() == ResponseCode::NoError && reply.truncated() {
                        // Fall back to TCP against the same server.
                        tcp_fallback = true;
                        resp_meta.query_tries += 1;
                        if let Ok((tcp_reply, tcp_rtt)) = self.tcp.exchange(query, &server).await {
                            rtt += tcp_rtt; // one big fat query for stats purposes
                            if tcp_reply.response_code() == ResponseCode::NoError {
                                tcp_superior = true;
                                reply = tcp_reply;
                                resp_meta.transport = DnsTransport::Tcp;
                            }
                        }
                    }
                    (classify(reply.response_code()), Some(reply))
                }
            };

            time_used += rtt;
            self.best
                .result(&server, classification.success, Instant::now(), rtt);
            self.add_server_outcome(
                bsix,
                classification.failure,
                tcp_fallback,
                tcp_superior,
                rtt,
            );

            if !classification.iterate {
                if let Some(reply) = reply {
                    let mut stats = self.stats.write();
                    stats.success += 1;
                    stats.total_latency += time_used;
                    drop(stats);

                    resp_meta.resolution_duration = time_used.max(Duration::from_nanos(1));
                    resp_meta.payload_size = reply.to_vec().map(|v| v.len()).unwrap_or(0);
                    return Ok((reply, resp_meta));
                }
            }

            if time_used > self.time_budget {
                self.stats.write().timeouts += 1;
                return Err(DnsError::budget(format!(
                    "Query timeout: {}s",
                    self.time_budget.as_secs()
                )));
            }
        }

        self.stats.write().attempts_exceeded += 1;
        Err(DnsError::budget(format!(
            "Query attempts exceeded: {}",
            self.attempts
        )))
    }
}

impl Reporter for LocalResolver {
    fn name(&self) -> String {
        "local resolver".to_string()
    }

    fn report(&self, reset: bool) -> String {
        let mut stats = self.stats.write();
        let mut lines = Vec::with_capacity(stats.servers.len() + 1);
        lines.push(format!(
            "ok={} timeouts={} attempts-exceeded={} latency={:?}",
            stats.success, stats.timeouts, stats.attempts_exceeded, stats.total_latency
        ));
        for (ix, server) in self.best.servers().iter().enumerate() {
            let s = stats.servers[ix];
            lines.push(format!(
                "{server}: ok={} fail={} tcp fb/sup={}/{} latency={:?}",
                s.success,
                s.failures.total(),
                s.tcp_fallback,
                s.tcp_superior,
                s.latency,
            ));
        }
        if reset {
            let n = stats.servers.len();
            *stats = Stats {
                servers: vec![ServerStats::default(); n],
                ..Stats::default()
            };
        }

        lines.join("\n")
    }
}
