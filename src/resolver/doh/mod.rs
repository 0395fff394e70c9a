//! DoH client resolver (RFC 8484).
//!
//! Serializes a DNS query, applies the configured ECS policy, issues an
//! HTTPS GET or POST to the currently-best upstream, validates and unpacks
//! the response and applies TTL-by-Age, redaction and padding-strip rules.
//!
//! The general philosophy is to know as little about the query as
//! possible: in part because we do not need to, and in part to insulate
//! this code from DNS enhancements it may not understand.
//!
//! # ECS manipulation
//!
//! Applied in order, and only to unsigned single-question IN queries:
//!
//! 1. If `ecs_remove` is set, strip any ECS from the query.
//! 2. If `ecs_set` is configured and no ECS remains, insert the configured
//!    ECS.
//! 3. If request-synthesis prefix lengths are configured and no ECS
//!    remains, ask the server to synthesize via the
//!    `X-trustydns-Synth` header. Zero lengths in that header tell the
//!    server *not* to synthesize for that family under any circumstances.
//!
//! The rules are sequential: the step 2 test observes whatever step 1 did.

pub mod config;
pub mod transport;

pub use config::{DohConfig, EcsSet};
pub use transport::{HttpExchange, HyperExchange};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use hickory_proto::op::{Message, OpCode};
use hickory_proto::rr::rdata::opt::EdnsCode;
use hickory_proto::rr::{DNSClass, Name};
use http::header::{ACCEPT, AGE, CONTENT_TYPE, USER_AGENT};
use http::{Method, Request};
use http_body_util::Full;
use parking_lot::RwLock;

use crate::bestserver::{BestServer, LatencyServers};
use crate::constants::{
    DNS_CONTENT_TYPE, DURATION_HEADER, MINIMUM_VIABLE_DNS_MESSAGE, PACKAGE_NAME,
    RFC8467_CLIENT_PAD_MODULO, RFC8484_QUERY_PARAM, SYNTHESIZE_ECS_HEADER, VERSION,
};
use crate::dnsutil;
use crate::error::{DnsError, DnsResult};
use crate::report::Reporter;
use crate::resolver::{DnsTransport, QueryMetaData, Resolver, ResponseMetaData};

/// Per-upstream failure buckets.
#[derive(Debug, Default, Clone, Copy)]
struct FailureCounts {
    build_request: u64,
    transport: u64,
    non_200: u64,
    content_type: u64,
    undersized: u64,
    unpack: u64,
}

impl FailureCounts {
    fn total(&self) -> u64 {
        self.build_request
            + self.transport
            + self.non_200
            + self.content_type
            + self.undersized
            + self.unpack
    }
}

#[derive(Debug, Clone, Copy)]
enum FailureKind {
    BuildRequest,
    Transport,
    Non200,
    ContentType,
    Undersized,
    Unpack,
}

/// Per-upstream statistics, reset on report.
#[derive(Debug, Default, Clone, Copy)]
struct ServerStats {
    success: u64,
    ecs_removed: u64,
    ecs_set: u64,
    ecs_request: u64,
    ecs_returned: u64,
    total_latency: Duration,
    server_latency: Duration,
    failures: FailureCounts,
}

#[derive(Debug, Default)]
struct Stats {
    servers: Vec<ServerStats>,
    pack_failures: u64,
}

/// ECS events observed while preparing one query.
#[derive(Debug, Default, Clone, Copy)]
struct EcsEvents {
    removed: bool,
    set: bool,
    requested: bool,
    returned: bool,
}

/// DoH client resolver. One per proxy daemon; shared across request tasks.
#[derive(Debug)]
pub struct DohResolver {
    config: DohConfig,
    /// `"p4/p6"` when request-synthesis is configured, otherwise None.
    ecs_request_data: Option<String>,
    best: LatencyServers,
    exchange: Arc<dyn HttpExchange>,
    stats: RwLock<Stats>,
}

impl DohResolver {
    /// Construct the resolver, validating the configuration.
    ///
    /// # Errors
    ///
    /// Any mutual-exclusion or range violation in `config` is a fatal
    /// config error: GET combined with ECS synthesis, set combined with
    /// request, out-of-range prefix lengths, malformed or empty server
    /// URLs.
    pub fn new(mut config: DohConfig, exchange: Arc<dyn HttpExchange>) -> DnsResult<Self> {
        config.validate()?;

        let ecs_request_data = (config.ecs_request_ipv4_prefix_len != 0
            || config.ecs_request_ipv6_prefix_len != 0)
            .then(|| {
                format!(
                    "{}/{}",
                    config.ecs_request_ipv4_prefix_len, config.ecs_request_ipv6_prefix_len
                )
            });

        let best = LatencyServers::new(config.latency, config.server_urls.clone())?;
        let stats = Stats {
            servers: vec![ServerStats::default(); config.server_urls.len()],
            pack_failures: 0,
        };

        Ok(Self {
            config,
            ecs_request_data,
            best,
            exchange,
            stats: RwLock::new(stats),
        })
    }

    /// The configured upstream URLs after normalization.
    pub fn servers(&self) -> Vec<String> {
        self.best.servers()
    }

    fn add_server_failure(&self, ix: usize, kind: FailureKind) {
        let mut stats = self.stats.write();
        let f = &mut stats.servers[ix].failures;
        match kind {
            FailureKind::BuildRequest => f.build_request += 1,
            FailureKind::Transport => f.transport += 1,
            FailureKind::Non200 => f.non_200 += 1,
            FailureKind::ContentType => f.content_type += 1,
            FailureKind::Undersized => f.undersized += 1,
            FailureKind::Unpack => f.unpack += 1,
        }
    }

    fn add_pack_failure(&self) {
        self.stats.write().pack_failures += 1;
    }

    fn add_success(
        &self,
        ix: usize,
        total: Duration,
        remote: Duration,
        events: EcsEvents,
    ) {
        let mut stats = self.stats.write();
        let s = &mut stats.servers[ix];
        s.success += 1;
        s.total_latency += total;
        s.server_latency += remote;
        if events.removed {
            s.ecs_removed += 1;
        }
        if events.set {
            s.ecs_set += 1;
        }
        if events.requested {
            s.ecs_request += 1;
        }
        if events.returned {
            s.ecs_returned += 1;
        }
    }
}

#[async_trait]
impl Resolver for DohResolver {
    /// A liberal test: anything that looks vaguely like a fully-qualified
    /// domain name is ours.
    fn in_bailiwick(&self, qname: &str) -> bool {
        if !qname.contains('.') {
            return false;
        }
        qname.ends_with('.') && Name::from_ascii(qname).is_ok()
    }

    async fn resolve(
        &self,
        query: &Message,
        _query_meta: &QueryMetaData,
    ) -> DnsResult<(Message, ResponseMetaData)> {
        let start = Instant::now();

        let mut dns_q = query.clone();
        let original_id = dns_q.id();
        let mut events = EcsEvents::default();
        let mut original_ecs_retained = true;
        let mut ecs_request_data: Option<&str> = None;

        // RFC 2845: a TSIG message cannot be modified in any way except
        // the ID without invalidating the signature.
        let msg_is_mutable = !dnsutil::is_signed(&dns_q);

        // Constrain the ECS rules to legitimate-looking IN queries.
        let single_in_query = dns_q.op_code() == OpCode::Query
            && dns_q.queries().len() == 1
            && dns_q.queries()[0].query_class() == DNSClass::IN;

        if single_in_query && msg_is_mutable {
            let mut ecs_present = dnsutil::has_ecs(&dns_q);

            // Rule 1: remove any ECS from the query.
            if self.config.ecs_remove && ecs_present {
                events.removed = dnsutil::remove_edns_option(&mut dns_q, EdnsCode::Subnet);
                original_ecs_retained = false;
                ecs_present = false;
            }

            // Rule 2: if set is configured and no ECS remains, insert ours.
            if let Some(set) = &self.config.ecs_set {
                if !ecs_present {
                    dnsutil::create_ecs(&mut dns_q, set.ip, set.prefix_len)?;
                    original_ecs_retained = false;
                    events.set = true;
                    ecs_present = true;
                }
            }

            // Rule 3: if request-synthesis is configured and no ECS
            // remains, arrange for the HTTP header. No DNS-level change.
            if let Some(data) = &self.ecs_request_data {
                if !ecs_present {
                    ecs_request_data = Some(data);
                    original_ecs_retained = false;
                    events.requested = true;
                }
            }
        }

        // The message ID SHOULD be zero for GET to maximize HTTP cache
        // hits. Allowed even for TSIG.
        if self.config.use_get {
            dns_q.set_id(0);
        }

        let binary = if self.config.generate_padding && msg_is_mutable {
            dnsutil::pad_and_pack(&mut dns_q, RFC8467_CLIENT_PAD_MODULO).inspect_err(|_| {
                self.add_pack_failure();
            })?
        } else {
            dns_q.to_vec().map_err(|e| {
                self.add_pack_failure();
                DnsError::serialize(e.to_string())
            })?
        };

        let (best_url, bsix) = self.best.best();

        let (method, uri, body) = if self.config.use_get {
            let encoded = URL_SAFE_NO_PAD.encode(&binary);
            let uri = format!("{best_url}?{RFC8484_QUERY_PARAM}={encoded}");
            (Method::GET, uri, Bytes::new())
        } else {
            (Method::POST, best_url.clone(), Bytes::from(binary))
        };

        let mut builder = Request::builder()
            .method(method)
            .uri(uri.as_str())
            .header(ACCEPT, DNS_CONTENT_TYPE)
            .header(CONTENT_TYPE, DNS_CONTENT_TYPE)
            .header(USER_AGENT, format!("{PACKAGE_NAME}/{VERSION}"));
        if msg_is_mutable {
            if let Some(data) = ecs_request_data {
                builder = builder.header(SYNTHESIZE_ECS_HEADER, data);
            }
        }
        let request = builder.body(Full::new(body)).map_err(|e| {
            self.add_server_failure(bsix, FailureKind::BuildRequest);
            DnsError::internal(format!("building DoH request for {best_url}: {e}"))
        })?;

        let result = self.exchange.exchange(request).await;
        let end = Instant::now();
        let total_duration = end.duration_since(start);

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.add_server_failure(bsix, FailureKind::Transport);
                self.best.result(&best_url, false, end, Duration::ZERO);
                return Err(e);
            }
        };

        self.best.result(&best_url, true, end, total_duration);

        let qname = query
            .queries()
            .first()
            .map_or_else(|| "?".to_string(), |q| q.name().to_string());

        if response.status() != http::StatusCode::OK {
            self.add_server_failure(bsix, FailureKind::Non200);
            return Err(DnsError::upstream(
                &best_url,
                format!(
                    "bad HTTP status: {} with query id={original_id} qname={qname}",
                    response.status()
                ),
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if content_type != DNS_CONTENT_TYPE {
            self.add_server_failure(bsix, FailureKind::ContentType);
            return Err(DnsError::protocol(format!(
                "expected Content-Type of '{DNS_CONTENT_TYPE}' but got '{content_type}' from {best_url}"
            )));
        }

        let body = response.body();
        if body.len() < MINIMUM_VIABLE_DNS_MESSAGE {
            self.add_server_failure(bsix, FailureKind::Undersized);
            return Err(DnsError::protocol(format!(
                "response length of {} is less than minimum viable of {MINIMUM_VIABLE_DNS_MESSAGE}",
                body.len()
            )));
        }

        // The server reports how long its local resolution took. Advisory,
        // parse errors are ignored.
        let remote_duration = response
            .headers()
            .get(DURATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<f64>().ok())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(Duration::ZERO);

        let mut reply = Message::from_vec(body).map_err(|e| {
            self.add_server_failure(bsix, FailureKind::Unpack);
            DnsError::parse(format!("unpack of DoH reply from {best_url} failed: {e}"))
        })?;

        let reply_is_mutable = !dnsutil::is_signed(&reply);

        // RFC 8484 5.1: reduce TTLs by the HTTP Age header, which a
        // caching HTTPS proxy may have added. Never below 1s; a TTL of
        // zero is not well defined so be a bit protective of the caller.
        if reply_is_mutable {
            if let Some(age) = response
                .headers()
                .get(AGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u32>().ok())
            {
                if age > 0 {
                    dnsutil::reduce_ttl(&mut reply, age, 1);
                }
            }
        }

        if dnsutil::has_ecs(&reply) && !original_ecs_retained {
            events.returned = true;
        }

        // Reconstitute the reply to more closely match the query: recover
        // the original ID in case GET zeroed it, conditionally redact ECS,
        // and strip returned padding (padding is hop-by-hop).
        reply.set_id(original_id);
        if reply_is_mutable {
            if !original_ecs_retained && self.config.ecs_redact_response {
                dnsutil::remove_edns_option(&mut reply, EdnsCode::Subnet);
            }
            if self.config.generate_padding {
                dnsutil::remove_edns_option(&mut reply, EdnsCode::Padding);
            }
        }

        self.add_success(bsix, total_duration, remote_duration, events);

        let nanos = Duration::from_nanos(1);
        let meta = ResponseMetaData {
            transport: DnsTransport::Http,
            transport_duration: total_duration
                .checked_sub(remote_duration)
                .unwrap_or(Duration::ZERO)
                .max(nanos),
            resolution_duration: remote_duration.max(nanos),
            payload_size: body.len(),
            query_tries: 1,
            server_tries: 1,
            final_server_used: best_url,
        };

        Ok((reply, meta))
    }
}

impl Reporter for DohResolver {
    fn name(&self) -> String {
        format!("DoH resolver ({})", self.best.algorithm())
    }

    fn report(&self, reset: bool) -> String {
        let mut stats = self.stats.write();
        let mut lines = Vec::with_capacity(stats.servers.len() + 1);
        for (ix, url) in self.best.servers().iter().enumerate() {
            let s = stats.servers[ix];
            let avg = if s.success > 0 {
                s.total_latency / u32::try_from(s.success).unwrap_or(u32::MAX)
            } else {
                Duration::ZERO
            };
            lines.push(format!(
                "{url}: ok={} fail={} ecs rm/set/req/ret={}/{}/{}/{} avg={avg:?} remote={:?}",
                s.success,
                s.failures.total(),
                s.ecs_removed,
                s.ecs_set,
                s.ecs_request,
                s.ecs_returned,
                s.server_latency,
            ));
        }
        if stats.pack_failures > 0 {
            lines.push(format!("pack failures={}", stats.pack_failures));
        }
        if reset {
            let n = stats.servers.len();
            *stats = Stats {
                servers: vec![ServerStats::default(); n],
                pack_failures: 0,
            };
        }

        lines.join("\n")
    }
}
