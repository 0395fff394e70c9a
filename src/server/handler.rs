//! The DoH request pipeline (RFC 8484 server side).
//!
//! Validates the HTTPS request, extracts the DNS message, applies the
//! server-side ECS policy, forwards to the local recursive resolver and
//! returns the binary DNS response, padded per RFC 8467 when the client
//! asked for it by padding its query.
//!
//! Every way a request can fail is counted in its own bucket so the
//! periodic report shows what clients are doing wrong.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use hickory_proto::op::Message;
use hickory_proto::rr::rdata::opt::EdnsCode;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, Response, StatusCode, Uri};
use http_body_util::Full;
use parking_lot::RwLock;
use tracing::info;

use crate::constants::{
    DNS_CONTENT_TYPE, DURATION_HEADER, RFC8467_SERVER_PAD_MODULO, RFC8484_QUERY_PARAM,
    SYNTHESIZE_ECS_HEADER,
};
use crate::dnsutil;
use crate::report::Reporter;
use crate::resolver::{DnsTransport, QueryMetaData, Resolver};
use crate::tracker::{ConcurrencyCounter, ConnectionTracker};

/// ECS and logging options the handler needs from the daemon config.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Strip any ECS arriving in queries.
    pub ecs_remove: bool,
    /// Synthesize ECS from the HTTPS peer unconditionally.
    pub ecs_set: bool,
    /// IPv4 prefix length for synthesized ECS. Zero disables IPv4 synthesis.
    pub ecs_set_ipv4_prefix_len: u8,
    /// IPv6 prefix length for synthesized ECS. Zero disables IPv6 synthesis.
    pub ecs_set_ipv6_prefix_len: u8,
    /// Log each inbound client query.
    pub log_client_in: bool,
    /// Log each outbound client response.
    pub log_client_out: bool,
}

/// Events that occur during the course of one request.
#[derive(Debug, Default, Clone, Copy)]
struct Events {
    get: bool,
    tsig: bool,
    edns0_removed: bool,
    ecs_v4_synth: bool,
    ecs_v6_synth: bool,
    padding: bool,
}

/// Errors that stop a request from progressing, by kind.
#[derive(Debug, Default, Clone, Copy)]
struct FailureCounts {
    bad_content_type: u64,
    bad_method: u64,
    bad_prefix_lengths: u64,
    bad_query_param_decode: u64,
    body_read_error: u64,
    client_tls_bad: u64,
    dns_pack_response_failed: u64,
    dns_unpack_request_failed: u64,
    ecs_synthesis_failed: u64,
    http_writer_failed: u64,
    local_resolution_failed: u64,
    query_param_missing: u64,
}

impl FailureCounts {
    fn total(&self) -> u64 {
        self.bad_content_type
            + self.bad_method
            + self.bad_prefix_lengths
            + self.bad_query_param_decode
            + self.body_read_error
            + self.client_tls_bad
            + self.dns_pack_response_failed
            + self.dns_unpack_request_failed
            + self.ecs_synthesis_failed
            + self.http_writer_failed
            + self.local_resolution_failed
            + self.query_param_missing
    }
}

/// Failures raised inside the request pipeline. TLS and write failures
/// are counted directly by the connection glue, which sees them first.
#[derive(Debug, Clone, Copy)]
enum Failure {
    BadContentType,
    BadMethod,
    BadPrefixLengths,
    BadQueryParamDecode,
    BodyReadError,
    DnsPackResponseFailed,
    DnsUnpackRequestFailed,
    EcsSynthesisFailed,
    LocalResolutionFailed,
    QueryParamMissing,
}

#[derive(Debug, Default, Clone, Copy)]
struct EventCounts {
    get: u64,
    tsig: u64,
    edns0_removed: u64,
    ecs_v4_synth: u64,
    ecs_v6_synth: u64,
    padding: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct ServerStats {
    success: u64,
    total_latency: Duration,
    events: EventCounts,
    failures: FailureCounts,
}

/// Per-listener DoH request handler. Shared across request tasks.
pub struct DohHandler {
    local: Arc<dyn Resolver>,
    options: HandlerOptions,
    listen_name: String,
    concurrency: ConcurrencyCounter,
    tracker: Option<Arc<ConnectionTracker>>,
    stats: RwLock<ServerStats>,
}

impl DohHandler {
    /// Create a handler forwarding to `local`.
    pub fn new(
        local: Arc<dyn Resolver>,
        options: HandlerOptions,
        listen_name: impl Into<String>,
        tracker: Option<Arc<ConnectionTracker>>,
    ) -> Self {
        Self {
            local,
            options,
            listen_name: listen_name.into(),
            concurrency: ConcurrencyCounter::default(),
            tracker,
            stats: RwLock::new(ServerStats::default()),
        }
    }

    /// The listener identity for logs and reports.
    pub fn listen_name(&self) -> &str {
        &self.listen_name
    }

    /// Peak concurrent requests seen, optionally resetting the peak.
    pub fn peak_concurrency(&self, reset: bool) -> u64 {
        self.concurrency.peak(reset)
    }

    /// Count a TLS handshake failure from a client. The accept loop calls
    /// this because the handshake fails before any request exists.
    pub fn note_client_tls_bad(&self) {
        self.stats.write().failures.client_tls_bad += 1;
    }

    /// Count a failed response write. The connection glue calls this.
    pub fn note_http_write_failed(&self) {
        self.stats.write().failures.http_writer_failed += 1;
    }

    /// Build the 400 response for an unreadable request body, counting it.
    pub fn body_read_error_response(&self, reason: &str) -> Response<Full<Bytes>> {
        self.add_failure(Failure::BodyReadError, Events::default());
        error_response(
            StatusCode::BAD_REQUEST,
            format!("Error: Could not read request body: {reason}"),
        )
    }

    /// Handle one DoH request. Called once per request task; `body` is the
    /// fully-read request body and `peer` the HTTPS connection's remote
    /// address.
    pub async fn handle(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
        peer: SocketAddr,
    ) -> Response<Full<Bytes>> {
        self.concurrency.add();
        let peer_key = peer.to_string();
        if let Some(tracker) = &self.tracker {
            tracker.session_add(&peer_key);
        }

        let response = self.process(method, uri, headers, body, peer).await;

        if let Some(tracker) = &self.tracker {
            tracker.session_done(&peer_key);
        }
        self.concurrency.done();
        response
    }

    async fn process(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
        peer: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let mut events = Events::default();

        if method != Method::POST && method != Method::GET {
            self.add_failure(Failure::BadMethod, events);
            return error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                format!("Error: Expected Method 'POST' or 'GET', not '{method}'"),
            );
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if content_type != DNS_CONTENT_TYPE {
            self.add_failure(Failure::BadContentType, events);
            return error_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("Error: Expected Content-Type: '{DNS_CONTENT_TYPE}' not '{content_type}'"),
            );
        }

        // POST carries the DNS binary in the body; GET base64url-encodes
        // it into the one-and-only query parameter.
        let wire = if method == Method::GET {
            events.get = true;
            match decode_query_param(uri) {
                Ok(wire) => wire,
                Err((failure, msg)) => {
                    self.add_failure(failure, events);
                    return error_response(StatusCode::BAD_REQUEST, msg);
                }
            }
        } else {
            body.to_vec()
        };

        let mut dns_q = match Message::from_vec(&wire) {
            Ok(dns_q) => dns_q,
            Err(e) => {
                self.add_failure(Failure::DnsUnpackRequestFailed, events);
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("Error: DNS unpack failed: {e}"),
                );
            }
        };

        if self.options.log_client_in {
            info!(listener = %self.listen_name, query = %dnsutil::compact_msg_string(&dns_q), "client query");
        }

        // A zero query ID is expected for GET. Resolve downstream with a
        // real one and reinstate the zero on the way out.
        let original_id = dns_q.id();
        if original_id == 0 {
            dns_q.set_id(random_nonzero_id());
        }

        let msg_is_mutable = !dnsutil::is_signed(&dns_q);
        events.tsig = !msg_is_mutable;
        let mut pad_response = false;

        if msg_is_mutable {
            let synth_header = headers
                .get(SYNTHESIZE_ECS_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|s| !s.is_empty());

            // Expunge any pre-existing ECS when we are about to replace it
            // or were told to remove it.
            if self.options.ecs_remove || synth_header.is_some() || self.options.ecs_set {
                dnsutil::remove_edns_option(&mut dns_q, EdnsCode::Subnet);
                events.edns0_removed = true;
            }

            if synth_header.is_some() || self.options.ecs_set {
                match self.synthesize_ecs(&mut dns_q, synth_header, peer.ip()) {
                    Ok(synthesized) => match synthesized {
                        Some(IpFamily::V4) => events.ecs_v4_synth = true,
                        Some(IpFamily::V6) => events.ecs_v6_synth = true,
                        None => {}
                    },
                    Err((failure, msg)) => {
                        self.add_failure(failure, events);
                        return error_response(StatusCode::BAD_REQUEST, msg);
                    }
                }
            }

            // Padding in the query is the RFC 8467 signal to pad the
            // response. It is hop-by-hop, so strip it before resolving.
            if dnsutil::find_padding(&dns_q).is_some() {
                events.padding = true;
                pad_response = true;
                dnsutil::remove_edns_option(&mut dns_q, EdnsCode::Padding);
            }
        }

        let start = Instant::now();
        let query_meta = QueryMetaData {
            transport: DnsTransport::Http,
        };
        let (mut reply, reply_meta) = match self.local.resolve(&dns_q, &query_meta).await {
            Ok(resolved) => resolved,
            Err(e) => {
                self.add_failure(Failure::LocalResolutionFailed, events);
                return error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("Error: local resolution failed: {e}"),
                );
            }
        };
        let duration = start.elapsed();

        reply.set_id(original_id);

        let body = if msg_is_mutable && pad_response {
            dnsutil::pad_and_pack(&mut reply, RFC8467_SERVER_PAD_MODULO)
        } else {
            reply
                .to_vec()
                .map_err(|e| crate::error::DnsError::serialize(e.to_string()))
        };
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                self.add_failure(Failure::DnsPackResponseFailed, events);
                return error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("DNS Pack Failed: {e}"),
                );
            }
        };

        self.add_success(duration, events);
        if self.options.log_client_out {
            info!(
                listener = %self.listen_name,
                response = %dnsutil::compact_msg_string(&reply),
                tries = reply_meta.query_tries,
                server = %reply_meta.final_server_used,
                elapsed = ?duration,
                "client response"
            );
        }

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, DNS_CONTENT_TYPE)
            .header(DURATION_HEADER, format!("{:.6}", duration.as_secs_f64()))
            .body(Full::new(Bytes::from(body)))
            .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, String::new()))
    }

    /// Insert an ECS option derived from the HTTPS peer address. Header
    /// prefix lengths override the configured ones; a zero length means
    /// "do not synthesize" for that family.
    fn synthesize_ecs(
        &self,
        dns_q: &mut Message,
        synth_header: Option<&str>,
        peer_ip: IpAddr,
    ) -> Result<Option<IpFamily>, (Failure, String)> {
        let mut ipv4_prefix_len = self.options.ecs_set_ipv4_prefix_len;
        let mut ipv6_prefix_len = self.options.ecs_set_ipv6_prefix_len;

        if let Some(header) = synth_header {
            let (p4, p6) = extract_prefix_lengths(header)
                .map_err(|msg| (Failure::BadPrefixLengths, msg))?;
            ipv4_prefix_len = p4;
            ipv6_prefix_len = p6;
        }

        let (family, prefix_len) = match peer_ip {
            IpAddr::V4(_) if ipv4_prefix_len > 0 => (IpFamily::V4, ipv4_prefix_len),
            IpAddr::V6(_) if ipv6_prefix_len > 0 => (IpFamily::V6, ipv6_prefix_len),
            _ => return Ok(None),
        };

        dnsutil::create_ecs(dns_q, peer_ip, prefix_len).map_err(|e| {
            (
                Failure::EcsSynthesisFailed,
                format!("Error: ECS synthesis failed: {e}"),
            )
        })?;

        Ok(Some(family))
    }

    fn add_failure(&self, failure: Failure, events: Events) {
        let mut stats = self.stats.write();
        let f = &mut stats.failures;
        match failure {
            Failure::BadContentType => f.bad_content_type += 1,
            Failure::BadMethod => f.bad_method += 1,
            Failure::BadPrefixLengths => f.bad_prefix_lengths += 1,
            Failure::BadQueryParamDecode => f.bad_query_param_decode += 1,
            Failure::BodyReadError => f.body_read_error += 1,
            Failure::DnsPackResponseFailed => f.dns_pack_response_failed += 1,
            Failure::DnsUnpackRequestFailed => f.dns_unpack_request_failed += 1,
            Failure::EcsSynthesisFailed => f.ecs_synthesis_failed += 1,
            Failure::LocalResolutionFailed => f.local_resolution_failed += 1,
            Failure::QueryParamMissing => f.query_param_missing += 1,
        }
        add_events(&mut stats.events, events);
    }

    fn add_success(&self, duration: Duration, events: Events) {
        let mut stats = self.stats.write();
        stats.success += 1;
        stats.total_latency += duration;
        add_events(&mut stats.events, events);
    }
}

#[derive(Debug, Clone, Copy)]
enum IpFamily {
    V4,
    V6,
}

fn add_events(counts: &mut EventCounts, events: Events) {
    if events.get {
        counts.get += 1;
    }
    if events.tsig {
        counts.tsig += 1;
    }
    if events.edns0_removed {
        counts.edns0_removed += 1;
    }
    if events.ecs_v4_synth {
        counts.ecs_v4_synth += 1;
    }
    if events.ecs_v6_synth {
        counts.ecs_v6_synth += 1;
    }
    if events.padding {
        counts.padding += 1;
    }
}

/// Decode the GET form: exactly one query parameter, named `dns`, holding
/// the base64url (unpadded) DNS message.
fn decode_query_param(uri: &Uri) -> Result<Vec<u8>, (Failure, String)> {
    let params: Vec<&str> = uri
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|p| !p.is_empty())
        .collect();

    let Some(value) = params.iter().find_map(|p| p.strip_prefix("dns=")) else {
        return Err((
            Failure::QueryParamMissing,
            format!("Error: Query Param '{RFC8484_QUERY_PARAM}' not present in 'GET' request"),
        ));
    };

    if params.len() != 1 {
        return Err((
            Failure::QueryParamMissing,
            format!(
                "Error: Superfluous Query Params beyond the singular '{RFC8484_QUERY_PARAM}' ({})",
                params.len()
            ),
        ));
    }

    URL_SAFE_NO_PAD.decode(value).map_err(|e| {
        (
            Failure::BadQueryParamDecode,
            format!("Error: Query Param '{RFC8484_QUERY_PARAM}': {e}"),
        )
    })
}

/// Tease the prefix lengths out of the synthesis request header.
///
/// The format is `ipv4prefixlen/ipv6prefixlen`, e.g. `24/64`.
fn extract_prefix_lengths(header: &str) -> Result<(u8, u8), String> {
    let parts: Vec<&str> = header.split('/').collect();
    if parts.len() != 2 {
        return Err(format!(
            "Error: Expected ipv4prefixlen/ipv6prefixlen, not '{header}'"
        ));
    }

    let ipv4_prefix_len: u64 = parts[0]
        .parse()
        .map_err(|e| format!("Error: Could not convert ipv4prefixlen: {e}"))?;
    let ipv6_prefix_len: u64 = parts[1]
        .parse()
        .map_err(|e| format!("Error: Could not convert ipv6prefixlen: {e}"))?;

    if ipv4_prefix_len > 32 {
        return Err(format!(
            "Error: IPv4 prefix length of {ipv4_prefix_len} is not in range 0-32"
        ));
    }
    if ipv6_prefix_len > 128 {
        return Err(format!(
            "Error: IPv6 prefix length of {ipv6_prefix_len} is not in range 0-128"
        ));
    }

    Ok((ipv4_prefix_len as u8, ipv6_prefix_len as u8))
}

fn random_nonzero_id() -> u16 {
    loop {
        let id: u16 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

/// Plain-text error responder, the moral equivalent of Go's http.Error.
fn error_response(status: StatusCode, msg: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(format!("{msg}\n"))));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

impl Reporter for DohHandler {
    fn name(&self) -> String {
        format!("DoH server ({})", self.listen_name)
    }

    fn report(&self, reset: bool) -> String {
        let mut stats = self.stats.write();
        let line = format!(
            "ok={} latency={:?} peak={} fail={} get={} tsig={} ecs rm/v4/v6={}/{}/{} pad={} tls-bad={}",
            stats.success,
            stats.total_latency,
            self.concurrency.peak(reset),
            stats.failures.total(),
            stats.events.get,
            stats.events.tsig,
            stats.events.edns0_removed,
            stats.events.ecs_v4_synth,
            stats.events.ecs_v6_synth,
            stats.events.padding,
            stats.failures.client_tls_bad,
        );
        if reset {
            *stats = ServerStats::default();
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DnsError, DnsResult};
    use crate::resolver::ResponseMetaData;
    use async_trait::async_trait;
    use hickory_proto::op::{Edns, MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsOption};
    use hickory_proto::rr::{Name, Record, RecordType};
    use parking_lot::Mutex;
    use std::str::FromStr;

    // ========================================================================
    // Capturing Resolver
    // ========================================================================

    /// Echoes the forwarded query back as the reply and remembers what it
    /// was asked, so tests can inspect exactly what the local resolver saw.
    #[derive(Debug)]
    struct CapturingResolver {
        seen: Mutex<Vec<Message>>,
        fail: bool,
    }

    impl CapturingResolver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        fn last_seen(&self) -> Message {
            self.seen.lock().last().expect("no query seen").clone()
        }
    }

    #[async_trait]
    impl Resolver for CapturingResolver {
        fn in_bailiwick(&self, _qname: &str) -> bool {
            true
        }

        async fn resolve(
            &self,
            query: &Message,
            _meta: &QueryMetaData,
        ) -> DnsResult<(Message, ResponseMetaData)> {
            self.seen.lock().push(query.clone());
            if self.fail {
                return Err(DnsError::budget("Query attempts exceeded: 2"));
            }
            let mut reply = query.clone();
            reply.set_message_type(MessageType::Response);
            Ok((reply, ResponseMetaData::default()))
        }
    }

    // ========================================================================
    // Helper Functions
    // ========================================================================

    fn handler(local: Arc<CapturingResolver>, options: HandlerOptions) -> DohHandler {
        DohHandler::new(local, options, "127.0.0.1:443", None)
    }

    fn a_query(name: &str, id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        msg
    }

    fn dns_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, DNS_CONTENT_TYPE.parse().unwrap());
        headers
    }

    fn peer_v4() -> SocketAddr {
        "192.0.2.55:49152".parse().unwrap()
    }

    fn peer_v6() -> SocketAddr {
        "[2001:db8:1:2:3:4:5:6]:49152".parse().unwrap()
    }

    fn post_uri() -> Uri {
        "/dns-query".parse().unwrap()
    }

    async fn post(h: &DohHandler, msg: &Message, peer: SocketAddr) -> Response<Full<Bytes>> {
        h.handle(
            &Method::POST,
            &post_uri(),
            &dns_headers(),
            Bytes::from(msg.to_vec().unwrap()),
            peer,
        )
        .await
    }

    async fn body_of(response: Response<Full<Bytes>>) -> Vec<u8> {
        use http_body_util::BodyExt;
        response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes()
            .to_vec()
    }

    async fn body_string(response: Response<Full<Bytes>>) -> String {
        String::from_utf8_lossy(&body_of(response).await).to_string()
    }

    // ========================================================================
    // POST Happy Path Tests
    // ========================================================================

    #[tokio::test]
    async fn test_post_round_trip() {
        let local = CapturingResolver::new();
        let h = handler(local.clone(), HandlerOptions::default());

        let query = a_query("example.com.", 0x2323);
        let response = post(&h, &query, peer_v4()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            DNS_CONTENT_TYPE
        );
        assert!(response.headers().get(DURATION_HEADER).is_some());

        let reply = Message::from_vec(&body_of(response).await).unwrap();
        assert_eq!(reply.id(), 0x2323);
        assert_eq!(h.stats.read().success, 1);
        assert_eq!(h.peak_concurrency(false), 1);
    }

    #[tokio::test]
    async fn test_zero_id_resolved_nonzero_and_restored() {
        let local = CapturingResolver::new();
        let h = handler(local.clone(), HandlerOptions::default());

        let query = a_query("example.com.", 0);
        let response = post(&h, &query, peer_v4()).await;

        assert_ne!(local.last_seen().id(), 0, "downstream must see a real ID");
        let reply = Message::from_vec(&body_of(response).await).unwrap();
        assert_eq!(reply.id(), 0, "the zero ID must be reinstated");
    }

    // ========================================================================
    // GET Tests
    // ========================================================================

    #[tokio::test]
    async fn test_get_round_trip() {
        let local = CapturingResolver::new();
        let h = handler(local.clone(), HandlerOptions::default());

        let query = a_query("example.com.", 0);
        let encoded = URL_SAFE_NO_PAD.encode(query.to_vec().unwrap());
        let uri: Uri = format!("/dns-query?dns={encoded}").parse().unwrap();

        let response = h
            .handle(&Method::GET, &uri, &dns_headers(), Bytes::new(), peer_v4())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.stats.read().events.get, 1);
    }

    #[tokio::test]
    async fn test_get_missing_param() {
        let h = handler(CapturingResolver::new(), HandlerOptions::default());
        let uri: Uri = "/dns-query".parse().unwrap();

        let response = h
            .handle(&Method::GET, &uri, &dns_headers(), Bytes::new(), peer_v4())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("not present"));
        assert_eq!(h.stats.read().failures.query_param_missing, 1);
    }

    #[tokio::test]
    async fn test_get_superfluous_params() {
        let h = handler(CapturingResolver::new(), HandlerOptions::default());
        let query = a_query("example.com.", 0);
        let encoded = URL_SAFE_NO_PAD.encode(query.to_vec().unwrap());
        let uri: Uri = format!("/dns-query?dns={encoded}&extra=1").parse().unwrap();

        let response = h
            .handle(&Method::GET, &uri, &dns_headers(), Bytes::new(), peer_v4())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("Superfluous"));
    }

    #[tokio::test]
    async fn test_get_bad_base64() {
        let h = handler(CapturingResolver::new(), HandlerOptions::default());
        let uri: Uri = "/dns-query?dns=!!!not-base64!!!".parse().unwrap();

        let response = h
            .handle(&Method::GET, &uri, &dns_headers(), Bytes::new(), peer_v4())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(h.stats.read().failures.bad_query_param_decode, 1);
    }

    // ========================================================================
    // Validation Tests
    // ========================================================================

    #[tokio::test]
    async fn test_bad_method() {
        let h = handler(CapturingResolver::new(), HandlerOptions::default());
        let response = h
            .handle(&Method::PUT, &post_uri(), &dns_headers(), Bytes::new(), peer_v4())
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(h.stats.read().failures.bad_method, 1);
    }

    #[tokio::test]
    async fn test_bad_content_type() {
        let h = handler(CapturingResolver::new(), HandlerOptions::default());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());

        let response = h
            .handle(&Method::POST, &post_uri(), &headers, Bytes::new(), peer_v4())
            .await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(h.stats.read().failures.bad_content_type, 1);
    }

    #[tokio::test]
    async fn test_unparseable_dns() {
        let h = handler(CapturingResolver::new(), HandlerOptions::default());
        let response = h
            .handle(
                &Method::POST,
                &post_uri(),
                &dns_headers(),
                Bytes::from_static(&[1, 2, 3]),
                peer_v4(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(h.stats.read().failures.dns_unpack_request_failed, 1);
    }

    #[tokio::test]
    async fn test_local_resolution_failure() {
        let h = handler(CapturingResolver::failing(), HandlerOptions::default());
        let response = post(&h, &a_query("example.com.", 1), peer_v4()).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_string(response).await.contains("local resolution failed"));
        assert_eq!(h.stats.read().failures.local_resolution_failed, 1);
    }

    // ========================================================================
    // ECS Synthesis Tests
    // ========================================================================

    fn synth_headers(value: &str) -> HeaderMap {
        let mut headers = dns_headers();
        headers.insert(SYNTHESIZE_ECS_HEADER, value.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn test_synth_header_ipv4() {
        let local = CapturingResolver::new();
        let h = handler(local.clone(), HandlerOptions::default());

        let query = a_query("example.com.", 1);
        let response = h
            .handle(
                &Method::POST,
                &post_uri(),
                &synth_headers("24/64"),
                Bytes::from(query.to_vec().unwrap()),
                peer_v4(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let seen = local.last_seen();
        let ecs = dnsutil::find_ecs(&seen).expect("ECS synthesized");
        assert_eq!(ecs, ClientSubnet::from_str("192.0.2.0/24").unwrap());
        assert_eq!(h.stats.read().events.ecs_v4_synth, 1);
    }

    #[tokio::test]
    async fn test_synth_header_ipv6() {
        let local = CapturingResolver::new();
        let h = handler(local.clone(), HandlerOptions::default());

        let query = a_query("example.com.", 1);
        let response = h
            .handle(
                &Method::POST,
                &post_uri(),
                &synth_headers("24/48"),
                Bytes::from(query.to_vec().unwrap()),
                peer_v6(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let ecs = dnsutil::find_ecs(&local.last_seen()).expect("ECS synthesized");
        assert_eq!(ecs, ClientSubnet::from_str("2001:db8:1::/48").unwrap());
        assert_eq!(h.stats.read().events.ecs_v6_synth, 1);
    }

    #[tokio::test]
    async fn test_synth_zero_zero_means_no_ecs() {
        let options = HandlerOptions {
            ecs_set: true,
            ecs_set_ipv4_prefix_len: 24,
            ecs_set_ipv6_prefix_len: 64,
            ..HandlerOptions::default()
        };
        let local = CapturingResolver::new();
        let h = handler(local.clone(), options);

        // Query arrives with its own ECS *and* the server is configured to
        // set one, but the header says no.
        let mut query = a_query("example.com.", 1);
        query
            .extensions_mut()
            .get_or_insert_with(Edns::new)
            .options_mut()
            .insert(EdnsOption::Subnet(
                ClientSubnet::from_str("198.51.100.0/24").unwrap(),
            ));

        let response = h
            .handle(
                &Method::POST,
                &post_uri(),
                &synth_headers("0/0"),
                Bytes::from(query.to_vec().unwrap()),
                peer_v4(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(dnsutil::find_ecs(&local.last_seen()).is_none());
    }

    #[tokio::test]
    async fn test_synth_bad_ipv6_range() {
        let h = handler(CapturingResolver::new(), HandlerOptions::default());
        let query = a_query("example.com.", 1);

        let response = h
            .handle(
                &Method::POST,
                &post_uri(),
                &synth_headers("24/129"),
                Bytes::from(query.to_vec().unwrap()),
                peer_v4(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("not in range 0-128"));
        assert_eq!(h.stats.read().failures.bad_prefix_lengths, 1);
    }

    #[tokio::test]
    async fn test_synth_bad_shape() {
        let h = handler(CapturingResolver::new(), HandlerOptions::default());
        let query = a_query("example.com.", 1);

        let response = h
            .handle(
                &Method::POST,
                &post_uri(),
                &synth_headers("24"),
                Bytes::from(query.to_vec().unwrap()),
                peer_v4(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("ipv4prefixlen/ipv6prefixlen"));
    }

    #[tokio::test]
    async fn test_ecs_passthrough_by_default() {
        let local = CapturingResolver::new();
        let h = handler(local.clone(), HandlerOptions::default());

        let mut query = a_query("example.com.", 1);
        let original = ClientSubnet::from_str("198.51.100.0/24").unwrap();
        query
            .extensions_mut()
            .get_or_insert_with(Edns::new)
            .options_mut()
            .insert(EdnsOption::Subnet(original.clone()));

        post(&h, &query, peer_v4()).await;
        assert_eq!(dnsutil::find_ecs(&local.last_seen()), Some(original));
    }

    #[tokio::test]
    async fn test_ecs_remove() {
        let options = HandlerOptions {
            ecs_remove: true,
            ..HandlerOptions::default()
        };
        let local = CapturingResolver::new();
        let h = handler(local.clone(), options);

        let mut query = a_query("example.com.", 1);
        query
            .extensions_mut()
            .get_or_insert_with(Edns::new)
            .options_mut()
            .insert(EdnsOption::Subnet(
                ClientSubnet::from_str("198.51.100.0/24").unwrap(),
            ));

        post(&h, &query, peer_v4()).await;
        assert!(dnsutil::find_ecs(&local.last_seen()).is_none());
        assert_eq!(h.stats.read().events.edns0_removed, 1);
    }

    #[tokio::test]
    async fn test_ecs_set_without_header() {
        let options = HandlerOptions {
            ecs_set: true,
            ecs_set_ipv4_prefix_len: 24,
            ecs_set_ipv6_prefix_len: 64,
            ..HandlerOptions::default()
        };
        let local = CapturingResolver::new();
        let h = handler(local.clone(), options);

        post(&h, &a_query("example.com.", 1), peer_v4()).await;
        let ecs = dnsutil::find_ecs(&local.last_seen()).expect("ECS synthesized");
        assert_eq!(ecs, ClientSubnet::from_str("192.0.2.0/24").unwrap());
    }

    // ========================================================================
    // Padding Tests
    // ========================================================================

    #[tokio::test]
    async fn test_padding_signal_pads_response() {
        let local = CapturingResolver::new();
        let h = handler(local.clone(), HandlerOptions::default());

        let mut query = a_query("example.com.", 1);
        query
            .extensions_mut()
            .get_or_insert_with(Edns::new)
            .options_mut()
            .insert(EdnsOption::Unknown(EdnsCode::Padding.into(), vec![0; 17]));

        let response = post(&h, &query, peer_v4()).await;
        let body = body_of(response).await;

        assert_eq!(body.len() % RFC8467_SERVER_PAD_MODULO, 0);
        // The local resolver must not see the hop-by-hop padding.
        assert!(dnsutil::find_padding(&local.last_seen()).is_none());
        assert_eq!(h.stats.read().events.padding, 1);
    }

    #[tokio::test]
    async fn test_no_padding_without_signal() {
        let local = CapturingResolver::new();
        let h = handler(local.clone(), HandlerOptions::default());

        let response = post(&h, &a_query("example.com.", 1), peer_v4()).await;
        let reply = Message::from_vec(&body_of(response).await).unwrap();
        assert!(dnsutil::find_padding(&reply).is_none());
    }

    // ========================================================================
    // TSIG Immutability Tests
    // ========================================================================

    #[tokio::test]
    async fn test_signed_query_is_not_touched() {
        let options = HandlerOptions {
            ecs_remove: true,
            ..HandlerOptions::default()
        };
        let local = CapturingResolver::new();
        let h = handler(local.clone(), options);

        let mut query = a_query("example.com.", 1);
        query
            .extensions_mut()
            .get_or_insert_with(Edns::new)
            .options_mut()
            .insert(EdnsOption::Subnet(
                ClientSubnet::from_str("198.51.100.0/24").unwrap(),
            ));
        let mut tsig = Record::new();
        tsig.set_name(Name::from_str("key.example.").unwrap());
        tsig.set_record_type(RecordType::Unknown(250));
        query.add_additional(tsig);

        post(&h, &query, peer_v4()).await;
        assert!(
            dnsutil::find_ecs(&local.last_seen()).is_some(),
            "signed query ECS must survive"
        );
        assert_eq!(h.stats.read().events.tsig, 1);
    }

    // ========================================================================
    // Prefix Length Extraction Tests
    // ========================================================================

    #[test]
    fn test_extract_prefix_lengths() {
        assert_eq!(extract_prefix_lengths("24/64").unwrap(), (24, 64));
        assert_eq!(extract_prefix_lengths("0/0").unwrap(), (0, 0));
        assert_eq!(extract_prefix_lengths("32/128").unwrap(), (32, 128));

        assert!(extract_prefix_lengths("24").is_err());
        assert!(extract_prefix_lengths("24/64/1").is_err());
        assert!(extract_prefix_lengths("abc/64").is_err());
        assert!(extract_prefix_lengths("33/64").unwrap_err().contains("0-32"));
        assert!(extract_prefix_lengths("24/129").unwrap_err().contains("0-128"));
    }

    // ========================================================================
    // Reporter Tests
    // ========================================================================

    #[tokio::test]
    async fn test_report_and_reset() {
        let h = handler(CapturingResolver::new(), HandlerOptions::default());
        post(&h, &a_query("example.com.", 1), peer_v4()).await;

        assert!(h.report(true).contains("ok=1"));
        assert!(h.report(false).contains("ok=0"));
    }
}
