//! The DNS front end: translate conventional DNS queries into resolver
//! calls and translate the responses back, truncating where UDP demands.
//!
//! A response from an upstream DoH server can easily be larger than the
//! downstream client allows over UDP, so the proxy truncates and sets
//! TC=1. A DoH response can also arrive with TC=1 already set, and that
//! must survive to the client: under no circumstances is TC=1 ever
//! cleared. Hiding it would rob the client of the ability to make a fully
//! informed retry choice. In the same vein as much of the response as
//! possible is retained when truncating: a client incapable of a TCP
//! re-query at least gets something to work with, and in the common case
//! of an address lookup some answers will fit.
//!
//! On resolver failure no reply is sent at all; retrying is the DNS
//! client's responsibility.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::constants::{DNS_TRUNCATE_THRESHOLD, MAXIMUM_VIABLE_DNS_MESSAGE};
use crate::dnsutil;
use crate::error::{DnsError, DnsResult};
use crate::report::Reporter;
use crate::resolver::{DnsTransport, QueryMetaData, Resolver};
use crate::tracker::ConcurrencyCounter;

/// Maximum bytes accepted for a single inbound UDP datagram.
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// How long a quiet inbound TCP connection is kept open.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Clone, Copy)]
struct ProxyStats {
    success: u64,
    total_latency: Duration,
    parse_errors: u64,
    no_response: u64,
    dns_write_failed: u64,
    in_truncated: u64,
    out_truncated: u64,
}

/// One DNS listener's worth of proxy state. A listener serves a single
/// (address, transport) tuple; the resolvers are shared between them.
pub struct ProxyServer {
    remote: Arc<dyn Resolver>,
    local: Option<Arc<dyn Resolver>>,
    listen_address: String,
    transport: DnsTransport,
    log_client_in: bool,
    log_client_out: bool,
    concurrency: ConcurrencyCounter,
    stats: RwLock<ProxyStats>,
}

impl ProxyServer {
    /// Create the proxy state for one listener.
    pub fn new(
        remote: Arc<dyn Resolver>,
        local: Option<Arc<dyn Resolver>>,
        listen_address: impl Into<String>,
        transport: DnsTransport,
    ) -> Self {
        Self {
            remote,
            local,
            listen_address: listen_address.into(),
            transport,
            log_client_in: false,
            log_client_out: false,
            concurrency: ConcurrencyCounter::default(),
            stats: RwLock::new(ProxyStats::default()),
        }
    }

    /// Enable per-query logging.
    pub fn with_query_logging(mut self, log_in: bool, log_out: bool) -> Self {
        self.log_client_in = log_in;
        self.log_client_out = log_out;
        self
    }

    /// The listener identity for logs and reports.
    pub fn listen_name(&self) -> String {
        format!("{}/{}", self.listen_address, self.transport)
    }

    /// Peak concurrent requests seen, optionally resetting the peak.
    pub fn peak_concurrency(&self, reset: bool) -> u64 {
        self.concurrency.peak(reset)
    }

    /// Note that a listener failed to write a reply to its client.
    pub fn note_write_failed(&self) {
        self.stats.write().dns_write_failed += 1;
    }

    /// Handle one wire-format DNS query, returning the wire-format reply
    /// or None when no reply should be sent.
    pub async fn handle_request(&self, wire: &[u8]) -> Option<Vec<u8>> {
        self.concurrency.add();
        let result = self.process(wire).await;
        self.concurrency.done();
        result
    }

    async fn process(&self, wire: &[u8]) -> Option<Vec<u8>> {
        let query = match Message::from_vec(wire) {
            Ok(query) => query,
            Err(e) => {
                self.stats.write().parse_errors += 1;
                debug!(listener = %self.listen_name(), error = %e, "dropping unparseable query");
                return None;
            }
        };

        // Default to the remote DoH resolver; only use the local resolver
        // when one is configured and the name is in its bailiwick.
        let qname = query.queries().first().map(|q| q.name().to_string());
        let resolver: &Arc<dyn Resolver> = match (&self.local, &qname) {
            (Some(local), Some(name)) if local.in_bailiwick(name) => local,
            _ => &self.remote,
        };

        if self.log_client_in {
            info!(listener = %self.listen_name(), query = %dnsutil::compact_msg_string(&query), "client query");
        }

        // Stub resolvers manage failures and timeouts themselves so there
        // is no retry loop here. An error cannot be sensibly translated
        // into a DNS response either; stay silent and let the client
        // retry if it chooses to.
        let start = Instant::now();
        let query_meta = QueryMetaData {
            transport: self.transport,
        };
        let (mut response, resp_meta) = match resolver.resolve(&query, &query_meta).await {
            Ok(resolved) => resolved,
            Err(e) => {
                self.stats.write().no_response += 1;
                if self.log_client_out {
                    warn!(
                        listener = %self.listen_name(),
                        query = %dnsutil::compact_msg_string(&query),
                        error = %e,
                        "resolution failed, no reply sent"
                    );
                }
                return None;
            }
        };
        let duration = start.elapsed();

        let upstream_truncated = response.truncated();
        let mut out_truncated = false;

        let mut packed = match response.to_vec() {
            Ok(packed) => packed,
            Err(e) => {
                self.stats.write().no_response += 1;
                warn!(listener = %self.listen_name(), error = %e, "response pack failed");
                return None;
            }
        };

        // The client's size limit comes from the inbound query's OPT, not
        // from any residual OPT in the DoH response.
        if self.transport == DnsTransport::Udp && packed.len() > DNS_TRUNCATE_THRESHOLD {
            let mut limit = DNS_TRUNCATE_THRESHOLD;
            if let Some(udp_size) = dnsutil::edns_udp_size(&query) {
                if usize::from(udp_size) > limit {
                    limit = usize::from(udp_size).min(MAXIMUM_VIABLE_DNS_MESSAGE);
                }
            }
            if packed.len() > limit {
                out_truncated = true;
                match truncate_response(&mut response, limit) {
                    Ok(truncated) => packed = truncated,
                    Err(e) => {
                        self.stats.write().no_response += 1;
                        warn!(listener = %self.listen_name(), error = %e, "truncation failed");
                        return None;
                    }
                }
            }
        }

        let mut stats = self.stats.write();
        stats.success += 1;
        stats.total_latency += duration;
        if upstream_truncated {
            stats.in_truncated += 1;
        }
        if out_truncated {
            stats.out_truncated += 1;
        }
        drop(stats);

        if self.log_client_out {
            info!(
                listener = %self.listen_name(),
                response = %dnsutil::compact_msg_string(&response),
                tries = resp_meta.query_tries,
                server = %resp_meta.final_server_used,
                elapsed = ?duration,
                "client response"
            );
        }

        Some(packed)
    }

    /// Serve UDP queries from `socket` until `shutdown` fires.
    pub async fn run_udp(
        self: Arc<Self>,
        socket: UdpSocket,
        mut shutdown: broadcast::Receiver<()>,
    ) -> DnsResult<()> {
        let socket = Arc::new(socket);
        info!(listener = %self.listen_name(), "DNS/UDP listener ready");

        let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
        loop {
            let (len, peer) = tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(listener = %self.listen_name(), error = %e, "UDP receive failed");
                        continue;
                    }
                },
                _ = shutdown.recv() => {
                    info!(listener = %self.listen_name(), "DNS/UDP listener stopping");
                    return Ok(());
                }
            };

            let wire = buf[..len].to_vec();
            let server = Arc::clone(&self);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                if let Some(reply) = server.handle_request(&wire).await {
                    if let Err(e) = socket.send_to(&reply, peer).await {
                        server.note_write_failed();
                        debug!(peer = %peer, error = %e, "UDP reply write failed");
                    }
                }
            });
        }
    }

    /// Serve TCP queries from `listener` until `shutdown` fires.
    pub async fn run_tcp(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> DnsResult<()> {
        info!(listener = %self.listen_name(), "DNS/TCP listener ready");

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(listener = %self.listen_name(), error = %e, "TCP accept failed");
                        continue;
                    }
                },
                _ = shutdown.recv() => {
                    info!(listener = %self.listen_name(), "DNS/TCP listener stopping");
                    return Ok(());
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                trace!(peer = %peer, "TCP connection accepted");
                if let Err(e) = server.serve_tcp_conn(stream).await {
                    debug!(peer = %peer, error = %e, "TCP connection ended");
                }
            });
        }
    }

    /// Serve length-prefixed queries on one TCP connection until the
    /// client closes it or goes quiet.
    async fn serve_tcp_conn(&self, mut stream: tokio::net::TcpStream) -> DnsResult<()> {
        loop {
            let mut len_buf = [0u8; 2];
            match tokio::time::timeout(TCP_IDLE_TIMEOUT, stream.read_exact(&mut len_buf)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => return Ok(()), // EOF or idle, done
            }

            let len = usize::from(u16::from_be_bytes(len_buf));
            let mut wire = vec![0u8; len];
            stream
                .read_exact(&mut wire)
                .await
                .map_err(|e| DnsError::network_io("TCP query read failed", e))?;

            if let Some(reply) = self.handle_request(&wire).await {
                let reply_len = u16::try_from(reply.len())
                    .map_err(|_| DnsError::serialize("reply too large for TCP framing"))?;
                let write = async {
                    stream.write_all(&reply_len.to_be_bytes()).await?;
                    stream.write_all(&reply).await
                };
                if let Err(e) = write.await {
                    self.note_write_failed();
                    return Err(DnsError::network_io("TCP reply write failed", e));
                }
            }
        }
    }
}

/// Trim the response down to `limit` packed bytes by dropping records from
/// the tail of the additional, then authority, then answer sections. The
/// question (and any EDNS OPT) always survives. TC is set whenever a
/// record was dropped; it is never cleared.
///
/// The serializer is the ground truth for wire length: name-compression
/// choices make any estimator unreliable, so the message is repacked after
/// every drop.
fn truncate_response(response: &mut Message, limit: usize) -> DnsResult<Vec<u8>> {
    let mut packed = response
        .to_vec()
        .map_err(|e| DnsError::serialize(e.to_string()))?;
    let mut dropped = false;

    while packed.len() > limit {
        let removed = response.additionals_mut().pop().is_some()
            || response.name_servers_mut().pop().is_some()
            || response.answers_mut().pop().is_some();
        if !removed {
            break; // nothing left but the question, send what we have
        }
        dropped = true;
        packed = response
            .to_vec()
            .map_err(|e| DnsError::serialize(e.to_string()))?;
    }

    if dropped {
        response.set_truncated(true);
        packed = response
            .to_vec()
            .map_err(|e| DnsError::serialize(e.to_string()))?;
    }

    Ok(packed)
}

impl Reporter for ProxyServer {
    fn name(&self) -> String {
        format!("proxy ({})", self.listen_name())
    }

    fn report(&self, reset: bool) -> String {
        let mut stats = self.stats.write();
        let line = format!(
            "ok={} latency={:?} peak={} no-response={} write-failed={} parse-errors={} tc in/out={}/{}",
            stats.success,
            stats.total_latency,
            self.concurrency.peak(reset),
            stats.no_response,
            stats.dns_write_failed,
            stats.parse_errors,
            stats.in_truncated,
            stats.out_truncated,
        );
        if reset {
            *stats = ProxyStats::default();
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DnsError;
    use crate::resolver::ResponseMetaData;
    use async_trait::async_trait;
    use hickory_proto::op::{Edns, MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
    use std::str::FromStr;

    // ========================================================================
    // Mock Resolver
    // ========================================================================

    #[derive(Debug)]
    struct MockResolver {
        bailiwick_suffix: Option<&'static str>,
        reply: Option<Message>,
        calls: parking_lot::Mutex<u64>,
    }

    impl MockResolver {
        fn answering(reply: Message) -> Arc<Self> {
            Arc::new(Self {
                bailiwick_suffix: None,
                reply: Some(reply),
                calls: parking_lot::Mutex::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                bailiwick_suffix: None,
                reply: None,
                calls: parking_lot::Mutex::new(0),
            })
        }

        fn scoped(suffix: &'static str, reply: Message) -> Arc<Self> {
            Arc::new(Self {
                bailiwick_suffix: Some(suffix),
                reply: Some(reply),
                calls: parking_lot::Mutex::new(0),
            })
        }

        fn calls(&self) -> u64 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl Resolver for MockResolver {
        fn in_bailiwick(&self, qname: &str) -> bool {
            match self.bailiwick_suffix {
                Some(suffix) => qname.to_lowercase().ends_with(suffix),
                None => true,
            }
        }

        async fn resolve(
            &self,
            _query: &Message,
            _meta: &QueryMetaData,
        ) -> DnsResult<(Message, ResponseMetaData)> {
            *self.calls.lock() += 1;
            match &self.reply {
                Some(reply) => Ok((reply.clone(), ResponseMetaData::default())),
                None => Err(DnsError::network("mock resolution failure")),
            }
        }
    }

    // ========================================================================
    // Helper Functions
    // ========================================================================

    fn a_query(name: &str, id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        msg
    }

    fn query_with_udp_size(name: &str, id: u16, udp_size: u16) -> Message {
        let mut msg = a_query(name, id);
        let mut edns = Edns::new();
        edns.set_max_payload(udp_size);
        *msg.extensions_mut() = Some(edns);
        msg
    }

    /// A response whose packed size comfortably exceeds the UDP
    /// threshold: sixty A records compress to roughly a kilobyte.
    fn big_response(name: &str, id: u16, answers: usize) -> Message {
        let mut msg = a_query(name, id);
        msg.set_message_type(MessageType::Response);
        msg.set_response_code(ResponseCode::NoError);
        for i in 0..answers {
            let mut record = Record::new();
            record.set_name(Name::from_str(name).unwrap());
            record.set_record_type(RecordType::A);
            record.set_dns_class(DNSClass::IN);
            record.set_ttl(300);
            record.set_data(Some(RData::A(A(std::net::Ipv4Addr::new(
                192,
                0,
                2,
                (i % 250) as u8,
            )))));
            msg.add_answer(record);
        }
        msg
    }

    fn udp_proxy(remote: Arc<dyn Resolver>) -> ProxyServer {
        ProxyServer::new(remote, None, "127.0.0.1:53", DnsTransport::Udp)
    }

    fn tcp_proxy(remote: Arc<dyn Resolver>) -> ProxyServer {
        ProxyServer::new(remote, None, "127.0.0.1:53", DnsTransport::Tcp)
    }

    // ========================================================================
    // Basic Lookup Tests
    // ========================================================================

    #[tokio::test]
    async fn test_basic_lookup_passes_resolver_reply_through() {
        // The resolver's reply goes to the client as-is, including its ID.
        let mut upstream_reply = a_query("example.com.", 4001);
        upstream_reply.set_message_type(MessageType::Response);
        let proxy = udp_proxy(MockResolver::answering(upstream_reply));

        let query = a_query("example.com.", 23);
        let reply = proxy.handle_request(&query.to_vec().unwrap()).await.unwrap();
        let reply = Message::from_vec(&reply).unwrap();

        assert_eq!(reply.id(), 4001);
        assert_eq!(reply.answers().len(), 0);
        assert_eq!(proxy.stats.read().success, 1);
        assert_eq!(proxy.peak_concurrency(false), 1);
    }

    #[tokio::test]
    async fn test_resolver_error_means_silence() {
        let proxy = udp_proxy(MockResolver::failing());
        let query = a_query("example.com.", 1);

        assert!(proxy.handle_request(&query.to_vec().unwrap()).await.is_none());
        assert_eq!(proxy.stats.read().no_response, 1);
    }

    #[tokio::test]
    async fn test_unparseable_query_dropped() {
        let proxy = udp_proxy(MockResolver::failing());
        assert!(proxy.handle_request(&[0u8; 3]).await.is_none());
        assert_eq!(proxy.stats.read().parse_errors, 1);
    }

    // ========================================================================
    // Bailiwick Routing Tests
    // ========================================================================

    #[tokio::test]
    async fn test_local_names_route_to_local_resolver() {
        let mut remote_reply = a_query("other.org.", 1);
        remote_reply.set_message_type(MessageType::Response);
        let remote = MockResolver::answering(remote_reply);

        let mut local_reply = a_query("host.corp.example.", 1);
        local_reply.set_message_type(MessageType::Response);
        let local = MockResolver::scoped("corp.example.", local_reply);

        let proxy = ProxyServer::new(
            remote.clone(),
            Some(local.clone() as Arc<dyn Resolver>),
            "127.0.0.1:53",
            DnsTransport::Udp,
        );

        let query = a_query("host.corp.example.", 5);
        proxy.handle_request(&query.to_vec().unwrap()).await.unwrap();
        assert_eq!(local.calls(), 1);
        assert_eq!(remote.calls(), 0);

        let query = a_query("www.other.org.", 6);
        proxy.handle_request(&query.to_vec().unwrap()).await.unwrap();
        assert_eq!(local.calls(), 1);
        assert_eq!(remote.calls(), 1);
    }

    // ========================================================================
    // Truncation Tests
    // ========================================================================

    #[tokio::test]
    async fn test_udp_truncation_without_edns() {
        let response = big_response("example.com.", 2, 60);
        let full_len = response.to_vec().unwrap().len();
        assert!(full_len > 512, "test premise: response must exceed 512");

        let proxy = udp_proxy(MockResolver::answering(response));
        let query = a_query("example.com.", 2);
        let reply = proxy.handle_request(&query.to_vec().unwrap()).await.unwrap();

        assert!(reply.len() <= 512, "reply of {} bytes exceeds 512", reply.len());
        let reply = Message::from_vec(&reply).unwrap();
        assert!(reply.truncated());
        assert!(reply.answers().len() < 60);
        assert_eq!(reply.queries().len(), 1);
        assert_eq!(proxy.stats.read().out_truncated, 1);
    }

    #[tokio::test]
    async fn test_client_edns_raises_limit() {
        let response = big_response("example.com.", 3, 60);
        let full_len = response.to_vec().unwrap().len();
        assert!(full_len > 512);

        let proxy = udp_proxy(MockResolver::answering(response));
        // The client advertises room for the whole response.
        let udp_size = u16::try_from(full_len + 1).unwrap();
        let query = query_with_udp_size("example.com.", 3, udp_size);
        let reply = proxy.handle_request(&query.to_vec().unwrap()).await.unwrap();

        assert_eq!(reply.len(), full_len);
        let reply = Message::from_vec(&reply).unwrap();
        assert!(!reply.truncated());
        assert_eq!(reply.answers().len(), 60);
    }

    #[tokio::test]
    async fn test_client_edns_partial_limit() {
        let response = big_response("example.com.", 4, 60);
        let proxy = udp_proxy(MockResolver::answering(response));

        let query = query_with_udp_size("example.com.", 4, 768);
        let reply = proxy.handle_request(&query.to_vec().unwrap()).await.unwrap();

        assert!(reply.len() <= 768);
        assert!(reply.len() >= 600, "over-trimmed to {} bytes", reply.len());
        assert!(Message::from_vec(&reply).unwrap().truncated());
    }

    #[tokio::test]
    async fn test_small_client_edns_does_not_lower_limit() {
        // A UDPSize below 512 must not reduce the threshold.
        let response = big_response("example.com.", 4, 15);
        let full_len = response.to_vec().unwrap().len();
        assert!(full_len <= 512);

        let proxy = udp_proxy(MockResolver::answering(response));
        let query = query_with_udp_size("example.com.", 4, 200);
        let reply = proxy.handle_request(&query.to_vec().unwrap()).await.unwrap();
        assert_eq!(reply.len(), full_len);
    }

    #[tokio::test]
    async fn test_tcp_never_truncates() {
        let response = big_response("example.com.", 5, 60);
        let full_len = response.to_vec().unwrap().len();

        let proxy = tcp_proxy(MockResolver::answering(response));
        let query = a_query("example.com.", 5);
        let reply = proxy.handle_request(&query.to_vec().unwrap()).await.unwrap();

        assert_eq!(reply.len(), full_len);
        assert!(!Message::from_vec(&reply).unwrap().truncated());
    }

    #[tokio::test]
    async fn test_upstream_tc_is_preserved() {
        let mut response = a_query("example.com.", 6);
        response.set_message_type(MessageType::Response);
        response.set_truncated(true);

        let proxy = udp_proxy(MockResolver::answering(response));
        let query = a_query("example.com.", 6);
        let reply = proxy.handle_request(&query.to_vec().unwrap()).await.unwrap();

        assert!(Message::from_vec(&reply).unwrap().truncated());
        assert_eq!(proxy.stats.read().in_truncated, 1);
        assert_eq!(proxy.stats.read().out_truncated, 0);
    }

    #[tokio::test]
    async fn test_truncation_preserves_upstream_tc_and_sets_its_own() {
        let mut response = big_response("example.com.", 7, 60);
        response.set_truncated(true);

        let proxy = udp_proxy(MockResolver::answering(response));
        let query = a_query("example.com.", 7);
        let reply = proxy.handle_request(&query.to_vec().unwrap()).await.unwrap();

        let reply = Message::from_vec(&reply).unwrap();
        assert!(reply.truncated());
        let stats = proxy.stats.read();
        assert_eq!(stats.in_truncated, 1);
        assert_eq!(stats.out_truncated, 1);
    }

    // ========================================================================
    // truncate_response Unit Tests
    // ========================================================================

    #[test]
    fn test_truncate_drops_tail_sections_first() {
        let mut msg = big_response("example.com.", 1, 10);
        let mut ns = Record::new();
        ns.set_name(Name::from_str("example.com.").unwrap());
        ns.set_record_type(RecordType::A);
        ns.set_dns_class(DNSClass::IN);
        ns.set_ttl(300);
        ns.set_data(Some(RData::A(A(std::net::Ipv4Addr::new(192, 0, 2, 251)))));
        msg.add_name_server(ns.clone());
        msg.add_additional(ns);

        let before_answers = msg.answers().len();
        // Limit chosen so only the extra/authority records need to go.
        let limit = msg.to_vec().unwrap().len() - 20;
        let packed = truncate_response(&mut msg, limit).unwrap();

        assert!(packed.len() <= limit);
        assert_eq!(msg.additionals().len(), 0);
        assert_eq!(msg.answers().len(), before_answers, "answers trimmed too early");
        assert!(msg.truncated());
    }

    #[test]
    fn test_truncate_keeps_question_when_limit_tiny() {
        let mut msg = big_response("example.com.", 1, 5);
        let packed = truncate_response(&mut msg, 1).unwrap();

        // Everything droppable went, the question survives.
        assert_eq!(msg.queries().len(), 1);
        assert_eq!(msg.answers().len(), 0);
        assert!(msg.truncated());
        assert!(packed.len() > 1); // can't fit, sent anyway
    }

    #[test]
    fn test_truncate_noop_when_under_limit() {
        let mut msg = big_response("example.com.", 1, 2);
        let full_len = msg.to_vec().unwrap().len();
        let packed = truncate_response(&mut msg, 4096).unwrap();

        assert_eq!(packed.len(), full_len);
        assert!(!msg.truncated());
    }
}
