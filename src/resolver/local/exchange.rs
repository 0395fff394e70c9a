//! DNS wire seam for the stub resolver.
//!
//! [`Exchanger`] is the only surface the stub resolver needs from the
//! network: send a query to a server, get back the reply and the round
//! trip time. Production implementations exist for UDP and for TCP with
//! its 2-byte length framing; tests supply mocks.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::constants::MAXIMUM_VIABLE_DNS_MESSAGE;
use crate::error::{DnsError, DnsResult};

/// Default per-exchange timeout. The resolver enforces its own cumulative
/// budget on top of this.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Receive buffer large enough for EDNS0 responses.
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// One query/reply exchange with a name server.
#[async_trait]
pub trait Exchanger: Send + Sync + fmt::Debug {
    /// Send `query` to `server` (an `ip:port` string) and return the reply
    /// with the round trip time.
    async fn exchange(&self, query: &Message, server: &str) -> DnsResult<(Message, Duration)>;
}

fn parse_server(server: &str) -> DnsResult<SocketAddr> {
    server
        .parse()
        .map_err(|e| DnsError::config(format!("bad name server address {server}: {e}")))
}

fn check_reply(query: &Message, reply: &Message, server: &str) -> DnsResult<()> {
    if reply.id() != query.id() {
        return Err(DnsError::upstream(
            server,
            format!("reply ID {} does not match query ID {}", reply.id(), query.id()),
        ));
    }
    Ok(())
}

/// UDP exchanger. Stateless: each exchange binds a fresh socket so replies
/// cannot cross between concurrent queries.
#[derive(Debug, Clone)]
pub struct UdpExchanger {
    timeout: Duration,
}

impl UdpExchanger {
    /// Construct with a per-exchange timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for UdpExchanger {
    fn default() -> Self {
        Self::new(DEFAULT_EXCHANGE_TIMEOUT)
    }
}

#[async_trait]
impl Exchanger for UdpExchanger {
    async fn exchange(&self, query: &Message, server: &str) -> DnsResult<(Message, Duration)> {
        let server_addr = parse_server(server)?;
        let query_bytes = query
            .to_vec()
            .map_err(|e| DnsError::serialize(e.to_string()))?;

        let bind_addr = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DnsError::network_io("failed to bind UDP socket", e))?;

        let start = Instant::now();
        socket
            .send_to(&query_bytes, server_addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to send UDP query to {server}"), e))?;

        let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
        loop {
            let (len, src) = match timeout(self.timeout, socket.recv_from(&mut buf)).await {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    return Err(DnsError::network_io(
                        format!("failed to receive UDP reply from {server}"),
                        e,
                    ))
                }
                Err(_) => {
                    return Err(DnsError::timeout(format!("UDP query to {server}"), self.timeout))
                }
            };

            // Datagrams from anyone but the queried server are dropped.
            if src != server_addr {
                continue;
            }

            let reply = Message::from_vec(&buf[..len])
                .map_err(|e| DnsError::parse(format!("bad UDP reply from {server}: {e}")))?;
            check_reply(query, &reply, server)?;
            return Ok((reply, start.elapsed()));
        }
    }
}

/// TCP exchanger using RFC 1035 2-byte length framing. One connection per
/// exchange; the stub resolver's TCP traffic is rare enough (truncation
/// fallback only) that pooling buys nothing.
#[derive(Debug, Clone)]
pub struct TcpExchanger {
    timeout: Duration,
}

impl TcpExchanger {
    /// Construct with a per-exchange timeout covering connect, write and
    /// read.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpExchanger {
    fn default() -> Self {
        Self::new(DEFAULT_EXCHANGE_TIMEOUT)
    }
}

#[async_trait]
impl Exchanger for TcpExchanger {
    async fn exchange(&self, query: &Message, server: &str) -> DnsResult<(Message, Duration)> {
        let server_addr = parse_server(server)?;
        let query_bytes = query
            .to_vec()
            .map_err(|e| DnsError::serialize(e.to_string()))?;
        if query_bytes.len() > MAXIMUM_VIABLE_DNS_MESSAGE {
            return Err(DnsError::serialize(format!(
                "query of {} bytes exceeds TCP limit",
                query_bytes.len()
            )));
        }

        let start = Instant::now();
        let exchange = async {
            let mut stream = TcpStream::connect(server_addr).await.map_err(|e| {
                DnsError::network_io(format!("failed to connect to {server}"), e)
            })?;

            let len = u16::try_from(query_bytes.len())
                .map_err(|_| DnsError::serialize("query too large for length prefix"))?;
            stream
                .write_all(&len.to_be_bytes())
                .await
                .map_err(|e| DnsError::network_io("failed to write length prefix", e))?;
            stream
                .write_all(&query_bytes)
                .await
                .map_err(|e| DnsError::network_io("failed to write query", e))?;

            let mut len_buf = [0u8; 2];
            stream
                .read_exact(&mut len_buf)
                .await
                .map_err(|e| DnsError::network_io("failed to read length prefix", e))?;
            let reply_len = usize::from(u16::from_be_bytes(len_buf));

            let mut reply_buf = vec![0u8; reply_len];
            stream
                .read_exact(&mut reply_buf)
                .await
                .map_err(|e| DnsError::network_io("failed to read reply", e))?;

            Message::from_vec(&reply_buf)
                .map_err(|e| DnsError::parse(format!("bad TCP reply from {server}: {e}")))
        };

        let reply = timeout(self.timeout, exchange)
            .await
            .map_err(|_| DnsError::timeout(format!("TCP query to {server}"), self.timeout))??;
        check_reply(query, &reply, server)?;

        Ok((reply, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn a_query(id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));
        msg
    }

    #[test]
    fn test_parse_server() {
        assert!(parse_server("10.0.0.1:53").is_ok());
        assert!(parse_server("[2001:db8::1]:53").is_ok());
        assert!(parse_server("10.0.0.1").is_err()); // port required
        assert!(parse_server("garbage").is_err());
    }

    #[test]
    fn test_check_reply_id() {
        let query = a_query(7);
        let mut reply = a_query(7);
        reply.set_message_type(MessageType::Response);
        assert!(check_reply(&query, &reply, "x").is_ok());

        let mut wrong = a_query(8);
        wrong.set_message_type(MessageType::Response);
        assert!(check_reply(&query, &wrong, "x").is_err());
    }

    #[tokio::test]
    async fn test_udp_against_local_socket() {
        // Stand up a one-shot UDP responder that echoes a response with
        // the same ID.
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = format!("{}", responder.local_addr().unwrap());

        let serve = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, src) = responder.recv_from(&mut buf).await.unwrap();
            let mut msg = Message::from_vec(&buf[..len]).unwrap();
            msg.set_message_type(MessageType::Response);
            responder.send_to(&msg.to_vec().unwrap(), src).await.unwrap();
        });

        let exchanger = UdpExchanger::default();
        let (reply, rtt) = exchanger.exchange(&a_query(0x0101), &server).await.unwrap();
        assert_eq!(reply.id(), 0x0101);
        assert!(rtt > Duration::ZERO);
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_timeout() {
        // A bound socket that never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = format!("{}", silent.local_addr().unwrap());

        let exchanger = UdpExchanger::new(Duration::from_millis(50));
        let err = exchanger.exchange(&a_query(1), &server).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_tcp_against_local_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = format!("{}", listener.local_addr().unwrap());

        let serve = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
            stream.read_exact(&mut buf).await.unwrap();

            let mut msg = Message::from_vec(&buf).unwrap();
            msg.set_message_type(MessageType::Response);
            let out = msg.to_vec().unwrap();
            let out_len = u16::try_from(out.len()).unwrap();
            stream.write_all(&out_len.to_be_bytes()).await.unwrap();
            stream.write_all(&out).await.unwrap();
        });

        let exchanger = TcpExchanger::default();
        let (reply, _) = exchanger.exchange(&a_query(0x0202), &server).await.unwrap();
        assert_eq!(reply.id(), 0x0202);
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connect_failure() {
        // Port 1 on localhost is almost certainly closed.
        let exchanger = TcpExchanger::new(Duration::from_millis(200));
        let result = exchanger.exchange(&a_query(1), "127.0.0.1:1").await;
        assert!(result.is_err());
    }
}
