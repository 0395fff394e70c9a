//! The DoH server daemon: DoH in, local recursive resolution out.
//!
//! [`run`] builds the [`crate::resolver::local::LocalResolver`], binds one
//! HTTPS (or plain HTTP) listener per configured address and serves the
//! RFC 8484 endpoint through [`DohHandler`]. Each connection is tracked
//! for occupancy statistics; TLS handshake failures from clients are
//! counted since no later stage will ever see those connections.

pub mod config;
pub mod handler;

pub use config::ServerConfig;
pub use handler::{DohHandler, HandlerOptions};

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::constants::{MAXIMUM_VIABLE_DNS_MESSAGE, RFC8484_PATH};
use crate::error::{DnsError, DnsResult};
use crate::report::{run_reporting_loop, Reporter};
use crate::resolver::local::LocalResolver;
use crate::resolver::Resolver;
use crate::tlsutil;
use crate::tracker::{ConnState, ConnectionTracker};

/// Slack over the maximum DNS message size when reading request bodies.
const MAX_BODY_BYTES: usize = MAXIMUM_VIABLE_DNS_MESSAGE + 1024;

/// Run the DoH server daemon until a termination signal arrives.
///
/// # Errors
///
/// Fatal configuration, TLS or bind errors surface here before any
/// traffic is served; the caller turns them into a diagnostic and exit
/// code 1.
pub async fn run(config: ServerConfig) -> DnsResult<()> {
    config.validate()?;

    let local = Arc::new(LocalResolver::new(config.local.clone())?);
    let tls = match (&config.tls_cert_file, &config.tls_key_file) {
        (Some(cert), Some(key)) => Some(Arc::new(tlsutil::server_config(cert, key)?)),
        _ => None,
    };

    info!(
        listen = ?config.listen_addresses,
        tls = tls.is_some(),
        servers = ?local.servers(),
        local_domains = ?local.in_bailiwick_domains(),
        "DoH server starting"
    );

    let options = HandlerOptions {
        ecs_remove: config.ecs_remove,
        ecs_set: config.ecs_set,
        ecs_set_ipv4_prefix_len: config.ecs_set_ipv4_prefix_len,
        ecs_set_ipv6_prefix_len: config.ecs_set_ipv6_prefix_len,
        log_client_in: config.log_client_in,
        log_client_out: config.log_client_out,
    };

    // Listeners report fatal exits on the error channel; termination fans
    // out over the broadcast.
    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let (exit_tx, mut exit_rx) = tokio::sync::mpsc::channel::<DnsError>(4);
    let mut handles = Vec::new();
    let mut reporters: Vec<Arc<dyn Reporter>> = vec![local.clone() as Arc<dyn Reporter>];

    for address in &config.listen_addresses {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| DnsError::config(format!("cannot bind listener {address}: {e}")))?;
        let tracker = Arc::new(ConnectionTracker::new(address.clone()));
        let doh_handler = Arc::new(DohHandler::new(
            local.clone() as Arc<dyn Resolver>,
            options.clone(),
            address.clone(),
            Some(tracker.clone()),
        ));
        reporters.push(doh_handler.clone() as Arc<dyn Reporter>);
        reporters.push(tracker.clone() as Arc<dyn Reporter>);

        let acceptor = tls.clone().map(TlsAcceptor::from);
        let exit_tx = exit_tx.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        let log_tls_errors = config.log_tls_errors;
        handles.push(tokio::spawn(async move {
            let result = accept_loop(
                listener,
                acceptor,
                doh_handler,
                tracker,
                shutdown_rx,
                log_tls_errors,
            )
            .await;
            if let Err(e) = result {
                let _ = exit_tx.send(e).await;
            }
        }));
    }
    drop(exit_tx);

    let reporting = tokio::spawn(run_reporting_loop(config.report_interval, reporters));

    let fatal = tokio::select! {
        _ = crate::signals::wait_for_termination() => {
            info!("termination signal received, stopping listeners");
            None
        }
        exited = exit_rx.recv() => exited,
    };

    let _ = shutdown_tx.send(());
    for handle in handles {
        let _ = handle.await;
    }
    reporting.abort();

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Accept connections, do the optional TLS handshake and hand each
/// connection to hyper, until `shutdown` fires.
async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    doh_handler: Arc<DohHandler>,
    tracker: Arc<ConnectionTracker>,
    mut shutdown: broadcast::Receiver<()>,
    log_tls_errors: bool,
) -> DnsResult<()> {
    info!(listener = %doh_handler.listen_name(), "DoH listener ready");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(listener = %doh_handler.listen_name(), error = %e, "accept failed");
                    continue;
                }
            },
            _ = shutdown.recv() => {
                info!(listener = %doh_handler.listen_name(), "DoH listener stopping");
                return Ok(());
            }
        };

        let key = peer.to_string();
        tracker.conn_state(&key, Instant::now(), ConnState::New);

        let acceptor = acceptor.clone();
        let doh_handler = Arc::clone(&doh_handler);
        let tracker = Arc::clone(&tracker);
        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        serve_connection(tls_stream, &doh_handler, &tracker, peer).await;
                    }
                    Err(e) => {
                        // There is no request to attribute this to; count
                        // it as a client TLS fault on the listener.
                        doh_handler.note_client_tls_bad();
                        if log_tls_errors {
                            warn!(peer = %peer, error = %e, "Client TLS error");
                        }
                    }
                },
                None => serve_connection(stream, &doh_handler, &tracker, peer).await,
            }
            tracker.conn_state(&key, Instant::now(), ConnState::Closed);
        });
    }
}

/// Serve HTTP/1.1 or HTTP/2 requests on one connection.
async fn serve_connection<I>(
    io: I,
    doh_handler: &Arc<DohHandler>,
    tracker: &Arc<ConnectionTracker>,
    peer: SocketAddr,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handler = Arc::clone(doh_handler);
    let tracker_for_service = Arc::clone(tracker);
    let service = service_fn(move |request: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        let tracker = Arc::clone(&tracker_for_service);
        let key = peer.to_string();
        async move {
            // Only the RFC 8484 well-known path is served.
            if request.uri().path() != RFC8484_PATH {
                return Ok::<_, Infallible>(plain_response(StatusCode::NOT_FOUND, "404 page not found"));
            }

            tracker.conn_state(&key, Instant::now(), ConnState::Active);
            let (parts, body) = request.into_parts();
            let response = match Limited::new(body, MAX_BODY_BYTES).collect().await {
                Ok(collected) => {
                    handler
                        .handle(
                            &parts.method,
                            &parts.uri,
                            &parts.headers,
                            collected.to_bytes(),
                            peer,
                        )
                        .await
                }
                Err(e) => handler.body_read_error_response(&e.to_string()),
            };
            tracker.conn_state(&key, Instant::now(), ConnState::Idle);

            Ok(response)
        }
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        doh_handler.note_http_write_failed();
        debug!(peer = %peer, error = %e, "connection ended with error");
    }
}

fn plain_response(status: StatusCode, msg: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(format!("{msg}\n"))));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_rejects_empty_config() {
        assert!(run(ServerConfig::default()).await.unwrap_err().is_config());
    }

    #[tokio::test]
    async fn test_run_rejects_missing_resolv_conf() {
        let config = ServerConfig {
            listen_addresses: vec!["127.0.0.1:0".to_string()],
            local: crate::resolver::local::LocalConfig {
                resolv_conf_path: "/no/such/resolv.conf".to_string(),
                local_domains: vec![],
            },
            ..ServerConfig::default()
        };
        assert!(run(config).await.unwrap_err().is_config());
    }

    #[test]
    fn test_plain_response() {
        let response = plain_response(StatusCode::NOT_FOUND, "404 page not found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
