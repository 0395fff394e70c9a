//! The proxy daemon: conventional DNS in, DoH out.
//!
//! [`run`] wires the pieces together: a [`crate::resolver::doh::DohResolver`]
//! for the wide world, an optional [`crate::resolver::local::LocalResolver`]
//! for split-horizon names, one [`ProxyServer`] listener per configured
//! (address, transport) tuple, a periodic statistics report and graceful
//! shutdown on SIGINT/SIGTERM.

pub mod config;
pub mod server;

pub use config::ProxyConfig;
pub use server::ProxyServer;

use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tracing::info;

use crate::error::{DnsError, DnsResult};
use crate::report::{run_reporting_loop, Reporter};
use crate::resolver::doh::{DohResolver, HyperExchange};
use crate::resolver::local::LocalResolver;
use crate::resolver::{DnsTransport, Resolver};
use crate::tlsutil;

/// Run the proxy daemon until a termination signal arrives.
///
/// # Errors
///
/// Fatal configuration or bind errors surface here before any traffic is
/// served; the caller turns them into a diagnostic and exit code 1.
pub async fn run(config: ProxyConfig) -> DnsResult<()> {
    config.validate()?;

    let tls = tlsutil::client_config(&config.tls)?;
    let exchange = Arc::new(HyperExchange::new(
        tls,
        config.doh.request_timeout,
        config.doh.max_connections_per_host,
    ));
    let remote = Arc::new(DohResolver::new(config.doh.clone(), exchange)?);
    let local = match &config.local {
        Some(local_config) => Some(Arc::new(LocalResolver::new(local_config.clone())?)),
        None => None,
    };

    info!(
        upstreams = ?remote.servers(),
        local_domains = ?local.as_ref().map(|l| l.in_bailiwick_domains()),
        "proxy starting"
    );

    // Termination fans out to every listener; capacity covers the small
    // burst of a signal racing listener exits. Listeners report fatal
    // exits on the error channel.
    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let (exit_tx, mut exit_rx) = tokio::sync::mpsc::channel::<DnsError>(4);
    let mut handles = Vec::new();
    let mut reporters: Vec<Arc<dyn Reporter>> = vec![remote.clone() as Arc<dyn Reporter>];
    if let Some(local) = &local {
        reporters.push(local.clone() as Arc<dyn Reporter>);
    }

    for address in &config.listen_addresses {
        if config.udp {
            let socket = UdpSocket::bind(address).await.map_err(|e| {
                DnsError::config(format!("cannot bind UDP listener {address}: {e}"))
            })?;
            let proxy = Arc::new(
                ProxyServer::new(
                    remote.clone() as Arc<dyn Resolver>,
                    local.clone().map(|l| l as Arc<dyn Resolver>),
                    address.clone(),
                    DnsTransport::Udp,
                )
                .with_query_logging(config.log_client_in, config.log_client_out),
            );
            reporters.push(proxy.clone() as Arc<dyn Reporter>);
            let exit_tx = exit_tx.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = proxy.run_udp(socket, shutdown_rx).await {
                    let _ = exit_tx.send(e).await;
                }
            }));
        }
        if config.tcp {
            let listener = TcpListener::bind(address).await.map_err(|e| {
                DnsError::config(format!("cannot bind TCP listener {address}: {e}"))
            })?;
            let proxy = Arc::new(
                ProxyServer::new(
                    remote.clone() as Arc<dyn Resolver>,
                    local.clone().map(|l| l as Arc<dyn Resolver>),
                    address.clone(),
                    DnsTransport::Tcp,
                )
                .with_query_logging(config.log_client_in, config.log_client_out),
            );
            reporters.push(proxy.clone() as Arc<dyn Reporter>);
            let exit_tx = exit_tx.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = proxy.run_tcp(listener, shutdown_rx).await {
                    let _ = exit_tx.send(e).await;
                }
            }));
        }
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
