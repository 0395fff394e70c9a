//! HTTPS wire seam for the DoH resolver.
//!
//! [`HttpExchange`] is the only surface the resolver needs from an HTTP
//! client: send a request, get back a fully-read response. The production
//! implementation wraps a pooled hyper client over rustls; tests supply a
//! mock.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;

use crate::error::{DnsError, DnsResult};

/// A single HTTP round trip with the response body already collected.
#[async_trait]
pub trait HttpExchange: Send + Sync + fmt::Debug {
    /// Send `req` and return the response with its body read to completion.
    async fn exchange(&self, req: Request<Full<Bytes>>) -> DnsResult<Response<Bytes>>;
}

/// Production [`HttpExchange`] backed by a shared hyper client.
///
/// One of these exists per daemon; hyper's pool provides connection reuse
/// and per-host caps underneath it.
pub struct HyperExchange {
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>,
    request_timeout: Duration,
}

impl fmt::Debug for HyperExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperExchange")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl HyperExchange {
    /// Build the shared HTTPS client.
    ///
    /// `tls` comes from [`crate::tlsutil::client_config`] so that operator
    /// trust-store and client-certificate options apply.
    pub fn new(
        tls: rustls::ClientConfig,
        request_timeout: Duration,
        max_connections_per_host: usize,
    ) -> Self {
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_all_versions()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(max_connections_per_host)
            .build(https);

        Self {
            client,
            request_timeout,
        }
    }
}

#[async_trait]
impl HttpExchange for HyperExchange {
    async fn exchange(&self, req: Request<Full<Bytes>>) -> DnsResult<Response<Bytes>> {
        let target = req.uri().to_string();

        let response = timeout(self.request_timeout, self.client.request(req))
            .await
            .map_err(|_| DnsError::timeout(format!("DoH request to {target}"), self.request_timeout))?
            .map_err(|e| DnsError::network(format!("DoH request to {target} failed: {e}")))?;

        let (parts, body) = response.into_parts();
        let collected = timeout(self.request_timeout, body.collect())
            .await
            .map_err(|_| {
                DnsError::timeout(format!("DoH response body from {target}"), self.request_timeout)
            })?
            .map_err(|e| DnsError::network(format!("DoH response body from {target}: {e}")))?;

        Ok(Response::from_parts(parts, collected.to_bytes()))
    }
}
