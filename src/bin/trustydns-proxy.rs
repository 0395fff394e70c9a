//! trustydns-proxy: listen for conventional DNS queries and resolve them
//! via DNS over HTTPS servers.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use trustydns::proxy::{self, ProxyConfig};
use trustydns::resolver::doh::{DohConfig, EcsSet};
use trustydns::resolver::local::LocalConfig;
use trustydns::tlsutil::ClientTlsOptions;

#[derive(Parser)]
#[command(name = "trustydns-proxy")]
#[command(version = trustydns::VERSION)]
#[command(about = "DNS to DNS-over-HTTPS proxy", long_about = None)]
struct Args {
    /// Upstream DoH server URLs. A bare hostname implies https.
    #[arg(required = true)]
    servers: Vec<String>,

    /// Listen addresses for inbound DNS queries
    #[arg(short = 'A', long = "listen", default_values_t = ["127.0.0.1:53".to_string()])]
    listen: Vec<String>,

    /// Do not listen on UDP
    #[arg(long)]
    no_udp: bool,

    /// Do not listen on TCP
    #[arg(long)]
    no_tcp: bool,

    /// Use HTTP GET instead of POST (maximizes HTTP cache hits)
    #[arg(short = 'g', long)]
    get: bool,

    /// Apply RFC 8467 padding to queries and responses
    #[arg(long)]
    padding: bool,

    /// Remove any EDNS0 Client Subnet option from outbound queries
    #[arg(long)]
    ecs_remove: bool,

    /// Set this CIDR as the EDNS0 Client Subnet on outbound queries
    #[arg(long, value_name = "CIDR")]
    ecs_set: Option<String>,

    /// Ask the DoH server to synthesize IPv4 ECS with this prefix length
    #[arg(long, value_name = "LEN", default_value_t = 0)]
    ecs_request_ipv4: u8,

    /// Ask the DoH server to synthesize IPv6 ECS with this prefix length
    #[arg(long, value_name = "LEN", default_value_t = 0)]
    ecs_request_ipv6: u8,

    /// Strip ECS from replies when this proxy synthesized or set it
    #[arg(long)]
    ecs_redact_response: bool,

    /// resolv.conf supplying name servers for split-horizon resolution
    #[arg(short = 'c', long, value_name = "PATH")]
    resolv_conf: Option<String>,

    /// Local domains handled by the split-horizon resolver, in addition
    /// to those in the resolv.conf
    #[arg(long = "domain", value_name = "NAME")]
    domains: Vec<String>,

    /// Per-request HTTPS timeout in seconds
    #[arg(long, default_value_t = 15)]
    timeout: u64,

    /// Maximum pooled connections per upstream host
    #[arg(long, default_value_t = 10)]
    max_connections: usize,

    /// Client TLS certificate presented to DoH servers
    #[arg(long, value_name = "PATH")]
    tls_cert: Option<String>,

    /// Client TLS key matching --tls-cert
    #[arg(long, value_name = "PATH")]
    tls_key: Option<String>,

    /// Additional CA files used to verify DoH servers
    #[arg(long = "tls-ca", value_name = "PATH")]
    tls_cas: Vec<String>,

    /// Do not use the built-in root CAs
    #[arg(long)]
    no_system_roots: bool,

    /// Skip DoH server certificate verification
    #[arg(long)]
    insecure: bool,

    /// Seconds between status reports (0 disables them)
    #[arg(short = 'i', long, default_value_t = 0)]
    status_interval: u64,

    /// Log inbound client queries
    #[arg(long)]
    log_client_in: bool,

    /// Log outbound client responses
    #[arg(long)]
    log_client_out: bool,

    /// Turn on all logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Err(e) = run(args).await {
        eprintln!("trustydns-proxy: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let ecs_set = match &args.ecs_set {
        Some(cidr) => Some(EcsSet::parse(cidr)?),
        None => None,
    };

    let config = ProxyConfig {
        listen_addresses: args.listen.clone(),
        udp: !args.no_udp,
        tcp: !args.no_tcp,
        doh: DohConfig {
            server_urls: args.servers.clone(),
            use_get: args.get,
            generate_padding: args.padding,
            ecs_remove: args.ecs_remove,
            ecs_redact_response: args.ecs_redact_response,
            ecs_set,
            ecs_request_ipv4_prefix_len: args.ecs_request_ipv4,
            ecs_request_ipv6_prefix_len: args.ecs_request_ipv6,
            request_timeout: Duration::from_secs(args.timeout.max(1)),
            max_connections_per_host: args.max_connections.max(1),
            ..DohConfig::default()
        },
        local: args.resolv_conf.as_ref().map(|path| LocalConfig {
            resolv_conf_path: path.clone(),
            local_domains: args.domains.clone(),
        }),
        tls: ClientTlsOptions {
            use_system_roots: !args.no_system_roots,
            ca_files: args.tls_cas.clone(),
            cert_file: args.tls_cert.clone(),
            key_file: args.tls_key.clone(),
            insecure_skip_verify: args.insecure,
        },
        report_interval: Duration::from_secs(args.status_interval),
        log_client_in: args.log_client_in || args.verbose,
        log_client_out: args.log_client_out || args.verbose,
    };

    proxy::run(config).await?;
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
