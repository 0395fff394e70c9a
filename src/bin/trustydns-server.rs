//! trustydns-server: listen for DNS-over-HTTPS queries and resolve them
//! with a local recursive resolver.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use trustydns::resolver::local::LocalConfig;
use trustydns::server::{self, ServerConfig};

#[derive(Parser)]
#[command(name = "trustydns-server")]
#[command(version = trustydns::VERSION)]
#[command(about = "DNS-over-HTTPS server", long_about = None)]
struct Args {
    /// Listen addresses for inbound DoH requests
    #[arg(short = 'A', long = "listen", default_values_t = ["0.0.0.0:443".to_string()])]
    listen: Vec<String>,

    /// resolv.conf supplying the recursive resolvers
    #[arg(short = 'c', long, value_name = "PATH", default_value = "/etc/resolv.conf")]
    resolv_conf: String,

    /// Local domains handled by this server in addition to those in the
    /// resolv.conf
    #[arg(long = "domain", value_name = "NAME")]
    domains: Vec<String>,

    /// Remove any EDNS0 Client Subnet option from inbound queries
    #[arg(long)]
    ecs_remove: bool,

    /// Synthesize an EDNS0 Client Subnet option from the HTTPS peer
    /// address
    #[arg(long)]
    ecs_set: bool,

    /// IPv4 prefix length for synthesized ECS (0 disables IPv4 synthesis)
    #[arg(long, value_name = "LEN", default_value_t = 24)]
    ecs_set_ipv4: u8,

    /// IPv6 prefix length for synthesized ECS (0 disables IPv6 synthesis)
    #[arg(long, value_name = "LEN", default_value_t = 64)]
    ecs_set_ipv6: u8,

    /// PEM certificate chain for HTTPS. Plain HTTP when omitted.
    #[arg(long, value_name = "PATH")]
    tls_cert: Option<String>,

    /// PEM private key matching --tls-cert
    #[arg(long, value_name = "PATH")]
    tls_key: Option<String>,

    /// Seconds between status reports (0 disables them)
    #[arg(short = 'i', long, default_value_t = 0)]
    status_interval: u64,

    /// Log inbound client queries
    #[arg(long)]
    log_client_in: bool,

    /// Log outbound client responses
    #[arg(long)]
    log_client_out: bool,

    /// Log TLS handshake failures from clients
    #[arg(long)]
    log_tls_errors: bool,

    /// Turn on all logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Err(e) = run(args).await {
        eprintln!("trustydns-server: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = ServerConfig {
        listen_addresses: args.listen.clone(),
        local: LocalConfig {
            resolv_conf_path: args.resolv_conf.clone(),
            local_domains: args.domains.clone(),
        },
        ecs_remove: args.ecs_remove,
        ecs_set: args.ecs_set,
        ecs_set_ipv4_prefix_len: args.ecs_set_ipv4,
        ecs_set_ipv6_prefix_len: args.ecs_set_ipv6,
        tls_cert_file: args.tls_cert.clone(),
        tls_key_file: args.tls_key.clone(),
        report_interval: Duration::from_secs(args.status_interval),
        log_client_in: args.log_client_in || args.verbose,
        log_client_out: args.log_client_out || args.verbose,
        log_tls_errors: args.log_tls_errors || args.verbose,
    };

    server::run(config).await?;
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
