//! System-wide protocol constants shared by both daemons.

/// Package name reported in the `User-Agent` header.
pub const PACKAGE_NAME: &str = "trustydns";

/// Crate version reported in the `User-Agent` header and `--version` output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// RFC 8484 well-known path for DoH queries.
pub const RFC8484_PATH: &str = "/dns-query";

/// RFC 8484 query parameter carrying the base64url-encoded DNS message on GET.
pub const RFC8484_QUERY_PARAM: &str = "dns";

/// Media type for DNS wire format over HTTP (RFC 8484).
pub const DNS_CONTENT_TYPE: &str = "application/dns-message";

/// Server response header carrying the server-side resolution duration in
/// fractional seconds. Advisory, used for client statistics only.
pub const DURATION_HEADER: &str = "X-trustydns-Duration";

/// Request header asking the server to synthesize ECS from the HTTPS peer
/// address. Value is `<ipv4PrefixLen>/<ipv6PrefixLen>`; a length of zero
/// means "do not synthesize for this family".
pub const SYNTHESIZE_ECS_HEADER: &str = "X-trustydns-Synth";

/// A legitimate binary DNS message cannot be shorter than this.
pub const MINIMUM_VIABLE_DNS_MESSAGE: usize = 16;

/// A response larger than this may be truncated for UDP clients unless the
/// query carried an EDNS0 UDP size above it.
pub const DNS_TRUNCATE_THRESHOLD: usize = 512;

/// RFC 8484 upper limit on DNS message size.
pub const MAXIMUM_VIABLE_DNS_MESSAGE: usize = 65535;

/// RFC 8467 recommended padding modulo for client queries.
pub const RFC8467_CLIENT_PAD_MODULO: usize = 128;

/// RFC 8467 recommended padding modulo for server responses.
pub const RFC8467_SERVER_PAD_MODULO: usize = 468;

/// Default port for conventional DNS listeners.
pub const DNS_DEFAULT_PORT: u16 = 53;

/// Default port for HTTPS listeners.
pub const HTTPS_DEFAULT_PORT: u16 = 443;
