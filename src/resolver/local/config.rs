//! Configuration for the local stub resolver.

/// Configuration for [`super::LocalResolver`].
#[derive(Debug, Clone, Default)]
pub struct LocalConfig {
    /// Path to a BIND-style resolv.conf supplying name servers and search
    /// domains.
    pub resolv_conf_path: String,

    /// Local domains handled by this resolver in addition to those found
    /// in the resolv.conf.
    pub local_domains: Vec<String>,
}
