use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{anyhow, Result};

/// Configuration for one listening endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub root: String,
    /// Keepalive timeout in seconds; 0 disables the idle sweep.
    pub keepalive_timeout: u64,
    pub cgi_enabled: bool,
    /// CGI extensions including the leading dot, e.g. ".py".
    pub cgi_extensions: Vec<String>,
    pub cgi_timeout: u64,
    /// 0 means unlimited.
    pub max_connections: usize,
    pub index_name: String,
    pub no_listing: bool,
    pub want_keepalive: bool,
    /// Value of the "Server:" header, or empty with --no-server-id.
    pub server_id: String,
}

/// Parse a `--listen` specification of the form `addr:port[:root]`.
pub fn parse_listen_spec(spec: &str, default_root: &str) -> Result<(Ipv4Addr, u16, String)> {
    let mut fields = spec.splitn(3, ':');
    let addr = fields
        .next()
        .filter(|addr| !addr.is_empty())
        .ok_or_else(|| anyhow!("missing address in listen spec `{}'", spec))?;
    let addr =
        Ipv4Addr::from_str(addr).map_err(|_| anyhow!("invalid address in listen spec `{}'", spec))?;
    let port = fields
        .next()
        .ok_or_else(|| anyhow!("missing port in listen spec `{}'", spec))?;
    let port = port
        .parse()
        .map_err(|_| anyhow!("invalid port in listen spec `{}'", spec))?;
    let mut root = fields.next().unwrap_or(default_root).to_string();
    if root.ends_with('/') {
        root.pop();
    }
    Ok((addr, port, root))
}
