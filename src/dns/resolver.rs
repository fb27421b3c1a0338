//! DNS resolver implementation

use crate::config::DnsConfig;
use crate::{Error, Result};
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info};

/// Resolver over the configured upstreams, or the system configuration
pub struct Resolver {
    resolver: TokioAsyncResolver,
}

impl Resolver {
    pub fn new(config: &DnsConfig) -> Result<Self> {
        let resolver = Self::build_resolver(&config.nameserver)?;
        Ok(Resolver { resolver })
    }

    fn build_resolver(nameservers: &[String]) -> Result<TokioAsyncResolver> {
        if nameservers.is_empty() {
            info!("DNS using system configuration");
            return TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| Error::dns(format!("Failed to create system resolver: {}", e)));
        }

        let mut config = ResolverConfig::new();
        for ns in nameservers {
            let ns_config = Self::parse_nameserver(ns)?;
            config.add_name_server(ns_config);
        }

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 2;
        opts.rotate = true;

        info!("DNS using {} nameservers", nameservers.len());
        Ok(TokioAsyncResolver::tokio(config, opts))
    }

    /// Accepts `ip`, `ip:port`, `[v6]:port`, and `udp://` or `tcp://` prefixed forms
    fn parse_nameserver(ns: &str) -> Result<NameServerConfig> {
        let (protocol, addr) = if let Some(rest) = ns.strip_prefix("tcp://") {
            (Protocol::Tcp, rest)
        } else if let Some(rest) = ns.strip_prefix("udp://") {
            (Protocol::Udp, rest)
        } else if ns.contains("://") {
            return Err(Error::config(format!("Unsupported nameserver: {}", ns)));
        } else {
            (Protocol::Udp, ns)
        };

        let socket_addr = match addr.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => {
                let ip = addr
                    .parse::<IpAddr>()
                    .map_err(|_| Error::config(format!("Invalid nameserver: {}", ns)))?;
                SocketAddr::new(ip, 53)
            }
        };

        Ok(NameServerConfig::new(socket_addr, protocol))
    }

    /// Resolve a host to its first address; IP literals pass through
    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(ip);
        }

        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| Error::dns(format!("lookup {} failed: {}", host, e)))?;

        let ip = lookup
            .iter()
            .next()
            .ok_or_else(|| Error::dns(format!("No IP found for {}", host)))?;
        debug!("DNS {} -> {}", host, ip);
        Ok(ip)
    }
}
