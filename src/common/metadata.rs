//! Connection metadata

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "TCP"),
            Network::Udp => write!(f, "UDP"),
        }
    }
}

/// Inbound flavour the connection arrived through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnType {
    Http,
    HttpConnect,
    Socks5,
    /// Connections originated by the gateway itself (probes)
    Inner,
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnType::Http => write!(f, "HTTP"),
            ConnType::HttpConnect => write!(f, "HTTPS"),
            ConnType::Socks5 => write!(f, "SOCKS5"),
            ConnType::Inner => write!(f, "Inner"),
        }
    }
}

/// Routing-relevant facts about one connection
#[derive(Debug, Clone)]
pub struct Metadata {
    pub network: Network,

    pub conn_type: ConnType,

    pub src_ip: IpAddr,

    pub src_port: u16,

    /// Destination IP address (may be unset if only host is known)
    pub dst_ip: Option<IpAddr>,

    pub dst_port: u16,

    /// Destination host name; empty when the client sent a bare IP
    pub host: String,
}

impl Metadata {
    pub fn new(network: Network, conn_type: ConnType) -> Self {
        Metadata {
            network,
            conn_type,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_ip: None,
            dst_port: 0,
            host: String::new(),
        }
    }

    pub fn tcp(conn_type: ConnType) -> Self {
        Self::new(Network::Tcp, conn_type)
    }

    pub fn with_source(mut self, addr: SocketAddr) -> Self {
        self.src_ip = addr.ip();
        self.src_port = addr.port();
        self
    }

    pub fn with_dst_ip(mut self, ip: IpAddr) -> Self {
        self.dst_ip = Some(ip);
        self
    }

    pub fn with_dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the destination from a host string, treating literal IPs as IPs
    pub fn with_destination(self, host: &str) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => self.with_dst_ip(ip),
            Err(_) => self.with_host(host),
        }
    }

    pub fn resolved(&self) -> bool {
        self.dst_ip.is_some()
    }

    /// Remote address string used for dialing
    pub fn remote_address(&self) -> String {
        if !self.host.is_empty() {
            format!("{}:{}", self.host, self.dst_port)
        } else if let Some(ip) = self.dst_ip {
            SocketAddr::new(ip, self.dst_port).to_string()
        } else {
            format!("0.0.0.0:{}", self.dst_port)
        }
    }

    /// Destination host or IP, without the port
    pub fn destination(&self) -> String {
        if !self.host.is_empty() {
            self.host.clone()
        } else if let Some(ip) = self.dst_ip {
            ip.to_string()
        } else {
            String::new()
        }
    }

    pub fn valid(&self) -> bool {
        self.dst_port > 0 && (!self.host.is_empty() || self.dst_ip.is_some())
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}:{} --> {}",
            self.network,
            self.src_ip,
            self.src_port,
            self.remote_address()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv6Addr, SocketAddrV4};

    #[test]
    fn test_metadata_creation() {
        let meta = Metadata::tcp(ConnType::Socks5)
            .with_source(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(192, 168, 1, 1),
                12345,
            )))
            .with_host("example.com")
            .with_dst_port(443);

        assert_eq!(meta.network, Network::Tcp);
        assert_eq!(meta.host, "example.com");
        assert_eq!(meta.remote_address(), "example.com:443");
        assert_eq!(
            meta.to_string(),
            "[TCP] 192.168.1.1:12345 --> example.com:443"
        );
    }

    #[test]
    fn test_metadata_validation() {
        let meta = Metadata::tcp(ConnType::Http)
            .with_dst_port(443)
            .with_host("example.com");
        assert!(meta.valid());

        assert!(!Metadata::tcp(ConnType::Http).valid());
    }

    #[test]
    fn test_with_destination_literal_ip() {
        let meta = Metadata::tcp(ConnType::HttpConnect)
            .with_destination("[2001:db8::1]")
            .with_dst_port(443);
        assert!(meta.host.is_empty());
        assert_eq!(
            meta.dst_ip,
            Some(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)))
        );
        assert_eq!(meta.remote_address(), "[2001:db8::1]:443");

        let meta = Metadata::tcp(ConnType::HttpConnect).with_destination("example.org");
        assert_eq!(meta.host, "example.org");
        assert!(!meta.resolved());
    }
}
