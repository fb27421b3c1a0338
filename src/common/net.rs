//! Network utilities

use crate::{Error, Result};
use socket2::SockRef;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Split `host:port` on the last colon outside IPv6 brackets.
///
/// Brackets are stripped from the host. A missing port yields `None`.
pub fn split_host_port(addr: &str) -> Result<(String, Option<u16>)> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(Error::parse("empty address"));
    }

    if let Some(rest) = addr.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| Error::parse(format!("missing ']' in address {}", addr)))?;
        let host = &rest[..close];
        let tail = &rest[close + 1..];
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None if tail.is_empty() => None,
            None => return Err(Error::parse(format!("garbage after ']' in {}", addr))),
        };
        return Ok((host.to_string(), port));
    }

    // A bare IPv6 literal has several colons and no port
    if addr.parse::<Ipv6Addr>().is_ok() {
        return Ok((addr.to_string(), None));
    }

    match addr.rfind(':') {
        Some(idx) => Ok((addr[..idx].to_string(), Some(parse_port(&addr[idx + 1..])?))),
        None => Ok((addr.to_string(), None)),
    }
}

/// Inverse of [`split_host_port`]; brackets IPv6 hosts.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse::<u16>()
        .map_err(|_| Error::parse(format!("invalid port: {}", s)))
}

/// SOCKS5 destination address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Address {
    /// Read `ATYP | ADDR | PORT` from a SOCKS5 stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Self, u16)> {
        let atyp = reader.read_u8().await?;

        let addr = match atyp {
            ATYP_IPV4 => {
                let mut ip = [0u8; 4];
                reader.read_exact(&mut ip).await?;
                Address::Ipv4(Ipv4Addr::from(ip))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut buf = vec![0u8; len];
                reader.read_exact(&mut buf).await?;
                let domain = String::from_utf8(buf)
                    .map_err(|e| Error::parse(format!("Invalid domain: {}", e)))?;
                Address::Domain(domain)
            }
            ATYP_IPV6 => {
                let mut ip = [0u8; 16];
                reader.read_exact(&mut ip).await?;
                Address::Ipv6(Ipv6Addr::from(ip))
            }
            t => return Err(Error::protocol(format!("Unknown address type: {}", t))),
        };

        let port = reader.read_u16().await?;
        Ok((addr, port))
    }

    /// Encode as `ATYP | ADDR | PORT`
    pub fn encode(&self, port: u16) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(1 + 16 + 2);
        match self {
            Address::Ipv4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Ipv6(ip) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                let bytes = domain.as_bytes();
                if bytes.len() > 255 {
                    return Err(Error::parse("Domain name too long"));
                }
                buf.push(ATYP_DOMAIN);
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
        }
        buf.extend_from_slice(&port.to_be_bytes());
        Ok(buf)
    }

    pub fn to_ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Address::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Address::Domain(_) => None,
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl From<&str> for Address {
    fn from(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::from(ip),
            Err(_) => Address::Domain(host.to_string()),
        }
    }
}

/// Copy bytes both ways until either side closes
pub async fn relay<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let counts = tokio::io::copy_bidirectional(a, b).await?;
    Ok(counts)
}
