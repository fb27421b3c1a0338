//! HTTP proxy request head handling

use super::Credentials;
use crate::common::net::split_host_port;
use crate::{Error, Result};
use base64::Engine;
use httparse::{Request, Status, EMPTY_HEADER};

pub const MAX_HEAD_BYTES: usize = 32 * 1024;
const MAX_HEADERS: usize = 64;

pub const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
pub const RESPONSE_AUTH_REQUIRED: &[u8] = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"nico\"\r\nConnection: close\r\n\r\n";
pub const RESPONSE_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";

/// What the client asked the proxy to do
#[derive(Debug, PartialEq, Eq)]
pub struct ProxyRequest {
    pub host: String,
    pub port: u16,
    /// `None` for CONNECT; otherwise the origin-form head to replay upstream
    pub forward_head: Option<Vec<u8>>,
}

/// Length of the request head if `buf` holds a complete one
pub fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse a complete request head, checking proxy credentials when required
pub fn parse_request(head: &[u8], users: &[Credentials]) -> Result<ProxyRequest> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut req = Request::new(&mut headers);
    match req.parse(head) {
        Ok(Status::Complete(_)) => {}
        Ok(Status::Partial) => return Err(Error::protocol("Incomplete HTTP request")),
        Err(e) => return Err(Error::protocol(format!("Invalid HTTP request: {}", e))),
    }

    let method = req
        .method
        .ok_or_else(|| Error::protocol("Invalid HTTP request line"))?;
    let target = req
        .path
        .ok_or_else(|| Error::protocol("Invalid HTTP request line"))?;

    if !users.is_empty() && !authorized(req.headers, users) {
        return Err(Error::auth("Proxy authentication required"));
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(target)?;
        return Ok(ProxyRequest {
            host,
            port: port.unwrap_or(443),
            forward_head: None,
        });
    }

    let url = url::Url::parse(target)
        .map_err(|e| Error::protocol(format!("Proxy request must use absolute URI: {}", e)))?;
    if url.scheme() != "http" {
        return Err(Error::unsupported(format!(
            "cannot forward {} requests",
            url.scheme()
        )));
    }
    let host = match url.host() {
        Some(url::Host::Ipv6(ip)) => ip.to_string(),
        Some(host) => host.to_string(),
        None => return Err(Error::protocol("Proxy request without host")),
    };
    let port = url.port_or_known_default().unwrap_or(80);

    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    let mut rewritten = format!("{} {} HTTP/1.1\r\n", method, path).into_bytes();
    for header in req.headers.iter() {
        if is_hop_by_hop_header(header.name) {
            continue;
        }
        rewritten.extend_from_slice(header.name.as_bytes());
        rewritten.extend_from_slice(b": ");
        rewritten.extend_from_slice(header.value);
        rewritten.extend_from_slice(b"\r\n");
    }
    rewritten.extend_from_slice(b"Connection: close\r\n\r\n");

    Ok(ProxyRequest {
        host,
        port,
        forward_head: Some(rewritten),
    })
}

fn authorized(headers: &[httparse::Header<'_>], users: &[Credentials]) -> bool {
    let Some(value) = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("proxy-authorization"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
    else {
        return false;
    };

    let Some(encoded) = value
        .trim()
        .strip_prefix("Basic ")
        .or_else(|| value.trim().strip_prefix("basic "))
    else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };

    match decoded.split_once(':') {
        Some((user, pass)) => users
            .iter()
            .any(|c| c.username == user && c.password == pass),
        None => false,
    }
}

fn is_hop_by_hop_header(header: &str) -> bool {
    matches!(
        header.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-connection"
    )
}
