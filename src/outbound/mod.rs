//! Outbound dialers
//!
//! The gateway only owns the dial boundary: an [`OutboundProxy`] turns
//! connection metadata into a byte stream. Built-in dialers cover direct,
//! reject, HTTP CONNECT and SOCKS5. Other kinds get an [`Unavailable`]
//! stand-in unless a host [`DialerFactory`] supplies a real dialer.

mod direct;
mod http;
mod reject;
mod socks5;
pub mod tls;
mod unavailable;

pub use direct::Direct;
pub use http::HttpProxy;
pub use reject::Reject;
pub use socks5::Socks5Proxy;
pub use unavailable::Unavailable;

use crate::common::Metadata;
use crate::config::ProxyConfig;
use crate::rule::AdapterAction;
use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Proxy kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyType {
    Direct,
    Reject,
    Shadowsocks,
    ShadowsocksR,
    Vmess,
    Vless,
    Trojan,
    Hysteria2,
    Tuic,
    Snell,
    WireGuard,
    Http,
    Socks5,
}

impl ProxyType {
    /// Canonical lowercase tag, as used in records and identities
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Direct => "direct",
            ProxyType::Reject => "reject",
            ProxyType::Shadowsocks => "ss",
            ProxyType::ShadowsocksR => "ssr",
            ProxyType::Vmess => "vmess",
            ProxyType::Vless => "vless",
            ProxyType::Trojan => "trojan",
            ProxyType::Hysteria2 => "hysteria2",
            ProxyType::Tuic => "tuic",
            ProxyType::Snell => "snell",
            ProxyType::WireGuard => "wireguard",
            ProxyType::Http => "http",
            ProxyType::Socks5 => "socks5",
        }
    }

    /// Routing action connections through this kind represent
    pub fn action(&self) -> AdapterAction {
        match self {
            ProxyType::Direct => AdapterAction::Direct,
            ProxyType::Reject => AdapterAction::Reject,
            _ => AdapterAction::Proxy,
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyType::Direct => write!(f, "Direct"),
            ProxyType::Reject => write!(f, "Reject"),
            ProxyType::Shadowsocks => write!(f, "Shadowsocks"),
            ProxyType::ShadowsocksR => write!(f, "ShadowsocksR"),
            ProxyType::Vmess => write!(f, "VMess"),
            ProxyType::Vless => write!(f, "VLESS"),
            ProxyType::Trojan => write!(f, "Trojan"),
            ProxyType::Hysteria2 => write!(f, "Hysteria2"),
            ProxyType::Tuic => write!(f, "TUIC"),
            ProxyType::Snell => write!(f, "Snell"),
            ProxyType::WireGuard => write!(f, "WireGuard"),
            ProxyType::Http => write!(f, "HTTP"),
            ProxyType::Socks5 => write!(f, "SOCKS5"),
        }
    }
}

impl TryFrom<&str> for ProxyType {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "direct" => Ok(ProxyType::Direct),
            "reject" => Ok(ProxyType::Reject),
            "ss" | "shadowsocks" => Ok(ProxyType::Shadowsocks),
            "ssr" | "shadowsocksr" => Ok(ProxyType::ShadowsocksR),
            "vmess" => Ok(ProxyType::Vmess),
            "vless" => Ok(ProxyType::Vless),
            "trojan" => Ok(ProxyType::Trojan),
            "hysteria2" | "hy2" => Ok(ProxyType::Hysteria2),
            "tuic" => Ok(ProxyType::Tuic),
            "snell" => Ok(ProxyType::Snell),
            "wireguard" | "wg" => Ok(ProxyType::WireGuard),
            "http" | "https" => Ok(ProxyType::Http),
            "socks5" | "socks" => Ok(ProxyType::Socks5),
            _ => Err(Error::config(format!("Unknown proxy type: {}", s))),
        }
    }
}

/// Trait for outbound proxy connections
#[async_trait]
pub trait OutboundProxy: Send + Sync {
    fn name(&self) -> &str;

    fn proxy_type(&self) -> ProxyType;

    /// Server host (or a fixed tag for built-ins)
    fn server(&self) -> &str;

    fn support_udp(&self) -> bool;

    /// Dial TCP connection through this proxy
    async fn dial_tcp(&self, metadata: &Metadata) -> Result<Box<dyn ProxyConnection>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Trait for proxy connections
pub trait ProxyConnection: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> ProxyConnection for T {}

/// Builds the dialer behind an adapter from its decoded record
pub trait DialerFactory: Send + Sync {
    fn build(&self, config: &ProxyConfig, name: &str) -> Result<Arc<dyn OutboundProxy>>;
}

/// Dialers the gateway implements itself
pub struct BuiltinDialers {
    connect_timeout: Duration,
}

impl BuiltinDialers {
    pub fn new(connect_timeout: Duration) -> Self {
        BuiltinDialers { connect_timeout }
    }
}

impl Default for BuiltinDialers {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl DialerFactory for BuiltinDialers {
    fn build(&self, config: &ProxyConfig, name: &str) -> Result<Arc<dyn OutboundProxy>> {
        let proxy_type = ProxyType::try_from(config.proxy_type.as_str())?;

        match proxy_type {
            ProxyType::Direct => Ok(Arc::new(Direct::with_name(name.to_string()))),
            ProxyType::Reject => Ok(Arc::new(Reject::with_name(name.to_string()))),
            ProxyType::Http => Ok(Arc::new(HttpProxy::new(
                name.to_string(),
                config.server.clone(),
                config.port,
                config.get_string("username"),
                config.get_string("password"),
                config.get_bool("tls").unwrap_or(false),
                config.get_bool("skip-cert-verify").unwrap_or(false),
                self.connect_timeout,
            ))),
            ProxyType::Socks5 => Ok(Arc::new(Socks5Proxy::new(
                name.to_string(),
                config.server.clone(),
                config.port,
                config.get_string("username"),
                config.get_string("password"),
                config.get_bool("udp").unwrap_or(false),
                self.connect_timeout,
            ))),
            other => Ok(Arc::new(Unavailable::new(
                name.to_string(),
                other,
                config.server.clone(),
            ))),
        }
    }
}
