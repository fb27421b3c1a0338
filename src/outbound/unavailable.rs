//! Stand-in dialer for kinds without a built-in implementation
//!
//! The node still registers, keeps its identity and exports; every dial
//! fails, so the first delay check marks it dead.

use super::{OutboundProxy, ProxyConnection, ProxyType};
use crate::common::Metadata;
use crate::{Error, Result};
use async_trait::async_trait;
use tracing::debug;

pub struct Unavailable {
    name: String,
    proxy_type: ProxyType,
    server: String,
}

impl Unavailable {
    pub fn new(name: String, proxy_type: ProxyType, server: String) -> Self {
        Unavailable {
            name,
            proxy_type,
            server,
        }
    }
}

#[async_trait]
impl OutboundProxy for Unavailable {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        self.proxy_type
    }

    fn server(&self) -> &str {
        &self.server
    }

    fn support_udp(&self) -> bool {
        false
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<Box<dyn ProxyConnection>> {
        debug!(
            "{} cannot dial {}: no {} dialer",
            self.name,
            metadata.remote_address(),
            self.proxy_type
        );
        Err(Error::unsupported(format!(
            "no built-in dialer for {} proxies",
            self.proxy_type
        )))
    }
}
