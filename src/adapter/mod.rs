//! Proxy adapter
//!
//! Wraps one outbound dialer with a content-derived identity, a display
//! name, the decoded record it came from and a small metric cache the
//! prober writes into.

mod cache;
mod export;
mod identity;

pub use cache::{MetricCache, ALIVE, DELAY, SPEED, SPEED_STR};
pub use identity::{canonical_form, compute as compute_identity};

use crate::common::net::split_host_port;
use crate::common::Metadata;
use crate::config::ProxyConfig;
use crate::outbound::{DialerFactory, OutboundProxy, ProxyConnection, ProxyType};
use crate::rule::AdapterAction;
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of identity characters used as the fallback display name
const SHORT_ID_LEN: usize = 12;

pub struct ProxyAdapter {
    dialer: Arc<dyn OutboundProxy>,
    config: Arc<ProxyConfig>,
    proxy_type: ProxyType,
    identity: String,
    name: String,
    host: String,
    port: u16,
    dial_timeout: Duration,
    cache: MetricCache,
}

impl ProxyAdapter {
    /// Wrap an already built dialer
    pub fn new(config: ProxyConfig, dialer: Arc<dyn OutboundProxy>) -> Result<Self> {
        let (identity, name) = Self::identify(&config)?;
        Self::assemble(config, dialer, identity, name)
    }

    /// Build the dialer through `factory`, naming it after the adapter
    pub fn from_config(config: ProxyConfig, factory: &dyn DialerFactory) -> Result<Self> {
        let (identity, name) = Self::identify(&config)?;
        let dialer = factory.build(&config, &name)?;
        Self::assemble(config, dialer, identity, name)
    }

    fn identify(config: &ProxyConfig) -> Result<(String, String)> {
        config.validate()?;
        let identity = identity::compute(config)?;

        let name = match config.name.as_deref() {
            Some(name) if !name.is_empty() => name.trim_end_matches(['\r', '\n']).to_string(),
            _ => identity.chars().take(SHORT_ID_LEN).collect(),
        };
        Ok((identity, name))
    }

    fn assemble(
        config: ProxyConfig,
        dialer: Arc<dyn OutboundProxy>,
        identity: String,
        name: String,
    ) -> Result<Self> {
        let proxy_type = ProxyType::try_from(config.proxy_type.as_str())?;
        let (host, port) = split_host_port(&config.address())?;
        let port = port.ok_or_else(|| Error::config(format!("{} has no port", config.address())))?;

        Ok(ProxyAdapter {
            dialer,
            config: Arc::new(config),
            proxy_type,
            identity,
            name,
            host,
            port,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            cache: MetricCache::new(),
        })
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn proxy_type(&self) -> ProxyType {
        self.proxy_type
    }

    pub fn action(&self) -> AdapterAction {
        self.proxy_type.action()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn store(&self, key: &str, value: impl Into<serde_json::Value>) {
        self.cache.store(key, value);
    }

    pub fn load(&self, key: &str) -> Option<serde_json::Value> {
        self.cache.load(key)
    }

    pub fn load_bool(&self, key: &str) -> bool {
        self.cache.load_bool(key)
    }

    pub fn load_u16(&self, key: &str) -> u16 {
        self.cache.load_u16(key)
    }

    pub fn load_f64(&self, key: &str) -> f64 {
        self.cache.load_f64(key)
    }

    pub fn delete(&self, key: &str) {
        self.cache.delete(key);
    }

    pub fn reset(&self) {
        self.cache.reset();
    }

    pub fn alive(&self) -> bool {
        self.cache.load_bool(ALIVE)
    }

    /// Whether a probe has recorded a failure for this adapter
    pub fn known_dead(&self) -> bool {
        self.cache.load(ALIVE).is_some() && !self.alive()
    }

    /// Last measured delay in milliseconds
    pub fn delay(&self) -> u16 {
        self.cache.load_u16(DELAY)
    }

    /// Last measured throughput in KB/s
    pub fn speed(&self) -> f64 {
        self.cache.load_f64(SPEED)
    }

    pub fn speed_str(&self) -> String {
        self.cache.load_string(SPEED_STR)
    }

    /// Dial through the wrapped dialer, bounded by the dial timeout
    pub async fn dial(&self, metadata: &Metadata) -> Result<Box<dyn ProxyConnection>> {
        let start = Instant::now();
        let result = timeout(self.dial_timeout, self.dialer.dial_tcp(metadata))
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "dial {} via {} timed out",
                    metadata.remote_address(),
                    self.name
                ))
            })?;

        debug!(
            "[{}] dial {} took {:?} ({})",
            self.name,
            metadata.remote_address(),
            start.elapsed(),
            if result.is_ok() { "ok" } else { "failed" }
        );
        result
    }

    /// Same dialer and static fields, empty metric cache
    pub fn fresh_clone(&self) -> Self {
        ProxyAdapter {
            dialer: Arc::clone(&self.dialer),
            config: Arc::clone(&self.config),
            proxy_type: self.proxy_type,
            identity: self.identity.clone(),
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            dial_timeout: self.dial_timeout,
            cache: MetricCache::new(),
        }
    }
}

impl fmt::Debug for ProxyAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyAdapter")
            .field("name", &self.name)
            .field("type", &self.proxy_type)
            .field("identity", &self.identity)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl fmt::Display for ProxyAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.proxy_type)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::common::ConnType;
    use crate::outbound::{BuiltinDialers, Reject};
    use tokio::io::AsyncReadExt;

    /// Adapter over a reject dialer; the kind only drives identity and export
    pub(crate) fn adapter_for(config: ProxyConfig) -> ProxyAdapter {
        ProxyAdapter::new(config, Arc::new(Reject::new())).unwrap()
    }

    #[test]
    fn test_default_name_is_short_identity() {
        let adapter = adapter_for(ProxyConfig::new("ss", "1.2.3.4", 8388));
        assert_eq!(adapter.name().len(), 12);
        assert!(adapter.identity().starts_with(adapter.name()));

        let named = adapter_for(ProxyConfig::new("ss", "1.2.3.4", 8388).with_name("hk 01\r\n"));
        assert_eq!(named.name(), "hk 01");
        assert_eq!(named.identity(), adapter.identity());
    }

    #[test]
    fn test_host_port_split() {
        let adapter = adapter_for(ProxyConfig::new("trojan", "2001:db8::1", 443));
        assert_eq!(adapter.host(), "2001:db8::1");
        assert_eq!(adapter.port(), 443);
        assert_eq!(adapter.action(), AdapterAction::Proxy);
    }

    #[test]
    fn test_unknown_kind_fails_construction() {
        let config = ProxyConfig::new("carrier-pigeon", "h", 1);
        assert!(ProxyAdapter::new(config, Arc::new(Reject::new())).is_err());
    }

    #[test]
    fn test_fresh_clone_has_independent_cache() {
        let adapter = adapter_for(ProxyConfig::new("vmess", "h", 443));
        adapter.store(ALIVE, true);
        adapter.store(DELAY, 80);

        let clone = adapter.fresh_clone();
        assert_eq!(clone.identity(), adapter.identity());
        assert!(!clone.alive());
        assert!(!clone.known_dead());

        clone.store(ALIVE, false);
        assert!(adapter.alive());
        assert!(clone.known_dead());
        assert_eq!(adapter.delay(), 80);
    }

    #[tokio::test]
    async fn test_dial_through_factory() {
        let factory = BuiltinDialers::default();
        let adapter =
            ProxyAdapter::from_config(ProxyConfig::new("reject", "reject", 1), &factory).unwrap();
        assert_eq!(adapter.action(), AdapterAction::Reject);

        let meta = Metadata::tcp(ConnType::Socks5)
            .with_host("example.com")
            .with_dst_port(80);
        let mut conn = adapter.dial(&meta).await.unwrap();
        let mut buf = Vec::new();
        assert_eq!(conn.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
