//! Configuration module

mod parser;
mod store;

pub use parser::{decode_base64, parse_link, parse_links};
pub use store::{ConfigStore, MemoryStore, RuleStore};

use crate::common::net::join_host_port;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_DELAY_URL: &str = "http://www.gstatic.com/generate_204";
pub const DEFAULT_SPEED_URL: &str = "http://cachefly.cachefly.net/50mb.test";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port of the combined HTTP/SOCKS5 listener; 0 disables it
    #[serde(rename = "mixed-port")]
    pub mixed_port: u16,

    #[serde(rename = "bind-address")]
    pub bind_address: Option<String>,

    #[serde(rename = "allow-lan")]
    pub allow_lan: bool,

    #[serde(rename = "log-level")]
    pub log_level: String,

    #[serde(rename = "external-controller")]
    pub external_controller: Option<String>,

    pub secret: Option<String>,

    /// `user:pass` pairs accepted by the mixed listener; empty disables auth
    pub authentication: Vec<String>,

    /// Key/value file holding persisted rules
    #[serde(rename = "store-path")]
    pub store_path: String,

    /// Structured proxy records
    pub proxies: Vec<Mapping>,

    /// Share links (vmess://, trojan://, ...)
    pub links: Vec<String>,

    pub subscriptions: Vec<SubscriptionConfig>,

    pub probe: ProbeConfig,

    pub dns: DnsConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(ref ctl) = self.external_controller {
            ctl.parse::<SocketAddr>().map_err(|e| {
                Error::config(format!("invalid external-controller {}: {}", ctl, e))
            })?;
        }

        if self.store_path.trim().is_empty() {
            return Err(Error::config("store-path cannot be empty"));
        }

        for sub in &self.subscriptions {
            url::Url::parse(&sub.url).map_err(|e| {
                Error::config(format!("invalid subscription url for {}: {}", sub.name, e))
            })?;
        }

        self.credentials()?;
        self.probe.validate()
    }

    /// Parsed `authentication` entries
    pub fn credentials(&self) -> Result<Vec<(String, String)>> {
        self.authentication
            .iter()
            .map(|entry| {
                entry
                    .split_once(':')
                    .map(|(user, pass)| (user.to_string(), pass.to_string()))
                    .ok_or_else(|| {
                        Error::config(format!("authentication entry {} is not user:pass", entry))
                    })
            })
            .collect()
    }

    /// Address the mixed listener binds to
    pub fn listen_address(&self) -> String {
        let host = match self.bind_address.as_deref() {
            Some(addr) if !addr.is_empty() && addr != "*" => addr,
            _ if self.allow_lan => "0.0.0.0",
            _ => "127.0.0.1",
        };
        join_host_port(host, self.mixed_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mixed_port: 7890,
            bind_address: None,
            allow_lan: false,
            log_level: "info".to_string(),
            external_controller: None,
            secret: None,
            authentication: Vec::new(),
            store_path: "nico.yaml".to_string(),
            proxies: Vec::new(),
            links: Vec::new(),
            subscriptions: Vec::new(),
            probe: ProbeConfig::default(),
            dns: DnsConfig::default(),
        }
    }
}

/// Health and speed probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    #[serde(rename = "delay-url")]
    pub delay_url: String,

    /// Seconds between delay sweeps
    #[serde(rename = "delay-interval")]
    pub delay_interval: u64,

    #[serde(rename = "speed-url")]
    pub speed_url: String,

    /// Seconds between speed sweeps
    #[serde(rename = "speed-interval")]
    pub speed_interval: u64,

    /// Per-request timeout of the delay probe, seconds
    pub timeout: u64,

    #[serde(rename = "speed-timeout")]
    pub speed_timeout: u64,

    #[serde(rename = "dial-timeout")]
    pub dial_timeout: u64,

    /// Bytes downloaded by the speed probe
    #[serde(rename = "speed-sample")]
    pub speed_sample: usize,
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.delay_interval == 0 || self.speed_interval == 0 {
            return Err(Error::config("probe intervals must be positive"));
        }
        if self.speed_sample == 0 {
            return Err(Error::config("speed-sample must be positive"));
        }
        url::Url::parse(&self.delay_url)
            .map_err(|e| Error::config(format!("invalid delay-url: {}", e)))?;
        url::Url::parse(&self.speed_url)
            .map_err(|e| Error::config(format!("invalid speed-url: {}", e)))?;
        Ok(())
    }

    pub fn delay_interval(&self) -> Duration {
        Duration::from_secs(self.delay_interval)
    }

    pub fn speed_interval(&self) -> Duration {
        Duration::from_secs(self.speed_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn speed_timeout(&self) -> Duration {
        Duration::from_secs(self.speed_timeout)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            delay_url: DEFAULT_DELAY_URL.to_string(),
            delay_interval: 60,
            speed_url: DEFAULT_SPEED_URL.to_string(),
            speed_interval: 30 * 60,
            timeout: 5,
            speed_timeout: 60,
            dial_timeout: 5,
            speed_sample: 1024 * 1024,
        }
    }
}

/// Remote node list refreshed periodically
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub name: String,

    pub url: String,

    /// Refresh interval in seconds; 0 fetches once
    #[serde(default = "default_subscription_interval")]
    pub interval: u64,

    /// Local cache of the last successful fetch
    pub path: Option<String>,
}

fn default_subscription_interval() -> u64 {
    3600
}

/// DNS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Resolve destination hosts before rule matching
    pub enable: bool,

    /// Upstream nameservers; empty uses the system configuration
    pub nameserver: Vec<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            enable: true,
            nameserver: Vec::new(),
        }
    }
}

/// Decoded outbound proxy description
///
/// `extra` holds every protocol-specific option verbatim; nested values
/// keep whatever key types the source document used.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    pub name: Option<String>,

    pub proxy_type: String,

    pub server: String,

    pub port: u16,

    pub extra: BTreeMap<String, Value>,
}

impl ProxyConfig {
    pub fn new(proxy_type: impl Into<String>, server: impl Into<String>, port: u16) -> Self {
        ProxyConfig {
            name: None,
            proxy_type: proxy_type.into(),
            server: server.into(),
            port,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.name = if name.is_empty() { None } else { Some(name) };
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.extra.insert(key.to_string(), value.into());
    }

    /// Build from a structured record such as a `proxies:` entry
    pub fn from_mapping(mapping: &Mapping) -> Result<Self> {
        let mut name = None;
        let mut proxy_type = None;
        let mut server = None;
        let mut port = None;
        let mut extra = BTreeMap::new();

        for (key, value) in mapping {
            let key = value_as_string(key)
                .ok_or_else(|| Error::config("proxy record keys must be scalars"))?;
            match key.as_str() {
                "name" => name = value_as_string(value),
                "type" => proxy_type = value_as_string(value),
                "server" => server = value_as_string(value),
                "port" => port = value_as_u64(value),
                _ => {
                    extra.insert(key, value.clone());
                }
            }
        }

        let proxy_type = proxy_type.ok_or_else(|| Error::config("proxy record missing type"))?;
        let server = server.ok_or_else(|| Error::config("proxy record missing server"))?;
        let port = port
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| Error::config(format!("proxy record {} has invalid port", server)))?;

        let config = ProxyConfig {
            name: name.filter(|n| !n.is_empty()),
            proxy_type,
            server,
            port,
            extra,
        };
        config.validate()?;
        Ok(config)
    }

    /// Structured record form, with `name` when present
    pub fn to_mapping(&self) -> Mapping {
        let mut mapping = Mapping::new();
        if let Some(ref name) = self.name {
            mapping.insert("name".into(), name.clone().into());
        }
        mapping.insert("type".into(), self.proxy_type.clone().into());
        mapping.insert("server".into(), self.server.clone().into());
        mapping.insert("port".into(), Value::from(self.port));
        for (key, value) in &self.extra {
            mapping.insert(Value::String(key.clone()), value.clone());
        }
        mapping
    }

    pub fn validate(&self) -> Result<()> {
        if self.proxy_type.trim().is_empty() {
            return Err(Error::config("Proxy type cannot be empty"));
        }
        if self.server.is_empty() {
            return Err(Error::config("Proxy server cannot be empty"));
        }
        if self.port == 0 {
            return Err(Error::config("Proxy port cannot be 0"));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        join_host_port(&self.server, self.port)
    }

    /// Get string field; numbers and bools are rendered
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.extra.get(key).and_then(value_as_string)
    }

    /// Get bool field; accepts "true"/"false" strings
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.extra.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            Value::Number(n) => n.as_i64().map(|v| v != 0),
            _ => None,
        }
    }

    /// Get integer field; accepts numeric strings
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.extra.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.mixed_port, 7890);
        assert_eq!(config.probe.delay_url, DEFAULT_DELAY_URL);
        assert_eq!(config.probe.speed_sample, 1024 * 1024);
        assert_eq!(config.listen_address(), "127.0.0.1:7890");
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
mixed-port: 7891
allow-lan: true
log-level: debug
external-controller: 127.0.0.1:9090
secret: s3cret
store-path: /tmp/nico.yaml
probe:
  delay-interval: 30
proxies:
  - name: test-ss
    type: ss
    server: example.com
    port: "8388"
    cipher: aes-256-gcm
    password: secret
links:
  - "trojan://pw@example.org:443#t"
subscriptions:
  - name: main
    url: https://sub.example.com/list
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.listen_address(), "0.0.0.0:7891");
        assert_eq!(config.probe.delay_interval, 30);
        assert_eq!(config.probe.speed_interval, 1800);
        assert_eq!(config.proxies.len(), 1);
        assert_eq!(config.links.len(), 1);
        assert_eq!(config.subscriptions[0].interval, 3600);

        let proxy = ProxyConfig::from_mapping(&config.proxies[0]).unwrap();
        assert_eq!(proxy.port, 8388);
        assert_eq!(proxy.get_string("cipher").as_deref(), Some("aes-256-gcm"));
    }

    #[test]
    fn test_config_authentication() {
        let config = Config::from_str("authentication:\n  - \"alice:pa:ss\"\n").unwrap();
        assert_eq!(
            config.credentials().unwrap(),
            vec![("alice".to_string(), "pa:ss".to_string())]
        );

        assert!(Config::from_str("authentication:\n  - nopass\n").is_err());
    }

    #[test]
    fn test_config_rejects_bad_controller() {
        let yaml = "external-controller: not-an-addr\n";
        assert!(matches!(Config::from_str(yaml), Err(Error::Config(_))));
    }

    #[test]
    fn test_proxy_config_mapping_roundtrip() {
        let config = ProxyConfig::new("vmess", "1.2.3.4", 443)
            .with_name("node")
            .with("uuid", "abc")
            .with("alterId", 0);
        let back = ProxyConfig::from_mapping(&config.to_mapping()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_proxy_config_missing_fields() {
        let mut mapping = Mapping::new();
        mapping.insert("type".into(), "ss".into());
        mapping.insert("port".into(), 443.into());
        assert!(ProxyConfig::from_mapping(&mapping).is_err());

        mapping.insert("server".into(), "a.com".into());
        mapping.insert("port".into(), 70000.into());
        assert!(ProxyConfig::from_mapping(&mapping).is_err());
    }

    #[test]
    fn test_proxy_config_accessors() {
        let config = ProxyConfig::new("trojan", "a.com", 443)
            .with("udp", "true")
            .with("alterId", "2");
        assert_eq!(config.get_bool("udp"), Some(true));
        assert_eq!(config.get_int("alterId"), Some(2));
        assert_eq!(config.get_string("missing"), None);
    }
}
