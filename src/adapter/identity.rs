//! Content-derived adapter identity
//!
//! The option bag is rendered into a canonical text form where every
//! mapping is emitted with its keys sorted and every key stringified, then
//! hashed with SHA-256. Two records that differ only in key order or in
//! whether a map key was written as `1` or `"1"` get the same identity.

use crate::config::ProxyConfig;
use crate::outbound::ProxyType;
use crate::{Error, Result};
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Fields that never take part in the identity
const EXCLUDED_KEYS: &[&str] = &["name", "unique-id", "unique_id"];

/// Hex-encoded SHA-256 identity of a decoded record
pub fn compute(config: &ProxyConfig) -> Result<String> {
    let canonical = canonical_form(config)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Canonical text of a record: kind normalized, name and identity removed
pub fn canonical_form(config: &ProxyConfig) -> Result<String> {
    let proxy_type = ProxyType::try_from(config.proxy_type.as_str())?;

    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in &config.extra {
        if EXCLUDED_KEYS.contains(&key.as_str()) {
            continue;
        }
        fields.insert(key.clone(), canonical_value(value)?);
    }
    fields.insert("type".into(), quote(proxy_type.as_str()));
    fields.insert("server".into(), quote(&config.server));
    fields.insert("port".into(), config.port.to_string());

    Ok(join_object(fields))
}

fn canonical_value(value: &Value) -> Result<String> {
    match value {
        Value::Null => Ok("null".to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(quote(s)),
        Value::Sequence(items) => {
            let parts = items
                .iter()
                .map(canonical_value)
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("[{}]", parts.join(",")))
        }
        Value::Mapping(mapping) => {
            let mut fields = BTreeMap::new();
            for (key, value) in mapping {
                fields.insert(canonical_key(key)?, canonical_value(value)?);
            }
            Ok(join_object(fields))
        }
        Value::Tagged(tagged) => Err(Error::config(format!(
            "unsupported option value with tag {}",
            tagged.tag
        ))),
    }
}

/// Map keys compare by their scalar text so `1` and `"1"` collide
fn canonical_key(key: &Value) -> Result<String> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok("null".to_string()),
        other => canonical_value(other),
    }
}

fn join_object(fields: BTreeMap<String, String>) -> String {
    let body = fields
        .into_iter()
        .map(|(k, v)| format!("{}:{}", quote(&k), v))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{}}}", body)
}

fn quote(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Mapping;

    fn ws_opts(first_path: bool) -> Value {
        let mut headers = Mapping::new();
        headers.insert("Host".into(), "cdn.example.com".into());
        let mut opts = Mapping::new();
        if first_path {
            opts.insert("path".into(), "/ws".into());
            opts.insert("headers".into(), Value::Mapping(headers));
        } else {
            opts.insert("headers".into(), Value::Mapping(headers));
            opts.insert("path".into(), "/ws".into());
        }
        Value::Mapping(opts)
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let a = ProxyConfig::new("vmess", "example.com", 443)
            .with("uuid", "u-1")
            .with("ws-opts", ws_opts(true));
        let b = ProxyConfig::new("vmess", "example.com", 443)
            .with("ws-opts", ws_opts(false))
            .with("uuid", "u-1");
        assert_eq!(compute(&a).unwrap(), compute(&b).unwrap());
    }

    #[test]
    fn test_key_representation_does_not_matter() {
        let mut numeric = Mapping::new();
        numeric.insert(Value::from(1), "x".into());
        let mut textual = Mapping::new();
        textual.insert("1".into(), "x".into());

        let a = ProxyConfig::new("ss", "h", 1).with("m", Value::Mapping(numeric));
        let b = ProxyConfig::new("ss", "h", 1).with("m", Value::Mapping(textual));
        assert_eq!(compute(&a).unwrap(), compute(&b).unwrap());
    }

    #[test]
    fn test_name_and_kind_alias() {
        let a = ProxyConfig::new("Shadowsocks", "h", 8388)
            .with_name("tokyo")
            .with("unique-id", "stale");
        let b = ProxyConfig::new("ss", "h", 8388).with_name("osaka");
        assert_eq!(compute(&a).unwrap(), compute(&b).unwrap());

        let c = ProxyConfig::new("ss", "h", 8389);
        assert_ne!(compute(&b).unwrap(), compute(&c).unwrap());
    }

    #[test]
    fn test_identity_shape() {
        let id = compute(&ProxyConfig::new("trojan", "h", 443)).unwrap();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_tagged_value_rejected() {
        let tagged: Value = serde_yaml::from_str("!custom 5").unwrap();
        let config = ProxyConfig::new("ss", "h", 1).with("weird", tagged);
        assert!(matches!(compute(&config), Err(Error::Config(_))));
    }
}
