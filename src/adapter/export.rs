//! Export formats: normalized record, YAML and share links

use super::ProxyAdapter;
use crate::common::net::join_host_port;
use crate::outbound::ProxyType;
use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_yaml::{Mapping, Value};
use url::form_urlencoded;

impl ProxyAdapter {
    /// Record form: display name, canonical kind, endpoint, options and identity
    pub fn to_normalized_config(&self) -> Mapping {
        let mut mapping = Mapping::new();
        mapping.insert("name".into(), self.name.clone().into());
        mapping.insert("type".into(), self.proxy_type.as_str().into());
        mapping.insert("server".into(), self.config.server.clone().into());
        mapping.insert("port".into(), Value::from(self.config.port));
        for (key, value) in &self.config.extra {
            if key == "unique-id" {
                continue;
            }
            mapping.insert(Value::String(key.clone()), value.clone());
        }
        mapping.insert("unique-id".into(), self.identity.clone().into());
        mapping
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.to_normalized_config())?)
    }

    /// Share link for kinds that have a well-known link format
    pub fn to_share_link(&self) -> Result<String> {
        match self.proxy_type {
            ProxyType::Trojan => Ok(self.trojan_link()),
            ProxyType::Shadowsocks => Ok(self.shadowsocks_link()),
            ProxyType::Vmess => self.vmess_link(),
            other => Err(Error::unsupported(format!(
                "unsupported kind {} for share link",
                other.as_str()
            ))),
        }
    }

    fn endpoint(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    fn option(&self, key: &str) -> Option<String> {
        self.config.get_string(key)
    }

    fn trojan_link(&self) -> String {
        let password = self.option("password").unwrap_or_default();

        // Keys in lexical order, matching what common clients emit
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("headerType", "none");
        query.append_pair("security", "tls");
        if let Some(sni) = self.option("sni") {
            query.append_pair("sni", &sni);
        }
        if let Some(network) = self.option("network") {
            query.append_pair("type", &network);
            if network == "ws" {
                if let Some(path) = self.ws_path() {
                    query.append_pair("wspath", &path);
                }
            }
        }

        format!(
            "trojan://{}@{}?{}#{}",
            urlencoding::encode(&password),
            self.endpoint(),
            query.finish(),
            urlencoding::encode(&self.name)
        )
    }

    fn ws_path(&self) -> Option<String> {
        match self.config.extra.get("ws-opts") {
            Some(Value::Mapping(opts)) => opts.get("path").and_then(Value::as_str).map(str::to_string),
            _ => self.option("ws-path"),
        }
    }

    fn shadowsocks_link(&self) -> String {
        let cipher = self.option("cipher").unwrap_or_default();
        let password = self.option("password").unwrap_or_default();
        format!(
            "ss://{}:{}@{}#{}",
            urlencoding::encode(&cipher),
            urlencoding::encode(&password),
            self.endpoint(),
            urlencoding::encode(&self.name)
        )
    }

    fn vmess_link(&self) -> Result<String> {
        let mut body = serde_json::Map::new();
        body.insert("v".into(), "2".into());
        body.insert("ps".into(), self.name.clone().into());
        body.insert("add".into(), self.host.clone().into());
        body.insert("port".into(), self.port.into());

        for (field, key) in [("id", "uuid"), ("scy", "cipher"), ("net", "network")] {
            if let Some(value) = self.option(key) {
                body.insert(field.into(), value.into());
            }
        }
        if let Some(aid) = self.config.get_int("alterId") {
            body.insert("aid".into(), aid.into());
        }
        if self.config.get_bool("tls").unwrap_or(false) {
            body.insert("tls".into(), "tls".into());
        }

        let json = serde_json::to_vec(&serde_json::Value::Object(body))?;
        Ok(format!("vmess://{}", STANDARD.encode(json)))
    }
}

#[cfg(test)]
mod tests {
    use crate::adapter::tests::adapter_for;
    use crate::config::{parse_link, ProxyConfig};
    use crate::Error;
    use serde_yaml::{Mapping, Value};

    #[test]
    fn test_trojan_link() {
        let mut ws = Mapping::new();
        ws.insert("path".into(), "/chat".into());
        let config = ProxyConfig::new("trojan", "example.com", 443)
            .with_name("jp 1")
            .with("password", "p@ss")
            .with("sni", "cdn.example.com")
            .with("network", "ws")
            .with("ws-opts", Value::Mapping(ws));

        let link = adapter_for(config).to_share_link().unwrap();
        assert_eq!(
            link,
            "trojan://p%40ss@example.com:443?headerType=none&security=tls&sni=cdn.example.com&type=ws&wspath=%2Fchat#jp%201"
        );
    }

    #[test]
    fn test_shadowsocks_link_parses_back() {
        let config = ProxyConfig::new("ss", "1.2.3.4", 8388)
            .with_name("hk")
            .with("cipher", "aes-256-gcm")
            .with("password", "secret");
        let adapter = adapter_for(config);

        let link = adapter.to_share_link().unwrap();
        assert_eq!(link, "ss://aes-256-gcm:secret@1.2.3.4:8388#hk");

        let decoded = parse_link(&link).unwrap();
        assert_eq!(decoded.server, "1.2.3.4");
        assert_eq!(decoded.get_string("cipher").as_deref(), Some("aes-256-gcm"));
    }

    #[test]
    fn test_vmess_link_parses_back() {
        let config = ProxyConfig::new("vmess", "v.example.com", 443)
            .with_name("us")
            .with("uuid", "b831381d-6324-4d53-ad4f-8cda48b30811")
            .with("alterId", 0)
            .with("cipher", "auto")
            .with("tls", true);
        let adapter = adapter_for(config);

        let link = adapter.to_share_link().unwrap();
        let decoded = parse_link(&link).unwrap();
        assert_eq!(decoded.server, "v.example.com");
        assert_eq!(decoded.port, 443);
        assert_eq!(decoded.name.as_deref(), Some("us"));
        assert_eq!(
            decoded.get_string("uuid").as_deref(),
            Some("b831381d-6324-4d53-ad4f-8cda48b30811")
        );
    }

    #[test]
    fn test_unsupported_kind() {
        let adapter = adapter_for(ProxyConfig::new("socks5", "127.0.0.1", 1080));
        assert!(matches!(adapter.to_share_link(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_normalized_config() {
        let adapter = adapter_for(
            ProxyConfig::new("Shadowsocks", "h", 1)
                .with("cipher", "none")
                .with("unique-id", "stale"),
        );
        let mapping = adapter.to_normalized_config();
        assert_eq!(mapping.get("type").and_then(Value::as_str), Some("ss"));
        assert_eq!(
            mapping.get("unique-id").and_then(Value::as_str),
            Some(adapter.identity())
        );
        assert_eq!(mapping.get("name").and_then(Value::as_str), Some(adapter.name()));

        let yaml = adapter.to_yaml().unwrap();
        assert!(yaml.contains("cipher: none"));
    }
}
