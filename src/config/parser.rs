//! Share-link decoder
//!
//! Turns `vmess://`, `vless://`, `trojan://`, `ss://`, `ssr://`,
//! `socks5://` and `http(s)://` links into [`ProxyConfig`] records.

use super::ProxyConfig;
use crate::common::net::split_host_port;
use crate::{Error, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use url::{Host, Url};

/// Decode base64 in any of the common alphabets, padded or not.
///
/// Returns `None` unless the input decodes to UTF-8 text.
pub fn decode_base64(input: &str) -> Option<String> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }

    [STANDARD, URL_SAFE, STANDARD_NO_PAD, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(cleaned.as_bytes()).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Decode one share link
pub fn parse_link(link: &str) -> Result<ProxyConfig> {
    let link = link.trim_end_matches(['\r', '\n']).trim();
    let (scheme, _) = link
        .split_once("://")
        .ok_or_else(|| Error::parse(format!("not a share link: {}", link)))?;

    match scheme.to_ascii_lowercase().as_str() {
        "vmess" => parse_vmess(link),
        "vless" => parse_vless(link),
        "trojan" => parse_trojan(link),
        "ss" => parse_shadowsocks(link),
        "ssr" => parse_shadowsocksr(link),
        "socks5" | "socks" => parse_socks5(link),
        "http" | "https" => parse_http(link),
        other => Err(Error::unsupported(format!("unsupported scheme: {}", other))),
    }
}

/// Decode a newline-separated link list, optionally base64 wrapped.
///
/// Blank lines are skipped; each remaining line yields its own result.
pub fn parse_links(content: &str) -> Vec<Result<ProxyConfig>> {
    let text = if content.contains("://") {
        content.to_string()
    } else {
        decode_base64(content).unwrap_or_else(|| content.to_string())
    };

    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_link)
        .collect()
}

fn parse_vmess(link: &str) -> Result<ProxyConfig> {
    let payload = strip_scheme(link);
    let json = decode_base64(payload)
        .ok_or_else(|| Error::parse("vmess link is not valid base64"))?;
    let obj: serde_json::Value = serde_json::from_str(&json)?;

    let field = |key: &str| -> Option<String> {
        match obj.get(key)? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    };

    let server = field("add")
        .or_else(|| field("host"))
        .ok_or_else(|| Error::parse("vmess link missing address"))?;
    let port = field("port")
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| Error::parse("vmess link has invalid port"))?;
    let uuid = field("id").ok_or_else(|| Error::parse("vmess link missing id"))?;
    let alter_id = field("aid").and_then(|a| a.parse::<i64>().ok()).unwrap_or(0);

    let tls = match obj.get("tls") {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => !s.is_empty(),
        _ => false,
    };

    let mut config = ProxyConfig::new("vmess", server, port)
        .with_name(field("ps").unwrap_or_default())
        .with("uuid", uuid)
        .with("alterId", alter_id)
        .with("cipher", field("scy").unwrap_or_else(|| "auto".to_string()))
        .with("udp", true)
        .with("tls", tls)
        .with("skip-cert-verify", true);

    if let Some(sni) = field("sni") {
        config.set("servername", sni);
    }

    if let Some(network) = field("net") {
        if network == "ws" {
            let mut ws = Mapping::new();
            ws.insert("path".into(), field("path").unwrap_or_default().into());
            if let Some(host) = field("host") {
                let mut headers = Mapping::new();
                headers.insert("Host".into(), host.into());
                ws.insert("headers".into(), Value::Mapping(headers));
            }
            config.set("ws-opts", Value::Mapping(ws));
        }
        config.set("network", network);
    }

    Ok(config)
}

fn parse_vless(link: &str) -> Result<ProxyConfig> {
    let url = Url::parse(link)?;
    let (server, port) = url_endpoint(&url)?;
    let query = query_map(&url);

    let uuid = percent_decode(url.username())?;
    if uuid.is_empty() {
        return Err(Error::parse("vless link missing uuid"));
    }

    let security = query.get("security").map(String::as_str).unwrap_or("");
    let network = query
        .get("type")
        .filter(|t| !t.is_empty())
        .cloned()
        .unwrap_or_else(|| "tcp".to_string());

    let mut config = ProxyConfig::new("vless", server, port)
        .with_name(fragment(&url)?)
        .with("uuid", uuid)
        .with("udp", true)
        .with("tls", security == "tls" || security == "reality")
        .with("network", network.clone())
        .with("skip-cert-verify", true);

    if let Some(name) = query
        .get("host")
        .filter(|h| !h.is_empty())
        .or_else(|| query.get("sni").filter(|s| !s.is_empty()))
    {
        config.set("servername", name.clone());
    }

    if let Some(flow) = query.get("flow").filter(|f| !f.is_empty()) {
        config.set("flow", flow.clone());
    }

    if network == "ws" {
        let mut ws = Mapping::new();
        ws.insert(
            "path".into(),
            query.get("path").cloned().unwrap_or_default().into(),
        );
        config.set("ws-opts", Value::Mapping(ws));
    }

    Ok(config)
}

fn parse_trojan(link: &str) -> Result<ProxyConfig> {
    let url = Url::parse(link)?;
    let (server, port) = url_endpoint(&url)?;
    let query = query_map(&url);

    let password = percent_decode(url.username())?;
    if password.is_empty() {
        return Err(Error::parse("trojan link missing password"));
    }

    let sni = query
        .get("sni")
        .filter(|s| !s.is_empty())
        .cloned()
        .unwrap_or_else(|| server.clone());
    let network = query.get("type").cloned().unwrap_or_default();

    let mut alpn: Vec<String> = Vec::new();
    if network == "h2" {
        alpn.push("h2".to_string());
    }
    for value in query.get("alpn").map(String::as_str).unwrap_or("").split(',') {
        if !value.is_empty() && !alpn.iter().any(|a| a == value) {
            alpn.push(value.to_string());
        }
    }

    let mut config = ProxyConfig::new("trojan", server, port)
        .with_name(fragment(&url)?)
        .with("password", password)
        .with("sni", sni)
        .with("udp", true)
        .with("skip-cert-verify", true);

    if !alpn.is_empty() {
        config.set(
            "alpn",
            Value::Sequence(alpn.into_iter().map(Value::String).collect()),
        );
    }

    let ws_path = query
        .get("wspath")
        .or_else(|| query.get("path"))
        .cloned()
        .unwrap_or_default();
    if network == "ws" || !ws_path.is_empty() {
        let mut ws = Mapping::new();
        ws.insert("path".into(), ws_path.into());
        config.set("ws-opts", Value::Mapping(ws));
        config.set("network", "ws");
    } else if !network.is_empty() {
        config.set("network", network);
    }

    Ok(config)
}

fn parse_shadowsocks(link: &str) -> Result<ProxyConfig> {
    let rest = strip_scheme(link);
    let (rest, name) = match rest.split_once('#') {
        Some((body, name)) => (body, percent_decode(name)?),
        None => (rest, String::new()),
    };
    let (body, query) = match rest.split_once('?') {
        Some((body, query)) => (body, Some(query)),
        None => (rest, None),
    };

    // Legacy form base64-encodes the whole `cipher:password@host:port`
    let body = if body.contains('@') {
        body.trim_end_matches('/').to_string()
    } else {
        decode_base64(body).ok_or_else(|| Error::parse("ss link is not valid base64"))?
    };

    let (userinfo, endpoint) = body
        .rsplit_once('@')
        .ok_or_else(|| Error::parse("ss link missing '@'"))?;

    let userinfo = match decode_base64(userinfo) {
        Some(decoded) if decoded.contains(':') => decoded,
        _ => percent_decode(userinfo)?,
    };
    let (cipher, password) = userinfo
        .split_once(':')
        .ok_or_else(|| Error::parse("ss link missing cipher or password"))?;

    let (server, port) = split_host_port(endpoint)?;
    let port = port.ok_or_else(|| Error::parse("ss link missing port"))?;

    let mut config = ProxyConfig::new("ss", server, port)
        .with_name(name)
        .with("cipher", cipher)
        .with("password", password)
        .with("udp", true);

    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "plugin" && !value.is_empty() {
                let mut parts = value.splitn(2, ';');
                if let Some(plugin) = parts.next() {
                    config.set("plugin", plugin.to_string());
                }
                if let Some(opts) = parts.next() {
                    config.set("plugin-opts", opts.to_string());
                }
            }
        }
    }

    Ok(config)
}

fn parse_shadowsocksr(link: &str) -> Result<ProxyConfig> {
    let decoded = decode_base64(strip_scheme(link))
        .ok_or_else(|| Error::parse("ssr link is not valid base64"))?;

    let (main, params) = match decoded.split_once("/?") {
        Some((main, params)) => (main, Some(params)),
        None => (decoded.as_str(), None),
    };

    // host may itself contain colons (IPv6), so peel fields from the right
    let mut fields: Vec<&str> = main.rsplitn(6, ':').collect();
    if fields.len() != 6 {
        return Err(Error::parse("ssr link has too few fields"));
    }
    fields.reverse();
    let (host, port, protocol, cipher, obfs, password) =
        (fields[0], fields[1], fields[2], fields[3], fields[4], fields[5]);

    let port = port
        .parse::<u16>()
        .map_err(|_| Error::parse(format!("ssr link has invalid port: {}", port)))?;
    let password =
        decode_base64(password).ok_or_else(|| Error::parse("ssr password is not base64"))?;

    let mut config = ProxyConfig::new("ssr", host.trim_matches(['[', ']']), port)
        .with("cipher", cipher)
        .with("password", password)
        .with("protocol", protocol)
        .with("obfs", obfs)
        .with("udp", true);

    if let Some(params) = params {
        for (key, value) in url::form_urlencoded::parse(params.as_bytes()) {
            let decoded = decode_base64(&value).unwrap_or_default();
            match key.as_ref() {
                "remarks" => config = config.with_name(decoded),
                "obfsparam" => config.set("obfs-param", decoded),
                "protoparam" => config.set("protocol-param", decoded),
                _ => {}
            }
        }
    }

    Ok(config)
}

fn parse_socks5(link: &str) -> Result<ProxyConfig> {
    let url = Url::parse(link)?;
    let (server, port) = url_endpoint(&url)?;
    let mut config = ProxyConfig::new("socks5", server, port)
        .with_name(fragment(&url)?)
        .with("udp", true);
    apply_credentials(&url, &mut config)?;
    Ok(config)
}

fn parse_http(link: &str) -> Result<ProxyConfig> {
    let url = Url::parse(link)?;
    let (server, port) = url_endpoint(&url)?;
    let mut config = ProxyConfig::new("http", server, port)
        .with_name(fragment(&url)?)
        .with("tls", url.scheme() == "https");
    apply_credentials(&url, &mut config)?;
    Ok(config)
}

fn apply_credentials(url: &Url, config: &mut ProxyConfig) -> Result<()> {
    let username = percent_decode(url.username())?;
    if !username.is_empty() {
        config.set("username", username);
    }
    if let Some(password) = url.password() {
        config.set("password", percent_decode(password)?);
    }
    Ok(())
}

fn strip_scheme(link: &str) -> &str {
    link.split_once("://").map(|(_, rest)| rest).unwrap_or(link)
}

fn url_endpoint(url: &Url) -> Result<(String, u16)> {
    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => return Err(Error::parse(format!("link has no host: {}", url))),
    };
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::parse(format!("link has no port: {}", url)))?;
    Ok((host, port))
}

fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn fragment(url: &Url) -> Result<String> {
    percent_decode(url.fragment().unwrap_or(""))
}

fn percent_decode(s: &str) -> Result<String> {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .map_err(|e| Error::parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        STANDARD.encode(s)
    }

    #[test]
    fn test_decode_base64_variants() {
        assert_eq!(decode_base64("aGVsbG8=").as_deref(), Some("hello"));
        assert_eq!(decode_base64("aGVsbG8").as_deref(), Some("hello"));
        assert_eq!(decode_base64("").as_deref(), None);
        assert_eq!(decode_base64("!!!").as_deref(), None);
    }

    #[test]
    fn test_parse_vmess_link() {
        let json = r#"{"v":"2","ps":"hk-01","add":"1.2.3.4","port":"443","id":"b831381d-6324-4d53-ad4f-8cda48b30811","aid":0,"net":"ws","path":"/ray","host":"cdn.example.com","tls":"tls"}"#;
        let link = format!("vmess://{}", b64(json));
        let config = parse_link(&link).unwrap();

        assert_eq!(config.proxy_type, "vmess");
        assert_eq!(config.name.as_deref(), Some("hk-01"));
        assert_eq!(config.server, "1.2.3.4");
        assert_eq!(config.port, 443);
        assert_eq!(config.get_string("cipher").as_deref(), Some("auto"));
        assert_eq!(config.get_bool("tls"), Some(true));
        assert_eq!(config.get_string("network").as_deref(), Some("ws"));
        assert!(config.extra.contains_key("ws-opts"));
    }

    #[test]
    fn test_parse_vless_link() {
        let link = "vless://b831381d-6324-4d53-ad4f-8cda48b30811@example.com:8443?security=tls&type=ws&path=%2Fws&sni=sni.example.com&flow=xtls-rprx-vision#my%20node";
        let config = parse_link(link).unwrap();

        assert_eq!(config.proxy_type, "vless");
        assert_eq!(config.name.as_deref(), Some("my node"));
        assert_eq!(config.port, 8443);
        assert_eq!(config.get_bool("tls"), Some(true));
        assert_eq!(config.get_string("network").as_deref(), Some("ws"));
        assert_eq!(
            config.get_string("servername").as_deref(),
            Some("sni.example.com")
        );
        assert_eq!(config.get_string("flow").as_deref(), Some("xtls-rprx-vision"));
    }

    #[test]
    fn test_parse_trojan_link() {
        let link = "trojan://p%40ss@[2001:db8::1]:443?alpn=h2,http/1.1#jp";
        let config = parse_link(link).unwrap();

        assert_eq!(config.proxy_type, "trojan");
        assert_eq!(config.server, "2001:db8::1");
        assert_eq!(config.get_string("password").as_deref(), Some("p@ss"));
        assert_eq!(config.get_string("sni").as_deref(), Some("2001:db8::1"));
        assert_eq!(config.get_bool("skip-cert-verify"), Some(true));
        assert!(matches!(config.extra.get("alpn"), Some(Value::Sequence(s)) if s.len() == 2));
    }

    #[test]
    fn test_parse_ss_sip002_link() {
        let link = format!(
            "ss://{}@1.2.3.4:8388/?plugin=obfs-local%3Bobfs%3Dhttp#ss%20node",
            URL_SAFE_NO_PAD.encode("aes-256-gcm:pass")
        );
        let config = parse_link(&link).unwrap();

        assert_eq!(config.proxy_type, "ss");
        assert_eq!(config.name.as_deref(), Some("ss node"));
        assert_eq!(config.server, "1.2.3.4");
        assert_eq!(config.port, 8388);
        assert_eq!(config.get_string("cipher").as_deref(), Some("aes-256-gcm"));
        assert_eq!(config.get_string("password").as_deref(), Some("pass"));
        assert_eq!(config.get_string("plugin").as_deref(), Some("obfs-local"));
        assert_eq!(config.get_string("plugin-opts").as_deref(), Some("obfs=http"));
    }

    #[test]
    fn test_parse_ss_legacy_link() {
        let link = format!("ss://{}#legacy", b64("chacha20-ietf-poly1305:pw@[::1]:8389"));
        let config = parse_link(&link).unwrap();

        assert_eq!(config.server, "::1");
        assert_eq!(config.port, 8389);
        assert_eq!(config.get_string("cipher").as_deref(), Some("chacha20-ietf-poly1305"));
    }

    #[test]
    fn test_parse_ssr_link() {
        let inner = format!(
            "example.com:8443:auth_aes128_md5:aes-256-cfb:tls1.2_ticket_auth:{}/?remarks={}&obfsparam={}",
            URL_SAFE_NO_PAD.encode("secret"),
            URL_SAFE_NO_PAD.encode("ssr node"),
            URL_SAFE_NO_PAD.encode("cdn.example.com"),
        );
        let link = format!("ssr://{}", URL_SAFE_NO_PAD.encode(inner));
        let config = parse_link(&link).unwrap();

        assert_eq!(config.proxy_type, "ssr");
        assert_eq!(config.server, "example.com");
        assert_eq!(config.port, 8443);
        assert_eq!(config.name.as_deref(), Some("ssr node"));
        assert_eq!(config.get_string("password").as_deref(), Some("secret"));
        assert_eq!(config.get_string("protocol").as_deref(), Some("auth_aes128_md5"));
        assert_eq!(config.get_string("obfs-param").as_deref(), Some("cdn.example.com"));
    }

    #[test]
    fn test_parse_socks_and_http_links() {
        let socks = parse_link("socks5://user:pw@127.0.0.1:1080#local").unwrap();
        assert_eq!(socks.proxy_type, "socks5");
        assert_eq!(socks.get_string("username").as_deref(), Some("user"));
        assert_eq!(socks.get_string("password").as_deref(), Some("pw"));

        let https = parse_link("https://proxy.example.com").unwrap();
        assert_eq!(https.proxy_type, "http");
        assert_eq!(https.port, 443);
        assert_eq!(https.get_bool("tls"), Some(true));
    }

    #[test]
    fn test_parse_link_errors() {
        assert!(matches!(
            parse_link("hysteria2://pw@a.com:443"),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(parse_link("garbage"), Err(Error::Parse(_))));
        assert!(parse_link("vmess://!!!").is_err());
        assert!(parse_link("trojan://@a.com:443").is_err());
    }

    #[test]
    fn test_parse_links_base64_list() {
        let list = "trojan://pw@a.com:443#a\r\n\r\nvless://id@b.com:443#b\nbogus://x\n";
        let results = parse_links(&b64(list));
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(results[2].is_err());
    }
}
