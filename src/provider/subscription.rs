//! Periodically refreshed subscription feeding the executor

use super::{Fetcher, SubscriptionInfo};
use crate::config::{parse_links, ProxyConfig, SubscriptionConfig};
use crate::executor::Executor;
use crate::{Error, Result};
use parking_lot::RwLock;
use serde_yaml::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Decode a subscription body into proxy records.
///
/// YAML documents with a `proxies:` sequence are read as structured
/// records; anything else is treated as a link list. Entries that fail to
/// decode are logged and skipped.
pub fn decode_content(content: &str) -> Vec<ProxyConfig> {
    if let Some(records) = yaml_proxies(content) {
        return records
            .iter()
            .filter_map(|record| match record {
                Value::Mapping(mapping) => match ProxyConfig::from_mapping(mapping) {
                    Ok(config) => Some(config),
                    Err(e) => {
                        warn!("skip proxy record: {}", e);
                        None
                    }
                },
                _ => None,
            })
            .collect();
    }

    parse_links(content)
        .into_iter()
        .filter_map(|parsed| match parsed {
            Ok(config) => Some(config),
            Err(e) => {
                debug!("skip proxy link: {}", e);
                None
            }
        })
        .collect()
}

fn yaml_proxies(content: &str) -> Option<Vec<Value>> {
    match serde_yaml::from_str::<Value>(content).ok()? {
        Value::Mapping(mut doc) => match doc.remove("proxies")? {
            Value::Sequence(list) => Some(list),
            _ => None,
        },
        _ => None,
    }
}

pub struct SubscriptionProvider {
    name: String,
    fetcher: Fetcher,
    executor: Arc<Executor>,
    info: RwLock<Option<SubscriptionInfo>>,
}

impl SubscriptionProvider {
    pub fn new(config: &SubscriptionConfig, executor: Arc<Executor>) -> Result<Self> {
        let fetcher = Fetcher::new(
            config.url.clone(),
            config.path.as_ref().map(PathBuf::from),
            Duration::from_secs(config.interval),
        )?;

        Ok(SubscriptionProvider {
            name: config.name.clone(),
            fetcher,
            executor,
            info: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscription_info(&self) -> Option<SubscriptionInfo> {
        self.info.read().clone()
    }

    /// Register every node in `content`; returns how many were new
    pub fn register(&self, content: &str) -> usize {
        let configs = decode_content(content);
        let total = configs.len();

        let mut added = 0;
        for config in configs {
            match self.executor.build_adapter(config) {
                Ok(adapter) => {
                    if self.executor.add_node(adapter) {
                        added += 1;
                    }
                }
                Err(e) => warn!("[{}] skip node: {}", self.name, e),
            }
        }

        info!("[{}] {} nodes decoded, {} new", self.name, total, added);
        added
    }

    /// Fetch the subscription and register its nodes
    pub async fn update(&self) -> Result<usize> {
        let (content, headers) = self.fetcher.fetch().await?;

        if let Some(info) = headers
            .get("subscription-userinfo")
            .and_then(|v| v.to_str().ok())
            .and_then(SubscriptionInfo::parse)
        {
            *self.info.write() = Some(info);
        }

        let content = String::from_utf8(content)
            .map_err(|_| Error::parse(format!("subscription {} is not UTF-8", self.name)))?;
        Ok(self.register(&content))
    }

    /// Register from the cache, if any, then fetch
    pub async fn initial(&self) -> Result<usize> {
        let mut added = 0;
        if self.fetcher.cache_path().is_some() {
            match self.fetcher.load_cache().await {
                Ok(cached) => added += self.register(&String::from_utf8_lossy(&cached)),
                Err(e) => debug!("[{}] no cached copy: {}", self.name, e),
            }
        }
        Ok(added + self.update().await?)
    }

    /// Initial load followed by a refresh every interval, until shutdown
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.initial().await {
                warn!("[{}] initial update failed: {}", self.name, e);
            }

            let every = self.fetcher.interval();
            if every.is_zero() {
                return;
            }

            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.update().await {
                            warn!("[{}] update failed: {}", self.name, e);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("[{}] subscription stopped", self.name);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::BuiltinDialers;
    use crate::rule::RuleTable;
    use base64::Engine;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const LINKS: &str = "socks5://127.0.0.1:1080#a\nhttp://127.0.0.1:8080#b\nnot-a-link\n";

    fn executor() -> Arc<Executor> {
        Arc::new(Executor::new(
            Arc::new(RuleTable::new(None)),
            Default::default(),
            Arc::new(BuiltinDialers::default()),
        ))
    }

    #[test]
    fn test_decode_link_list() {
        let wrapped = base64::engine::general_purpose::STANDARD.encode(LINKS);
        let configs = decode_content(&wrapped);
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].proxy_type, "socks5");
        assert_eq!(configs[1].port, 8080);
    }

    #[test]
    fn test_decode_yaml_document() {
        let doc = r#"
proxies:
  - name: one
    type: socks5
    server: 10.0.0.1
    port: 1080
  - name: broken
    type: socks5
  - just-a-string
"#;
        let configs = decode_content(doc);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name.as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn test_register_dedups() {
        let executor = executor();
        let provider = SubscriptionProvider::new(
            &SubscriptionConfig {
                name: "test".into(),
                url: "http://127.0.0.1:1/sub".into(),
                interval: 0,
                path: None,
            },
            executor.clone(),
        )
        .unwrap();

        assert_eq!(provider.register(LINKS), 2);
        assert_eq!(provider.register(LINKS), 0);
        assert_eq!(executor.all_proxies().len(), 2);
    }

    #[tokio::test]
    async fn test_update_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            let body = base64::engine::general_purpose::STANDARD.encode(LINKS);
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nSubscription-Userinfo: upload=1; download=2; total=3\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(resp.as_bytes()).await.unwrap();
        });

        let executor = executor();
        let cache = std::env::temp_dir().join(format!("nico-sub-{}.txt", uuid::Uuid::new_v4()));
        let provider = SubscriptionProvider::new(
            &SubscriptionConfig {
                name: "remote".into(),
                url: format!("http://{}/sub", addr),
                interval: 0,
                path: Some(cache.to_string_lossy().into_owned()),
            },
            executor.clone(),
        )
        .unwrap();

        assert_eq!(provider.update().await.unwrap(), 2);
        assert_eq!(provider.subscription_info().map(|i| i.total), Some(3));

        let cached = tokio::fs::read_to_string(&cache).await.unwrap();
        assert!(!cached.is_empty());
        let _ = tokio::fs::remove_file(&cache).await;
    }
}
