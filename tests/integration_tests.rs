//! End-to-end behavior of the pool, dispatch and rule persistence
//!
//! Everything here goes through the public crate API with in-process fake
//! dialers, so no network access is needed.

use async_trait::async_trait;
use nico_gateway::adapter::{ProxyAdapter, ALIVE, DELAY, SPEED};
use nico_gateway::common::{ConnType, Metadata};
use nico_gateway::config::{ConfigStore, ProbeConfig, ProxyConfig, RuleStore};
use nico_gateway::executor::Executor;
use nico_gateway::outbound::{BuiltinDialers, OutboundProxy, ProxyConnection, ProxyType};
use nico_gateway::rule::{AdapterAction, Rule, RuleKind, RuleTable};
use nico_gateway::{Error, Result};
use serde_yaml::Mapping;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Answers the first request with `204 No Content`, counting dials
struct Healthy {
    dials: AtomicUsize,
}

/// Refuses every dial, counting attempts
struct Refusing {
    dials: AtomicUsize,
}

#[async_trait]
impl OutboundProxy for Healthy {
    fn name(&self) -> &str {
        "healthy"
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Trojan
    }

    fn server(&self) -> &str {
        "fake"
    }

    fn support_udp(&self) -> bool {
        false
    }

    async fn dial_tcp(&self, _metadata: &Metadata) -> Result<Box<dyn ProxyConnection>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = server.read(&mut buf).await;
            let _ = server
                .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                .await;
            let _ = server.read(&mut buf).await;
        });
        Ok(Box::new(client))
    }
}

#[async_trait]
impl OutboundProxy for Refusing {
    fn name(&self) -> &str {
        "refusing"
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Trojan
    }

    fn server(&self) -> &str {
        "fake"
    }

    fn support_udp(&self) -> bool {
        false
    }

    async fn dial_tcp(&self, _metadata: &Metadata) -> Result<Box<dyn ProxyConnection>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Err(Error::connection("Connection refused"))
    }
}

fn executor(rules: Arc<RuleTable>) -> Executor {
    let probe = ProbeConfig {
        delay_url: "http://probe.test/generate_204".to_string(),
        ..Default::default()
    };
    Executor::new(rules, probe, Arc::new(BuiltinDialers::default()))
}

fn node(port: u16, dialer: Arc<dyn OutboundProxy>) -> ProxyAdapter {
    ProxyAdapter::new(ProxyConfig::new("trojan", "example.com", port), dialer).unwrap()
}

fn healthy() -> Arc<Healthy> {
    Arc::new(Healthy {
        dials: AtomicUsize::new(0),
    })
}

fn refusing() -> Arc<Refusing> {
    Arc::new(Refusing {
        dials: AtomicUsize::new(0),
    })
}

fn destination() -> Metadata {
    Metadata::tcp(ConnType::HttpConnect)
        .with_host("example.org")
        .with_dst_ip(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)))
        .with_dst_port(443)
}

#[tokio::test]
async fn test_ranking_prefers_low_delay_then_high_speed() {
    let executor = executor(Arc::new(RuleTable::new(None)));
    for (port, delay, speed) in [(1u16, 50u16, 10.0f64), (2, 30, 5.0), (3, 30, 20.0)] {
        assert!(executor.add_node(node(port, healthy())));
        let adapter = executor
            .all_proxies()
            .into_iter()
            .find(|a| a.port() == port)
            .unwrap();
        adapter.store(ALIVE, true);
        adapter.store(DELAY, delay);
        adapter.store(SPEED, speed);
    }

    executor.proxy_sort();
    let ports: Vec<u16> = executor.alive_proxies().iter().map(|a| a.port()).collect();
    assert_eq!(ports, vec![3, 2, 1]);
    assert_eq!(executor.choose_proxy().map(|a| a.port()), Some(3));

    executor.proxy_sort();
    let again: Vec<u16> = executor.alive_proxies().iter().map(|a| a.port()).collect();
    assert_eq!(again, ports);
}

#[tokio::test]
async fn test_failed_probe_keeps_delay() {
    let executor = executor(Arc::new(RuleTable::new(None)));
    executor.add_node(node(1, refusing()));
    let adapter = executor.all_proxies()[0].clone();
    adapter.store(ALIVE, true);
    adapter.store(DELAY, 120u16);

    assert!(executor.check_delay(&adapter).await.is_none());
    assert!(adapter.known_dead());
    assert_eq!(adapter.delay(), 120);

    let executor = executor_with_healthy();
    let adapter = executor.all_proxies()[0].clone();
    assert!(executor.check_delay(&adapter).await.is_some());
    assert!(adapter.alive());
}

fn executor_with_healthy() -> Executor {
    let executor = executor(Arc::new(RuleTable::new(None)));
    executor.add_node(node(1, healthy()));
    executor
}

#[tokio::test]
async fn test_identity_ignores_name_and_key_order() {
    let executor = executor(Arc::new(RuleTable::new(None)));

    let first: Mapping = serde_yaml::from_str(
        "{name: a, type: socks5, server: 10.0.0.1, port: 1080, username: u, password: p}",
    )
    .unwrap();
    let second: Mapping = serde_yaml::from_str(
        "{password: p, port: 1080, username: u, server: 10.0.0.1, type: SOCKS5, name: b}",
    )
    .unwrap();

    assert!(executor.add_node_from_config(&first).unwrap());
    assert!(!executor.add_node_from_config(&second).unwrap());
    assert_eq!(executor.all_proxies().len(), 1);
}

#[tokio::test]
async fn test_failover_learns_and_persists() {
    let path = std::env::temp_dir().join(format!("nico-it-{}.yaml", uuid::Uuid::new_v4()));
    let store = Arc::new(ConfigStore::open(&path));
    let rules = Arc::new(RuleTable::new(Some(store.clone() as Arc<dyn RuleStore>)));
    rules.add_rule(Rule::new(RuleKind::DstPort, "443", AdapterAction::Proxy).unwrap());

    let executor = executor(rules.clone());
    let bad = refusing();
    let good = healthy();
    executor.add_node(node(1, bad.clone()));
    executor.add_node(node(2, good.clone()));
    for (adapter, delay) in executor.all_proxies().iter().zip([10u16, 20]) {
        adapter.store(ALIVE, true);
        adapter.store(DELAY, delay);
    }
    executor.proxy_sort();
    let rescuer = executor.alive_proxies()[1].identity().to_string();

    assert!(executor.connect(&destination()).await.is_ok());
    assert_eq!(bad.dials.load(Ordering::SeqCst), 1);
    assert_eq!(good.dials.load(Ordering::SeqCst), 1);

    rules.sync().unwrap();
    store.flush().unwrap();

    let reopened = Arc::new(ConfigStore::open(&path));
    let restored = RuleTable::new(Some(reopened as Arc<dyn RuleStore>));
    let pinned: Vec<_> = restored
        .rules()
        .into_iter()
        .filter(|r| r.proxy.as_deref() == Some(rescuer.as_str()))
        .collect();
    assert_eq!(pinned.len(), 2);
    assert_eq!(restored.len(), 3);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_reject_route_never_touches_pool() {
    let rules = Arc::new(RuleTable::new(None));
    rules.add_rule(Rule::domain("example.org", AdapterAction::Reject).unwrap());

    let executor = executor(rules.clone());
    let good = healthy();
    executor.add_node(node(1, good.clone()));
    executor.all_proxies()[0].store(ALIVE, true);
    executor.proxy_sort();

    assert!(executor.connect(&destination()).await.is_ok());
    assert_eq!(good.dials.load(Ordering::SeqCst), 0);
    assert_eq!(rules.len(), 1);
}
