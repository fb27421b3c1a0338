//! nico-gateway - adaptive routing gateway
//!
//! Accepts HTTP and SOCKS5 connections on one port and decides per
//! connection whether to go direct, reject, or forward through one of many
//! outbound proxies. The proxy pool is ranked continuously by measured
//! delay and throughput; failed dials fail over to the next best proxy and
//! teach the rule table which proxy serves that destination.
//!
//! # Architecture
//!
//! ```text
//!   +-------------+      +----------------+      +-------------+
//!   |  inbound/   | ---> |   executor/    | <--- |   hub/      |
//!   |  (mixed)    | conn | (pool, probes, |      |  (REST API) |
//!   +-------------+      |   dispatch)    |      +-------------+
//!                        +---+--------+---+
//!                            |        |
//!                  +---------v--+  +--v----------+
//!                  |   rule/    |  |  adapter/   |
//!                  |  (table)   |  | (identity,  |
//!                  +-----+------+  |  metrics)   |
//!                        |         +------+------+
//!                  +-----v------+         |
//!                  |  config/   |  +------v------+
//!                  |  (store)   |  |  outbound/  |
//!                  +------------+  |  (dialers)  |
//!                                  +-------------+
//! ```

pub mod adapter;
pub mod common;
pub mod config;
pub mod dns;
pub mod executor;
pub mod hub;
pub mod inbound;
pub mod outbound;
pub mod provider;
pub mod rule;

pub use common::error::{Error, Result};
pub use config::Config;

use config::ConfigStore;
use executor::Executor;
use hub::AppState;
use inbound::{Credentials, InboundListener, MixedListener};
use outbound::BuiltinDialers;
use provider::SubscriptionProvider;
use rule::RuleTable;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pending inbound connections not yet picked up by dispatch
const CONN_QUEUE_SIZE: usize = 1024;

/// How often dirty store contents are written to disk
const STORE_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Gateway instance wiring every component together
pub struct Gateway {
    config: Config,
    store: Arc<ConfigStore>,
    executor: Arc<Executor>,
    api_addr: Option<SocketAddr>,
}

impl Gateway {
    /// Create a new Gateway from configuration
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing nico-gateway v{}", VERSION);

        let api_addr = config
            .external_controller
            .as_ref()
            .and_then(|addr| addr.parse::<SocketAddr>().ok());

        let store = Arc::new(ConfigStore::open(&config.store_path));
        info!("Config store opened at {}", store.path().display());

        let rules = Arc::new(RuleTable::new(Some(store.clone())));
        info!("Loaded {} rules", rules.len());

        let dialers = Arc::new(BuiltinDialers::new(config.probe.dial_timeout()));
        let mut executor = Executor::new(rules, config.probe.clone(), dialers);
        if config.dns.enable {
            let resolver = dns::Resolver::new(&config.dns)?;
            executor = executor.with_resolver(Arc::new(resolver));
            info!("DNS resolver initialized");
        }

        Ok(Gateway {
            config,
            store,
            executor: Arc::new(executor),
            api_addr,
        })
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Register the proxies and links listed in the configuration
    pub fn register_static_nodes(&self) -> usize {
        let mut added = 0;
        for mapping in &self.config.proxies {
            match self.executor.add_node_from_config(mapping) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => warn!("skip configured proxy: {}", e),
            }
        }
        added += self
            .executor
            .add_nodes_from_links(&self.config.links.join("\n"));
        info!("Registered {} configured proxies", added);
        added
    }

    /// Start all services and block until Ctrl-C
    pub async fn run(&self) -> Result<()> {
        info!("Starting gateway...");

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let pool_handle = self.executor.start(shutdown_tx.subscribe())?;
        self.register_static_nodes();

        let flusher = self
            .store
            .clone()
            .spawn_flusher(STORE_FLUSH_INTERVAL, shutdown_tx.subscribe());

        let (conn_tx, conn_rx) = mpsc::channel(CONN_QUEUE_SIZE);
        self.executor.serve(conn_rx, shutdown_tx.subscribe());

        let listener = if self.config.mixed_port != 0 {
            let users = self
                .config
                .credentials()?
                .into_iter()
                .map(|(user, pass)| Credentials::new(user, pass))
                .collect();
            let listener =
                Arc::new(MixedListener::bind(&self.config.listen_address(), users, conn_tx).await?);
            info!("Mixed proxy listening on {}", listener.local_addr());

            let accept = listener.clone();
            tokio::spawn(async move {
                if let Err(e) = accept.start().await {
                    warn!("Inbound listener error: {}", e);
                }
            });
            Some(listener)
        } else {
            None
        };

        if let Some(addr) = self.api_addr {
            let state = AppState::new(
                self.config.secret.clone().unwrap_or_default(),
                self.executor.clone(),
            );
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = hub::start_server(state, addr, shutdown).await {
                    warn!("REST API server error: {}", e);
                }
            });
        }

        for sub in &self.config.subscriptions {
            match SubscriptionProvider::new(sub, self.executor.clone()) {
                Ok(provider) => {
                    Arc::new(provider).spawn(shutdown_tx.subscribe());
                }
                Err(e) => warn!("subscription {} disabled: {}", sub.name, e),
            }
        }

        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");

        if let Err(e) = self.executor.rules().sync() {
            error!("rule sync failed: {}", e);
        }
        if let Some(listener) = listener {
            listener.stop().await?;
        }
        let _ = shutdown_tx.send(());

        if let Err(e) = flusher.await {
            error!("store flusher panicked: {}", e);
        }
        if let Err(e) = pool_handle.await {
            error!("pool loop panicked: {}", e);
        }

        info!("Gateway stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_gateway_registers_configured_nodes() {
        let store = std::env::temp_dir().join(format!("nico-gw-{}.yaml", uuid::Uuid::new_v4()));
        let yaml = format!(
            r#"
store-path: {}
dns:
  enable: false
links:
  - socks5://127.0.0.1:1080#a
  - bogus://x
proxies:
  - name: b
    type: http
    server: 127.0.0.1
    port: 8080
  - name: a-again
    type: socks5
    server: 127.0.0.1
    port: 1080
    udp: true
"#,
            store.display()
        );
        let config = Config::from_str(&yaml).unwrap();
        let gateway = Gateway::new(config).await.unwrap();

        assert_eq!(gateway.register_static_nodes(), 2);
        assert_eq!(gateway.executor().all_proxies().len(), 2);
    }

    #[tokio::test]
    async fn test_gateway_survives_broken_store() {
        let store = std::env::temp_dir().join(format!("nico-gw-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&store, "rule: [unterminated").unwrap();

        let yaml = format!("store-path: {}\ndns:\n  enable: false\n", store.display());
        let gateway = Gateway::new(Config::from_str(&yaml).unwrap()).await.unwrap();
        assert!(gateway.executor().rules().is_empty());

        let _ = std::fs::remove_file(&store);
    }
}
