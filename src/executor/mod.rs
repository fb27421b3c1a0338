//! Proxy pool manager
//!
//! The executor owns every registered [`ProxyAdapter`], keeps them ranked by
//! measured delay and speed, and routes inbound connections through the
//! rule table and the ranked pool. One background task drives probing:
//!
//! - a delay ticker re-checks every adapter,
//! - a speed ticker measures throughput of every adapter,
//! - an event queue carries first checks of new adapters and cleanups.
//!
//! Connection handling only ever takes short read locks on the pool and
//! never waits on a probe.

mod dispatch;
mod pool;
mod probe;

pub use probe::{bytes_per_second, format_speed};

use crate::adapter::{ProxyAdapter, ALIVE, DELAY, SPEED, SPEED_STR};
use crate::config::{parse_link, parse_links, ProbeConfig, ProxyConfig};
use crate::dns::Resolver;
use crate::outbound::{DialerFactory, Direct, OutboundProxy, Reject};
use crate::rule::RuleTable;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use pool::Pool;
use serde_yaml::Mapping;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Capacity of the pool event queue
pub const EVENT_QUEUE_SIZE: usize = 10;

/// Work queued for the pool loop
#[derive(Debug)]
pub enum PoolEvent {
    /// First delay check of a newly registered adapter
    Check(Arc<ProxyAdapter>),
    /// Drop adapters whose last check failed
    Cleanup,
}

type RegisterHook = Box<dyn Fn(&Arc<ProxyAdapter>) + Send + Sync>;
type DelayHook = Box<dyn Fn(&Arc<ProxyAdapter>, Option<Duration>) + Send + Sync>;

pub struct Executor {
    pool: RwLock<Pool>,
    rules: Arc<RuleTable>,
    probe: ProbeConfig,
    factory: Arc<dyn DialerFactory>,
    resolver: Option<Arc<Resolver>>,
    direct: Arc<dyn OutboundProxy>,
    reject: Arc<dyn OutboundProxy>,
    events_tx: mpsc::Sender<PoolEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<PoolEvent>>>,
    register_hooks: RwLock<Vec<RegisterHook>>,
    delay_hooks: RwLock<Vec<DelayHook>>,
}

impl Executor {
    pub fn new(rules: Arc<RuleTable>, probe: ProbeConfig, factory: Arc<dyn DialerFactory>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);

        Executor {
            pool: RwLock::new(Pool::default()),
            rules,
            probe,
            factory,
            resolver: None,
            direct: Arc::new(Direct::new()),
            reject: Arc::new(Reject::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            register_hooks: RwLock::new(Vec::new()),
            delay_hooks: RwLock::new(Vec::new()),
        }
    }

    /// Resolve destination hosts before rule matching
    pub fn with_resolver(mut self, resolver: Arc<Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn rules(&self) -> &Arc<RuleTable> {
        &self.rules
    }

    /// Called for every adapter passed to `add_node`, duplicate or not
    pub fn on_register<F>(&self, hook: F)
    where
        F: Fn(&Arc<ProxyAdapter>) + Send + Sync + 'static,
    {
        self.register_hooks.write().push(Box::new(hook));
    }

    /// Called after every delay check; `None` means the check failed
    pub fn on_delay_checked<F>(&self, hook: F)
    where
        F: Fn(&Arc<ProxyAdapter>, Option<Duration>) + Send + Sync + 'static,
    {
        self.delay_hooks.write().push(Box::new(hook));
    }

    /// Spawn the probing loop. Can only be started once.
    pub fn start(self: &Arc<Self>, shutdown: broadcast::Receiver<()>) -> Result<JoinHandle<()>> {
        let events = self
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| Error::internal("pool loop already started"))?;

        let executor = Arc::clone(self);
        Ok(tokio::spawn(async move {
            executor.run(events, shutdown).await;
        }))
    }

    async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<PoolEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let delay_every = self.probe.delay_interval();
        let speed_every = self.probe.speed_interval();

        let mut delay_ticker = interval_at(Instant::now() + delay_every, delay_every);
        delay_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut speed_ticker = interval_at(Instant::now() + speed_every, speed_every);
        speed_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "pool loop started (delay every {:?}, speed every {:?})",
            delay_every, speed_every
        );

        loop {
            tokio::select! {
                _ = delay_ticker.tick() => {
                    self.check_all_delays().await;
                }
                _ = speed_ticker.tick() => {
                    self.check_all_speeds().await;
                }
                Some(event) = events.recv() => {
                    self.handle_events(event, &mut events).await;
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }

        info!("pool loop stopped");
    }

    /// Handle `first` plus whatever else is already queued, in one pass
    async fn handle_events(&self, first: PoolEvent, events: &mut mpsc::Receiver<PoolEvent>) {
        let mut fresh = Vec::new();
        let mut cleanup = false;

        let mut next = Some(first);
        while let Some(event) = next {
            match event {
                PoolEvent::Check(adapter) => fresh.push(adapter),
                PoolEvent::Cleanup => cleanup = true,
            }
            next = events.try_recv().ok();
        }

        if !fresh.is_empty() {
            for adapter in &fresh {
                info!("load new node {} [{}]", adapter.name(), adapter.identity());
            }
            futures::future::join_all(fresh.iter().map(|a| self.check_delay(a))).await;
        }

        if cleanup {
            let removed = self.pool.write().remove_dead();
            info!("removed {} dead nodes", removed);
        }

        self.proxy_sort();
    }

    fn queue(&self, event: PoolEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(event).await;
                });
            }
            Err(TrySendError::Closed(_)) => debug!("pool loop gone, event dropped"),
        }
    }

    /// Register an adapter.
    ///
    /// Returns false when an adapter with the same identity is alive or
    /// still waiting for its first check. A dead twin does not block.
    pub fn add_node(&self, adapter: ProxyAdapter) -> bool {
        adapter.store(DELAY, 0);
        adapter.store(SPEED, 0);
        adapter.store(SPEED_STR, "wait");
        let adapter = Arc::new(adapter);

        let added = {
            let mut pool = self.pool.write();
            if pool.has_live_twin(adapter.identity()) {
                false
            } else {
                pool.all.push(Arc::clone(&adapter));
                true
            }
        };

        for hook in self.register_hooks.read().iter() {
            hook(&adapter);
        }

        if added {
            debug!("registered {} [{}]", adapter.name(), adapter.identity());
            self.queue(PoolEvent::Check(adapter));
        } else {
            debug!("skip duplicate {} [{}]", adapter.name(), adapter.identity());
        }
        added
    }

    pub fn build_adapter(&self, config: ProxyConfig) -> Result<ProxyAdapter> {
        Ok(ProxyAdapter::from_config(config, self.factory.as_ref())?
            .with_dial_timeout(self.probe.dial_timeout()))
    }

    /// Decode one share link and register it
    pub fn add_node_from_link(&self, link: &str) -> Result<bool> {
        let config = parse_link(link)?;
        let adapter = self.build_adapter(config)?;
        Ok(self.add_node(adapter))
    }

    /// Register a structured proxy record
    pub fn add_node_from_config(&self, mapping: &Mapping) -> Result<bool> {
        let config = ProxyConfig::from_mapping(mapping)?;
        let adapter = self.build_adapter(config)?;
        Ok(self.add_node(adapter))
    }

    /// Register every decodable link in a newline separated list; returns
    /// how many were added
    pub fn add_nodes_from_links(&self, content: &str) -> usize {
        let mut added = 0;
        for parsed in parse_links(content) {
            match parsed.and_then(|config| self.build_adapter(config)) {
                Ok(adapter) => {
                    if self.add_node(adapter) {
                        added += 1;
                    }
                }
                Err(e) => warn!("skip proxy link: {}", e),
            }
        }
        added
    }

    /// Probe delay through `adapter` and record the outcome
    pub async fn check_delay(&self, adapter: &Arc<ProxyAdapter>) -> Option<Duration> {
        debug!("check delay for {}", adapter.name());

        let result = probe::url_test(adapter, &self.probe.delay_url, self.probe.timeout()).await;
        let delay = match result {
            Ok(elapsed) => {
                let ms = elapsed.as_millis().min(u16::MAX as u128) as u64;
                adapter.store(ALIVE, true);
                adapter.store(DELAY, ms);
                info!("{} delay: {}ms", adapter.name(), ms);
                Some(elapsed)
            }
            Err(e) => {
                adapter.store(ALIVE, false);
                debug!("{} delay check failed: {}", adapter.name(), e);
                None
            }
        };

        for hook in self.delay_hooks.read().iter() {
            hook(adapter, delay);
        }
        delay
    }

    /// Measure throughput through `adapter` and record the outcome
    pub async fn check_speed(&self, adapter: &Arc<ProxyAdapter>) {
        debug!("check speed for {}", adapter.name());

        let result = probe::download_sample(
            adapter,
            &self.probe.speed_url,
            self.probe.speed_sample,
            self.probe.speed_timeout(),
        )
        .await;

        match result {
            Ok((bytes, elapsed)) => {
                let speed = bytes_per_second(bytes, elapsed);
                if speed > 0.0 {
                    adapter.store(SPEED, speed / 1024.0);
                }
                let label = format_speed(speed);
                info!("{} speed: {}", adapter.name(), label);
                adapter.store(SPEED_STR, label);
            }
            Err(e) => {
                warn!("{} speed check failed: {}", adapter.name(), e);
                adapter.store(SPEED, -1.0);
                adapter.store(SPEED_STR, "0bps");
            }
        }
    }

    /// Delay-check every adapter concurrently, then re-rank
    pub async fn check_all_delays(&self) {
        let adapters = self.all_proxies();
        info!("check delay for {} proxies", adapters.len());
        futures::future::join_all(adapters.iter().map(|a| self.check_delay(a))).await;
        self.proxy_sort();
    }

    /// Speed-check every adapter concurrently, then re-rank
    pub async fn check_all_speeds(&self) {
        let adapters = self.all_proxies();
        info!("check speed for {} proxies", adapters.len());
        futures::future::join_all(adapters.iter().map(|a| self.check_speed(a))).await;
        self.proxy_sort();
    }

    /// Re-rank the pool and rebuild the alive view
    pub fn proxy_sort(&self) {
        self.pool.write().sort();
    }

    /// Ask the loop to drop dead adapters
    pub fn clean_dead_nodes(&self) {
        self.queue(PoolEvent::Cleanup);
    }

    /// Best alive adapter
    pub fn choose_proxy(&self) -> Option<Arc<ProxyAdapter>> {
        self.pool.read().best_alive(None)
    }

    pub fn all_proxies(&self) -> Vec<Arc<ProxyAdapter>> {
        self.pool.read().all.clone()
    }

    pub fn alive_proxies(&self) -> Vec<Arc<ProxyAdapter>> {
        self.pool.read().alive.clone()
    }

    pub fn find(&self, identity: &str) -> Option<Arc<ProxyAdapter>> {
        self.pool.read().find(identity)
    }

    /// Drop every adapter with this identity; false when none existed
    pub fn remove_node(&self, identity: &str) -> bool {
        let removed = self.pool.write().remove(identity);
        for adapter in &removed {
            info!("removed node {} [{}]", adapter.name(), adapter.identity());
        }
        !removed.is_empty()
    }
}
