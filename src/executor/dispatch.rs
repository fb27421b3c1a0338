//! Connection dispatch: route, dial, fail over, learn, relay

use super::Executor;
use crate::adapter::ProxyAdapter;
use crate::common::net::relay;
use crate::common::Metadata;
use crate::inbound::ConnContext;
use crate::outbound::{OutboundProxy, ProxyConnection};
use crate::rule::{AdapterAction, Route, Rule};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

/// Something a connection can be dialed through
enum Candidate {
    Builtin(AdapterAction, Arc<dyn OutboundProxy>),
    Adapter(Arc<ProxyAdapter>),
}

impl Candidate {
    fn action(&self) -> AdapterAction {
        match self {
            Candidate::Builtin(action, _) => *action,
            Candidate::Adapter(adapter) => adapter.action(),
        }
    }

    fn identity(&self) -> Option<&str> {
        match self {
            Candidate::Builtin(..) => None,
            Candidate::Adapter(adapter) => Some(adapter.identity()),
        }
    }

    fn label(&self) -> String {
        match self {
            Candidate::Builtin(action, _) => action.to_string(),
            Candidate::Adapter(adapter) => adapter.to_string(),
        }
    }
}

impl Executor {
    /// Fill in the destination IP when only a host name is known
    async fn resolve_destination(&self, metadata: &Metadata) -> Metadata {
        let mut resolved = metadata.clone();
        if resolved.dst_ip.is_some() || resolved.host.is_empty() {
            return resolved;
        }

        if let Some(resolver) = &self.resolver {
            match resolver.resolve(&resolved.host).await {
                Ok(ip) => resolved.dst_ip = Some(ip),
                Err(e) => debug!("resolve {} failed: {}", resolved.host, e),
            }
        }
        resolved
    }

    fn pick(&self, route: &Route) -> Option<Candidate> {
        match route.action {
            AdapterAction::Direct => Some(Candidate::Builtin(
                AdapterAction::Direct,
                Arc::clone(&self.direct),
            )),
            AdapterAction::Reject => Some(Candidate::Builtin(
                AdapterAction::Reject,
                Arc::clone(&self.reject),
            )),
            AdapterAction::Proxy => {
                let pool = self.pool.read();
                route
                    .proxy
                    .as_deref()
                    .and_then(|identity| pool.find_alive(identity))
                    .or_else(|| pool.best_alive(None))
                    .map(Candidate::Adapter)
            }
        }
    }

    async fn dial(&self, candidate: &Candidate, metadata: &Metadata) -> Result<Box<dyn ProxyConnection>> {
        match candidate {
            Candidate::Builtin(_, dialer) => {
                timeout(self.probe.dial_timeout(), dialer.dial_tcp(metadata))
                    .await
                    .map_err(|_| {
                        Error::timeout(format!("dial {} timed out", metadata.remote_address()))
                    })?
            }
            Candidate::Adapter(adapter) => adapter.dial(metadata).await,
        }
    }

    /// Open the upstream side for one connection.
    ///
    /// A failed first dial is retried once through the best alive adapter
    /// other than the one that failed. When the retry succeeds, rules for
    /// the destination IP and host are learned, pinned to that adapter.
    pub async fn connect(&self, metadata: &Metadata) -> Result<Box<dyn ProxyConnection>> {
        let metadata = self.resolve_destination(metadata).await;
        let route = self.rules.match_route(&metadata);

        let first = self
            .pick(&route)
            .ok_or_else(|| Error::connection("no usable proxy"))?;
        info!(
            "try to connect {} using {}",
            metadata.remote_address(),
            first.label()
        );

        let err = match self.dial(&first, &metadata).await {
            Ok(conn) => {
                debug!("{} using {}", metadata.remote_address(), first.label());
                return Ok(conn);
            }
            Err(e) => e,
        };
        warn!(
            "connect {} using {} failed: {}",
            metadata.remote_address(),
            first.label(),
            err
        );

        if first.action() == AdapterAction::Reject {
            return Err(err);
        }

        let retry = self
            .pool
            .read()
            .best_alive(first.identity())
            .ok_or_else(|| Error::connection("no usable proxy"))?;
        info!(
            "try to connect {} using {}",
            metadata.remote_address(),
            retry
        );

        let conn = retry.dial(&metadata).await?;
        self.learn(&metadata, &retry, first.identity());
        Ok(conn)
    }

    /// Learn rules for `metadata` pinned to `adapter`; rules pinned to the
    /// adapter that just failed are taken over
    fn learn(&self, metadata: &Metadata, adapter: &ProxyAdapter, failed: Option<&str>) {
        let action = adapter.action();
        let mut learned = Vec::with_capacity(2);

        if let Some(ip) = metadata.dst_ip {
            learned.push(Rule::dst_ip(ip, action).with_proxy(adapter.identity()));
        }

        let ip = metadata.dst_ip.map(|ip| ip.to_string()).unwrap_or_default();
        if !metadata.host.is_empty() && metadata.host != ip {
            match Rule::domain(&metadata.host, action) {
                Ok(rule) => learned.push(rule.with_proxy(adapter.identity())),
                Err(e) => warn!("learn rule for {} failed: {}", metadata.host, e),
            }
        }

        let added = match failed {
            Some(stale) => learned
                .into_iter()
                .map(|rule| self.rules.repin(rule, stale))
                .filter(|written| *written)
                .count(),
            None => self.rules.add_rules(learned),
        };
        if added > 0 {
            info!(
                "learned {} rules for {} via {}",
                added,
                metadata.destination(),
                adapter
            );
        }
    }

    /// Connect upstream and relay until either side closes
    pub async fn handle_conn(&self, ctx: ConnContext) {
        let ConnContext {
            metadata,
            mut stream,
            ..
        } = ctx;

        let mut remote = match self.connect(&metadata).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("drop {}: {}", metadata, e);
                return;
            }
        };

        match relay(&mut *stream, &mut *remote).await {
            Ok((up, down)) => debug!(
                "{} closed (up {} bytes, down {} bytes)",
                metadata.remote_address(),
                up,
                down
            ),
            Err(e) => debug!("{} relay ended: {}", metadata.remote_address(), e),
        }
    }

    /// Handle every connection event on its own task until shutdown
    pub fn serve(
        self: &Arc<Self>,
        mut conns: mpsc::Receiver<ConnContext>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    conn = conns.recv() => {
                        let Some(ctx) = conn else {
                            break;
                        };
                        let span = info_span!("conn", id = %ctx.id);
                        let executor = Arc::clone(&executor);
                        tokio::spawn(async move { executor.handle_conn(ctx).await }.instrument(span));
                    }
                    _ = shutdown.recv() => {
                        break;
                    }
                }
            }
            info!("connection dispatch stopped");
        })
    }
}
