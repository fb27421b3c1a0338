//! Ranked adapter pool

use crate::adapter::ProxyAdapter;
use std::cmp::Ordering;
use std::sync::Arc;

/// Every registered adapter and the alive subset, both best first
#[derive(Default)]
pub struct Pool {
    pub all: Vec<Arc<ProxyAdapter>>,
    pub alive: Vec<Arc<ProxyAdapter>>,
}

impl Pool {
    /// Re-rank `all` and rebuild `alive` from it.
    ///
    /// Delay ascending, then speed descending; remaining ties keep their
    /// previous relative order. Metrics are read once up front so the
    /// comparison sees a consistent snapshot.
    pub fn sort(&mut self) {
        let mut keyed: Vec<(u16, f64, Arc<ProxyAdapter>)> = self
            .all
            .drain(..)
            .map(|adapter| (adapter.delay(), adapter.speed(), adapter))
            .collect();

        keyed.sort_by(|a, b| compare(a.0, a.1, b.0, b.1));

        self.all = keyed.into_iter().map(|(_, _, adapter)| adapter).collect();
        self.rebuild_alive();
    }

    pub fn rebuild_alive(&mut self) {
        self.alive = self.all.iter().filter(|a| a.alive()).cloned().collect();
    }

    /// Whether an adapter with this identity is alive or not yet checked
    pub fn has_live_twin(&self, identity: &str) -> bool {
        self.all
            .iter()
            .any(|a| a.identity() == identity && !a.known_dead())
    }

    /// Drop adapters whose last probe failed; returns how many went
    pub fn remove_dead(&mut self) -> usize {
        let before = self.all.len();
        self.all.retain(|a| !a.known_dead());
        before - self.all.len()
    }

    pub fn remove(&mut self, identity: &str) -> Vec<Arc<ProxyAdapter>> {
        let (removed, kept) = self
            .all
            .drain(..)
            .partition(|a| a.identity() == identity);
        self.all = kept;
        self.rebuild_alive();
        removed
    }

    pub fn find(&self, identity: &str) -> Option<Arc<ProxyAdapter>> {
        self.all.iter().find(|a| a.identity() == identity).cloned()
    }

    pub fn find_alive(&self, identity: &str) -> Option<Arc<ProxyAdapter>> {
        self.alive.iter().find(|a| a.identity() == identity).cloned()
    }

    /// Best alive adapter, skipping `exclude` when given
    pub fn best_alive(&self, exclude: Option<&str>) -> Option<Arc<ProxyAdapter>> {
        self.alive
            .iter()
            .find(|a| Some(a.identity()) != exclude)
            .cloned()
    }
}

fn compare(delay_a: u16, speed_a: f64, delay_b: u16, speed_b: f64) -> Ordering {
    delay_a
        .cmp(&delay_b)
        .then_with(|| speed_b.total_cmp(&speed_a))
}
