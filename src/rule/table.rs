//! Keyed rule collection
//!
//! Rules are stored by their bare payload, so at most one rule exists per
//! payload string and the first writer wins. Matching walks the table in
//! hash order: when several rules match one connection, which one decides
//! is unspecified.

use super::{AdapterAction, Rule, RuleInfo};
use crate::common::Metadata;
use crate::config::RuleStore;
use crate::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of matching one connection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Route {
    pub action: AdapterAction,
    /// Adapter identity pinned by the matching rule
    pub proxy: Option<String>,
}

pub struct RuleTable {
    rules: RwLock<HashMap<String, Rule>>,
    store: Option<Arc<dyn RuleStore>>,
}

impl RuleTable {
    /// Create a table, loading whatever the store holds
    pub fn new(store: Option<Arc<dyn RuleStore>>) -> Self {
        let table = RuleTable {
            rules: RwLock::new(HashMap::new()),
            store,
        };
        table.load();
        table
    }

    fn load(&self) {
        let Some(store) = self.store.as_ref() else {
            return;
        };

        let infos = match store.load_rules() {
            Ok(infos) => infos,
            Err(e) => {
                error!("load rules failed: {}", e);
                return;
            }
        };

        let mut rules = self.rules.write();
        for info in infos {
            match Rule::from_info(&info) {
                Ok(rule) => {
                    rules.entry(rule.key().to_string()).or_insert(rule);
                }
                Err(e) => warn!("skip stored rule {}({}): {}", info.rule, info.payload, e),
            }
        }
        info!("loaded {} rules", rules.len());
    }

    /// Insert unless a rule with the same key exists; true when inserted
    pub fn add_rule(&self, rule: Rule) -> bool {
        let mut rules = self.rules.write();
        if rules.contains_key(rule.key()) {
            debug!("rule {} already present, keep existing", rule.key());
            return false;
        }
        info!("add rule {}", rule);
        rules.insert(rule.key().to_string(), rule);
        true
    }

    /// Insert unless a rule with the same key exists, except that a rule
    /// pinned to `stale` is replaced; true when written
    pub fn repin(&self, rule: Rule, stale: &str) -> bool {
        let mut rules = self.rules.write();
        match rules.get(rule.key()) {
            Some(existing) if existing.proxy() != Some(stale) => {
                debug!("rule {} already present, keep existing", rule.key());
                return false;
            }
            Some(_) => info!("re-pin rule {} away from {}", rule, stale),
            None => info!("add rule {}", rule),
        }
        rules.insert(rule.key().to_string(), rule);
        true
    }

    /// Insert each rule first-writer-wins; returns how many were new
    pub fn add_rules<I: IntoIterator<Item = Rule>>(&self, rules: I) -> usize {
        rules.into_iter().map(|r| self.add_rule(r)).filter(|added| *added).count()
    }

    pub fn remove(&self, key: &str) -> Option<RuleInfo> {
        self.rules.write().remove(key).map(|r| r.export())
    }

    pub fn match_route(&self, metadata: &Metadata) -> Route {
        let rules = self.rules.read();
        rules
            .values()
            .find(|rule| rule.matches(metadata))
            .map(|rule| Route {
                action: rule.action(),
                proxy: rule.proxy().map(str::to_string),
            })
            .unwrap_or_default()
    }

    /// Action for the connection; Direct when nothing matches
    pub fn match_action(&self, metadata: &Metadata) -> AdapterAction {
        self.match_route(metadata).action
    }

    /// Exported rules ordered by key
    pub fn rules(&self) -> Vec<RuleInfo> {
        let mut infos: Vec<RuleInfo> = self.rules.read().values().map(Rule::export).collect();
        infos.sort_by(|a, b| a.payload.cmp(&b.payload));
        infos
    }

    /// Hand the full rule list to the store
    pub fn sync(&self) -> Result<()> {
        let Some(store) = self.store.as_ref() else {
            debug!("no rule store configured, skip sync");
            return Ok(());
        };
        let infos = self.rules();
        let count = infos.len();
        store.save_rules(infos)?;
        info!("synced {} rules", count);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}
