//! Persisted key/value store
//!
//! A YAML document on disk mirrored in memory. Writes mark the store
//! dirty; a background task flushes it every minute and once more on
//! shutdown.

use crate::rule::RuleInfo;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Key the rule list lives under
pub const RULE_KEY: &str = "rule";

/// Persistence boundary of the rule table
pub trait RuleStore: Send + Sync {
    fn load_rules(&self) -> Result<Vec<RuleInfo>>;

    fn save_rules(&self, rules: Vec<RuleInfo>) -> Result<()>;
}

/// YAML file backed key/value store
pub struct ConfigStore {
    path: PathBuf,
    values: RwLock<Mapping>,
    dirty: AtomicBool,
}

impl ConfigStore {
    /// Open the store.
    ///
    /// A missing file starts empty. An unreadable or malformed file is
    /// logged and also starts empty; it stays on disk untouched until the
    /// next flush writes a fresh document.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match Self::read_document(&path) {
            Ok(values) => values,
            Err(e) => {
                error!("store {} unusable, starting empty: {}", path.display(), e);
                Mapping::new()
            }
        };

        ConfigStore {
            path,
            values: RwLock::new(values),
            dirty: AtomicBool::new(false),
        }
    }

    fn read_document(path: &Path) -> Result<Mapping> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("store {} not found, starting empty", path.display());
                return Ok(Mapping::new());
            }
            Err(e) => return Err(Error::persistence(format!("{}: {}", path.display(), e))),
        };

        if content.trim().is_empty() {
            return Ok(Mapping::new());
        }
        match serde_yaml::from_str::<Value>(&content)
            .map_err(|e| Error::persistence(e.to_string()))?
        {
            Value::Mapping(m) => Ok(m),
            Value::Null => Ok(Mapping::new()),
            _ => Err(Error::persistence("not a key/value document")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Value) {
        self.values.write().insert(Value::String(key.to_string()), value);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write the document if anything changed since the last flush
    pub fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let content = {
            let values = self.values.read();
            serde_yaml::to_string(&*values)
        };
        let content = match content {
            Ok(c) => c,
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                return Err(Error::persistence(e.to_string()));
            }
        };

        if let Err(e) = self.write_file(&content) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }

        debug!("store flushed to {}", self.path.display());
        Ok(())
    }

    fn write_file(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::persistence(format!("{}: {}", parent.display(), e)))?;
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| Error::persistence(format!("{}: {}", self.path.display(), e)))
    }

    /// Flush every `interval` until shutdown, then flush once more
    pub fn spawn_flusher(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.flush() {
                            error!("store flush failed: {}", e);
                        }
                    }
                    _ = shutdown.recv() => {
                        if let Err(e) = self.flush() {
                            error!("store flush on exit failed: {}", e);
                        }
                        break;
                    }
                }
            }
        })
    }
}

impl RuleStore for ConfigStore {
    fn load_rules(&self) -> Result<Vec<RuleInfo>> {
        let list = match self.get(RULE_KEY) {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Sequence(seq)) => seq,
            Some(_) => return Err(Error::persistence("stored rule list is not a sequence")),
        };

        let mut rules = Vec::with_capacity(list.len());
        for entry in list {
            match serde_yaml::from_value::<RuleInfo>(entry) {
                Ok(info) => rules.push(info),
                Err(e) => warn!("skip malformed stored rule: {}", e),
            }
        }
        Ok(rules)
    }

    fn save_rules(&self, rules: Vec<RuleInfo>) -> Result<()> {
        let value =
            serde_yaml::to_value(rules).map_err(|e| Error::persistence(e.to_string()))?;
        self.set(RULE_KEY, value);
        Ok(())
    }
}

/// In-memory store for embedding and tests
#[derive(Default)]
pub struct MemoryStore {
    rules: Mutex<Vec<RuleInfo>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<RuleInfo>) -> Self {
        MemoryStore {
            rules: Mutex::new(rules),
        }
    }

    pub fn snapshot(&self) -> Vec<RuleInfo> {
        self.rules.lock().clone()
    }
}

impl RuleStore for MemoryStore {
    fn load_rules(&self) -> Result<Vec<RuleInfo>> {
        Ok(self.snapshot())
    }

    fn save_rules(&self, rules: Vec<RuleInfo>) -> Result<()> {
        *self.rules.lock() = rules;
        Ok(())
    }
}
