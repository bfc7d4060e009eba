//! Unified cache manager.
//!
//! Named caches are registered once at startup, each with an invalidation
//! strategy:
//!
//! - `memory`: LRU with per-entry TTL
//! - `file_watcher`: entries dropped when a watched path changes; change
//!   notifications are debounced to coalesce editor save bursts, but an
//!   explicit invalidate from inside a saga step applies immediately
//! - `manual`: only explicit invalidation
//! - `never`: always miss (useful for disabling a cache in config)
//!
//! Values are JSON so one manager serves template sources, role lookups,
//! and record metadata alike.

use crate::error::{Error, Result};
use lru::LruCache;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Invalidation strategy for a named cache.
#[derive(Debug, Clone)]
pub enum Strategy {
    Memory,
    FileWatcher { watch_paths: Vec<PathBuf> },
    Manual,
    Never,
}

/// Registration parameters for one named cache.
#[derive(Debug, Clone)]
pub struct CacheRegistration {
    pub name: String,
    pub strategy: Strategy,
    pub default_ttl: Option<Duration>,
    pub max_size: usize,
}

struct Entry {
    value: Arc<serde_json::Value>,
    expires_at: Option<Instant>,
}

struct NamedCache {
    strategy: Strategy,
    default_ttl: Option<Duration>,
    entries: Mutex<LruCache<String, Entry>>,
}

impl NamedCache {
    fn new(reg: &CacheRegistration) -> Result<Self> {
        let cap = NonZeroUsize::new(reg.max_size.max(1))
            .ok_or_else(|| Error::InvalidInput("cache max_size must be positive".into()))?;
        Ok(NamedCache {
            strategy: reg.strategy.clone(),
            default_ttl: reg.default_ttl,
            entries: Mutex::new(LruCache::new(cap)),
        })
    }

    fn watches(&self, changed: &Path) -> bool {
        match &self.strategy {
            Strategy::FileWatcher { watch_paths } => {
                watch_paths.iter().any(|root| changed.starts_with(root))
            }
            _ => false,
        }
    }
}

/// Registry of named caches plus the shared watcher plumbing.
#[derive(Clone)]
pub struct CacheManager {
    caches: Arc<Mutex<HashMap<String, Arc<NamedCache>>>>,
    debounce: Duration,
    // The notify watcher must outlive the manager; kept here once started.
    watcher: Arc<Mutex<Option<RecommendedWatcher>>>,
}

impl CacheManager {
    pub fn new(debounce: Duration) -> Self {
        CacheManager {
            caches: Arc::new(Mutex::new(HashMap::new())),
            debounce,
            watcher: Arc::new(Mutex::new(None)),
        }
    }

    /// Registers a named cache. Duplicate names are a conflict.
    pub async fn register(&self, reg: CacheRegistration) -> Result<()> {
        let mut caches = self.caches.lock().await;
        if caches.contains_key(&reg.name) {
            return Err(Error::DuplicateKey {
                key: format!("cache:{}", reg.name),
            });
        }
        caches.insert(reg.name.clone(), Arc::new(NamedCache::new(&reg)?));
        Ok(())
    }

    pub async fn get(&self, name: &str, key: &str) -> Option<Arc<serde_json::Value>> {
        let cache = self.cache_handle(name).await?;
        if matches!(cache.strategy, Strategy::Never) {
            return None;
        }

        let mut entries = cache.entries.lock().await;
        let entry = entries.get(key)?;
        if let Some(expires_at) = entry.expires_at {
            if Instant::now() > expires_at {
                entries.pop(key);
                return None;
            }
        }
        Some(entry.value.clone())
    }

    pub async fn insert(&self, name: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let cache = self
            .cache_handle(name)
            .await
            .ok_or_else(|| Error::InvalidInput(format!("unknown cache: {name}")))?;
        if matches!(cache.strategy, Strategy::Never) {
            return Ok(());
        }

        let expires_at = cache.default_ttl.map(|ttl| Instant::now() + ttl);
        let mut entries = cache.entries.lock().await;
        entries.put(
            key.to_string(),
            Entry {
                value: Arc::new(value),
                expires_at,
            },
        );
        Ok(())
    }

    /// Explicit invalidation of one cache, applied immediately so a read
    /// later in the same saga step observes the write.
    pub async fn invalidate(&self, name: &str) {
        if let Some(cache) = self.cache_handle(name).await {
            cache.entries.lock().await.clear();
        }
    }

    pub async fn invalidate_key(&self, name: &str, key: &str) {
        if let Some(cache) = self.cache_handle(name).await {
            cache.entries.lock().await.pop(key);
        }
    }

    /// Drops entries of every file-watcher cache whose roots cover `path`.
    pub async fn invalidate_path(&self, path: &Path) {
        let caches = self.caches.lock().await;
        for (name, cache) in caches.iter() {
            if cache.watches(path) {
                debug!(cache = %name, path = %path.display(), "file change invalidation");
                cache.entries.lock().await.clear();
            }
        }
    }

    /// Starts the shared file watcher over every registered watch root.
    ///
    /// Events funnel into a debounce worker: bursts within the window
    /// collapse into one invalidation sweep. Test-mode callers skip this
    /// and drive [`Self::invalidate_path`] directly.
    pub async fn start_watcher(&self) -> Result<()> {
        let roots: Vec<PathBuf> = {
            let caches = self.caches.lock().await;
            caches
                .values()
                .filter_map(|c| match &c.strategy {
                    Strategy::FileWatcher { watch_paths } => Some(watch_paths.clone()),
                    _ => None,
                })
                .flatten()
                .collect()
        };
        if roots.is_empty() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                match result {
                    Ok(event) => {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                    Err(e) => warn!(error = %e, "file watcher error"),
                }
            })
            .map_err(|e| Error::InvalidInput(format!("failed to start watcher: {e}")))?;

        for root in &roots {
            if root.exists() {
                watcher
                    .watch(root, RecursiveMode::Recursive)
                    .map_err(|e| Error::InvalidInput(format!("failed to watch {}: {e}", root.display())))?;
            }
        }
        *self.watcher.lock().await = Some(watcher);

        let manager = self.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut changed = vec![first];
                // Collect the burst, then sweep once.
                let deadline = tokio::time::Instant::now() + debounce;
                loop {
                    match tokio::time::timeout_at(deadline, rx.recv()).await {
                        Ok(Some(path)) => changed.push(path),
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                for path in changed {
                    manager.invalidate_path(&path).await;
                }
            }
        });

        Ok(())
    }

    async fn cache_handle(&self, name: &str) -> Option<Arc<NamedCache>> {
        self.caches.lock().await.get(name).cloned()
    }
}
