//! Module cache and artifact fetching
//!
//! Compiled modules are kept per source identity (the source string as
//! given) in a bounded LRU. Values are `Arc`s, so evicting an entry never
//! affects sessions already holding it.

use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported artifact source: {0} (only paths and file:// URLs)")]
    UnsupportedSource(String),

    #[error("Artifact is empty: {0}")]
    Empty(String),
}

/// Resolve a source string to bytes
pub fn fetch_artifact(source: &str) -> Result<Vec<u8>, LoadError> {
    let path = if let Some(rest) = source.strip_prefix("file://") {
        PathBuf::from(rest)
    } else if source.contains("://") {
        return Err(LoadError::UnsupportedSource(source.to_string()));
    } else {
        PathBuf::from(source)
    };
    let bytes = fs::read(&path).map_err(|source| LoadError::Io {
        path: path.clone(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(LoadError::Empty(path.display().to_string()));
    }
    debug!("Fetched {} ({} bytes)", path.display(), bytes.len());
    Ok(bytes)
}

/// Bounded, thread-safe memo of loaded modules keyed by source
pub struct ModuleCache<V: Clone> {
    name: &'static str,
    entries: Mutex<LruCache<String, V>>,
}

impl<V: Clone> ModuleCache<V> {
    /// A capacity of zero means unbounded
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let entries = match NonZeroUsize::new(capacity) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            name,
            entries: Mutex::new(entries),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.lock().get(key).cloned()
    }

    pub fn insert(&self, key: &str, value: V) {
        if let Some((evicted, _)) = self.lock().push(key.to_string(), value) {
            if evicted != key {
                debug!("{} cache evicted {}", self.name, evicted);
            }
        }
    }

    /// Return the cached value or load, cache and return it.
    ///
    /// The lock is held while loading, so concurrent requests for the same
    /// source compile once. Failures are not cached.
    pub fn get_or_try_insert<E, F>(&self, key: &str, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let mut entries = self.lock();
        if let Some(value) = entries.get(key) {
            debug!("{} cache hit: {}", self.name, key);
            return Ok(value.clone());
        }
        let value = load()?;
        entries.put(key.to_string(), value.clone());
        Ok(value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
