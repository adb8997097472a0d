//! Process-lifetime runtime service
//!
//! Owns the wasm engine and the compiled-artifact caches. Cloning a
//! [`Runtime`] is cheap and shares everything.

use std::sync::Arc;

use tracing::info;
use wasmi::Engine;

use super::cache::{fetch_artifact, ModuleCache};
use super::guest::{GuestError, GuestModule};
use super::vt::{VtArtifact, VtError};
use crate::config::DEFAULT_CACHE_CAPACITY;
use crate::ui::canvas::MetricsCache;

struct Inner {
    engine: Engine,
    guests: ModuleCache<Arc<GuestModule>>,
    engines: ModuleCache<Arc<VtArtifact>>,
    metrics: MetricsCache,
}

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl Runtime {
    /// `cache_capacity` bounds each module cache; zero disables eviction
    pub fn new(cache_capacity: usize) -> Self {
        info!("Starting runtime (cache capacity {})", cache_capacity);
        Self {
            inner: Arc::new(Inner {
                engine: Engine::default(),
                guests: ModuleCache::new("guest", cache_capacity),
                engines: ModuleCache::new("vt engine", cache_capacity),
                metrics: MetricsCache::new(),
            }),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub fn metrics(&self) -> &MetricsCache {
        &self.inner.metrics
    }

    /// Fetch and compile a guest, once per source
    pub fn load_guest(&self, source: &str) -> Result<Arc<GuestModule>, GuestError> {
        self.inner.guests.get_or_try_insert(source, || {
            let bytes = fetch_artifact(source)?;
            GuestModule::compile(&self.inner.engine, source, &bytes).map(Arc::new)
        })
    }

    /// Fetch, compile and probe a VT engine, once per source.
    ///
    /// Incompatible engines stay cached with their verdict, so later loads
    /// fail without probing again.
    pub fn load_vt(&self, source: &str) -> Result<Arc<VtArtifact>, VtError> {
        let artifact = self.inner.engines.get_or_try_insert(source, || {
            let bytes = fetch_artifact(source)?;
            VtArtifact::load(&self.inner.engine, source, &bytes).map(Arc::new)
        })?;
        artifact.verdict()?;
        Ok(artifact)
    }

    /// Compile in-memory guest bytes and cache them under `source`
    pub fn register_guest(&self, source: &str, bytes: &[u8]) -> Result<Arc<GuestModule>, GuestError> {
        let module = Arc::new(GuestModule::compile(&self.inner.engine, source, bytes)?);
        self.inner.guests.insert(source, module.clone());
        Ok(module)
    }

    pub fn cached_guests(&self) -> usize {
        self.inner.guests.len()
    }

    pub fn cached_engines(&self) -> usize {
        self.inner.engines.len()
    }
}
