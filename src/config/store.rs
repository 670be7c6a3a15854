//! Configuration snapshot store
//!
//! Readers take cheap immutable snapshots; reload and partial updates
//! validate fully before an atomic swap. A failed update leaves the
//! previous snapshot in effect.

use std::sync::Arc;

use arc_swap::ArcSwap;

use super::Config;
use crate::error::ServiceError;

pub struct ConfigStore {
    inner: ArcSwap<Config>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        Self {
            inner: ArcSwap::from_pointee(config),
        }
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    /// Apply a section-wise partial update. Returns the new snapshot, or the
    /// validation error with the old snapshot untouched.
    pub fn update(&self, partial: serde_json::Value) -> Result<Arc<Config>, ServiceError> {
        let current = self.snapshot();
        let updated = current.update(partial)?;
        let updated = Arc::new(updated);
        self.inner.store(Arc::clone(&updated));
        tracing::info!("configuration updated");
        Ok(updated)
    }

    /// Replace the whole configuration (hot reload). Validates first; on
    /// failure the old snapshot stays in effect.
    pub fn replace(&self, config: Config) -> Result<Arc<Config>, ServiceError> {
        config.validate()?;
        let config = Arc::new(config);
        self.inner.store(Arc::clone(&config));
        tracing::info!("configuration replaced");
        Ok(config)
    }
}
