//! Builder API and serializable configuration for caches.
//!
//! # Example
//!
//! ```ignore
//! use cached_value::{CacheBuilder, CacheConfig};
//!
//! let config: CacheConfig =
//!     serde_json::from_str(r#"{ "name": "profile", "expiration_ms": 30000 }"#)?;
//!
//! let profile = CacheBuilder::from_config(&config)
//!     .sink(sink.clone())
//!     .build_overlay(fetch_profile)?;
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Settings, ValueCache};
use crate::diagnostics::DiagnosticSink;
use crate::error::CacheError;
use crate::overlay::TransformOverlay;
use crate::producer::Producer;

const DEFAULT_NAME: &str = "cached-value";

/// Serializable cache configuration.
///
/// Missing fields fall back to [`CacheConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Label used in logs and diagnostics.
    pub name: String,

    /// Time in milliseconds a fetched value stays fresh.
    pub expiration_ms: u64,

    /// Withdraw the current value from subscribers while a refresh is in flight.
    pub blocking: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            name: DEFAULT_NAME.to_string(),
            expiration_ms: 60_000,
            blocking: true,
        }
    }
}

impl CacheConfig {
    pub fn expiration(&self) -> Duration {
        Duration::from_millis(self.expiration_ms)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), CacheError> {
        validate(&self.name, self.expiration())
    }
}

fn validate(name: &str, expiration: Duration) -> Result<(), CacheError> {
    if name.trim().is_empty() {
        return Err(CacheError::Config("name must not be empty".to_string()));
    }
    if expiration.is_zero() {
        return Err(CacheError::Config(format!("[{}] expiration must be positive", name)));
    }
    Ok(())
}

/// Builder for [`ValueCache`] and [`TransformOverlay`] instances.
pub struct CacheBuilder {
    name: String,
    expiration: Option<Duration>,
    blocking: bool,
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl CacheBuilder {
    /// Create a builder. An expiration must be set before building.
    pub fn new() -> Self {
        CacheBuilder {
            name: DEFAULT_NAME.to_string(),
            expiration: None,
            blocking: true,
            sink: None,
        }
    }

    /// Create a builder from a configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        CacheBuilder {
            name: config.name.clone(),
            expiration: Some(config.expiration()),
            blocking: config.blocking,
            sink: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// How long a fetched value stays fresh.
    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Set the delivery policy. Defaults to blocking.
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Receive every diagnostic event emitted by the cache.
    pub fn sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn settings(self) -> Result<Settings, CacheError> {
        let expiration = self.expiration.ok_or_else(|| {
            CacheError::Config(format!("[{}] expiration is required", self.name))
        })?;

        validate(&self.name, expiration)?;

        Ok(Settings {
            name: self.name,
            expiration,
            blocking: self.blocking,
            sink: self.sink,
        })
    }

    /// Build a [`ValueCache`] reading through to `producer`.
    pub fn build<T, P>(self, producer: P) -> Result<ValueCache<T>, CacheError>
    where
        T: Clone + Send + Sync + 'static,
        P: Producer<T> + 'static,
    {
        let settings = self.settings()?;
        Ok(ValueCache::assemble(settings, Arc::new(producer), None))
    }

    /// Build a [`TransformOverlay`] reading through to `producer`.
    pub fn build_overlay<T, P>(self, producer: P) -> Result<TransformOverlay<T>, CacheError>
    where
        T: Clone + Send + Sync + 'static,
        P: Producer<T> + 'static,
    {
        let settings = self.settings()?;
        Ok(TransformOverlay::assemble(settings, Arc::new(producer)))
    }
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}
