//! Diagnostic events emitted by caches.
//!
//! Every event is logged through `tracing` and, when one was injected, handed
//! to a [`DiagnosticSink`]. Caches behave the same with or without a sink.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::{Arc, Mutex};
//! use cached_value::{CacheBuilder, CacheEvent};
//!
//! let events = Arc::new(Mutex::new(Vec::new()));
//! let recorded = events.clone();
//!
//! let cache = CacheBuilder::new()
//!     .name("profile")
//!     .expiration(Duration::from_secs(60))
//!     .sink(Arc::new(move |event: CacheEvent| recorded.lock().unwrap().push(event)))
//!     .build(fetch_profile)?;
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::CacheError;

/// Events emitted over the lifetime of a cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// The value expired and the producer was dispatched.
    FetchStarted {
        /// Name of the cache.
        cache: String,
        /// Sequence number of this fetch.
        fetch_id: u64,
        /// Staleness threshold the expiration check used.
        threshold: Duration,
        /// Whether subscribers were blocked until the value arrives.
        blocking: bool,
    },
    /// The value expired but a fetch was already outstanding.
    FetchSkipped {
        cache: String,
        /// The outstanding fetch.
        fetch_id: u64,
    },
    /// A new value was published.
    Published {
        cache: String,
        /// The fetch that produced the value, `None` for a local `set`.
        fetch_id: Option<u64>,
        /// Producer latency in milliseconds, zero for a local `set`.
        latency_ms: f64,
    },
    /// The producer failed. Subscribers keep the previous value.
    ProducerFailed {
        cache: String,
        fetch_id: u64,
        error: CacheError,
        latency_ms: f64,
    },
    /// The value expired but the caller was outside a Tokio runtime, so no
    /// fetch could be spawned. Nothing changed.
    NoRuntime { cache: String },
    /// A fetch completed after the cache was closed and was ignored.
    CompletionDiscarded { cache: String, fetch_id: u64 },
    /// The cache was invalidated.
    Invalidated { cache: String },
    /// Expired transforms were dropped ahead of a publish.
    TransformsCleared {
        cache: String,
        removed: usize,
        remaining: usize,
    },
    /// The cache was closed.
    Closed { cache: String },
}

impl CacheEvent {
    /// Name of the cache that emitted the event.
    pub fn cache(&self) -> &str {
        match self {
            CacheEvent::FetchStarted { cache, .. }
            | CacheEvent::FetchSkipped { cache, .. }
            | CacheEvent::Published { cache, .. }
            | CacheEvent::ProducerFailed { cache, .. }
            | CacheEvent::NoRuntime { cache }
            | CacheEvent::CompletionDiscarded { cache, .. }
            | CacheEvent::Invalidated { cache }
            | CacheEvent::TransformsCleared { cache, .. }
            | CacheEvent::Closed { cache } => cache,
        }
    }
}

/// Trait for receiving cache diagnostics.
///
/// Implement this trait to collect events from a cache. Closures taking a
/// [`CacheEvent`] implement it as well.
pub trait DiagnosticSink: Send + Sync {
    /// Emit a single event.
    ///
    /// This is called synchronously, sometimes while the cache holds a lock.
    /// Implementations should be fast and must not call back into the cache.
    fn emit(&self, event: CacheEvent);
}

impl<F> DiagnosticSink for F
where
    F: Fn(CacheEvent) + Send + Sync,
{
    fn emit(&self, event: CacheEvent) {
        self(event)
    }
}

/// Logs events and forwards them to the injected sink.
#[derive(Clone, Default)]
pub(crate) struct Diagnostics {
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl Diagnostics {
    pub(crate) fn new(sink: Option<Arc<dyn DiagnosticSink>>) -> Self {
        Diagnostics { sink }
    }

    pub(crate) fn emit(&self, event: CacheEvent) {
        match &event {
            CacheEvent::FetchStarted {
                cache,
                fetch_id,
                threshold,
                blocking,
            } => tracing::debug!(
                cache = %cache,
                fetch_id,
                threshold_ms = threshold.as_millis() as u64,
                blocking,
                "value expired, producing"
            ),
            CacheEvent::FetchSkipped { cache, fetch_id } => {
                tracing::trace!(cache = %cache, fetch_id, "fetch already in flight")
            }
            CacheEvent::Published {
                cache,
                fetch_id,
                latency_ms,
            } => tracing::debug!(cache = %cache, ?fetch_id, latency_ms, "published value"),
            CacheEvent::ProducerFailed {
                cache,
                fetch_id,
                error,
                latency_ms,
            } => tracing::warn!(
                cache = %cache,
                fetch_id,
                latency_ms,
                error = %error,
                "producer failed, keeping previous value"
            ),
            CacheEvent::NoRuntime { cache } => {
                tracing::warn!(cache = %cache, "no tokio runtime, fetch not started")
            }
            CacheEvent::CompletionDiscarded { cache, fetch_id } => {
                tracing::debug!(cache = %cache, fetch_id, "discarding completion for closed cache")
            }
            CacheEvent::Invalidated { cache } => tracing::debug!(cache = %cache, "invalidated"),
            CacheEvent::TransformsCleared {
                cache,
                removed,
                remaining,
            } => tracing::debug!(cache = %cache, removed, remaining, "cleared expired transforms"),
            CacheEvent::Closed { cache } => tracing::debug!(cache = %cache, "closed"),
        }

        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }
}

/// Milliseconds elapsed since `start`.
pub(crate) fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
