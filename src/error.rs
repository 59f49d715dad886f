/// Boxed error returned by producers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The producer failed to yield a value.
    ///
    /// Never delivered to subscribers; only reported to diagnostics.
    #[error("[{cache}] producer failed: {message}")]
    Producer { cache: String, message: String },
    /// The cache was closed before a value arrived.
    #[error("[{cache}] cache closed")]
    Closed { cache: String },
    /// Invalid cache configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Create a new producer error.
    pub fn producer(cache: impl Into<String>, message: impl Into<String>) -> Self {
        CacheError::Producer {
            cache: cache.into(),
            message: message.into(),
        }
    }

    /// Create a new closed error.
    pub fn closed(cache: impl Into<String>) -> Self {
        CacheError::Closed {
            cache: cache.into(),
        }
    }
}
