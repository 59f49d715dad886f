//! cached-value - A read-through single-value cache for Rust
//!
//! This library provides one lazily refreshed value shared by many observers:
//! - Expiration-triggered refresh on subscribe or explicit request
//! - Multicast delivery with replay of the latest value to new subscribers
//! - Blocking or stale-while-revalidate delivery during refreshes
//! - At most one outstanding producer call per cache
//! - Optimistic transforms that hold until fresh data supersedes them
//!
//! # Example
//!
//! ```ignore
//! use cached_value::{Refreshable, TransformOverlay};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let totals = TransformOverlay::new("totals", Duration::from_secs(30), || async {
//!         // Load from the server
//!         Ok::<_, std::io::Error>(41)
//!     });
//!
//!     let mut updates = totals.subscribe();
//!     assert_eq!(updates.recv().await, Some(41));
//!
//!     // Optimistically count a pending submission
//!     let pending = totals.transform(|total| total + 1);
//!     assert_eq!(updates.recv().await, Some(42));
//!
//!     // Once the server has it, let the next fetch replace the local edit
//!     pending.expire();
//!     totals.refresh();
//! }
//! ```

mod builder;
mod cache;
mod channel;
mod diagnostics;
mod error;
mod overlay;
mod producer;
mod refresh;

// Re-export public API
pub use builder::{CacheBuilder, CacheConfig};
pub use cache::{CacheState, ValueCache};
pub use channel::{Observer, ReplayChannel, Subscription};
pub use diagnostics::{CacheEvent, DiagnosticSink};
pub use error::{BoxError, CacheError};
pub use overlay::{Transform, TransformOverlay, TransformState};
pub use producer::Producer;
pub use refresh::{DEFAULT_REFRESH_AGE, Refreshable};
