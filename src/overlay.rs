//! Optimistic transforms layered over a [`ValueCache`].
//!
//! A transform is a temporary local edit of the cached value, for example the
//! expected result of a request that is still in flight. Transforms apply to
//! every value the overlay serves, whether replayed or freshly produced, until
//! they are expired. An expired transform keeps applying to the value that is
//! already cached and is dropped the moment the next value is published, so
//! fresh data from the producer replaces the optimistic edit.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cache::{CacheState, PublishHook, Settings, ValueCache};
use crate::channel::{Observer, Subscription};
use crate::diagnostics::{CacheEvent, Diagnostics};
use crate::error::CacheError;
use crate::producer::Producer;
use crate::refresh::Refreshable;

/// Lifecycle of a single transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformState {
    /// Applies to current and future values.
    Active,
    /// Marked expired. Still applies to the cached value until the next publish.
    ExpiredPending,
    /// Dropped by a publish. Never applies again.
    Removed,
}

struct TransformInner<T> {
    apply: Box<dyn Fn(T) -> T + Send + Sync>,
    expire_at: Mutex<Option<Instant>>,
    removed: AtomicBool,
}

/// Handle to a transform registered with [`TransformOverlay::transform`].
pub struct Transform<T> {
    inner: Arc<TransformInner<T>>,
}

impl<T> Clone for Transform<T> {
    fn clone(&self) -> Self {
        Transform {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Transform<T> {
    fn new<F>(apply: F) -> Self
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        Transform {
            inner: Arc::new(TransformInner {
                apply: Box::new(apply),
                expire_at: Mutex::new(None),
                removed: AtomicBool::new(false),
            }),
        }
    }

    pub fn apply(&self, value: T) -> T {
        (self.inner.apply)(value)
    }

    /// Expire now. The transform is dropped when the next value is published.
    pub fn expire(&self) {
        self.expire_at(Instant::now());
    }

    /// Expire at `at`. Publishes before that instant keep the transform.
    pub fn expire_at(&self, at: Instant) {
        *self.inner.expire_at.lock() = Some(at);
    }

    pub fn is_expired(&self) -> bool {
        matches!(*self.inner.expire_at.lock(), Some(at) if Instant::now() >= at)
    }

    pub fn state(&self) -> TransformState {
        if self.inner.removed.load(Ordering::SeqCst) {
            TransformState::Removed
        } else if self.is_expired() {
            TransformState::ExpiredPending
        } else {
            TransformState::Active
        }
    }
}

/// Apply transforms in insertion order.
fn compose<T>(transforms: &[Transform<T>], base: T) -> T {
    transforms
        .iter()
        .fold(base, |value, transform| transform.apply(value))
}

/// Combine state of one overlay subscriber.
struct OverlaySubscriber<T> {
    id: u64,
    /// Latest base value this subscriber has seen. Nothing is emitted before
    /// the first one arrives.
    base: Option<T>,
    tx: mpsc::UnboundedSender<T>,
}

struct OverlayState<T> {
    transforms: Vec<Transform<T>>,
    subscribers: Vec<OverlaySubscriber<T>>,
    next_id: u64,
    closed: bool,
}

impl<T> OverlayState<T>
where
    T: Clone,
{
    /// Re-emit the composed value to every subscriber that holds a base value.
    fn emit_all(&mut self) {
        let transforms = &self.transforms;
        self.subscribers.retain(|sub| match &sub.base {
            Some(base) => sub.tx.send(compose(transforms, base.clone())).is_ok(),
            None => !sub.tx.is_closed(),
        });
    }

    /// Record a new base value for one subscriber and emit its composed value.
    ///
    /// Returns `false` once the subscriber is gone.
    fn emit_base(&mut self, id: u64, base: &T) -> bool {
        let Some(pos) = self.subscribers.iter().position(|sub| sub.id == id) else {
            return false;
        };

        let sub = &mut self.subscribers[pos];
        sub.base = Some(base.clone());
        if sub.tx.send(compose(&self.transforms, base.clone())).is_ok() {
            return true;
        }
        self.subscribers.remove(pos);
        false
    }

    fn is_subscribed(&mut self, id: u64) -> bool {
        let Some(pos) = self.subscribers.iter().position(|sub| sub.id == id) else {
            return false;
        };
        if self.subscribers[pos].tx.is_closed() {
            self.subscribers.remove(pos);
            return false;
        }
        true
    }
}

/// The transform list and combine state, guarded by one lock so a composed
/// value never mixes a base value with a half-updated transform list.
struct TransformSet<T> {
    name: String,
    state: Mutex<OverlayState<T>>,
    diagnostics: Diagnostics,
}

impl<T> TransformSet<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clear_expired(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.transforms.len();
        state.transforms.retain(|transform| {
            if transform.is_expired() {
                transform.inner.removed.store(true, Ordering::SeqCst);
                false
            } else {
                true
            }
        });

        let removed = before - state.transforms.len();
        if removed > 0 {
            self.diagnostics.emit(CacheEvent::TransformsCleared {
                cache: self.name.clone(),
                removed,
                remaining: state.transforms.len(),
            });
        }
        removed
    }
}

impl<T> PublishHook for TransformSet<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn before_publish(&self) {
        self.clear_expired();
    }

    fn on_close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }
}

/// Feeds base values from the cache into one overlay subscriber.
struct OverlayObserver<T> {
    id: u64,
    layer: Arc<TransformSet<T>>,
}

impl<T> Observer<Option<T>> for OverlayObserver<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn on_next(&mut self, value: &Option<T>) -> bool {
        let mut state = self.layer.state.lock();
        match value {
            Some(base) => state.emit_base(self.id, base),
            None => state.is_subscribed(self.id),
        }
    }
}

/// A [`ValueCache`] whose value can be transformed locally until fresh data
/// replaces the transforms.
///
/// Subscribers receive the cached value with every registered transform
/// applied in insertion order. Adding a transform re-emits to all subscribers
/// immediately. Expiring a transform emits nothing: it keeps applying to the
/// cached value and is removed when the next value is published.
///
/// # Example
/// ```ignore
/// let profile = TransformOverlay::new("profile", Duration::from_secs(60), fetch_profile);
/// let mut updates = profile.subscribe();
///
/// // Show the new display name before the server confirms it.
/// let rename = profile.transform(|mut p: Profile| {
///     p.display_name = "Ada".into();
///     p
/// });
/// client.rename("Ada").await?;
///
/// // Let the next fetch replace the optimistic edit.
/// rename.expire();
/// profile.invalidate();
/// profile.refresh_if_expired();
/// ```
pub struct TransformOverlay<T>
where
    T: Clone + Send + Sync + 'static,
{
    cache: ValueCache<T>,
    layer: Arc<TransformSet<T>>,
}

impl<T> Clone for TransformOverlay<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        TransformOverlay {
            cache: self.cache.clone(),
            layer: Arc::clone(&self.layer),
        }
    }
}

impl<T> TransformOverlay<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a blocking overlay without a diagnostic sink.
    pub fn new<P>(name: impl Into<String>, expiration: Duration, producer: P) -> Self
    where
        P: Producer<T> + 'static,
    {
        let settings = Settings {
            name: name.into(),
            expiration,
            blocking: true,
            sink: None,
        };
        Self::assemble(settings, Arc::new(producer))
    }

    pub(crate) fn assemble(settings: Settings, producer: Arc<dyn Producer<T>>) -> Self {
        let set = Arc::new(TransformSet {
            name: settings.name.clone(),
            state: Mutex::new(OverlayState {
                transforms: Vec::new(),
                subscribers: Vec::new(),
                next_id: 0,
                closed: false,
            }),
            diagnostics: Diagnostics::new(settings.sink.clone()),
        });
        let hook: Arc<dyn PublishHook> = set.clone();
        let cache = ValueCache::assemble(settings, producer, Some(hook));
        TransformOverlay { cache, layer: set }
    }

    /// Subscribe to the transformed value.
    ///
    /// Checks expiration like [`ValueCache::subscribe`]. Emits whenever a new
    /// base value arrives or the transform list grows, starting with the first
    /// base value this subscriber receives.
    pub fn subscribe(&self) -> Subscription<T> {
        self.cache.check_expired(None);

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.layer.state.lock();
            if state.closed {
                return Subscription::new(rx);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.subscribers.push(OverlaySubscriber { id, base: None, tx });
            id
        };

        self.cache.attach(Box::new(OverlayObserver {
            id,
            layer: Arc::clone(&self.layer),
        }));
        Subscription::new(rx)
    }

    /// Wait for a single transformed value.
    pub async fn get(&self) -> Result<T, CacheError> {
        self.subscribe()
            .first()
            .await
            .ok_or_else(|| CacheError::closed(self.name()))
    }

    /// Register a transform and re-emit to every subscriber holding a value.
    ///
    /// The returned handle is used to expire the transform later.
    pub fn transform<F>(&self, apply: F) -> Transform<T>
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        let transform = Transform::new(apply);
        let mut state = self.layer.state.lock();
        state.transforms.push(transform.clone());
        state.emit_all();
        transform
    }

    /// Drop every expired transform. Returns how many were removed.
    ///
    /// Runs automatically right before each publish.
    pub fn clear_expired_transforms(&self) -> usize {
        self.layer.clear_expired()
    }

    /// Number of transforms still registered, expired ones included.
    pub fn transform_count(&self) -> usize {
        self.layer.state.lock().transforms.len()
    }

    /// The latest value with the current transforms applied, without
    /// triggering a fetch.
    pub fn latest(&self) -> Option<T> {
        let base = self.cache.latest()?;
        let state = self.layer.state.lock();
        Some(compose(&state.transforms, base))
    }

    /// The underlying cache. Its subscribers see untransformed values.
    pub fn cache(&self) -> &ValueCache<T> {
        &self.cache
    }

    /// See [`ValueCache::invalidate`].
    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    /// Publish a locally known value. Expired transforms are dropped first.
    pub fn set(&self, value: T) {
        self.cache.set(value);
    }

    pub fn state(&self) -> CacheState {
        self.cache.state()
    }

    pub fn is_blocking(&self) -> bool {
        self.cache.is_blocking()
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.cache.set_blocking(blocking);
    }

    pub fn name(&self) -> &str {
        self.cache.name()
    }

    pub fn expiration(&self) -> Duration {
        self.cache.expiration()
    }

    /// See [`ValueCache::close`].
    pub fn close(&self) {
        self.cache.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cache.is_closed()
    }
}

impl<T> Refreshable for TransformOverlay<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn refresh_if_older_than(&self, age: Duration) {
        self.cache.refresh_if_older_than(age);
    }

    fn refresh_if_expired(&self) {
        self.cache.refresh_if_expired();
    }
}
