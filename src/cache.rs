use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::channel::{Observer, ReplayChannel, Subscription};
use crate::diagnostics::{CacheEvent, DiagnosticSink, Diagnostics, elapsed_ms};
use crate::error::{BoxError, CacheError};
use crate::producer::Producer;
use crate::refresh::Refreshable;

/// Layer stacked on a cache's channel, such as the transform overlay.
pub(crate) trait PublishHook: Send + Sync {
    /// Runs inside the channel's critical section right before a value is published.
    fn before_publish(&self);

    /// Runs once when the cache closes.
    fn on_close(&self);
}

/// Where a cache is in its fetch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// No value to show: nothing was published yet, or the last fetch failed
    /// after a blocking refresh withdrew the previous value.
    Empty,
    /// A fetch is outstanding.
    Fetching,
    /// A value is held and is within its expiration window.
    Fresh,
    /// A value is held but has expired or was invalidated.
    Stale,
}

/// Construction settings shared by the builder and the plain constructors.
pub(crate) struct Settings {
    pub(crate) name: String,
    pub(crate) expiration: Duration,
    pub(crate) blocking: bool,
    pub(crate) sink: Option<Arc<dyn DiagnosticSink>>,
}

struct FetchState {
    last_fetch: Option<Instant>,
    /// Id of the outstanding fetch, if any.
    in_flight: Option<u64>,
    next_fetch_id: u64,
    /// Lifetime token. Completions dispatched under an older epoch are dropped.
    epoch: u64,
    closed: bool,
}

struct Shared<T> {
    name: String,
    expiration: Duration,
    blocking: AtomicBool,
    producer: Arc<dyn Producer<T>>,
    state: Mutex<FetchState>,
    /// `None` is the placeholder pushed while a blocking fetch is in flight.
    channel: ReplayChannel<Option<T>>,
    hook: Option<Arc<dyn PublishHook>>,
    diagnostics: Diagnostics,
}

impl<T> Shared<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn check_expired(self: &Arc<Self>, threshold: Option<Duration>) {
        let threshold = threshold.unwrap_or(self.expiration);
        let mut state = self.state.lock();
        if state.closed {
            return;
        }

        let now = Instant::now();
        let expired = match state.last_fetch {
            None => true,
            Some(last) => now.saturating_duration_since(last) > threshold,
        };
        if !expired {
            return;
        }

        if let Some(fetch_id) = state.in_flight {
            self.diagnostics.emit(CacheEvent::FetchSkipped {
                cache: self.name.clone(),
                fetch_id,
            });
            return;
        }

        // Checked before touching any state so a call from outside a runtime
        // leaves the cache as it was.
        let Ok(runtime) = Handle::try_current() else {
            self.diagnostics.emit(CacheEvent::NoRuntime {
                cache: self.name.clone(),
            });
            return;
        };

        let fetch_id = state.next_fetch_id;
        state.next_fetch_id += 1;
        state.last_fetch = Some(now);
        state.in_flight = Some(fetch_id);
        let epoch = state.epoch;

        let blocking = self.blocking.load(Ordering::SeqCst);
        self.diagnostics.emit(CacheEvent::FetchStarted {
            cache: self.name.clone(),
            fetch_id,
            threshold,
            blocking,
        });

        // Withdraw the current value so nobody is served stale data while the
        // fetch runs.
        if blocking {
            self.channel.publish(None);
        }
        drop(state);

        self.produce(&runtime, fetch_id, epoch);
    }

    fn produce(self: &Arc<Self>, runtime: &Handle, fetch_id: u64, epoch: u64) {
        let shared = Arc::clone(self);
        runtime.spawn(async move {
            let start = Instant::now();
            let result = AssertUnwindSafe(shared.producer.produce())
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panic_message(panic).into()));
            shared.complete(fetch_id, epoch, start, result);
        });
    }

    fn complete(&self, fetch_id: u64, epoch: u64, start: Instant, result: Result<T, BoxError>) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            self.diagnostics.emit(CacheEvent::CompletionDiscarded {
                cache: self.name.clone(),
                fetch_id,
            });
            return;
        }
        state.in_flight = None;

        // Published while the state lock is held, so no new fetch can start
        // between clearing the flag and delivering the value.
        match result {
            Ok(value) => {
                self.publish(value);
                self.diagnostics.emit(CacheEvent::Published {
                    cache: self.name.clone(),
                    fetch_id: Some(fetch_id),
                    latency_ms: elapsed_ms(start),
                });
            }
            Err(err) => {
                self.diagnostics.emit(CacheEvent::ProducerFailed {
                    cache: self.name.clone(),
                    fetch_id,
                    error: CacheError::producer(&self.name, err.to_string()),
                    latency_ms: elapsed_ms(start),
                });
            }
        }
    }

    fn publish(&self, value: T) {
        match &self.hook {
            Some(hook) => self
                .channel
                .publish_with(Some(value), || hook.before_publish()),
            None => self.channel.publish(Some(value)),
        }
    }

    fn set(&self, value: T) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.last_fetch = Some(Instant::now());
        self.publish(value);
        self.diagnostics.emit(CacheEvent::Published {
            cache: self.name.clone(),
            fetch_id: None,
            latency_ms: 0.0,
        });
    }

    fn invalidate(&self) {
        self.state.lock().last_fetch = None;
        self.diagnostics.emit(CacheEvent::Invalidated {
            cache: self.name.clone(),
        });
    }

    fn state(&self) -> CacheState {
        let state = self.state.lock();
        if state.in_flight.is_some() && !state.closed {
            return CacheState::Fetching;
        }
        if !matches!(self.channel.latest(), Some(Some(_))) {
            return CacheState::Empty;
        }
        match state.last_fetch {
            Some(last) if last.elapsed() <= self.expiration => CacheState::Fresh,
            _ => CacheState::Stale,
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.epoch += 1;
        self.channel.close();
        if let Some(hook) = &self.hook {
            hook.on_close();
        }
        self.diagnostics.emit(CacheEvent::Closed {
            cache: self.name.clone(),
        });
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "unknown cause".to_string(),
        },
    };
    format!("producer panicked: {}", detail)
}

/// Closes the cache once the last user handle is dropped.
///
/// Producer tasks hold the shared state but not this guard, so an outstanding
/// fetch does not keep the cache open.
struct Lifetime<T>
where
    T: Clone + Send + Sync + 'static,
{
    shared: Arc<Shared<T>>,
}

impl<T> Drop for Lifetime<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Delivers present values and skips the blocking placeholder.
struct PresentObserver<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Observer<Option<T>> for PresentObserver<T>
where
    T: Clone + Send,
{
    fn on_next(&mut self, value: &Option<T>) -> bool {
        match value {
            Some(value) => self.tx.send(value.clone()).is_ok(),
            None => !self.tx.is_closed(),
        }
    }
}

/// A read-through cache holding a single value.
///
/// Every subscription checks whether the value has expired and, if so, calls
/// the producer in the background. The value is multicast to all subscribers:
/// current subscribers get every new value, new subscribers immediately get the
/// latest one.
///
/// With the blocking policy (the default), an expiration withdraws the current
/// value: new and existing subscribers receive nothing until the fresh value
/// arrives. Without it, subscribers keep the old value until it is replaced.
///
/// Fetches are spawned on the current Tokio runtime, so subscribing and
/// refreshing must happen inside one.
///
/// # Example
/// ```ignore
/// let cache = ValueCache::new("profile", Duration::from_secs(60), move || {
///     let client = client.clone();
///     async move { client.fetch_profile().await }
/// });
///
/// let mut profile = cache.subscribe();
/// while let Some(profile) = profile.recv().await {
///     render(&profile);
/// }
/// ```
pub struct ValueCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    shared: Arc<Shared<T>>,
    lifetime: Arc<Lifetime<T>>,
}

impl<T> Clone for ValueCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        ValueCache {
            shared: Arc::clone(&self.shared),
            lifetime: Arc::clone(&self.lifetime),
        }
    }
}

impl<T> ValueCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a blocking cache without a diagnostic sink.
    ///
    /// # Arguments
    /// * `name` - Label used in logs and diagnostics
    /// * `expiration` - How long a fetched value stays fresh
    /// * `producer` - The origin to read through to
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
        Self::assemble(settings, Arc::new(producer), None)
    }

    pub(crate) fn assemble(
        settings: Settings,
        producer: Arc<dyn Producer<T>>,
        hook: Option<Arc<dyn PublishHook>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            name: settings.name,
            expiration: settings.expiration,
            blocking: AtomicBool::new(settings.blocking),
            producer,
            state: Mutex::new(FetchState {
                last_fetch: None,
                in_flight: None,
                next_fetch_id: 1,
                epoch: 0,
                closed: false,
            }),
            channel: ReplayChannel::new(),
            hook,
            diagnostics: Diagnostics::new(settings.sink),
        });
        let lifetime = Arc::new(Lifetime {
            shared: Arc::clone(&shared),
        });
        ValueCache { shared, lifetime }
    }

    /// Subscribe to the value.
    ///
    /// Checks expiration first, which may start a fetch. The returned stream
    /// yields the latest value right away unless a blocking fetch is in flight.
    pub fn subscribe(&self) -> Subscription<T> {
        self.shared.check_expired(None);
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach(Box::new(PresentObserver { tx }));
        Subscription::new(rx)
    }

    /// Wait for a single value.
    ///
    /// Waits as long as no value is available, so a producer that keeps failing
    /// keeps this pending until a later fetch succeeds.
    pub async fn get(&self) -> Result<T, CacheError> {
        self.subscribe()
            .first()
            .await
            .ok_or_else(|| CacheError::closed(self.name()))
    }

    pub(crate) fn attach(&self, observer: Box<dyn Observer<Option<T>>>) {
        self.shared.channel.attach(observer);
    }

    pub(crate) fn check_expired(&self, threshold: Option<Duration>) {
        self.shared.check_expired(threshold);
    }

    /// Expire the cache. The value is fetched again on the next subscribe or
    /// refresh. Subscribers are not notified.
    pub fn invalidate(&self) {
        self.shared.invalidate();
    }

    /// Publish a locally known value as if it had just been fetched.
    pub fn set(&self, value: T) {
        self.shared.set(value);
    }

    /// The latest published value, without triggering a fetch.
    pub fn latest(&self) -> Option<T> {
        self.shared.channel.latest().flatten()
    }

    /// Where the cache is in its fetch cycle.
    pub fn state(&self) -> CacheState {
        self.shared.state()
    }

    /// Whether expirations withdraw the current value until fresh data arrives.
    pub fn is_blocking(&self) -> bool {
        self.shared.blocking.load(Ordering::SeqCst)
    }

    /// Change the delivery policy for later expirations.
    pub fn set_blocking(&self, blocking: bool) {
        self.shared.blocking.store(blocking, Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn expiration(&self) -> Duration {
        self.shared.expiration
    }

    /// Close the cache: end every subscription and ignore any outstanding fetch.
    ///
    /// Dropping the last handle has the same effect.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.channel.is_closed()
    }
}

impl<T> Refreshable for ValueCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn refresh_if_older_than(&self, age: Duration) {
        self.shared.check_expired(Some(age));
    }

    fn refresh_if_expired(&self) {
        self.shared.check_expired(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    const LATENCY: Duration = Duration::from_millis(100);

    /// Cache whose producer yields 0, 1, 2, ... after `LATENCY`.
    fn counting_cache(expiration: Duration) -> (ValueCache<u64>, Arc<AtomicU64>) {
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let cache = ValueCache::new("counter", expiration, move || {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(LATENCY).await;
                Ok::<_, BoxError>(counter.fetch_add(1, Ordering::SeqCst))
            }
        });
        (cache, count)
    }

    async fn settle() {
        tokio::time::sleep(LATENCY * 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_subscribe_fetches() {
        let (cache, count) = counting_cache(Duration::from_secs(3));
        assert_eq!(cache.state(), CacheState::Empty);

        let mut sub = cache.subscribe();
        assert_eq!(cache.state(), CacheState::Fetching);
        assert!(sub.try_recv().is_none());

        assert_eq!(sub.recv().await, Some(0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(cache.state(), CacheState::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_within_window_replays() {
        let (cache, count) = counting_cache(Duration::from_secs(3));
        let _first = cache.subscribe();
        settle().await;

        for _ in 0..5 {
            let mut sub = cache.subscribe();
            assert_eq!(sub.try_recv(), Some(0));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribes_during_fetch_share_it() {
        let (cache, count) = counting_cache(Duration::from_secs(3));
        let mut subs: Vec<_> = (0..4).map(|_| cache.subscribe()).collect();

        // Expired again while the first fetch is still outstanding.
        cache.invalidate();
        subs.push(cache.subscribe());
        cache.refresh();
        assert_eq!(cache.state(), CacheState::Fetching);
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        for sub in &mut subs {
            assert_eq!(sub.drain(), vec![0]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_withholds_stale_value() {
        let (cache, _count) = counting_cache(Duration::from_secs(3));
        let mut existing = cache.subscribe();
        settle().await;
        assert_eq!(existing.drain(), vec![0]);

        tokio::time::sleep(Duration::from_secs(4)).await;
        let mut fresh = cache.subscribe();
        assert!(fresh.try_recv().is_none());
        assert!(existing.try_recv().is_none());
        assert!(cache.latest().is_none());

        settle().await;
        assert_eq!(existing.drain(), vec![1]);
        assert_eq!(fresh.drain(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_blocking_serves_stale_then_fresh() {
        let (cache, _count) = counting_cache(Duration::from_secs(3));
        cache.set_blocking(false);
        assert!(!cache.is_blocking());

        let mut existing = cache.subscribe();
        settle().await;
        assert_eq!(existing.drain(), vec![0]);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(cache.state(), CacheState::Stale);
        let mut late = cache.subscribe();
        assert_eq!(late.drain(), vec![0]);
        assert!(existing.try_recv().is_none());
        assert_eq!(cache.latest(), Some(0));

        settle().await;
        assert_eq!(existing.drain(), vec![1]);
        assert_eq!(late.drain(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_failure_keeps_value_and_waits_for_window() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let cache = ValueCache::new("flaky", Duration::from_secs(3), move || {
            let counter = counter.clone();
            async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => Ok("good".to_string()),
                    _ => Err::<String, BoxError>("origin down".into()),
                }
            }
        });
        cache.set_blocking(false);

        let mut sub = cache.subscribe();
        settle().await;
        assert_eq!(sub.drain(), vec!["good".to_string()]);

        tokio::time::sleep(Duration::from_secs(4)).await;
        cache.refresh_if_expired();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(sub.try_recv().is_none());
        assert_eq!(cache.latest(), Some("good".to_string()));

        // The failed attempt still counts as the fetch for this window.
        cache.refresh_if_expired();
        let _again = cache.subscribe();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(4)).await;
        cache.refresh_if_expired();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_producer_is_a_failed_fetch() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let settings = Settings {
            name: "panicky".to_string(),
            expiration: Duration::from_secs(3),
            blocking: true,
            sink: Some(Arc::new(move |event: CacheEvent| recorded.lock().push(event))),
        };
        let producer: Arc<dyn Producer<u32>> = Arc::new(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("origin exploded");
                }
                Ok::<u32, BoxError>(7)
            }
        });
        let cache = ValueCache::assemble(settings, producer, None);

        let mut sub = cache.subscribe();
        settle().await;
        assert!(sub.try_recv().is_none());
        assert_eq!(cache.state(), CacheState::Empty);
        assert!(events.lock().contains(&CacheEvent::ProducerFailed {
            cache: "panicky".to_string(),
            fetch_id: 1,
            error: CacheError::producer("panicky", "producer panicked: origin exploded"),
            latency_ms: 0.0,
        }));

        tokio::time::sleep(Duration::from_secs(4)).await;
        cache.refresh_if_expired();
        assert_eq!(sub.recv().await, Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscribe_outside_runtime_leaves_cache_usable() {
        let (cache, count) = counting_cache(Duration::from_secs(3));

        let mut early = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    cache.refresh_if_expired();
                    cache.subscribe()
                })
                .join()
                .unwrap()
        });
        assert!(early.try_recv().is_none());
        assert_eq!(cache.state(), CacheState::Empty);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        runtime.block_on(async {
            assert_eq!(cache.get().await, Ok(0));
        });
        assert_eq!(early.try_recv(), Some(0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_next_fetch_silently() {
        let (cache, count) = counting_cache(Duration::from_secs(60));
        let mut sub = cache.subscribe();
        settle().await;
        assert_eq!(sub.drain(), vec![0]);

        cache.invalidate();
        assert_eq!(cache.state(), CacheState::Stale);
        assert!(sub.try_recv().is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let _next = cache.subscribe();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(sub.drain(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_does_not_cancel_in_flight_fetch() {
        let (cache, count) = counting_cache(Duration::from_secs(60));
        let mut sub = cache.subscribe();
        cache.invalidate();
        cache.refresh_if_expired();

        settle().await;
        assert_eq!(sub.drain(), vec![0]);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Still invalidated, so the next check fetches again.
        cache.refresh_if_expired();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_thresholds() {
        let (cache, count) = counting_cache(Duration::from_secs(60));
        let _sub = cache.subscribe();
        settle().await;

        // 200ms old: neither the one second default nor the configured window applies.
        cache.refresh();
        cache.refresh_if_expired();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        cache.refresh_if_older_than(Duration::from_secs(5));
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        cache.refresh();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_publishes_and_restarts_window() {
        let (cache, count) = counting_cache(Duration::from_secs(3));
        cache.set(42);
        assert_eq!(cache.state(), CacheState::Fresh);

        let mut sub = cache.subscribe();
        assert_eq!(sub.drain(), vec![42]);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_waits_for_value() {
        let (cache, _count) = counting_cache(Duration::from_secs(3));
        assert_eq!(cache.get().await, Ok(0));
        assert_eq!(cache.get().await, Ok(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_discards_in_flight_completion() {
        let (cache, count) = counting_cache(Duration::from_secs(3));
        let mut sub = cache.subscribe();
        cache.close();

        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(sub.recv().await, None);
        assert!(cache.is_closed());
        assert!(cache.latest().is_none());
        assert_eq!(cache.get().await, Err(CacheError::closed("counter")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_closes() {
        let (cache, _count) = counting_cache(Duration::from_secs(3));
        let clone = cache.clone();
        let mut sub = cache.subscribe();
        settle().await;
        assert_eq!(sub.drain(), vec![0]);

        drop(cache);
        assert!(!clone.is_closed());

        drop(clone);
        assert_eq!(sub.recv().await, None);
    }
}
