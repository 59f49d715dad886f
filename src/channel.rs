//! Multicast channel with a single-slot replay buffer.
//!
//! A [`ReplayChannel`] remembers the most recently published value. New
//! observers receive that value as soon as they attach, followed by every
//! later publish. Publishing and attaching share one lock, so every observer
//! sees values in the same order and no observer can miss a value published
//! while it was attaching.

use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Receives values pushed through a [`ReplayChannel`].
pub trait Observer<V>: Send {
    /// Deliver a value.
    ///
    /// Returning `false` detaches the observer from the channel.
    fn on_next(&mut self, value: &V) -> bool;
}

struct Inner<V> {
    latest: Option<V>,
    observers: Vec<Box<dyn Observer<V>>>,
    closed: bool,
}

/// Single-writer, multi-reader broadcast with a replay buffer of one.
pub struct ReplayChannel<V> {
    inner: Mutex<Inner<V>>,
}

impl<V> ReplayChannel<V>
where
    V: Clone + Send + 'static,
{
    /// Create an empty channel.
    pub fn new() -> Self {
        ReplayChannel {
            inner: Mutex::new(Inner {
                latest: None,
                observers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Make `value` the replay value and deliver it to every attached observer.
    pub fn publish(&self, value: V) {
        self.publish_with(value, || {});
    }

    /// Like [`publish`](Self::publish), but runs `prepare` first, inside the
    /// channel's critical section.
    ///
    /// Nothing can attach or publish between `prepare` and the delivery of
    /// `value`.
    pub fn publish_with<F>(&self, value: V, prepare: F)
    where
        F: FnOnce(),
    {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }

        prepare();
        inner.observers.retain_mut(|observer| observer.on_next(&value));
        inner.latest = Some(value);
    }

    /// Attach an observer, replaying the latest value to it first.
    ///
    /// Attaching to a closed channel drops the observer immediately.
    pub fn attach(&self, mut observer: Box<dyn Observer<V>>) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }

        if let Some(latest) = &inner.latest
            && !observer.on_next(latest)
        {
            return;
        }
        inner.observers.push(observer);
    }

    /// Subscribe to the raw channel.
    pub fn subscribe(&self) -> Subscription<V> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach(Box::new(SenderObserver { tx }));
        Subscription::new(rx)
    }

    /// Return the replay value, if anything was published.
    pub fn latest(&self) -> Option<V> {
        self.inner.lock().latest.clone()
    }

    /// Number of attached observers.
    ///
    /// Observers whose subscription was dropped are only detached on the next
    /// publish.
    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    /// Detach every observer and refuse further publishes.
    ///
    /// Open subscriptions end once they have drained what was already delivered.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.observers.clear();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl<V> Default for ReplayChannel<V>
where
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards every value into an unbounded mpsc sender.
struct SenderObserver<V> {
    tx: mpsc::UnboundedSender<V>,
}

impl<V> Observer<V> for SenderObserver<V>
where
    V: Clone + Send,
{
    fn on_next(&mut self, value: &V) -> bool {
        self.tx.send(value.clone()).is_ok()
    }
}

/// A live feed of values.
///
/// Dropping the subscription unsubscribes it without affecting any other
/// subscriber. The stream ends when its source is closed.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Subscription { rx }
    }

    /// Wait for the next value. Returns `None` once the source is closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next value if one was already delivered.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Take every value delivered so far.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::new();
        while let Ok(value) = self.rx.try_recv() {
            values.push(value);
        }
        values
    }

    /// Wait for a single value, then unsubscribe.
    pub async fn first(mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
