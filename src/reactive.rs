//! Minimal push-based stream contracts with demand-driven backpressure.
//!
//! A [`Publisher`] hands each [`Subscriber`] a [`Subscription`]; elements flow
//! only as far as the subscriber has requested. Signals to one subscriber are
//! serialized: `on_subscribe`, then any number of `on_next`, then at most one
//! of `on_error` / `on_complete`.

use crate::error::TransportError;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::{debug, warn};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

pub trait Subscription: Send + Sync {
    fn request(&self, n: u64);
    fn cancel(&self);
}

pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);
    fn on_next(&self, item: T);
    fn on_error(&self, error: TransportError);
    fn on_complete(&self);
}

pub trait Publisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// Adds `n` to the outstanding demand, saturating at unbounded. Returns the
/// previous value.
pub fn add_cap(requested: &AtomicU64, n: u64) -> u64 {
    let mut current = requested.load(Ordering::Acquire);
    loop {
        if current == u64::MAX {
            return current;
        }
        let next = current.saturating_add(n);
        match requested.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(previous) => return previous,
            Err(actual) => current = actual,
        }
    }
}

/// Subtracts `n` emitted elements from the demand. Unbounded demand stays
/// unbounded. Returns the new value.
pub fn produced(requested: &AtomicU64, n: u64) -> u64 {
    let mut current = requested.load(Ordering::Acquire);
    loop {
        if current == u64::MAX {
            return current;
        }
        let next = current.saturating_sub(n);
        match requested.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return next,
            Err(actual) => current = actual,
        }
    }
}

/// Where signals that arrive after a terminal signal end up.
pub trait DroppedSignalHooks: Send + Sync {
    fn on_next_dropped(&self, item: &Bytes) {
        warn!("Dropped {} bytes delivered after the stream terminated", item.len());
    }

    fn on_error_dropped(&self, error: &TransportError) {
        warn!("Dropped error delivered after the stream terminated: {}", error);
    }
}

/// Logs dropped signals at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHooks;

impl DroppedSignalHooks for LoggingHooks {}

pub fn default_hooks() -> Arc<dyn DroppedSignalHooks> {
    Arc::new(LoggingHooks)
}

/// A subscription that does nothing. Handed out before rejecting a subscriber.
pub struct EmptySubscription;

impl Subscription for EmptySubscription {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

/// Publishes a fallible [`Stream`] to a single subscriber.
pub struct StreamPublisher<S> {
    stream: Mutex<Option<S>>,
}

impl<S> StreamPublisher<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
        }
    }
}

impl<S, T> Publisher<T> for StreamPublisher<S>
where
    S: Stream<Item = Result<T, TransportError>> + Send + Unpin + 'static,
    T: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let stream = self.stream.lock().ok().and_then(|mut slot| slot.take());
        let Some(mut stream) = stream else {
            subscriber.on_subscribe(Arc::new(EmptySubscription));
            subscriber.on_error(TransportError::IllegalState(
                "StreamPublisher allows only a single subscriber".to_string(),
            ));
            return;
        };

        let subscription = Arc::new(StreamSubscription {
            requested: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            wakeup: Notify::new(),
        });
        subscriber.on_subscribe(subscription.clone());

        tokio::spawn(async move {
            loop {
                if subscription.cancelled.load(Ordering::Acquire) {
                    debug!("Stream subscription cancelled");
                    return;
                }
                if subscription.requested.load(Ordering::Acquire) == 0 {
                    subscription.wakeup.notified().await;
                    continue;
                }

                let item = stream.next().await;
                if subscription.cancelled.load(Ordering::Acquire) {
                    return;
                }
                match item {
                    Some(Ok(item)) => {
                        produced(&subscription.requested, 1);
                        subscriber.on_next(item);
                    }
                    Some(Err(e)) => {
                        subscriber.on_error(e);
                        return;
                    }
                    None => {
                        subscriber.on_complete();
                        return;
                    }
                }
            }
        });
    }
}

struct StreamSubscription {
    requested: AtomicU64,
    cancelled: AtomicBool,
    wakeup: Notify,
}

impl Subscription for StreamSubscription {
    fn request(&self, n: u64) {
        if n > 0 {
            add_cap(&self.requested, n);
            self.wakeup.notify_one();
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.wakeup.notify_one();
    }
}

enum Signal<T> {
    Next(T),
    Error(TransportError),
    Complete,
}

struct ChannelSubscriber<T> {
    tx: UnboundedSender<Signal<T>>,
    subscription: Arc<OnceLock<Arc<dyn Subscription>>>,
}

impl<T: Send> Subscriber<T> for ChannelSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.subscription.set(subscription.clone()).is_err() {
            subscription.cancel();
            return;
        }
        subscription.request(1);
    }

    fn on_next(&self, item: T) {
        let _ = self.tx.send(Signal::Next(item));
    }

    fn on_error(&self, error: TransportError) {
        let _ = self.tx.send(Signal::Error(error));
    }

    fn on_complete(&self) {
        let _ = self.tx.send(Signal::Complete);
    }
}

/// Pulls a [`Publisher`] as a [`Stream`], one element at a time. Dropping the
/// stream cancels the subscription.
pub struct SubscriberStream<T> {
    rx: UnboundedReceiver<Signal<T>>,
    subscription: Arc<OnceLock<Arc<dyn Subscription>>>,
    done: bool,
}

impl<T: Send + 'static> SubscriberStream<T> {
    pub fn new<P>(publisher: &P) -> Self
    where
        P: Publisher<T> + ?Sized,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Arc::new(OnceLock::new());
        publisher.subscribe(Arc::new(ChannelSubscriber {
            tx,
            subscription: subscription.clone(),
        }));
        Self {
            rx,
            subscription,
            done: false,
        }
    }
}

impl<T> Stream for SubscriberStream<T> {
    type Item = Result<T, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Signal::Next(item))) => {
                if let Some(subscription) = self.subscription.get() {
                    subscription.request(1);
                }
                Poll::Ready(Some(Ok(item)))
            }
            Poll::Ready(Some(Signal::Error(e))) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Some(Signal::Complete)) | Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for SubscriberStream<T> {
    fn drop(&mut self) {
        if !self.done {
            if let Some(subscription) = self.subscription.get() {
                subscription.cancel();
            }
        }
    }
}
