//! Async iterator over notifications, with cancellation.
//!
//! An [`EventStream`] has exactly one consumer at a time. It can be driven as
//! a `futures_util::Stream`, awaited item by item with [`EventStream::next`],
//! or polled synchronously with a timeout from non-async callers (the C ABI).

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::Stream;
use tracing::debug;

use super::channel::{EventChannel, Notification, Popped};
use super::error::{BridgeError, Result};

/// Where an [`EventStream`] pulls its notifications from.
pub trait EventSource: Send + Sync {
    type Item;

    /// `Ready(None)` once the source is exhausted.
    fn poll_pop(&self, cx: &mut Context<'_>) -> Poll<Option<Notification<Self::Item>>>;

    /// Blocking pop; `None` on timeout or once closed.
    fn pop_until(&self, deadline: Instant) -> Option<Notification<Self::Item>>;

    /// Returns `true` only for the call that closed the source.
    fn close(&self) -> bool;

    fn is_closed(&self) -> bool;
}

impl<T: Send> EventSource for EventChannel<T> {
    type Item = T;

    fn poll_pop(&self, cx: &mut Context<'_>) -> Poll<Option<Notification<T>>> {
        EventChannel::poll_pop(self, cx)
    }

    fn pop_until(&self, deadline: Instant) -> Option<Notification<T>> {
        match EventChannel::pop_until(self, deadline) {
            Popped::Item(item) => Some(item),
            Popped::Empty | Popped::Closed => None,
        }
    }

    fn close(&self) -> bool {
        EventChannel::close(self)
    }

    fn is_closed(&self) -> bool {
        EventChannel::is_closed(self)
    }
}

/// Single-consumer, cancellable stream of notifications.
///
/// Dropping the stream closes it.
pub struct EventStream<S: EventSource> {
    source: S,
    consuming: AtomicBool,
}

struct ConsumeGuard<'a>(&'a AtomicBool);

impl Drop for ConsumeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S: EventSource> EventStream<S> {
    pub(crate) fn new(source: S) -> Self {
        Self {
            source,
            consuming: AtomicBool::new(false),
        }
    }

    pub(crate) fn source(&self) -> &S {
        &self.source
    }

    /// Wait for the next notification. `Ok(None)` means the stream has ended.
    ///
    /// Fails with [`BridgeError::ConcurrentConsumption`] if another `next`
    /// call is already waiting on this stream.
    pub async fn next(&self) -> Result<Option<Notification<S::Item>>> {
        let _guard = self.acquire()?;
        Ok(std::future::poll_fn(|cx| self.source.poll_pop(cx)).await)
    }

    /// Blocking variant of [`next`](Self::next).
    ///
    /// `Ok(None)` if nothing arrived within `timeout` or the stream ended;
    /// [`is_closed`](Self::is_closed) tells the two apart.
    pub fn next_timeout(&self, timeout: Duration) -> Result<Option<Notification<S::Item>>> {
        let _guard = self.acquire()?;
        Ok(self.source.pop_until(Instant::now() + timeout))
    }

    /// Cancel the stream. Pending and future `next` calls yield `None`.
    pub fn close(&self) -> bool {
        let closed = self.source.close();
        if closed {
            debug!("Event stream closed");
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_closed()
    }

    fn acquire(&self) -> Result<ConsumeGuard<'_>> {
        if self.consuming.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::ConcurrentConsumption);
        }
        Ok(ConsumeGuard(&self.consuming))
    }
}

impl<S: EventSource + Unpin> Stream for EventStream<S> {
    type Item = Notification<S::Item>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.source.poll_pop(cx)
    }
}

impl<S: EventSource> Drop for EventStream<S> {
    fn drop(&mut self) {
        self.source.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::{Backpressure, ChannelConfig};
    use futures_util::StreamExt;
    use std::sync::Arc;

    fn stream() -> EventStream<EventChannel<u32>> {
        EventStream::new(EventChannel::new(ChannelConfig {
            capacity: 8,
            backpressure: Backpressure::DropOldest,
        }))
    }

    #[tokio::test]
    async fn test_next_yields_in_order() {
        let stream = stream();
        stream.source().push(1);
        stream.source().push(2);

        assert_eq!(stream.next().await.unwrap(), Some(Notification::Event(1)));
        assert_eq!(stream.next().await.unwrap(), Some(Notification::Event(2)));
    }

    #[tokio::test]
    async fn test_close_ends_pending_next() {
        let stream = Arc::new(stream());

        let waiter = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.next().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(stream.close());
        assert!(!stream.close());

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("pending next did not finish after close")
            .unwrap();
        assert_eq!(result.unwrap(), None);

        // Closed streams stay closed.
        stream.source().push(3);
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_second_consumer_is_rejected() {
        let stream = Arc::new(stream());

        let waiter = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            stream.next().await,
            Err(BridgeError::ConcurrentConsumption)
        ));
        assert!(matches!(
            stream.next_timeout(Duration::from_millis(1)),
            Err(BridgeError::ConcurrentConsumption)
        ));

        stream.source().push(9);
        let first = waiter.await.unwrap().unwrap();
        assert_eq!(first, Some(Notification::Event(9)));

        // The guard is released once the first consumer finished.
        stream.source().push(10);
        assert_eq!(stream.next().await.unwrap(), Some(Notification::Event(10)));
    }

    #[tokio::test]
    async fn test_cancelled_next_releases_consumer_slot() {
        let stream = stream();

        let timed_out = tokio::time::timeout(Duration::from_millis(10), stream.next()).await;
        assert!(timed_out.is_err());

        stream.source().push(5);
        assert_eq!(stream.next().await.unwrap(), Some(Notification::Event(5)));
    }

    #[test]
    fn test_next_timeout_distinguishes_timeout_from_end() {
        let stream = stream();
        assert_eq!(stream.next_timeout(Duration::from_millis(5)).unwrap(), None);
        assert!(!stream.is_closed());

        stream.close();
        assert_eq!(stream.next_timeout(Duration::from_millis(5)).unwrap(), None);
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_stream_trait_ends_after_close() {
        let mut stream = stream();
        stream.source().push(1);
        assert_eq!(StreamExt::next(&mut stream).await, Some(Notification::Event(1)));

        stream.close();
        assert_eq!(StreamExt::next(&mut stream).await, None);
    }
}
