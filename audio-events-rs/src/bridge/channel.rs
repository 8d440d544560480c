//! Bounded hand-off queue between OS callback threads and one consumer.
//!
//! Producers are OS notification threads that may differ on every call.
//! When the queue is full a producer either stalls for a bounded time or
//! displaces the oldest event; displaced events are reported to the consumer
//! as a [`Notification::Overflow`] marker ahead of the next event, so loss is
//! always visible.
//!
//! A channel ends in one of two ways. [`EventChannel::close`] cancels it from
//! the consumer side and discards whatever is queued. [`EventChannel::finish`]
//! ends it from the producer side: later pushes are rejected, but events
//! already accepted are still handed out before the end of the stream.

use std::collections::VecDeque;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::task::AtomicWaker;
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::audio::{DeviceCollectionEvent, NativeEvent, VolumeChangeEvent};

use super::registration::Subscriber;

/// Item yielded by every event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<T> {
    /// A notification raised by the OS
    Event(T),

    /// `dropped` events were discarded because the consumer fell behind
    Overflow { dropped: usize },

    /// A volume notification reported a different number of channels than
    /// the device had when the stream was opened
    ChannelLayoutChanged { expected: usize, actual: usize },
}

impl<T> Notification<T> {
    pub fn event(&self) -> Option<&T> {
        match self {
            Notification::Event(event) => Some(event),
            _ => None,
        }
    }

    pub fn into_event(self) -> Option<T> {
        match self {
            Notification::Event(event) => Some(event),
            _ => None,
        }
    }

    pub fn is_marker(&self) -> bool {
        !matches!(self, Notification::Event(_))
    }
}

/// Producer behaviour when the channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Wait for room up to the given time, then displace the oldest event
    BlockWithTimeout(Duration),

    /// Displace the oldest event without waiting
    DropOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub capacity: usize,
    pub backpressure: Backpressure,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            backpressure: Backpressure::BlockWithTimeout(Duration::from_millis(50)),
        }
    }
}

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,

    /// Queued, but the oldest pending event was discarded to make room
    QueuedAfterDrop,

    /// The channel is closed; the event was discarded
    Closed,
}

/// Result of a non-blocking pop.
#[derive(Debug, PartialEq)]
pub enum Popped<T> {
    Item(Notification<T>),
    Empty,
    Closed,
}

struct ChannelState<T> {
    queue: VecDeque<T>,
    dropped: usize,
    closed: bool,

    /// No more pushes; `closed` is set once the queue has drained
    finished: bool,
    epoch: u64,
}

impl<T> ChannelState<T> {
    fn has_pending(&self) -> bool {
        self.dropped > 0 || !self.queue.is_empty()
    }
}

/// Bounded, ordered, closeable multi-producer single-consumer queue.
pub struct EventChannel<T> {
    state: Mutex<ChannelState<T>>,
    not_full: Condvar,
    ready: Condvar,
    waker: AtomicWaker,
    config: ChannelConfig,
}

impl<T> EventChannel<T> {
    pub fn new(config: ChannelConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            state: Mutex::new(ChannelState {
                queue: VecDeque::with_capacity(capacity),
                dropped: 0,
                closed: false,
                finished: false,
                epoch: 0,
            }),
            not_full: Condvar::new(),
            ready: Condvar::new(),
            waker: AtomicWaker::new(),
            config: ChannelConfig { capacity, ..config },
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// True once nothing more will be popped.
    pub fn is_closed(&self) -> bool {
        let state = self.state.lock();
        state.closed || (state.finished && !state.has_pending())
    }

    /// Enqueue an event, applying the configured backpressure when full.
    pub fn push(&self, item: T) -> PushOutcome {
        let mut state = self.state.lock();
        if state.closed || state.finished {
            return PushOutcome::Closed;
        }

        let mut outcome = PushOutcome::Queued;
        if state.queue.len() >= self.config.capacity {
            if let Backpressure::BlockWithTimeout(timeout) = self.config.backpressure {
                let deadline = Instant::now() + timeout;
                while !state.closed && !state.finished && state.queue.len() >= self.config.capacity {
                    if self.not_full.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                if state.closed || state.finished {
                    return PushOutcome::Closed;
                }
            }
            if state.queue.len() >= self.config.capacity {
                state.queue.pop_front();
                state.dropped += 1;
                outcome = PushOutcome::QueuedAfterDrop;
            }
        }

        state.queue.push_back(item);
        drop(state);
        self.notify_consumer();
        outcome
    }

    /// Take the next item without waiting.
    ///
    /// A pending overflow count is reported before the events that follow it.
    pub fn try_pop(&self) -> Popped<T> {
        let mut state = self.state.lock();
        if state.closed {
            return Popped::Closed;
        }
        if state.dropped > 0 {
            let dropped = std::mem::take(&mut state.dropped);
            return Popped::Item(Notification::Overflow { dropped });
        }
        match state.queue.pop_front() {
            Some(item) => {
                drop(state);
                self.not_full.notify_one();
                Popped::Item(Notification::Event(item))
            }
            None if state.finished => {
                state.closed = true;
                drop(state);
                self.not_full.notify_all();
                Popped::Closed
            }
            None => Popped::Empty,
        }
    }

    /// Async pop: `Ready(None)` once the channel is closed.
    pub fn poll_pop(&self, cx: &mut Context<'_>) -> Poll<Option<Notification<T>>> {
        match self.try_pop() {
            Popped::Item(item) => return Poll::Ready(Some(item)),
            Popped::Closed => return Poll::Ready(None),
            Popped::Empty => {}
        }

        // Register before re-checking so a push racing with us is not lost.
        self.waker.register(cx.waker());
        match self.try_pop() {
            Popped::Item(item) => Poll::Ready(Some(item)),
            Popped::Closed => Poll::Ready(None),
            Popped::Empty => Poll::Pending,
        }
    }

    /// Blocking pop with a deadline. Returns `Popped::Empty` on timeout.
    pub fn pop_until(&self, deadline: Instant) -> Popped<T> {
        loop {
            let epoch = self.epoch();
            match self.try_pop() {
                Popped::Empty => {
                    if !self.wait_ready(epoch, deadline) {
                        return Popped::Empty;
                    }
                }
                other => return other,
            }
        }
    }

    /// Current wake-up epoch; see [`wait_ready`](Self::wait_ready).
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Block until there is something to pop, the channel closes, or
    /// [`poke`](Self::poke) is called after `epoch` was read.
    ///
    /// Returns `false` if the deadline passed first.
    pub fn wait_ready(&self, epoch: u64, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        loop {
            let ready = |state: &ChannelState<T>| {
                state.closed || state.finished || state.has_pending() || state.epoch != epoch
            };
            if ready(&state) {
                return true;
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return ready(&state);
            }
        }
    }

    /// Wake the consumer without enqueuing anything.
    pub fn poke(&self) {
        self.state.lock().epoch += 1;
        self.notify_consumer();
    }

    /// Close the channel, discarding queued events and waking every waiter.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.queue.clear();
        state.dropped = 0;
        drop(state);

        self.not_full.notify_all();
        self.notify_consumer();
        true
    }

    /// End the channel from the producer side.
    ///
    /// Further pushes are rejected; the consumer still receives every queued
    /// event (and any overflow marker) before the channel reports closed.
    /// Returns `false` if the channel had already ended.
    pub fn finish(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.finished {
            return false;
        }
        state.finished = true;
        drop(state);

        self.not_full.notify_all();
        self.notify_consumer();
        true
    }

    fn notify_consumer(&self) {
        self.ready.notify_all();
        self.waker.wake();
    }
}

impl Subscriber for EventChannel<DeviceCollectionEvent> {
    fn deliver(&self, event: &NativeEvent) {
        if let NativeEvent::Collection(event) = event {
            if self.push(event.clone()) == PushOutcome::QueuedAfterDrop {
                warn!("Collection channel full, dropped oldest event");
            }
        }
    }

    fn terminate(&self) {
        self.finish();
    }
}

impl Subscriber for EventChannel<VolumeChangeEvent> {
    fn deliver(&self, event: &NativeEvent) {
        if let NativeEvent::Volume(event) = event {
            if self.push(event.clone()) == PushOutcome::QueuedAfterDrop {
                warn!(device_id = %event.device, "Volume channel full, dropped oldest event");
            }
        }
    }

    fn terminate(&self) {
        self.finish();
    }
}
