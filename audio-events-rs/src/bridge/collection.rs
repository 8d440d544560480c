//! Device collection handle: snapshot, default lookups and the
//! collection-events stream.
//!
//! Collection notifications land in one inbound channel. Whoever reaches them
//! first (a snapshot reader or the events consumer) applies them to the
//! snapshot under the collection lock; events drained by readers are parked
//! for the consumer so it still sees every one, in order. Either way the
//! snapshot is never behind the last event handed out.
//!
//! Parked events are bounded by the channel capacity. When readers outpace a
//! slow consumer the oldest parked events are dropped and the consumer gets an
//! overflow marker in their place; the snapshot has already applied them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio::{
    AudioDevice, AudioError, DataFlow, DeviceCollectionEvent, DeviceState, Role, Scope,
};

use super::channel::{EventChannel, Notification, Popped};
use super::error::{BridgeError, Result};
use super::registration::RegistrationHandle;
use super::snapshot::{DeviceSnapshot, FilteredView};
use super::stream::{EventSource, EventStream};
use super::volume::AudioDeviceHandle;
use super::BridgeInner;

/// Async sequence of collection changes.
pub type CollectionEvents = EventStream<CollectionSource>;

struct Forward {
    stream_id: u64,
    pending: VecDeque<Notification<DeviceCollectionEvent>>,

    /// Parked events discarded since the consumer last looked
    dropped: usize,
}

impl Forward {
    fn new(stream_id: u64) -> Self {
        Self {
            stream_id,
            pending: VecDeque::new(),
            dropped: 0,
        }
    }

    fn park(&mut self, item: Notification<DeviceCollectionEvent>, capacity: usize) {
        if self.pending.len() >= capacity {
            let lost = match self.pending.pop_front() {
                Some(Notification::Overflow { dropped }) => dropped,
                Some(_) => 1,
                None => 0,
            };
            self.dropped += lost;
            warn!(
                stream_id = self.stream_id,
                dropped = self.dropped,
                "Collection consumer fell behind, dropping parked events"
            );
        }
        self.pending.push_back(item);
    }

    fn take(&mut self) -> Option<Notification<DeviceCollectionEvent>> {
        if self.dropped > 0 {
            let dropped = std::mem::take(&mut self.dropped);
            return Some(Notification::Overflow { dropped });
        }
        self.pending.pop_front()
    }
}

struct CollectionState {
    snapshot: DeviceSnapshot,

    /// Present while an events stream is open
    forward: Option<Forward>,
}

struct CollectionShared {
    inner: Arc<BridgeInner>,
    inbound: Arc<EventChannel<DeviceCollectionEvent>>,
    state: Mutex<CollectionState>,
    registration: Mutex<Option<RegistrationHandle>>,
    next_stream_id: AtomicU64,
}

impl CollectionShared {
    /// Drain everything queued so far into the snapshot.
    fn sync(&self) {
        let capacity = self.inbound.capacity();
        let mut state = self.state.lock();
        let mut forwarded = false;
        loop {
            match self.inbound.try_pop() {
                Popped::Item(item) => {
                    let item = self.accept(&mut state, item);
                    if let Some(forward) = state.forward.as_mut() {
                        forward.park(item, capacity);
                        forwarded = true;
                    }
                }
                Popped::Empty | Popped::Closed => break,
            }
        }
        drop(state);

        if forwarded {
            self.inbound.poke();
        }
    }

    /// Apply an inbound item to the snapshot and return what the consumer sees.
    fn accept(
        &self,
        state: &mut CollectionState,
        item: Notification<DeviceCollectionEvent>,
    ) -> Notification<DeviceCollectionEvent> {
        match &item {
            Notification::Event(event) => {
                let backend = &self.inner.backend;
                state
                    .snapshot
                    .apply(event, |device_id| backend.get_device(device_id));
            }
            Notification::Overflow { dropped } => {
                warn!(dropped, "Collection events were dropped, resynchronising snapshot");
                if let Err(e) = self.resync(&mut state.snapshot) {
                    warn!(error = %e, "Snapshot resync failed");
                }
            }
            Notification::ChannelLayoutChanged { .. } => {}
        }
        item
    }

    /// Rebuild the snapshot from enumeration.
    fn resync(&self, snapshot: &mut DeviceSnapshot) -> std::result::Result<(), AudioError> {
        let backend = &self.inner.backend;
        snapshot.reset(backend.enumerate_devices(DataFlow::All, DeviceState::ALL)?);

        for dataflow in [DataFlow::Render, DataFlow::Capture] {
            for role in Role::ALL {
                match backend.get_default_device(dataflow, role) {
                    Ok(device) => {
                        snapshot.set_default(dataflow, role, device.map(|d| d.device_id))
                    }
                    Err(e) => {
                        debug!(?dataflow, ?role, error = %e, "No default device lookup");
                    }
                }
            }
        }
        Ok(())
    }

    fn release(&self, handle: Option<RegistrationHandle>) {
        if let Some(handle) = handle {
            if let Err(e) = self.inner.manager.unregister(&handle) {
                warn!(error = %e, "Failed to release collection registration");
            }
        }
    }
}

/// Consistent view of the endpoints known to the OS.
///
/// Lookups drain pending notifications first, so they always reflect every
/// event the OS has delivered so far. Dropping the collection closes it.
pub struct DeviceCollection {
    shared: Arc<CollectionShared>,
}

impl DeviceCollection {
    pub(crate) fn open(inner: Arc<BridgeInner>) -> Result<Self> {
        let inbound = Arc::new(EventChannel::new(inner.config.channel()));
        let handle = inner
            .manager
            .register(Scope::GlobalCollection, Some(inbound.clone()))?;

        let shared = Arc::new(CollectionShared {
            inner,
            inbound,
            state: Mutex::new(CollectionState {
                snapshot: DeviceSnapshot::new(),
                forward: None,
            }),
            registration: Mutex::new(Some(handle)),
            next_stream_id: AtomicU64::new(1),
        });

        // Registered before enumerating, so nothing between the two is missed.
        let seeded = {
            let mut state = shared.state.lock();
            shared.resync(&mut state.snapshot)
        };
        if let Err(e) = seeded {
            shared.inbound.close();
            shared.release(shared.registration.lock().take());
            return Err(e.into());
        }

        info!(
            devices = shared.state.lock().snapshot.len(),
            "Device collection opened"
        );
        Ok(Self { shared })
    }

    /// Every known device, in enumeration order.
    pub fn devices(&self) -> Vec<AudioDevice> {
        self.shared.sync();
        self.shared.state.lock().snapshot.devices().to_vec()
    }

    pub fn len(&self) -> usize {
        self.shared.sync();
        self.shared.state.lock().snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, device_id: &str) -> Result<AudioDeviceHandle> {
        self.shared.sync();
        let state = self.shared.state.lock();
        state
            .snapshot
            .get(device_id)
            .map(|device| self.handle(device.clone()))
            .ok_or_else(|| BridgeError::DeviceNotFound {
                device_id: device_id.to_string(),
            })
    }

    /// Devices matching `dataflow` (`All` for both) with any state in `state_mask`.
    pub fn filter(&self, dataflow: DataFlow, state_mask: DeviceState) -> FilteredView {
        self.shared.sync();
        self.shared.state.lock().snapshot.filter(dataflow, state_mask)
    }

    /// Current default for a (flow, role) pair, if it is a known device.
    pub fn default_device(&self, dataflow: DataFlow, role: Role) -> Option<AudioDeviceHandle> {
        self.shared.sync();
        let state = self.shared.state.lock();
        state
            .snapshot
            .default_device(dataflow, role)
            .map(|device| self.handle(device.clone()))
    }

    pub fn default_output(&self) -> Option<AudioDeviceHandle> {
        self.default_device(DataFlow::Render, Role::Console)
    }

    pub fn default_input(&self) -> Option<AudioDeviceHandle> {
        self.default_device(DataFlow::Capture, Role::Console)
    }

    /// Wrap a device value in a handle bound to this bridge.
    pub fn handle(&self, device: AudioDevice) -> AudioDeviceHandle {
        AudioDeviceHandle::new(device, Arc::clone(&self.shared.inner))
    }

    /// Open the collection-events stream.
    ///
    /// Only one stream may be open per collection at a time; a second call
    /// fails with [`BridgeError::ConcurrentConsumption`] until the first is
    /// closed or dropped.
    pub fn events(&self) -> Result<CollectionEvents> {
        if self.is_closed() {
            return Ok(EventStream::new(CollectionSource::finished(Arc::clone(
                &self.shared,
            ))));
        }

        // Apply anything queued before the stream existed; it is not replayed.
        self.shared.sync();

        let stream_id = self.shared.next_stream_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.shared.state.lock();
            if state.forward.is_some() {
                return Err(BridgeError::ConcurrentConsumption);
            }
            state.forward = Some(Forward::new(stream_id));
        }

        let handle = match self
            .shared
            .inner
            .manager
            .register(Scope::GlobalCollection, None)
        {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.state.lock().forward = None;
                return Err(e);
            }
        };

        debug!(stream_id, "Collection events stream opened");
        Ok(EventStream::new(CollectionSource {
            shared: Arc::clone(&self.shared),
            stream_id,
            registration: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        }))
    }

    /// Stop receiving notifications. Idempotent; open event streams end.
    pub fn close(&self) -> bool {
        if !self.shared.inbound.close() {
            return false;
        }
        self.shared.state.lock().forward = None;
        self.shared.release(self.shared.registration.lock().take());
        info!("Device collection closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inbound.is_closed()
    }
}

impl Drop for DeviceCollection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer side of a [`CollectionEvents`] stream.
pub struct CollectionSource {
    shared: Arc<CollectionShared>,
    stream_id: u64,
    registration: Mutex<Option<RegistrationHandle>>,
    closed: AtomicBool,
}

impl CollectionSource {
    fn finished(shared: Arc<CollectionShared>) -> Self {
        Self {
            shared,
            stream_id: 0,
            registration: Mutex::new(None),
            closed: AtomicBool::new(true),
        }
    }

    fn is_current(&self, state: &CollectionState) -> bool {
        !self.closed.load(Ordering::Acquire)
            && state
                .forward
                .as_ref()
                .map_or(false, |forward| forward.stream_id == self.stream_id)
    }

    fn take_pending(
        &self,
        state: &mut CollectionState,
    ) -> Option<Notification<DeviceCollectionEvent>> {
        state.forward.as_mut().and_then(Forward::take)
    }
}

impl EventSource for CollectionSource {
    type Item = DeviceCollectionEvent;

    fn poll_pop(&self, cx: &mut Context<'_>) -> Poll<Option<Notification<DeviceCollectionEvent>>> {
        let mut state = self.shared.state.lock();
        if !self.is_current(&state) {
            return Poll::Ready(None);
        }
        if let Some(item) = self.take_pending(&mut state) {
            return Poll::Ready(Some(item));
        }

        // Polled under the collection lock: readers that drain the channel
        // meanwhile poke it after parking events, which wakes us.
        match self.shared.inbound.poll_pop(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(self.shared.accept(&mut state, item))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn pop_until(&self, deadline: Instant) -> Option<Notification<DeviceCollectionEvent>> {
        loop {
            let epoch = self.shared.inbound.epoch();
            {
                let mut state = self.shared.state.lock();
                if !self.is_current(&state) {
                    return None;
                }
                if let Some(item) = self.take_pending(&mut state) {
                    return Some(item);
                }
                match self.shared.inbound.try_pop() {
                    Popped::Item(item) => return Some(self.shared.accept(&mut state, item)),
                    Popped::Closed => return None,
                    Popped::Empty => {}
                }
            }
            if !self.shared.inbound.wait_ready(epoch, deadline) {
                return None;
            }
        }
    }

    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        {
            let mut state = self.shared.state.lock();
            if state
                .forward
                .as_ref()
                .map_or(false, |forward| forward.stream_id == self.stream_id)
            {
                state.forward = None;
            }
        }
        self.shared.inbound.poke();
        self.shared.release(self.registration.lock().take());
        debug!(stream_id = self.stream_id, "Collection events stream closed");
        true
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return true;
        }
        let state = self.shared.state.lock();
        !self.is_current(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FakeBackend;
    use crate::bridge::AudioBridge;
    use crate::config::BridgeConfig;
    use std::time::Duration;

    fn bridge() -> (Arc<FakeBackend>, AudioBridge) {
        let backend = Arc::new(FakeBackend::new());
        backend.add_device(AudioDevice::new(
            "spk",
            "Speakers",
            DataFlow::Render,
            DeviceState::ACTIVE,
        ));
        backend.set_default("spk", DataFlow::Render, Role::Console);
        let bridge = AudioBridge::new(backend.clone(), BridgeConfig::default()).unwrap();
        (backend, bridge)
    }

    #[test]
    fn test_open_seeds_from_enumeration() {
        let (_backend, bridge) = bridge();
        let collection = bridge.collection().unwrap();

        assert_eq!(collection.len(), 1);
        assert_eq!(collection.default_output().unwrap().device_id(), "spk");
        assert!(collection.default_input().is_none());
        assert!(matches!(
            collection.get("nope"),
            Err(BridgeError::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn test_readers_see_events_without_a_stream() {
        let (backend, bridge) = bridge();
        let collection = bridge.collection().unwrap();

        backend.add_device(AudioDevice::new(
            "mic1",
            "Microphone",
            DataFlow::Capture,
            DeviceState::ACTIVE,
        ));
        assert_eq!(collection.len(), 2);
        assert_eq!(
            collection.filter(DataFlow::Capture, DeviceState::ACTIVE).ids(),
            vec!["mic1"]
        );
    }

    #[test]
    fn test_default_cleared_without_device() {
        let (backend, bridge) = bridge();
        let collection = bridge.collection().unwrap();
        assert!(collection.default_output().is_some());

        backend.clear_default(DataFlow::Render, Role::Console);
        assert!(collection.default_output().is_none());
        // The device itself is still known.
        assert!(collection.get("spk").is_ok());
    }

    #[test]
    fn test_events_parked_by_readers_reach_consumer() {
        let (backend, bridge) = bridge();
        let collection = bridge.collection().unwrap();
        let events = collection.events().unwrap();

        backend.set_device_state("spk", DeviceState::DISABLED);
        // The read applies the change before the consumer has seen it.
        assert_eq!(collection.get("spk").unwrap().state(), DeviceState::DISABLED);

        let item = events.next_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(
            item,
            Some(Notification::Event(DeviceCollectionEvent::StateChanged {
                device_id: "spk".to_string(),
                state: DeviceState::DISABLED,
            }))
        );
    }

    #[test]
    fn test_single_events_stream() {
        let (_backend, bridge) = bridge();
        let collection = bridge.collection().unwrap();

        let first = collection.events().unwrap();
        assert!(matches!(
            collection.events(),
            Err(BridgeError::ConcurrentConsumption)
        ));
        assert_eq!(bridge.registrations().ref_count(&Scope::GlobalCollection), 2);

        assert!(first.close());
        assert!(!first.close());
        assert_eq!(bridge.registrations().ref_count(&Scope::GlobalCollection), 1);

        let second = collection.events().unwrap();
        assert!(!second.is_closed());
        assert!(first.is_closed());
    }

    #[test]
    fn test_close_collection_ends_stream_and_unregisters() {
        let (backend, bridge) = bridge();
        let collection = bridge.collection().unwrap();
        let events = collection.events().unwrap();

        assert!(collection.close());
        assert!(!collection.close());
        assert_eq!(events.next_timeout(Duration::from_millis(50)).unwrap(), None);
        assert!(events.is_closed());

        drop(events);
        assert_eq!(backend.register_calls(), 1);
        assert_eq!(backend.unregister_calls(), 1);
        assert!(bridge.registrations().active_scopes().is_empty());
    }

    #[test]
    fn test_overflow_triggers_resync() {
        let backend = Arc::new(FakeBackend::new());
        let config = BridgeConfig {
            channel_capacity: 2,
            overflow_policy: crate::config::OverflowPolicy::DropOldest,
            ..Default::default()
        };
        let bridge = AudioBridge::new(backend.clone(), config).unwrap();
        let collection = bridge.collection().unwrap();
        let events = collection.events().unwrap();

        for i in 0..5 {
            backend.add_device(AudioDevice::new(
                format!("mic{}", i),
                "Microphone",
                DataFlow::Capture,
                DeviceState::ACTIVE,
            ));
        }

        let first = events.next_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first, Some(Notification::Overflow { dropped: 3 }));
        // Everything is present even though three ADDED events were lost.
        assert_eq!(collection.len(), 5);
    }

    #[test]
    fn test_parked_events_are_bounded() {
        let backend = Arc::new(FakeBackend::new());
        let config = BridgeConfig {
            channel_capacity: 2,
            overflow_policy: crate::config::OverflowPolicy::DropOldest,
            ..Default::default()
        };
        let bridge = AudioBridge::new(backend.clone(), config).unwrap();
        let collection = bridge.collection().unwrap();
        let events = collection.events().unwrap();

        // Every read drains the inbound channel, so it never overflows itself.
        for i in 0..500 {
            backend.add_device(AudioDevice::new(
                format!("mic{}", i),
                "Microphone",
                DataFlow::Capture,
                DeviceState::ACTIVE,
            ));
            assert_eq!(collection.len(), i + 1);
        }

        let next = || events.next_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(next(), Some(Notification::Overflow { dropped: 498 }));
        for id in ["mic498", "mic499"] {
            assert_eq!(
                next(),
                Some(Notification::Event(DeviceCollectionEvent::Added {
                    device_id: id.to_string(),
                }))
            );
        }
        assert_eq!(events.next_timeout(Duration::from_millis(20)).unwrap(), None);
        assert!(!events.is_closed());
    }
}
