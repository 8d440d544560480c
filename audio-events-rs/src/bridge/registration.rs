//! Reference-counted ownership of OS notification registrations.
//!
//! The manager holds exactly one OS registration per [`Scope`]. Every caller
//! gets a [`RegistrationHandle`] (scope + generation + id) that only counts
//! towards that registration; the last release tears it down.
//!
//! Notifications are fanned out to the subscribers of their scope. The
//! callback path never takes the registry lock, so deregistering with the OS
//! (which may wait for in-flight callbacks) cannot deadlock against it.
//!
//! Removal is remembered per device through a shared [`DeviceStatus`]. The
//! manager only keeps weak references to them, so the state of a device lives
//! as long as some handle or registration still refers to it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::audio::{
    AudioBackend, DeviceCollectionEvent, NativeEvent, NativeHandle, NotificationCallback, Scope,
};

use super::error::{BridgeError, Result};

/// Receiver of the notifications of one scope.
pub(crate) trait Subscriber: Send + Sync {
    fn deliver(&self, event: &NativeEvent);

    /// The scope ended for good (device removed); no further events follow,
    /// but those already delivered stay readable.
    fn terminate(&self);
}

/// Removal flag shared by everything that refers to one device.
#[derive(Debug, Default)]
pub(crate) struct DeviceStatus {
    removed: AtomicBool,
}

impl DeviceStatus {
    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    fn set_removed(&self, removed: bool) -> bool {
        self.removed.swap(removed, Ordering::AcqRel) != removed
    }
}

/// Caller-side token for one reference to a scope's OS registration.
///
/// Dropping the handle does nothing; it must be passed to
/// [`RegistrationManager::unregister`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct RegistrationHandle {
    scope: Scope,
    generation: u64,
    id: u64,
}

impl RegistrationHandle {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Subscribers of one OS registration.
struct Fanout {
    scope: Scope,
    subscribers: RwLock<Vec<(u64, Arc<dyn Subscriber>)>>,
    terminated: AtomicBool,
    retired: AtomicBool,
}

impl Fanout {
    fn new(scope: Scope) -> Self {
        Self {
            scope,
            subscribers: RwLock::new(Vec::new()),
            terminated: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    fn add(&self, id: u64, subscriber: Arc<dyn Subscriber>) {
        let mut subscribers = self.subscribers.write();
        if self.terminated.load(Ordering::Acquire) {
            subscriber.terminate();
        }
        subscribers.push((id, subscriber));
    }

    fn remove(&self, id: u64) {
        self.subscribers.write().retain(|(sub_id, _)| *sub_id != id);
    }

    fn deliver(&self, event: &NativeEvent) {
        let subscribers: Vec<Arc<dyn Subscriber>> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, subscriber)| Arc::clone(subscriber))
            .collect();

        for subscriber in subscribers {
            subscriber.deliver(event);
        }
    }

    fn terminate(&self) {
        let subscribers = {
            let subscribers = self.subscribers.write();
            if self.terminated.swap(true, Ordering::AcqRel) {
                return;
            }
            subscribers
                .iter()
                .map(|(_, subscriber)| Arc::clone(subscriber))
                .collect::<Vec<_>>()
        };

        for subscriber in subscribers {
            subscriber.terminate();
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

struct ScopeEntry {
    native: NativeHandle,
    generation: u64,
    handles: HashSet<u64>,
    fanout: Arc<Fanout>,

    /// Set for device scopes
    device: Option<Arc<DeviceStatus>>,
}

impl ScopeEntry {
    fn is_device_removed(&self) -> bool {
        device_removed(&self.device)
    }
}

fn device_removed(device: &Option<Arc<DeviceStatus>>) -> bool {
    device.as_ref().map_or(false, |status| status.is_removed())
}

#[derive(Default)]
struct Registry {
    /// Live registration per scope
    scopes: HashMap<Scope, ScopeEntry>,

    /// Registrations superseded while handles to them were still held,
    /// keyed by generation
    superseded: HashMap<u64, ScopeEntry>,
}

/// Single point of truth for what is registered with the OS.
pub struct RegistrationManager {
    this: Weak<RegistrationManager>,
    backend: Arc<dyn AudioBackend>,
    registry: Mutex<Registry>,
    routes: RwLock<HashMap<Scope, Arc<Fanout>>>,
    devices: Mutex<HashMap<String, Weak<DeviceStatus>>>,
    violations: AtomicU64,
    next_id: AtomicU64,
    next_generation: AtomicU64,
}

impl RegistrationManager {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            backend,
            registry: Mutex::new(Registry::default()),
            routes: RwLock::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
            violations: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Take a reference to `scope`'s OS registration, creating it on first use.
    ///
    /// `subscriber` receives the scope's notifications until the returned
    /// handle is unregistered.
    pub(crate) fn register(
        &self,
        scope: Scope,
        subscriber: Option<Arc<dyn Subscriber>>,
    ) -> Result<RegistrationHandle> {
        let mut registry = self.registry.lock();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // A volume scope whose device went away and came back gets a fresh
        // OS registration; holders of the old one release it separately.
        let stale = registry.scopes.get(&scope).map_or(false, |entry| {
            entry.fanout.is_terminated() && !entry.is_device_removed()
        });
        if stale {
            if let Some(entry) = registry.scopes.remove(&scope) {
                debug!(scope = %scope, generation = entry.generation, "Superseding terminated registration");
                registry.superseded.insert(entry.generation, entry);
            }
        }

        if let Some(entry) = registry.scopes.get_mut(&scope) {
            entry.handles.insert(id);
            if let Some(subscriber) = subscriber {
                entry.fanout.add(id, subscriber);
            }
            debug!(
                scope = %scope,
                refs = entry.handles.len(),
                "Shared existing OS registration"
            );
            return Ok(RegistrationHandle {
                scope,
                generation: entry.generation,
                id,
            });
        }

        let device = scope.device_id().map(|device_id| self.track(device_id));
        let fanout = Arc::new(Fanout::new(scope.clone()));
        if let Some(subscriber) = subscriber {
            fanout.add(id, subscriber);
        }

        let native = self
            .backend
            .register_notification_sink(&scope, self.callback_for(&fanout))
            .map_err(|e| {
                warn!(scope = %scope, error = %e, "OS registration failed");
                BridgeError::RegistrationFailed {
                    scope: scope.clone(),
                    reason: e.to_string(),
                }
            })?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.routes.write().insert(scope.clone(), Arc::clone(&fanout));

        // The device may have been removed between the caller's check and now.
        if device_removed(&device) {
            fanout.terminate();
        }

        info!(scope = %scope, generation, "Registered OS notification sink");
        registry.scopes.insert(
            scope.clone(),
            ScopeEntry {
                native,
                generation,
                handles: HashSet::from([id]),
                fanout,
                device,
            },
        );

        Ok(RegistrationHandle {
            scope,
            generation,
            id,
        })
    }

    /// Release one reference; the last one deregisters from the OS.
    pub fn unregister(&self, handle: &RegistrationHandle) -> Result<()> {
        let mut registry = self.registry.lock();

        let live = registry
            .scopes
            .get(&handle.scope)
            .map_or(false, |entry| entry.generation == handle.generation);

        let entry = if live {
            registry.scopes.get_mut(&handle.scope)
        } else {
            registry
                .superseded
                .get_mut(&handle.generation)
                .filter(|entry| entry.fanout.scope == handle.scope)
        };

        let Some(entry) = entry else {
            return Err(Self::already_unregistered(handle));
        };
        if !entry.handles.remove(&handle.id) {
            return Err(Self::already_unregistered(handle));
        }

        entry.fanout.remove(handle.id);
        if !entry.handles.is_empty() {
            debug!(
                scope = %handle.scope,
                refs = entry.handles.len(),
                "Released registration reference"
            );
            return Ok(());
        }

        let entry = if live {
            registry.scopes.remove(&handle.scope)
        } else {
            registry.superseded.remove(&handle.generation)
        };
        let Some(entry) = entry else {
            return Ok(());
        };

        if live {
            let mut routes = self.routes.write();
            if routes
                .get(&handle.scope)
                .map_or(false, |fanout| Arc::ptr_eq(fanout, &entry.fanout))
            {
                routes.remove(&handle.scope);
            }
        }
        entry.fanout.retired.store(true, Ordering::Release);

        info!(scope = %handle.scope, generation = entry.generation, "Unregistering OS notification sink");
        self.backend.unregister_notification_sink(entry.native)?;
        Ok(())
    }

    /// Number of live references to `scope`'s current registration.
    pub fn ref_count(&self, scope: &Scope) -> usize {
        self.registry
            .lock()
            .scopes
            .get(scope)
            .map_or(0, |entry| entry.handles.len())
    }

    pub fn is_registered(&self, scope: &Scope) -> bool {
        self.ref_count(scope) > 0
    }

    /// Scopes that currently hold an OS registration.
    pub fn active_scopes(&self) -> Vec<Scope> {
        self.registry.lock().scopes.keys().cloned().collect()
    }

    /// True once a REMOVED notification for `device_id` went through the
    /// collection scope (and no later ADDED revived it).
    ///
    /// Only devices that are still referenced by a handle or a registration
    /// are remembered; for any other id this is `false`.
    pub fn is_removed(&self, device_id: &str) -> bool {
        self.devices
            .lock()
            .get(device_id)
            .and_then(Weak::upgrade)
            .map_or(false, |status| status.is_removed())
    }

    /// Shared removal state for `device_id`, created on first use.
    pub(crate) fn track(&self, device_id: &str) -> Arc<DeviceStatus> {
        let mut devices = self.devices.lock();
        if let Some(status) = devices.get(device_id).and_then(Weak::upgrade) {
            return status;
        }

        devices.retain(|_, status| status.strong_count() > 0);
        let status = Arc::new(DeviceStatus::default());
        devices.insert(device_id.to_string(), Arc::downgrade(&status));
        status
    }

    /// Number of devices whose removal state is currently remembered.
    pub fn tracked_devices(&self) -> usize {
        let mut devices = self.devices.lock();
        devices.retain(|_, status| status.strong_count() > 0);
        devices.len()
    }

    /// Notifications rejected because their scope was not registered.
    pub fn protocol_violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    fn already_unregistered(handle: &RegistrationHandle) -> BridgeError {
        warn!(scope = %handle.scope, "Registration handle released twice");
        BridgeError::AlreadyUnregistered {
            scope: handle.scope.clone(),
        }
    }

    fn callback_for(&self, fanout: &Arc<Fanout>) -> NotificationCallback {
        let manager = self.this.clone();
        let fanout = Arc::clone(fanout);
        Arc::new(move |event| match manager.upgrade() {
            Some(manager) => manager.dispatch(&fanout, event),
            None => Err(BridgeError::ProtocolViolation {
                scope: fanout.scope.clone(),
                detail: "notification after the bridge was dropped".to_string(),
            }),
        })
    }

    fn dispatch(&self, fanout: &Fanout, event: NativeEvent) -> Result<()> {
        if fanout.retired.load(Ordering::Acquire) {
            return Err(self.violation(&fanout.scope, "notification for an unregistered scope"));
        }

        let belongs = match (&fanout.scope, &event) {
            (Scope::GlobalCollection, NativeEvent::Collection(_)) => true,
            (Scope::DeviceVolume(id), NativeEvent::Volume(volume)) => volume.device == *id,
            _ => false,
        };
        if !belongs {
            return Err(self.violation(&fanout.scope, "notification does not belong to this scope"));
        }

        if fanout.is_terminated() {
            debug!(scope = %fanout.scope, "Ignoring notification for removed device");
            return Ok(());
        }

        if let NativeEvent::Collection(DeviceCollectionEvent::Added { device_id }) = &event {
            if self.set_removed(device_id, false) {
                debug!(device_id = %device_id, "Previously removed device re-added");
            }
        }

        fanout.deliver(&event);

        if let NativeEvent::Collection(DeviceCollectionEvent::Removed { device_id }) = &event {
            self.handle_removal(device_id);
        }
        Ok(())
    }

    /// Returns `true` if the device's state changed. Untracked devices are
    /// left alone.
    fn set_removed(&self, device_id: &str, removed: bool) -> bool {
        let status = self.devices.lock().get(device_id).and_then(Weak::upgrade);
        status.map_or(false, |status| status.set_removed(removed))
    }

    fn handle_removal(&self, device_id: &str) {
        self.set_removed(device_id, true);

        let scope = Scope::DeviceVolume(device_id.to_string());
        let fanout = self.routes.read().get(&scope).cloned();
        if let Some(fanout) = fanout {
            info!(device_id = %device_id, "Device removed, ending volume observers");
            fanout.terminate();
        }
    }

    fn violation(&self, scope: &Scope, detail: &str) -> BridgeError {
        self.violations.fetch_add(1, Ordering::Relaxed);
        error!(scope = %scope, detail, "Notification protocol violation");
        BridgeError::ProtocolViolation {
            scope: scope.clone(),
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{DataFlow, DeviceState, FakeBackend, VolumeChangeEvent};
    use crate::bridge::channel::{ChannelConfig, EventChannel, Notification, Popped};

    fn setup() -> (Arc<FakeBackend>, Arc<RegistrationManager>) {
        let backend = Arc::new(FakeBackend::new());
        let manager = RegistrationManager::new(backend.clone());
        (backend, manager)
    }

    fn volume_event(device: &str, volume: f32) -> NativeEvent {
        NativeEvent::Volume(VolumeChangeEvent {
            device: device.to_string(),
            volume,
            mute: false,
            channel_volumes: vec![volume, volume],
        })
    }

    #[test]
    fn test_reference_counting_single_os_registration() {
        let (backend, manager) = setup();
        let scope = Scope::GlobalCollection;

        let handles: Vec<_> = (0..3)
            .map(|_| manager.register(scope.clone(), None).unwrap())
            .collect();
        assert_eq!(backend.register_calls(), 1);
        assert_eq!(manager.ref_count(&scope), 3);

        manager.unregister(&handles[0]).unwrap();
        manager.unregister(&handles[1]).unwrap();
        assert!(manager.is_registered(&scope));
        assert_eq!(backend.unregister_calls(), 0);

        manager.unregister(&handles[2]).unwrap();
        assert!(!manager.is_registered(&scope));
        assert_eq!(backend.register_calls(), 1);
        assert_eq!(backend.unregister_calls(), 1);
    }

    #[test]
    fn test_double_unregister_is_reported() {
        let (backend, manager) = setup();
        let handle = manager.register(Scope::GlobalCollection, None).unwrap();

        manager.unregister(&handle).unwrap();
        assert!(matches!(
            manager.unregister(&handle),
            Err(BridgeError::AlreadyUnregistered { .. })
        ));
        assert_eq!(backend.unregister_calls(), 1);
    }

    #[test]
    fn test_failed_registration_leaves_no_state() {
        let (backend, manager) = setup();
        backend.fail_next_register("resource exhaustion");

        let result = manager.register(Scope::GlobalCollection, None);
        assert!(matches!(result, Err(BridgeError::RegistrationFailed { .. })));
        assert_eq!(manager.ref_count(&Scope::GlobalCollection), 0);
        assert!(manager.active_scopes().is_empty());

        // A later attempt starts from scratch.
        let handle = manager.register(Scope::GlobalCollection, None).unwrap();
        assert_eq!(manager.ref_count(&Scope::GlobalCollection), 1);
        manager.unregister(&handle).unwrap();
    }

    #[test]
    fn test_fanout_reaches_every_subscriber() {
        let (backend, manager) = setup();
        let scope = Scope::DeviceVolume("spk".to_string());
        let first = Arc::new(EventChannel::<VolumeChangeEvent>::new(ChannelConfig::default()));
        let second = Arc::new(EventChannel::<VolumeChangeEvent>::new(ChannelConfig::default()));

        let h1 = manager.register(scope.clone(), Some(first.clone())).unwrap();
        let h2 = manager.register(scope.clone(), Some(second.clone())).unwrap();

        backend.emit(volume_event("spk", 0.3)).unwrap();
        assert!(matches!(first.try_pop(), Popped::Item(Notification::Event(e)) if e.volume == 0.3));
        assert!(matches!(second.try_pop(), Popped::Item(Notification::Event(e)) if e.volume == 0.3));

        manager.unregister(&h1).unwrap();
        backend.emit(volume_event("spk", 0.4)).unwrap();
        assert_eq!(first.try_pop(), Popped::Empty);
        assert!(matches!(second.try_pop(), Popped::Item(Notification::Event(e)) if e.volume == 0.4));

        manager.unregister(&h2).unwrap();
    }

    #[test]
    fn test_event_after_unregister_is_protocol_violation() {
        let (backend, manager) = setup();
        let scope = Scope::DeviceVolume("spk".to_string());
        let handle = manager.register(scope, None).unwrap();
        manager.unregister(&handle).unwrap();

        let results = backend.emit_retired(volume_event("spk", 0.5));
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(BridgeError::ProtocolViolation { .. })));
        assert_eq!(manager.protocol_violations(), 1);
    }

    #[test]
    fn test_event_for_wrong_device_is_protocol_violation() {
        let (backend, manager) = setup();
        let handle = manager
            .register(Scope::DeviceVolume("spk".to_string()), None)
            .unwrap();

        let results = backend.emit_to_scope(
            &Scope::DeviceVolume("spk".to_string()),
            volume_event("mic", 0.5),
        );
        assert!(matches!(results[0], Err(BridgeError::ProtocolViolation { .. })));
        assert_eq!(manager.protocol_violations(), 1);
        manager.unregister(&handle).unwrap();
    }

    #[test]
    fn test_removal_terminates_volume_subscribers() {
        let (backend, manager) = setup();
        let channel = Arc::new(EventChannel::<VolumeChangeEvent>::new(ChannelConfig::default()));
        let global = manager.register(Scope::GlobalCollection, None).unwrap();
        let volume = manager
            .register(Scope::DeviceVolume("spk".to_string()), Some(channel.clone()))
            .unwrap();

        backend
            .emit(NativeEvent::Collection(DeviceCollectionEvent::Removed {
                device_id: "spk".to_string(),
            }))
            .unwrap();

        assert!(manager.is_removed("spk"));
        assert_eq!(channel.try_pop(), Popped::Closed);

        // The OS registration lives until the handle is released.
        assert!(manager.is_registered(&Scope::DeviceVolume("spk".to_string())));
        manager.unregister(&volume).unwrap();
        manager.unregister(&global).unwrap();
        assert_eq!(backend.unregister_calls(), 2);
    }

    #[test]
    fn test_register_after_removal_is_terminated_immediately() {
        let (backend, manager) = setup();
        let global = manager.register(Scope::GlobalCollection, None).unwrap();
        let status = manager.track("spk");
        backend
            .emit(NativeEvent::Collection(DeviceCollectionEvent::Removed {
                device_id: "spk".to_string(),
            }))
            .unwrap();
        assert!(status.is_removed());

        let channel = Arc::new(EventChannel::<VolumeChangeEvent>::new(ChannelConfig::default()));
        let handle = manager
            .register(Scope::DeviceVolume("spk".to_string()), Some(channel.clone()))
            .unwrap();
        assert!(channel.is_closed());

        manager.unregister(&handle).unwrap();
        manager.unregister(&global).unwrap();
    }

    #[test]
    fn test_removal_state_is_dropped_with_last_reference() {
        let (backend, manager) = setup();
        let global = manager.register(Scope::GlobalCollection, None).unwrap();

        for i in 0..100 {
            let device_id = format!("usb-headset-{i}");
            let status = manager.track(&device_id);
            backend
                .emit(NativeEvent::Collection(DeviceCollectionEvent::Removed {
                    device_id: device_id.clone(),
                }))
                .unwrap();
            assert!(status.is_removed());
            assert!(manager.is_removed(&device_id));
        }

        assert_eq!(manager.tracked_devices(), 0);
        assert!(!manager.is_removed("usb-headset-0"));

        // Removals of devices nobody refers to leave nothing behind.
        backend
            .emit(NativeEvent::Collection(DeviceCollectionEvent::Removed {
                device_id: "never-seen".to_string(),
            }))
            .unwrap();
        assert_eq!(manager.tracked_devices(), 0);
        manager.unregister(&global).unwrap();
    }

    #[test]
    fn test_volume_registration_keeps_removal_state() {
        let (backend, manager) = setup();
        let global = manager.register(Scope::GlobalCollection, None).unwrap();
        let volume = manager
            .register(Scope::DeviceVolume("spk".to_string()), None)
            .unwrap();
        assert_eq!(manager.tracked_devices(), 1);

        backend
            .emit(NativeEvent::Collection(DeviceCollectionEvent::Removed {
                device_id: "spk".to_string(),
            }))
            .unwrap();
        assert!(manager.is_removed("spk"));

        manager.unregister(&volume).unwrap();
        assert_eq!(manager.tracked_devices(), 0);
        manager.unregister(&global).unwrap();
    }

    #[test]
    fn test_readded_device_gets_fresh_registration() {
        let (backend, manager) = setup();
        backend.add_device(crate::audio::AudioDevice::new(
            "spk",
            "Speakers",
            DataFlow::Render,
            DeviceState::ACTIVE,
        ));
        let scope = Scope::DeviceVolume("spk".to_string());
        let global = manager.register(Scope::GlobalCollection, None).unwrap();
        let old = manager.register(scope.clone(), None).unwrap();

        backend
            .emit(NativeEvent::Collection(DeviceCollectionEvent::Removed {
                device_id: "spk".to_string(),
            }))
            .unwrap();
        backend
            .emit(NativeEvent::Collection(DeviceCollectionEvent::Added {
                device_id: "spk".to_string(),
            }))
            .unwrap();
        assert!(!manager.is_removed("spk"));

        let channel = Arc::new(EventChannel::<VolumeChangeEvent>::new(ChannelConfig::default()));
        let fresh = manager.register(scope.clone(), Some(channel.clone())).unwrap();
        assert_ne!(fresh.generation(), old.generation());
        assert!(!channel.is_closed());
        assert_eq!(manager.ref_count(&scope), 1);

        // Releasing the superseded handle tears down only the old registration.
        manager.unregister(&old).unwrap();
        assert!(manager.is_registered(&scope));
        manager.unregister(&fresh).unwrap();
        manager.unregister(&global).unwrap();
        assert_eq!(backend.register_calls(), backend.unregister_calls());
    }
}
