//! In-memory [`AudioBackend`] for tests and non-Windows development.
//!
//! Devices, defaults and volume state live in a table; mutations raise the
//! same notifications the OS would, on the calling thread. Registration calls
//! are counted so tests can check what reached the "OS".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::backend::{AudioBackend, NativeEvent, NativeHandle, NotificationCallback, Scope};
use super::device::{
    AudioDevice, AudioError, DataFlow, DeviceCollectionEvent, DeviceState, EndpointVolume, OsError,
    Role, VolumeChangeEvent,
};
use crate::bridge::BridgeError;

/// E_OUTOFMEMORY, used for injected registration failures
const FAKE_REGISTER_FAILURE: i32 = 0x8007_000E_u32 as i32;

#[derive(Default)]
struct FakeState {
    devices: Vec<AudioDevice>,
    defaults: HashMap<(DataFlow, Role), String>,
    volumes: HashMap<String, EndpointVolume>,
    sinks: HashMap<NativeHandle, (Scope, NotificationCallback)>,
    retired: Vec<(Scope, NotificationCallback)>,
    register_calls: usize,
    unregister_calls: usize,
    fail_next_register: Option<String>,
}

/// Scriptable stand-in for the Windows audio stack.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    next_handle: AtomicU64,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a device and raise ADDED.
    pub fn add_device(&self, device: AudioDevice) {
        let device_id = device.device_id.clone();
        {
            let mut state = self.state.lock();
            state.devices.retain(|d| d.device_id != device_id);
            state.devices.push(device);
        }
        self.raise(NativeEvent::Collection(DeviceCollectionEvent::Added { device_id }));
    }

    /// Unplug a device and raise REMOVED.
    pub fn remove_device(&self, device_id: &str) {
        {
            let mut state = self.state.lock();
            state.devices.retain(|d| d.device_id != device_id);
            state.defaults.retain(|_, id| id.as_str() != device_id);
            state.volumes.remove(device_id);
        }
        self.raise(NativeEvent::Collection(DeviceCollectionEvent::Removed {
            device_id: device_id.to_string(),
        }));
    }

    /// Change a device's state and raise STATE_CHANGED.
    pub fn set_device_state(&self, device_id: &str, new_state: DeviceState) {
        {
            let mut state = self.state.lock();
            if let Some(device) = state.devices.iter_mut().find(|d| d.device_id == device_id) {
                device.state = new_state;
            }
        }
        self.raise(NativeEvent::Collection(DeviceCollectionEvent::StateChanged {
            device_id: device_id.to_string(),
            state: new_state,
        }));
    }

    /// Change a default and raise DEFAULT_CHANGED.
    pub fn set_default(&self, device_id: &str, dataflow: DataFlow, role: Role) {
        self.state
            .lock()
            .defaults
            .insert((dataflow, role), device_id.to_string());
        self.raise(NativeEvent::Collection(DeviceCollectionEvent::DefaultChanged {
            device_id: Some(device_id.to_string()),
            dataflow,
            role,
        }));
    }

    /// Clear a default and raise DEFAULT_CHANGED with no device.
    pub fn clear_default(&self, dataflow: DataFlow, role: Role) {
        self.state.lock().defaults.remove(&(dataflow, role));
        self.raise(NativeEvent::Collection(DeviceCollectionEvent::DefaultChanged {
            device_id: None,
            dataflow,
            role,
        }));
    }

    /// Set volume state silently.
    pub fn set_volume_state(&self, device_id: &str, volume: EndpointVolume) {
        self.state.lock().volumes.insert(device_id.to_string(), volume);
    }

    /// Set volume state and raise a volume notification.
    pub fn emit_volume(&self, device_id: &str, volume: f32, mute: bool, channel_volumes: Vec<f32>) {
        let endpoint = EndpointVolume {
            volume,
            mute,
            channel_volumes,
        };
        self.set_volume_state(device_id, endpoint.clone());
        self.raise(Self::volume_event(device_id, endpoint));
    }

    /// Deliver `event` to every live sink whose scope it belongs to.
    ///
    /// Callbacks run on the calling thread, outside the backend lock. Returns
    /// the first callback error.
    pub fn emit(&self, event: NativeEvent) -> Result<(), BridgeError> {
        let callbacks: Vec<NotificationCallback> = self
            .state
            .lock()
            .sinks
            .values()
            .filter(|(scope, _)| routes_to(scope, &event))
            .map(|(_, callback)| callback.clone())
            .collect();

        let mut result = Ok(());
        for callback in callbacks {
            if let Err(e) = callback(event.clone()) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Deliver `event` to every live sink of `scope`, whether or not it
    /// belongs there.
    pub fn emit_to_scope(&self, scope: &Scope, event: NativeEvent) -> Vec<Result<(), BridgeError>> {
        let callbacks: Vec<NotificationCallback> = self
            .state
            .lock()
            .sinks
            .values()
            .filter(|(sink_scope, _)| sink_scope == scope)
            .map(|(_, callback)| callback.clone())
            .collect();
        callbacks.into_iter().map(|cb| cb(event.clone())).collect()
    }

    /// Deliver `event` to sinks that were already unregistered, as a late
    /// OS callback would.
    pub fn emit_retired(&self, event: NativeEvent) -> Vec<Result<(), BridgeError>> {
        let callbacks: Vec<NotificationCallback> = self
            .state
            .lock()
            .retired
            .iter()
            .filter(|(scope, _)| routes_to(scope, &event))
            .map(|(_, callback)| callback.clone())
            .collect();
        callbacks.into_iter().map(|cb| cb(event.clone())).collect()
    }

    /// Make the next `register_notification_sink` call fail.
    pub fn fail_next_register(&self, reason: &str) {
        self.state.lock().fail_next_register = Some(reason.to_string());
    }

    pub fn register_calls(&self) -> usize {
        self.state.lock().register_calls
    }

    pub fn unregister_calls(&self) -> usize {
        self.state.lock().unregister_calls
    }

    /// Scopes of the sinks currently registered.
    pub fn active_sinks(&self) -> Vec<Scope> {
        self.state
            .lock()
            .sinks
            .values()
            .map(|(scope, _)| scope.clone())
            .collect()
    }

    fn raise(&self, event: NativeEvent) {
        if let Err(e) = self.emit(event) {
            debug!(error = %e, "Notification callback failed");
        }
    }

    fn volume_event(device_id: &str, endpoint: EndpointVolume) -> NativeEvent {
        NativeEvent::Volume(VolumeChangeEvent {
            device: device_id.to_string(),
            volume: endpoint.volume,
            mute: endpoint.mute,
            channel_volumes: endpoint.channel_volumes,
        })
    }

    fn not_found(device_id: &str) -> AudioError {
        AudioError::DeviceNotFound {
            device_id: device_id.to_string(),
        }
    }

    /// Apply `change` to a device's volume state and raise the notification.
    fn update_volume<F>(&self, device_id: &str, change: F) -> Result<(), AudioError>
    where
        F: FnOnce(&mut EndpointVolume),
    {
        let endpoint = {
            let mut state = self.state.lock();
            if !state.devices.iter().any(|d| d.device_id == device_id) {
                return Err(Self::not_found(device_id));
            }
            let endpoint = state
                .volumes
                .entry(device_id.to_string())
                .or_insert_with(default_volume);
            change(endpoint);
            endpoint.clone()
        };
        self.raise(Self::volume_event(device_id, endpoint));
        Ok(())
    }
}

fn default_volume() -> EndpointVolume {
    EndpointVolume {
        volume: 1.0,
        mute: false,
        channel_volumes: vec![1.0, 1.0],
    }
}

fn routes_to(scope: &Scope, event: &NativeEvent) -> bool {
    match (scope, event) {
        (Scope::GlobalCollection, NativeEvent::Collection(_)) => true,
        (Scope::DeviceVolume(id), NativeEvent::Volume(volume)) => volume.device == *id,
        _ => false,
    }
}

impl AudioBackend for FakeBackend {
    fn enumerate_devices(
        &self,
        dataflow: DataFlow,
        state_mask: DeviceState,
    ) -> Result<Vec<AudioDevice>, AudioError> {
        Ok(self
            .state
            .lock()
            .devices
            .iter()
            .filter(|d| d.matches(dataflow, state_mask))
            .cloned()
            .collect())
    }

    fn get_device(&self, device_id: &str) -> Result<AudioDevice, AudioError> {
        self.state
            .lock()
            .devices
            .iter()
            .find(|d| d.device_id == device_id)
            .cloned()
            .ok_or_else(|| Self::not_found(device_id))
    }

    fn get_default_device(
        &self,
        dataflow: DataFlow,
        role: Role,
    ) -> Result<Option<AudioDevice>, AudioError> {
        let state = self.state.lock();
        Ok(state.defaults.get(&(dataflow, role)).and_then(|id| {
            state.devices.iter().find(|d| d.device_id == *id).cloned()
        }))
    }

    fn register_notification_sink(
        &self,
        scope: &Scope,
        callback: NotificationCallback,
    ) -> Result<NativeHandle, AudioError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.fail_next_register.take() {
            return Err(AudioError::NotificationFailed(OsError::new(
                FAKE_REGISTER_FAILURE,
                reason,
            )));
        }

        state.register_calls += 1;
        let handle = NativeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        state.sinks.insert(handle, (scope.clone(), callback));
        debug!(scope = %scope, handle = handle.0, "Fake sink registered");
        Ok(handle)
    }

    fn unregister_notification_sink(&self, handle: NativeHandle) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        let sink = state
            .sinks
            .remove(&handle)
            .ok_or(AudioError::UnknownHandle(handle.0))?;
        state.unregister_calls += 1;
        state.retired.push(sink);
        Ok(())
    }

    fn get_endpoint_volume(&self, device_id: &str) -> Result<EndpointVolume, AudioError> {
        let state = self.state.lock();
        if !state.devices.iter().any(|d| d.device_id == device_id) {
            return Err(Self::not_found(device_id));
        }
        Ok(state
            .volumes
            .get(device_id)
            .cloned()
            .unwrap_or_else(default_volume))
    }

    fn set_endpoint_mute(&self, device_id: &str, mute: bool) -> Result<(), AudioError> {
        self.update_volume(device_id, |endpoint| endpoint.mute = mute)
    }

    fn set_endpoint_volume(&self, device_id: &str, volume: f32) -> Result<(), AudioError> {
        let volume = volume.clamp(0.0, 1.0);
        self.update_volume(device_id, |endpoint| {
            endpoint.volume = volume;
            for channel in endpoint.channel_volumes.iter_mut() {
                *channel = volume;
            }
        })
    }

    fn set_default_device(&self, device_id: &str, role: Role) -> Result<(), AudioError> {
        let dataflow = self.get_device(device_id)?.dataflow;
        self.set_default(device_id, dataflow, role);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_emit_routes_by_scope() {
        let backend = FakeBackend::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = {
            let seen = Arc::clone(&seen);
            Arc::new(move |event: NativeEvent| {
                seen.lock().push(event);
                Ok::<(), BridgeError>(())
            }) as NotificationCallback
        };
        backend
            .register_notification_sink(&Scope::DeviceVolume("spk".to_string()), sink)
            .unwrap();

        backend.emit_volume("mic", 0.2, false, vec![0.2]);
        backend.emit_volume("spk", 0.4, false, vec![0.4]);
        backend.add_device(AudioDevice::new("x", "X", DataFlow::Render, DeviceState::ACTIVE));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], NativeEvent::Volume(v) if v.device == "spk"));
    }

    #[test]
    fn test_unregister_unknown_handle() {
        let backend = FakeBackend::new();
        assert!(matches!(
            backend.unregister_notification_sink(NativeHandle(99)),
            Err(AudioError::UnknownHandle(99))
        ));
        assert_eq!(backend.unregister_calls(), 0);
    }

    #[test]
    fn test_mutations_on_missing_device_fail() {
        let backend = FakeBackend::new();
        assert!(matches!(
            backend.set_endpoint_mute("ghost", true),
            Err(AudioError::DeviceNotFound { .. })
        ));
        assert!(matches!(
            backend.set_default_device("ghost", Role::Console),
            Err(AudioError::DeviceNotFound { .. })
        ));
    }
}
