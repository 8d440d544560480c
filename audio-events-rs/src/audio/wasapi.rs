//! [`AudioBackend`] over the Windows Core Audio API.
//!
//! Every call initializes COM on the calling thread (multithreaded apartment)
//! and creates its own enumerator, so the backend can be used from any
//! thread. Notification interfaces are kept alive in a registration table
//! until they are unregistered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};
use windows::Win32::Media::Audio::Endpoints::{IAudioEndpointVolume, IAudioEndpointVolumeCallback};
use windows::Win32::Media::Audio::{IMMDeviceEnumerator, IMMNotificationClient};

use super::backend::{AudioBackend, NativeHandle, NotificationCallback, Scope};
use super::device::{AudioDevice, AudioError, DataFlow, DeviceState, EndpointVolume, Role};
use super::enumerator::{ensure_com, DeviceEnumerator, OsResultExt};
use super::notifications::DeviceNotificationClient;
use super::policy;
use super::volume::{VolumeController, VolumeNotificationClient};

enum NativeRegistration {
    Collection {
        enumerator: IMMDeviceEnumerator,
        client: IMMNotificationClient,
    },
    Volume {
        endpoint: IAudioEndpointVolume,
        callback: IAudioEndpointVolumeCallback,
    },
}

// The interfaces were created in the multithreaded apartment and are
// free-threaded there.
unsafe impl Send for NativeRegistration {}

/// Windows audio endpoint backend.
pub struct WasapiBackend {
    registrations: Mutex<HashMap<NativeHandle, NativeRegistration>>,
    next_handle: AtomicU64,
}

impl WasapiBackend {
    /// Check that the audio service is reachable.
    pub fn new() -> Result<Self, AudioError> {
        ensure_com()?;
        DeviceEnumerator::new()?;
        info!("Windows audio backend ready");
        Ok(Self {
            registrations: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    fn enumerator(&self) -> Result<DeviceEnumerator, AudioError> {
        ensure_com()?;
        DeviceEnumerator::new()
    }

    fn volume_controller(&self, device_id: &str) -> Result<VolumeController, AudioError> {
        let device = self.enumerator()?.device(device_id)?;
        VolumeController::new(&device)
    }
}

impl AudioBackend for WasapiBackend {
    fn enumerate_devices(
        &self,
        dataflow: DataFlow,
        state_mask: DeviceState,
    ) -> Result<Vec<AudioDevice>, AudioError> {
        self.enumerator()?.enumerate(dataflow, state_mask)
    }

    fn get_device(&self, device_id: &str) -> Result<AudioDevice, AudioError> {
        self.enumerator()?.get_device(device_id)
    }

    fn get_default_device(
        &self,
        dataflow: DataFlow,
        role: Role,
    ) -> Result<Option<AudioDevice>, AudioError> {
        self.enumerator()?.default_device(dataflow, role)
    }

    fn register_notification_sink(
        &self,
        scope: &Scope,
        callback: NotificationCallback,
    ) -> Result<NativeHandle, AudioError> {
        let registration = match scope {
            Scope::GlobalCollection => {
                let enumerator = self.enumerator()?;
                let client = DeviceNotificationClient::new(callback)
                    .register(enumerator.raw_enumerator())
                    .os_err(AudioError::NotificationFailed)?;
                NativeRegistration::Collection {
                    enumerator: enumerator.raw_enumerator().clone(),
                    client,
                }
            }
            Scope::DeviceVolume(device_id) => {
                let controller = self.volume_controller(device_id)?;
                let callback = controller
                    .register(VolumeNotificationClient::new(device_id.clone(), callback))?;
                NativeRegistration::Volume {
                    endpoint: controller.raw_endpoint_volume().clone(),
                    callback,
                }
            }
        };

        let handle = NativeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.registrations.lock().insert(handle, registration);
        debug!(scope = %scope, handle = handle.0, "Registered native notification sink");
        Ok(handle)
    }

    fn unregister_notification_sink(&self, handle: NativeHandle) -> Result<(), AudioError> {
        let registration = self
            .registrations
            .lock()
            .remove(&handle)
            .ok_or(AudioError::UnknownHandle(handle.0))?;

        ensure_com()?;
        // Blocks until in-flight callbacks for this sink have returned.
        unsafe {
            match registration {
                NativeRegistration::Collection { enumerator, client } => enumerator
                    .UnregisterEndpointNotificationCallback(&client)
                    .os_err(AudioError::NotificationFailed)?,
                NativeRegistration::Volume { endpoint, callback } => endpoint
                    .UnregisterControlChangeNotify(&callback)
                    .os_err(AudioError::NotificationFailed)?,
            }
        }
        debug!(handle = handle.0, "Unregistered native notification sink");
        Ok(())
    }

    fn get_endpoint_volume(&self, device_id: &str) -> Result<EndpointVolume, AudioError> {
        self.volume_controller(device_id)?.snapshot()
    }

    fn set_endpoint_mute(&self, device_id: &str, mute: bool) -> Result<(), AudioError> {
        self.volume_controller(device_id)?.set_mute(mute)
    }

    fn set_endpoint_volume(&self, device_id: &str, volume: f32) -> Result<(), AudioError> {
        self.volume_controller(device_id)?.set_volume(volume)
    }

    fn set_default_device(&self, device_id: &str, role: Role) -> Result<(), AudioError> {
        ensure_com()?;
        policy::set_default_endpoint(device_id, role)
    }
}
