//! Volume control using IAudioEndpointVolume.
//!
//! Provides volume and mute control for audio devices, and the per-device
//! callback that reports volume changes.

use tracing::warn;
use windows::core::implement;
use windows::Win32::Foundation::E_UNEXPECTED;
use windows::Win32::Media::Audio::Endpoints::{
    IAudioEndpointVolume, IAudioEndpointVolumeCallback, IAudioEndpointVolumeCallback_Impl,
};
use windows::Win32::Media::Audio::{IMMDevice, AUDIO_VOLUME_NOTIFICATION_DATA};
use windows::Win32::System::Com::CLSCTX_ALL;
// Re-export windows_core so the implement macro can find it
#[allow(unused_imports)]
use windows_core;

use super::backend::{NativeEvent, NotificationCallback};
use super::device::{AudioError, EndpointVolume, VolumeChangeEvent};
use super::enumerator::OsResultExt;

/// Volume controller for a specific device.
pub struct VolumeController {
    endpoint_volume: IAudioEndpointVolume,
}

impl VolumeController {
    /// Create a new VolumeController for the given device.
    pub fn new(device: &IMMDevice) -> Result<Self, AudioError> {
        unsafe {
            let endpoint_volume: IAudioEndpointVolume = device
                .Activate(CLSCTX_ALL, None)
                .map_err(|_| AudioError::VolumeNotAvailable)?;

            Ok(Self { endpoint_volume })
        }
    }

    /// Get the current mute state.
    pub fn get_mute(&self) -> Result<bool, AudioError> {
        unsafe {
            let muted = self
                .endpoint_volume
                .GetMute()
                .os_err(AudioError::WindowsError)?;
            Ok(muted.as_bool())
        }
    }

    /// Set the mute state.
    pub fn set_mute(&self, muted: bool) -> Result<(), AudioError> {
        unsafe {
            self.endpoint_volume
                .SetMute(muted, std::ptr::null())
                .os_err(AudioError::WindowsError)
        }
    }

    /// Get the current volume level (0.0 to 1.0).
    pub fn get_volume(&self) -> Result<f32, AudioError> {
        unsafe {
            self.endpoint_volume
                .GetMasterVolumeLevelScalar()
                .os_err(AudioError::WindowsError)
        }
    }

    /// Set the volume level (0.0 to 1.0).
    pub fn set_volume(&self, level: f32) -> Result<(), AudioError> {
        let level = level.clamp(0.0, 1.0);
        unsafe {
            self.endpoint_volume
                .SetMasterVolumeLevelScalar(level, std::ptr::null())
                .os_err(AudioError::WindowsError)
        }
    }

    /// Per-channel volume scalars, in channel order.
    pub fn channel_volumes(&self) -> Result<Vec<f32>, AudioError> {
        unsafe {
            let count = self
                .endpoint_volume
                .GetChannelCount()
                .os_err(AudioError::WindowsError)?;
            (0..count)
                .map(|channel| {
                    self.endpoint_volume
                        .GetChannelVolumeLevelScalar(channel)
                        .os_err(AudioError::WindowsError)
                })
                .collect()
        }
    }

    pub fn snapshot(&self) -> Result<EndpointVolume, AudioError> {
        Ok(EndpointVolume {
            volume: self.get_volume()?,
            mute: self.get_mute()?,
            channel_volumes: self.channel_volumes()?,
        })
    }

    /// Register a volume change callback; keep the returned interface to
    /// unregister it later.
    pub fn register(
        &self,
        client: VolumeNotificationClient,
    ) -> Result<IAudioEndpointVolumeCallback, AudioError> {
        unsafe {
            let callback: IAudioEndpointVolumeCallback = client.into();
            self.endpoint_volume
                .RegisterControlChangeNotify(&callback)
                .os_err(AudioError::NotificationFailed)?;
            Ok(callback)
        }
    }

    /// Get the raw IAudioEndpointVolume interface for notification registration.
    pub fn raw_endpoint_volume(&self) -> &IAudioEndpointVolume {
        &self.endpoint_volume
    }
}

/// Forwards one endpoint's volume notifications to a callback.
#[implement(IAudioEndpointVolumeCallback)]
pub struct VolumeNotificationClient {
    device_id: String,
    callback: NotificationCallback,
}

impl VolumeNotificationClient {
    pub fn new(device_id: String, callback: NotificationCallback) -> Self {
        Self {
            device_id,
            callback,
        }
    }
}

impl IAudioEndpointVolumeCallback_Impl for VolumeNotificationClient_Impl {
    fn OnNotify(&self, pnotify: *mut AUDIO_VOLUME_NOTIFICATION_DATA) -> windows::core::Result<()> {
        if pnotify.is_null() {
            return Ok(());
        }

        // afChannelVolumes is declared with one element; the OS allocates
        // nChannels of them.
        let event = unsafe {
            let data = &*pnotify;
            let channels = std::slice::from_raw_parts(
                data.afChannelVolumes.as_ptr(),
                data.nChannels as usize,
            );
            VolumeChangeEvent {
                device: self.device_id.clone(),
                volume: data.fMasterVolume,
                mute: data.bMuted.as_bool(),
                channel_volumes: channels.to_vec(),
            }
        };

        (self.callback)(NativeEvent::Volume(event)).map_err(|e| {
            warn!(device_id = %self.device_id, error = %e, "Volume notification rejected");
            E_UNEXPECTED.into()
        })
    }
}
