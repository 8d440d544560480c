//! Event bridge between OS notification callbacks and async consumers.
//!
//! [`AudioBridge`] is the entry point. It owns the backend and the
//! [`RegistrationManager`], and hands out:
//!
//! - [`DeviceCollection`]: snapshot of all endpoints, default lookups and a
//!   stream of collection changes
//! - [`AudioDeviceHandle`]: one endpoint, its mutations and its volume stream
//!
//! OS callbacks only push into bounded [`EventChannel`]s; every stream is an
//! [`EventStream`] over one of them.

pub mod channel;
pub mod collection;
pub mod error;
pub mod registration;
pub mod snapshot;
pub mod stream;
pub mod volume;

use std::sync::Arc;

use tracing::info;

use crate::audio::{AudioBackend, AudioError, DataFlow, DeviceState, Role};
use crate::config::BridgeConfig;

pub use channel::{Backpressure, ChannelConfig, EventChannel, Notification, PushOutcome};
pub use collection::{CollectionEvents, CollectionSource, DeviceCollection};
pub use error::{BridgeError, Result};
pub use registration::{RegistrationHandle, RegistrationManager};
pub use snapshot::{DeviceSnapshot, FilteredView};
pub use stream::{EventSource, EventStream};
pub use volume::{AudioDeviceHandle, VolumeEvents, VolumeSource};

pub(crate) struct BridgeInner {
    pub(crate) backend: Arc<dyn AudioBackend>,
    pub(crate) manager: Arc<RegistrationManager>,
    pub(crate) config: BridgeConfig,
}

/// Entry point of the event bridge.
#[derive(Clone)]
pub struct AudioBridge {
    inner: Arc<BridgeInner>,
}

impl AudioBridge {
    pub fn new(backend: Arc<dyn AudioBackend>, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let manager = RegistrationManager::new(Arc::clone(&backend));
        info!(
            capacity = config.channel_capacity,
            policy = ?config.overflow_policy,
            "Audio bridge created"
        );
        Ok(Self {
            inner: Arc::new(BridgeInner {
                backend,
                manager,
                config,
            }),
        })
    }

    /// Bridge over the Windows audio endpoint API.
    #[cfg(windows)]
    pub fn windows(config: BridgeConfig) -> Result<Self> {
        Self::new(Arc::new(crate::audio::WasapiBackend::new()?), config)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Open a device collection. Each call has its own snapshot.
    pub fn collection(&self) -> Result<DeviceCollection> {
        DeviceCollection::open(Arc::clone(&self.inner))
    }

    /// Enumerate devices directly from the OS, bypassing any snapshot.
    pub fn devices(&self, dataflow: DataFlow, state_mask: DeviceState) -> Result<Vec<AudioDeviceHandle>> {
        let devices = self.inner.backend.enumerate_devices(dataflow, state_mask)?;
        Ok(devices
            .into_iter()
            .map(|device| AudioDeviceHandle::new(device, Arc::clone(&self.inner)))
            .collect())
    }

    pub fn device(&self, device_id: &str) -> Result<AudioDeviceHandle> {
        match self.inner.backend.get_device(device_id) {
            Ok(device) => Ok(AudioDeviceHandle::new(device, Arc::clone(&self.inner))),
            Err(AudioError::DeviceNotFound { device_id }) => {
                Err(BridgeError::DeviceNotFound { device_id })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current OS default for a (flow, role) pair.
    pub fn default_device(&self, dataflow: DataFlow, role: Role) -> Result<Option<AudioDeviceHandle>> {
        let device = self.inner.backend.get_default_device(dataflow, role)?;
        Ok(device.map(|device| AudioDeviceHandle::new(device, Arc::clone(&self.inner))))
    }

    /// Open a volume stream for a device by id.
    pub fn observe(&self, device_id: &str) -> Result<VolumeEvents> {
        volume::observe(&self.inner, device_id)
    }

    pub fn registrations(&self) -> &RegistrationManager {
        &self.inner.manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioDevice, FakeBackend};

    #[test]
    fn test_invalid_config_rejected() {
        let config = BridgeConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            AudioBridge::new(Arc::new(FakeBackend::new()), config),
            Err(BridgeError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_direct_lookups() {
        let backend = Arc::new(FakeBackend::new());
        backend.add_device(AudioDevice::new("mic1", "Mic", DataFlow::Capture, DeviceState::ACTIVE));
        backend.add_device(AudioDevice::new("spk", "Speakers", DataFlow::Render, DeviceState::DISABLED));
        backend.set_default("mic1", DataFlow::Capture, Role::Communications);
        let bridge = AudioBridge::new(backend, BridgeConfig::default()).unwrap();

        let active = bridge.devices(DataFlow::All, DeviceState::ACTIVE).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name(), "Mic");

        assert_eq!(bridge.device("spk").unwrap().state(), DeviceState::DISABLED);
        assert!(matches!(
            bridge.device("missing"),
            Err(BridgeError::DeviceNotFound { .. })
        ));
        assert_eq!(
            bridge
                .default_device(DataFlow::Capture, Role::Communications)
                .unwrap()
                .map(|d| d.device_id().to_string()),
            Some("mic1".to_string())
        );
        assert!(bridge.default_device(DataFlow::Capture, Role::Console).unwrap().is_none());
    }
}
