//! Boundary between the event bridge and the OS audio stack.
//!
//! Everything the bridge needs from Windows goes through [`AudioBackend`]:
//! enumeration, default lookup, notification sink registration and the
//! volume/mute/default mutations. `WasapiBackend` implements it on Windows
//! and `FakeBackend` implements it in memory.

use std::fmt;
use std::sync::Arc;

use super::device::{
    AudioDevice, AudioError, DataFlow, DeviceCollectionEvent, DeviceState, EndpointVolume, Role,
    VolumeChangeEvent,
};
use crate::bridge::BridgeError;

/// Unit of OS notification registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Device added/removed/state/default changes for every endpoint
    GlobalCollection,

    /// Volume and mute changes of one endpoint
    DeviceVolume(String),
}

impl Scope {
    /// Device the scope is bound to, if any.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Scope::GlobalCollection => None,
            Scope::DeviceVolume(id) => Some(id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::GlobalCollection => f.write_str("collection"),
            Scope::DeviceVolume(id) => write!(f, "volume:{}", id),
        }
    }
}

/// Opaque token for one OS-level sink registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

/// A notification as raised by the OS, already converted to crate types.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeEvent {
    Collection(DeviceCollectionEvent),
    Volume(VolumeChangeEvent),
}

/// Callback a backend invokes from its notification threads.
///
/// It may be called from any thread, concurrently, and must not block for
/// longer than the channel push timeout.
pub type NotificationCallback = Arc<dyn Fn(NativeEvent) -> Result<(), BridgeError> + Send + Sync>;

/// OS audio primitives consumed by the bridge.
pub trait AudioBackend: Send + Sync {
    /// Enumerate endpoints matching a flow and state mask.
    fn enumerate_devices(
        &self,
        dataflow: DataFlow,
        state_mask: DeviceState,
    ) -> Result<Vec<AudioDevice>, AudioError>;

    /// Look up a single endpoint by ID, whatever its state.
    fn get_device(&self, device_id: &str) -> Result<AudioDevice, AudioError>;

    /// Current default endpoint for a (flow, role) pair, `None` if there is none.
    fn get_default_device(
        &self,
        dataflow: DataFlow,
        role: Role,
    ) -> Result<Option<AudioDevice>, AudioError>;

    /// Register an OS notification sink for `scope`.
    fn register_notification_sink(
        &self,
        scope: &Scope,
        callback: NotificationCallback,
    ) -> Result<NativeHandle, AudioError>;

    /// Remove a sink created by [`register_notification_sink`](Self::register_notification_sink).
    fn unregister_notification_sink(&self, handle: NativeHandle) -> Result<(), AudioError>;

    fn get_endpoint_volume(&self, device_id: &str) -> Result<EndpointVolume, AudioError>;

    fn set_endpoint_mute(&self, device_id: &str, mute: bool) -> Result<(), AudioError>;

    /// Set the master volume scalar (clamped to 0.0..=1.0).
    fn set_endpoint_volume(&self, device_id: &str, volume: f32) -> Result<(), AudioError>;

    fn set_default_device(&self, device_id: &str, role: Role) -> Result<(), AudioError>;
}
