//! Audio module: endpoint model and the OS backends.
//!
//! [`AudioBackend`] is the seam the event bridge talks to. The Windows
//! Core Audio implementation lives in the `cfg(windows)` modules;
//! [`FakeBackend`] is an in-memory stand-in available everywhere.

pub mod backend;
pub mod device;
pub mod fake;

#[cfg(windows)]
pub mod enumerator;
#[cfg(windows)]
pub mod notifications;
#[cfg(windows)]
pub mod policy;
#[cfg(windows)]
pub mod volume;
#[cfg(windows)]
pub mod wasapi;

pub use backend::{AudioBackend, NativeEvent, NativeHandle, NotificationCallback, Scope};
pub use device::{
    AudioDevice, AudioError, DataFlow, DeviceCollectionEvent, DeviceCollectionEventType,
    DeviceState, EndpointVolume, OsError, Role, VolumeChangeEvent,
};
#[cfg(windows)]
pub use enumerator::DeviceEnumerator;
pub use fake::FakeBackend;
#[cfg(windows)]
pub use wasapi::WasapiBackend;
