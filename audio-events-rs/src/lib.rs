//! Windows Audio Events - Library
//!
//! Audio endpoint enumeration, default-device control and live change
//! notification, exposed as ordered, cancellable async streams.
//!
//! ## Features
//!
//! - Consistent snapshot of all endpoints with filtered views
//! - Stream of device added/removed/state/default changes
//! - Per-device volume and mute streams
//! - Mute, volume and default-device control
//! - One OS registration per scope, shared by reference count
//!
//! ## Example
//!
//! ```rust,ignore
//! let bridge = AudioBridge::windows(BridgeConfig::default())?;
//! let collection = bridge.collection()?;
//! let events = collection.events()?;
//! while let Some(event) = events.next().await? {
//!     println!("{:?}", event);
//! }
//! ```

pub mod audio;
pub mod bridge;
pub mod config;
pub mod logging;

pub use audio::{
    AudioBackend, AudioDevice, AudioError, DataFlow, DeviceCollectionEvent,
    DeviceCollectionEventType, DeviceState, EndpointVolume, FakeBackend, Role, Scope,
    VolumeChangeEvent,
};
#[cfg(windows)]
pub use audio::WasapiBackend;
pub use bridge::{
    AudioBridge, AudioDeviceHandle, BridgeError, CollectionEvents, DeviceCollection,
    FilteredView, Notification, RegistrationHandle, RegistrationManager, VolumeEvents,
};
pub use config::{BridgeConfig, OverflowPolicy};
