//! Audio endpoint data models.
//!
//! Defines the value types shared by every layer: endpoint identity,
//! data-flow direction, default-device roles, state flags, the events the
//! OS raises and the errors OS calls can produce.

use std::fmt;

use bitflags::bitflags;
use thiserror::Error;

/// Direction of audio data for an endpoint (maps to Windows `EDataFlow`).
///
/// `All` is only ever used as a filter wildcard; no device reports it as its
/// own flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum DataFlow {
    /// Playback endpoints (speakers, headphones)
    Render = 0,

    /// Recording endpoints (microphones, line-in)
    Capture = 1,

    /// Wildcard matching both directions
    All = 2,
}

impl DataFlow {
    /// True if a device with flow `other` passes a filter on `self`.
    pub fn matches(self, other: DataFlow) -> bool {
        self == DataFlow::All || self == other
    }

    /// Convert from the raw `EDataFlow` value.
    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(DataFlow::Render),
            1 => Some(DataFlow::Capture),
            2 => Some(DataFlow::All),
            _ => None,
        }
    }
}

/// Audio device role (maps to Windows `ERole`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Role {
    /// Used by games, system sounds, most general applications
    Console = 0,

    /// Used by music players, video players
    Multimedia = 1,

    /// Used by Teams, Zoom, Discord, and other VoIP applications
    Communications = 2,
}

impl Role {
    /// Every role, in OS numbering order.
    pub const ALL: [Role; 3] = [Role::Console, Role::Multimedia, Role::Communications];

    /// Convert from the raw `ERole` value.
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Role::Console),
            1 => Some(Role::Multimedia),
            2 => Some(Role::Communications),
            _ => None,
        }
    }
}

bitflags! {
    /// Windows device state flags.
    ///
    /// The OS reports a single state per endpoint, but the value is a flag set
    /// and the same type doubles as the state mask for enumeration and filtering.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceState: u32 {
        /// Device is active and available for use
        const ACTIVE = 0x1;

        /// Device is disabled in Windows Sound settings
        const DISABLED = 0x2;

        /// Device is not present (driver issue)
        const NOT_PRESENT = 0x4;

        /// Device is unplugged (for pluggable devices)
        const UNPLUGGED = 0x8;

        /// Mask matching every state
        const ALL = Self::ACTIVE.bits()
            | Self::DISABLED.bits()
            | Self::NOT_PRESENT.bits()
            | Self::UNPLUGGED.bits();
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        bitflags::parser::to_writer(self, f)
    }
}

/// An audio endpoint as reported by the OS.
///
/// This is an identity snapshot: volume and mute are delivered through
/// events, and a handle never turns into a live mirror of the device.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioDevice {
    /// Unique Windows device ID (opaque string from IMMDevice::GetId)
    pub device_id: String,

    /// Human-readable device name (from device properties)
    pub name: String,

    /// Render or capture, never `All`
    pub dataflow: DataFlow,

    /// State at the time the snapshot was taken
    pub state: DeviceState,
}

impl AudioDevice {
    pub fn new(
        device_id: impl Into<String>,
        name: impl Into<String>,
        dataflow: DataFlow,
        state: DeviceState,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            name: name.into(),
            dataflow,
            state,
        }
    }

    /// True if the device passes a `(dataflow, state_mask)` filter.
    pub fn matches(&self, dataflow: DataFlow, state_mask: DeviceState) -> bool {
        dataflow.matches(self.dataflow) && state_mask.intersects(self.state)
    }
}

/// Master volume, mute and per-channel levels of one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointVolume {
    /// Master volume scalar (0.0 to 1.0)
    pub volume: f32,

    pub mute: bool,

    /// One scalar per channel, in channel order
    pub channel_volumes: Vec<f32>,
}

/// Volume or mute state changed on a device.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeChangeEvent {
    pub device: String,
    pub volume: f32,
    pub mute: bool,
    pub channel_volumes: Vec<f32>,
}

/// Kind of a [`DeviceCollectionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCollectionEventType {
    Added,
    Removed,
    StateChanged,
    DefaultChanged,
}

/// Changes to the set of endpoints known to the OS.
///
/// Each variant carries only the fields its kind defines; the accessors
/// return `None` for fields a kind does not have.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCollectionEvent {
    /// A new audio device was connected
    Added { device_id: String },

    /// An audio device was disconnected
    Removed { device_id: String },

    /// Device state changed (active, disabled, not present, unplugged)
    StateChanged {
        device_id: String,
        state: DeviceState,
    },

    /// Default device changed for a (dataflow, role) pair
    DefaultChanged {
        device_id: Option<String>, // None if no default device
        dataflow: DataFlow,
        role: Role,
    },
}

impl DeviceCollectionEvent {
    pub fn kind(&self) -> DeviceCollectionEventType {
        match self {
            DeviceCollectionEvent::Added { .. } => DeviceCollectionEventType::Added,
            DeviceCollectionEvent::Removed { .. } => DeviceCollectionEventType::Removed,
            DeviceCollectionEvent::StateChanged { .. } => DeviceCollectionEventType::StateChanged,
            DeviceCollectionEvent::DefaultChanged { .. } => DeviceCollectionEventType::DefaultChanged,
        }
    }

    /// The device the event refers to. `None` only for a default change to
    /// "no device".
    pub fn device_id(&self) -> Option<&str> {
        match self {
            DeviceCollectionEvent::Added { device_id }
            | DeviceCollectionEvent::Removed { device_id }
            | DeviceCollectionEvent::StateChanged { device_id, .. } => Some(device_id),
            DeviceCollectionEvent::DefaultChanged { device_id, .. } => device_id.as_deref(),
        }
    }

    pub fn dataflow(&self) -> Option<DataFlow> {
        match self {
            DeviceCollectionEvent::DefaultChanged { dataflow, .. } => Some(*dataflow),
            _ => None,
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            DeviceCollectionEvent::DefaultChanged { role, .. } => Some(*role),
            _ => None,
        }
    }

    pub fn state(&self) -> Option<DeviceState> {
        match self {
            DeviceCollectionEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        }
    }
}

/// Failure reported by an OS call, detached from the `windows` crate so the
/// type exists on every platform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (HRESULT {code:#010x})")]
pub struct OsError {
    pub code: i32,
    pub message: String,
}

impl OsError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for OsError {
    fn from(err: windows::core::Error) -> Self {
        Self {
            code: err.code().0,
            message: err.message(),
        }
    }
}

/// Audio service error types.
#[derive(Debug, Clone, Error)]
pub enum AudioError {
    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("COM initialization failed: {0}")]
    ComInitFailed(#[source] OsError),

    #[error("Failed to enumerate devices: {0}")]
    EnumerationFailed(#[source] OsError),

    #[error("Failed to set default device: {0}")]
    SetDefaultFailed(#[source] OsError),

    #[error("Failed to register notification sink: {0}")]
    NotificationFailed(#[source] OsError),

    #[error("Unknown notification handle: {0}")]
    UnknownHandle(u64),

    #[error("Volume control not available for device")]
    VolumeNotAvailable,

    #[error("Windows API error: {0}")]
    WindowsError(#[source] OsError),

    #[error("String conversion error: {0}")]
    StringConversion(String),

    #[error("Audio endpoints are not available on this platform")]
    Unsupported,
}
