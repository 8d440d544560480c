use thiserror::Error;

use crate::audio::{AudioError, Scope};

/// Errors raised by the event bridge.
///
/// Stream-level anomalies (overflow, channel layout changes, termination)
/// are not errors; they travel inside the stream as markers or as the end of
/// the sequence.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// The OS refused to register a notification sink
    #[error("Failed to register notification sink for {scope}: {reason}")]
    RegistrationFailed { scope: Scope, reason: String },

    /// Two consumers tried to advance the same stream at once
    #[error("Event stream is already being consumed by another task")]
    ConcurrentConsumption,

    /// A registration handle was released twice
    #[error("Registration for {scope} was already released")]
    AlreadyUnregistered { scope: Scope },

    /// The device was removed and the OS call on it failed
    #[error("Device {device_id} has been removed")]
    StaleDeviceReference { device_id: String },

    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    /// A notification arrived for a scope that is not registered, or did not
    /// belong to the scope it arrived on
    #[error("Protocol violation on {scope}: {detail}")]
    ProtocolViolation { scope: Scope, detail: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error(transparent)]
    Backend(#[from] AudioError),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
