//! FFI bindings for Windows Audio Events.
//!
//! This crate provides C ABI functions for use from C# via P/Invoke.
//! All functions use panic::catch_unwind to prevent Rust panics from
//! unwinding across the FFI boundary.
//!
//! Structured results are returned as JSON strings that the caller frees
//! with `audio_events_free_string`. Event streams are polled with a timeout;
//! a poll that times out returns `{"event": null, "closed": false}`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use audio_events::{
    AudioBackend, AudioBridge, AudioDevice, AudioDeviceHandle, AudioError, BridgeConfig,
    BridgeError, CollectionEvents, DataFlow, DeviceCollection, DeviceCollectionEvent, DeviceState,
    Notification, Role, VolumeChangeEvent, VolumeEvents,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ============================================================================
// Error Handling
// ============================================================================

/// Error codes returned by FFI functions.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    InvalidHandle = -1,
    InvalidArgument = -2,
    DeviceNotFound = -3,
    ComError = -4,
    JsonError = -5,
    VolumeNotAvailable = -6,
    RegistrationFailed = -7,
    StaleDevice = -8,
    ConcurrentConsumption = -9,
    Unsupported = -10,
    Panic = -99,
}

impl From<&AudioError> for ErrorCode {
    fn from(err: &AudioError) -> Self {
        match err {
            AudioError::DeviceNotFound { .. } => ErrorCode::DeviceNotFound,
            AudioError::VolumeNotAvailable => ErrorCode::VolumeNotAvailable,
            AudioError::Unsupported => ErrorCode::Unsupported,
            _ => ErrorCode::ComError,
        }
    }
}

impl From<&BridgeError> for ErrorCode {
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::RegistrationFailed { .. } => ErrorCode::RegistrationFailed,
            BridgeError::ConcurrentConsumption => ErrorCode::ConcurrentConsumption,
            BridgeError::StaleDeviceReference { .. } => ErrorCode::StaleDevice,
            BridgeError::DeviceNotFound { .. } => ErrorCode::DeviceNotFound,
            BridgeError::InvalidConfig { .. } => ErrorCode::InvalidArgument,
            BridgeError::Backend(e) => ErrorCode::from(e),
            BridgeError::AlreadyUnregistered { .. } | BridgeError::ProtocolViolation { .. } => {
                ErrorCode::ComError
            }
        }
    }
}

/// Failure of one FFI call: code plus message for `last_error_message`.
#[derive(Debug)]
struct Failure {
    code: ErrorCode,
    message: String,
}

impl Failure {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<BridgeError> for Failure {
    fn from(err: BridgeError) -> Self {
        Self::new(ErrorCode::from(&err), err.to_string())
    }
}

impl From<serde_json::Error> for Failure {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::JsonError, err.to_string())
    }
}

// Last error, per calling thread
thread_local! {
    static LAST_ERROR: RefCell<Option<(ErrorCode, String)>> = const { RefCell::new(None) };
}

fn set_last_error(code: ErrorCode, message: impl Into<String>) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = Some((code, message.into()));
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

// ============================================================================
// Data Types for JSON Serialization
// ============================================================================

/// Configuration for engine creation.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(flatten)]
    pub bridge: BridgeConfig,
}

/// An audio endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceDto {
    pub id: String,
    pub name: String,
    /// 0 = render, 1 = capture
    pub dataflow: i32,
    /// DEVICE_STATE bits
    pub state: u32,
}

impl From<&AudioDevice> for DeviceDto {
    fn from(device: &AudioDevice) -> Self {
        Self {
            id: device.device_id.clone(),
            name: device.name.clone(),
            dataflow: device.dataflow as i32,
            state: device.state.bits(),
        }
    }
}

/// Response containing a list of devices.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceDto>,
}

/// Response for a default-device lookup; `device` is null if there is none.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceResponse {
    pub device: Option<DeviceDto>,
}

/// Response containing operation result.
#[derive(Debug, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
}

/// A collection change or stream marker.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollectionEventDto {
    Added {
        device_id: String,
    },
    Removed {
        device_id: String,
    },
    StateChanged {
        device_id: String,
        state: u32,
    },
    DefaultChanged {
        device_id: Option<String>,
        dataflow: i32,
        role: u32,
    },
    Overflow {
        dropped: usize,
    },
}

impl From<Notification<DeviceCollectionEvent>> for CollectionEventDto {
    fn from(item: Notification<DeviceCollectionEvent>) -> Self {
        match item {
            Notification::Event(DeviceCollectionEvent::Added { device_id }) => {
                Self::Added { device_id }
            }
            Notification::Event(DeviceCollectionEvent::Removed { device_id }) => {
                Self::Removed { device_id }
            }
            Notification::Event(DeviceCollectionEvent::StateChanged { device_id, state }) => {
                Self::StateChanged {
                    device_id,
                    state: state.bits(),
                }
            }
            Notification::Event(DeviceCollectionEvent::DefaultChanged {
                device_id,
                dataflow,
                role,
            }) => Self::DefaultChanged {
                device_id,
                dataflow: dataflow as i32,
                role: role as u32,
            },
            Notification::Overflow { dropped } => Self::Overflow { dropped },
            // Collection streams carry no layout markers.
            Notification::ChannelLayoutChanged { .. } => Self::Overflow { dropped: 0 },
        }
    }
}

/// A volume change or stream marker.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumeEventDto {
    Volume {
        device_id: String,
        volume: f32,
        mute: bool,
        channel_volumes: Vec<f32>,
    },
    Overflow {
        dropped: usize,
    },
    ChannelLayoutChanged {
        expected: usize,
        actual: usize,
    },
}

impl From<Notification<VolumeChangeEvent>> for VolumeEventDto {
    fn from(item: Notification<VolumeChangeEvent>) -> Self {
        match item {
            Notification::Event(event) => Self::Volume {
                device_id: event.device,
                volume: event.volume,
                mute: event.mute,
                channel_volumes: event.channel_volumes,
            },
            Notification::Overflow { dropped } => Self::Overflow { dropped },
            Notification::ChannelLayoutChanged { expected, actual } => {
                Self::ChannelLayoutChanged { expected, actual }
            }
        }
    }
}

/// Result of polling a stream.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventPoll<T> {
    pub event: Option<T>,
    /// True once the stream has ended; no further events will arrive
    pub closed: bool,
}

// ============================================================================
// Engine Handle Type
// ============================================================================

/// Opaque handle to the engine. Actually points to an Engine struct.
pub type AudioEventsHandle = *mut c_void;

/// Internal engine state.
struct Engine {
    bridge: AudioBridge,
    collection: DeviceCollection,
    events: CollectionEvents,
    volume_streams: Mutex<HashMap<u64, Arc<VolumeEvents>>>,
    next_stream_id: AtomicU64,

    /// Every device the host has addressed, so later calls on a removed one
    /// report it stale instead of unknown
    devices: Mutex<HashMap<String, AudioDeviceHandle>>,
}

impl Engine {
    fn with_backend(backend: Arc<dyn AudioBackend>, config: BridgeConfig) -> Result<Self, BridgeError> {
        let bridge = AudioBridge::new(backend, config)?;
        let collection = bridge.collection()?;
        let events = collection.events()?;
        Ok(Self {
            bridge,
            collection,
            events,
            volume_streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(1),
            devices: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(windows)]
    fn platform(config: BridgeConfig) -> Result<Self, Failure> {
        let backend = audio_events::WasapiBackend::new().map_err(BridgeError::from)?;
        Ok(Self::with_backend(Arc::new(backend), config)?)
    }

    #[cfg(not(windows))]
    fn platform(_config: BridgeConfig) -> Result<Self, Failure> {
        Err(Failure::from(BridgeError::from(AudioError::Unsupported)))
    }

    /// Device from the snapshot, falling back to a direct OS lookup.
    fn device(&self, device_id: &str) -> Result<AudioDeviceHandle, BridgeError> {
        let found = self
            .collection
            .get(device_id)
            .or_else(|_| self.bridge.device(device_id));

        let mut devices = self.devices.lock();
        match found {
            Ok(handle) => {
                devices.insert(device_id.to_string(), handle.clone());
                Ok(handle)
            }
            Err(e) => match devices.get(device_id) {
                Some(known) if known.is_removed() => {
                    debug!(device_id = %device_id, "Call on a removed device");
                    Err(BridgeError::StaleDeviceReference {
                        device_id: device_id.to_string(),
                    })
                }
                _ => Err(e),
            },
        }
    }

    fn volume_stream(&self, stream_id: u64) -> Result<Arc<VolumeEvents>, Failure> {
        self.volume_streams
            .lock()
            .get(&stream_id)
            .cloned()
            .ok_or_else(|| Failure::new(ErrorCode::InvalidArgument, "Unknown volume stream"))
    }

    fn close(&self) {
        self.events.close();
        self.collection.close();
        for (_, stream) in self.volume_streams.lock().drain() {
            stream.close();
        }
    }
}

fn into_handle(engine: Engine) -> AudioEventsHandle {
    Box::into_raw(Box::new(engine)) as AudioEventsHandle
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Allocate a C string from a Rust string. Caller must free with audio_events_free_string.
fn alloc_c_string(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        // String contained a null byte
        Err(_) => CString::default().into_raw(),
    }
}

/// Parse a C string to a Rust string slice.
unsafe fn parse_c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

fn arg<'a>(ptr: *const c_char, name: &str) -> Result<&'a str, Failure> {
    unsafe { parse_c_str(ptr) }
        .ok_or_else(|| Failure::new(ErrorCode::InvalidArgument, format!("Invalid {}", name)))
}

fn engine<'a>(handle: AudioEventsHandle) -> Result<&'a Engine, Failure> {
    if handle.is_null() {
        return Err(Failure::new(ErrorCode::InvalidHandle, "Null engine handle"));
    }
    Ok(unsafe { &*(handle as *const Engine) })
}

fn parse_dataflow(value: i32) -> Result<DataFlow, Failure> {
    DataFlow::from_raw(value)
        .ok_or_else(|| Failure::new(ErrorCode::InvalidArgument, "Invalid dataflow"))
}

fn parse_role(value: u32) -> Result<Role, Failure> {
    Role::from_raw(value).ok_or_else(|| Failure::new(ErrorCode::InvalidArgument, "Invalid role"))
}

/// Run `f` against the engine and return its result as a JSON string.
/// Returns null on failure, with the last error set.
fn ffi_json<T, F>(handle: AudioEventsHandle, what: &str, f: F) -> *mut c_char
where
    T: Serialize,
    F: FnOnce(&Engine) -> Result<T, Failure>,
{
    clear_last_error();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let value = f(engine(handle)?)?;
        Ok::<_, Failure>(serde_json::to_string(&value)?)
    }));

    match result {
        Ok(Ok(json)) => alloc_c_string(&json),
        Ok(Err(failure)) => {
            debug!(operation = what, error = %failure.message, "FFI call failed");
            set_last_error(failure.code, failure.message);
            ptr::null_mut()
        }
        Err(_) => {
            set_last_error(ErrorCode::Panic, format!("Panic during {}", what));
            ptr::null_mut()
        }
    }
}

/// Run `f` against the engine and return an error code.
fn ffi_code<F>(handle: AudioEventsHandle, what: &str, f: F) -> i32
where
    F: FnOnce(&Engine) -> Result<(), Failure>,
{
    clear_last_error();

    let result = panic::catch_unwind(AssertUnwindSafe(|| f(engine(handle)?)));

    match result {
        Ok(Ok(())) => ErrorCode::Success as i32,
        Ok(Err(failure)) => {
            debug!(operation = what, error = %failure.message, "FFI call failed");
            let code = failure.code;
            set_last_error(code, failure.message);
            code as i32
        }
        Err(_) => {
            set_last_error(ErrorCode::Panic, format!("Panic during {}", what));
            ErrorCode::Panic as i32
        }
    }
}

// ============================================================================
// FFI Functions - Lifecycle
// ============================================================================

/// Create a new engine instance.
///
/// # Arguments
/// * `config_json` - JSON configuration string (can be null for defaults)
///
/// # Returns
/// Handle to the engine, or null on failure. Check audio_events_last_error_code() on failure.
///
/// # Safety
/// The returned handle must be freed with audio_events_destroy().
#[no_mangle]
pub extern "C" fn audio_events_create(config_json: *const c_char) -> AudioEventsHandle {
    clear_last_error();

    let result = panic::catch_unwind(|| {
        let config = match unsafe { parse_c_str(config_json) } {
            Some(json) => serde_json::from_str::<EngineConfig>(json)?,
            None => EngineConfig::default(),
        };

        if let Some(level) = &config.bridge.log_level {
            if !audio_events::logging::is_initialized() {
                let _ = audio_events::logging::init_with_level(level);
            }
        }

        let engine = Engine::platform(config.bridge)?;
        info!("Engine created");
        Ok::<_, Failure>(into_handle(engine))
    });

    match result {
        Ok(Ok(handle)) => handle,
        Ok(Err(failure)) => {
            set_last_error(failure.code, failure.message);
            ptr::null_mut()
        }
        Err(_) => {
            set_last_error(ErrorCode::Panic, "Panic during engine creation");
            ptr::null_mut()
        }
    }
}

/// Destroy an engine instance, closing every stream it owns.
///
/// # Safety
/// The handle must have been created by audio_events_create() and must not be used after this call.
#[no_mangle]
pub extern "C" fn audio_events_destroy(handle: AudioEventsHandle) {
    if handle.is_null() {
        return;
    }

    let _ = panic::catch_unwind(|| {
        let engine = unsafe { Box::from_raw(handle as *mut Engine) };
        engine.close();
    });
}

/// Stop all notifications without destroying the engine.
///
/// Pending and later event polls report `closed`. Idempotent.
#[no_mangle]
pub extern "C" fn audio_events_close(handle: AudioEventsHandle) -> i32 {
    ffi_code(handle, "close", |engine| {
        engine.close();
        Ok(())
    })
}

// ============================================================================
// FFI Functions - Device Operations
// ============================================================================

/// Get devices from the snapshot.
///
/// # Arguments
/// * `handle` - Engine handle
/// * `dataflow` - 0 = render, 1 = capture, 2 = all
/// * `state_mask` - DEVICE_STATE bits (1 active, 2 disabled, 4 not present, 8 unplugged)
///
/// # Returns
/// JSON string containing the device list. Caller must free with audio_events_free_string().
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn audio_events_get_devices(
    handle: AudioEventsHandle,
    dataflow: i32,
    state_mask: u32,
) -> *mut c_char {
    ffi_json(handle, "device enumeration", |engine| {
        let view = engine
            .collection
            .filter(parse_dataflow(dataflow)?, DeviceState::from_bits_truncate(state_mask));
        Ok(DeviceListResponse {
            devices: view.iter().map(DeviceDto::from).collect(),
        })
    })
}

/// Get the default device for a (dataflow, role) pair.
///
/// # Returns
/// JSON `{"device": ...}` with a null device if there is no default.
#[no_mangle]
pub extern "C" fn audio_events_get_default_device(
    handle: AudioEventsHandle,
    dataflow: i32,
    role: u32,
) -> *mut c_char {
    ffi_json(handle, "default device lookup", |engine| {
        let device = engine
            .collection
            .default_device(parse_dataflow(dataflow)?, parse_role(role)?);
        Ok(DeviceResponse {
            device: device.as_ref().map(|d| DeviceDto::from(d.device())),
        })
    })
}

/// Set a device as the default for a specific role.
///
/// # Arguments
/// * `role` - 0 = Console, 1 = Multimedia, 2 = Communications
///
/// # Returns
/// 0 on success, negative error code on failure.
#[no_mangle]
pub extern "C" fn audio_events_set_default_device(
    handle: AudioEventsHandle,
    device_id: *const c_char,
    role: u32,
) -> i32 {
    ffi_code(handle, "set default device", |engine| {
        let role = parse_role(role)?;
        engine.device(arg(device_id, "device ID")?)?.set_default(role)?;
        Ok(())
    })
}

/// Toggle the mute state of a device.
///
/// # Returns
/// JSON string with the result (includes new mute state). Caller must free with audio_events_free_string().
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn audio_events_toggle_mute(
    handle: AudioEventsHandle,
    device_id: *const c_char,
) -> *mut c_char {
    ffi_json(handle, "toggle mute", |engine| {
        let muted = engine.device(arg(device_id, "device ID")?)?.toggle_mute()?;
        Ok(OperationResult {
            success: true,
            error: None,
            is_muted: Some(muted),
        })
    })
}

/// Set the mute state of a device.
///
/// # Arguments
/// * `muted` - 1 = muted, 0 = unmuted
#[no_mangle]
pub extern "C" fn audio_events_set_mute(
    handle: AudioEventsHandle,
    device_id: *const c_char,
    muted: i32,
) -> i32 {
    ffi_code(handle, "set mute", |engine| {
        engine.device(arg(device_id, "device ID")?)?.set_mute(muted != 0)?;
        Ok(())
    })
}

/// Set the volume level for a device (0.0 to 1.0).
#[no_mangle]
pub extern "C" fn audio_events_set_volume(
    handle: AudioEventsHandle,
    device_id: *const c_char,
    volume: f32,
) -> i32 {
    ffi_code(handle, "set volume", |engine| {
        engine.device(arg(device_id, "device ID")?)?.set_volume(volume)?;
        Ok(())
    })
}

// ============================================================================
// FFI Functions - Event Streams
// ============================================================================

/// Wait up to `timeout_ms` for the next collection change.
///
/// # Returns
/// JSON `EventPoll`. Returns null on failure; a second thread polling the
/// same engine concurrently fails with ConcurrentConsumption.
#[no_mangle]
pub extern "C" fn audio_events_next_collection_event(
    handle: AudioEventsHandle,
    timeout_ms: u32,
) -> *mut c_char {
    ffi_json(handle, "collection event poll", |engine| {
        let item = engine
            .events
            .next_timeout(Duration::from_millis(timeout_ms as u64))?;
        Ok(EventPoll {
            event: item.map(CollectionEventDto::from),
            closed: engine.events.is_closed(),
        })
    })
}

/// Start observing a device's volume.
///
/// # Returns
/// A positive stream ID, or a negative error code.
#[no_mangle]
pub extern "C" fn audio_events_observe_volume(
    handle: AudioEventsHandle,
    device_id: *const c_char,
) -> i64 {
    let mut stream_id = 0;
    let code = ffi_code(handle, "observe volume", |engine| {
        let events = engine.device(arg(device_id, "device ID")?)?.observe_volume()?;
        let id = engine.next_stream_id.fetch_add(1, Ordering::Relaxed);
        engine.volume_streams.lock().insert(id, Arc::new(events));
        stream_id = id;
        Ok(())
    });

    if code == ErrorCode::Success as i32 {
        stream_id as i64
    } else {
        code as i64
    }
}

/// Wait up to `timeout_ms` for the next volume change on a stream.
#[no_mangle]
pub extern "C" fn audio_events_next_volume_event(
    handle: AudioEventsHandle,
    stream_id: u64,
    timeout_ms: u32,
) -> *mut c_char {
    ffi_json(handle, "volume event poll", |engine| {
        let stream = engine.volume_stream(stream_id)?;
        let item = stream.next_timeout(Duration::from_millis(timeout_ms as u64))?;
        Ok(EventPoll {
            event: item.map(VolumeEventDto::from),
            closed: stream.is_closed(),
        })
    })
}

/// Close a volume stream and release its registration.
#[no_mangle]
pub extern "C" fn audio_events_close_volume(handle: AudioEventsHandle, stream_id: u64) -> i32 {
    ffi_code(handle, "close volume stream", |engine| {
        let stream = engine.volume_streams.lock().remove(&stream_id).ok_or_else(|| {
            Failure::new(ErrorCode::InvalidArgument, "Unknown volume stream")
        })?;
        stream.close();
        Ok(())
    })
}

// ============================================================================
// FFI Functions - Memory Management
// ============================================================================

/// Free a string allocated by this library.
///
/// # Safety
/// The pointer must have been returned by one of the audio_events_* functions.
/// Do not call this on strings from other sources.
#[no_mangle]
pub extern "C" fn audio_events_free_string(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }

    let _ = panic::catch_unwind(|| unsafe {
        let _ = CString::from_raw(ptr);
    });
}

// ============================================================================
// FFI Functions - Error Handling
// ============================================================================

/// Get the last error code.
///
/// # Returns
/// The error code from the last failed operation, or 0 if no error.
#[no_mangle]
pub extern "C" fn audio_events_last_error_code() -> i32 {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|(code, _)| *code as i32)
            .unwrap_or(0)
    })
}

/// Get the last error message.
///
/// # Returns
/// Error message string. Caller must free with audio_events_free_string().
/// Returns null if no error.
#[no_mangle]
pub extern "C" fn audio_events_last_error_message() -> *mut c_char {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|(_, msg)| alloc_c_string(msg))
            .unwrap_or(ptr::null_mut())
    })
}

// ============================================================================
// FFI Functions - Utility
// ============================================================================

/// Get the library version.
///
/// # Returns
/// Version string. Caller must free with audio_events_free_string().
#[no_mangle]
pub extern "C" fn audio_events_version() -> *mut c_char {
    alloc_c_string(env!("CARGO_PKG_VERSION"))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use audio_events::{EndpointVolume, FakeBackend};

    fn take_json(ptr: *mut c_char) -> serde_json::Value {
        assert!(!ptr.is_null(), "call failed: code {}", audio_events_last_error_code());
        let value = unsafe { serde_json::from_str(CStr::from_ptr(ptr).to_str().unwrap()).unwrap() };
        audio_events_free_string(ptr);
        value
    }

    fn fake_engine() -> (Arc<FakeBackend>, AudioEventsHandle) {
        let backend = Arc::new(FakeBackend::new());
        backend.add_device(AudioDevice::new(
            "mic1",
            "Microphone",
            DataFlow::Capture,
            DeviceState::ACTIVE,
        ));
        backend.add_device(AudioDevice::new(
            "spk",
            "Speakers",
            DataFlow::Render,
            DeviceState::ACTIVE,
        ));
        backend.set_default("spk", DataFlow::Render, Role::Console);
        backend.set_volume_state(
            "spk",
            EndpointVolume {
                volume: 0.5,
                mute: false,
                channel_volumes: vec![0.5, 0.5],
            },
        );
        let engine = Engine::with_backend(backend.clone(), BridgeConfig::default()).unwrap();
        (backend, into_handle(engine))
    }

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(
            ErrorCode::from(&BridgeError::from(AudioError::DeviceNotFound {
                device_id: "test".to_string()
            })),
            ErrorCode::DeviceNotFound
        );
        assert_eq!(
            ErrorCode::from(&BridgeError::StaleDeviceReference {
                device_id: "test".to_string()
            }),
            ErrorCode::StaleDevice
        );
    }

    #[test]
    fn test_null_handle_is_rejected() {
        assert!(audio_events_get_devices(ptr::null_mut(), 2, 0xF).is_null());
        assert_eq!(audio_events_last_error_code(), ErrorCode::InvalidHandle as i32);
    }

    #[cfg(not(windows))]
    #[test]
    fn test_create_unsupported_off_windows() {
        let handle = audio_events_create(ptr::null());
        assert!(handle.is_null());
        assert_eq!(audio_events_last_error_code(), ErrorCode::Unsupported as i32);
    }

    #[test]
    fn test_create_rejects_bad_config() {
        let config = CString::new("{not json").unwrap();
        assert!(audio_events_create(config.as_ptr()).is_null());
        assert_eq!(audio_events_last_error_code(), ErrorCode::JsonError as i32);
    }

    #[test]
    fn test_devices_and_defaults() {
        let (_backend, handle) = fake_engine();

        let all = take_json(audio_events_get_devices(handle, 2, 0xF));
        assert_eq!(all["devices"].as_array().unwrap().len(), 2);

        let capture = take_json(audio_events_get_devices(handle, 1, 1));
        assert_eq!(capture["devices"][0]["id"], "mic1");

        let default = take_json(audio_events_get_default_device(handle, 0, 0));
        assert_eq!(default["device"]["id"], "spk");
        let none = take_json(audio_events_get_default_device(handle, 1, 0));
        assert!(none["device"].is_null());

        assert!(audio_events_get_devices(handle, 7, 1).is_null());
        assert_eq!(audio_events_last_error_code(), ErrorCode::InvalidArgument as i32);

        audio_events_destroy(handle);
    }

    #[test]
    fn test_collection_event_poll() {
        let (backend, handle) = fake_engine();

        let idle = take_json(audio_events_next_collection_event(handle, 10));
        assert!(idle["event"].is_null());
        assert_eq!(idle["closed"], false);

        backend.set_device_state("mic1", DeviceState::DISABLED);
        let polled = take_json(audio_events_next_collection_event(handle, 1000));
        assert_eq!(polled["event"]["kind"], "state_changed");
        assert_eq!(polled["event"]["device_id"], "mic1");
        assert_eq!(polled["event"]["state"], 2);

        assert_eq!(audio_events_close(handle), 0);
        let closed = take_json(audio_events_next_collection_event(handle, 10));
        assert_eq!(closed["closed"], true);

        audio_events_destroy(handle);
    }

    #[test]
    fn test_volume_stream_round_trip() {
        let (_backend, handle) = fake_engine();
        let device_id = CString::new("spk").unwrap();

        let stream_id = audio_events_observe_volume(handle, device_id.as_ptr());
        assert!(stream_id > 0);

        let toggled = take_json(audio_events_toggle_mute(handle, device_id.as_ptr()));
        assert_eq!(toggled["is_muted"], true);

        let polled = take_json(audio_events_next_volume_event(handle, stream_id as u64, 1000));
        assert_eq!(polled["event"]["kind"], "volume");
        assert_eq!(polled["event"]["mute"], true);

        assert_eq!(audio_events_close_volume(handle, stream_id as u64), 0);
        assert_eq!(
            audio_events_close_volume(handle, stream_id as u64),
            ErrorCode::InvalidArgument as i32
        );

        audio_events_destroy(handle);
    }

    #[test]
    fn test_operations_on_removed_device() {
        let (backend, handle) = fake_engine();
        let device_id = CString::new("mic1").unwrap();
        let stream_id = audio_events_observe_volume(handle, device_id.as_ptr());
        assert!(stream_id > 0);

        backend.remove_device("mic1");

        let polled = take_json(audio_events_next_volume_event(handle, stream_id as u64, 1000));
        assert!(polled["event"].is_null());
        assert_eq!(polled["closed"], true);

        assert_eq!(
            audio_events_set_mute(handle, device_id.as_ptr(), 1),
            ErrorCode::StaleDevice as i32
        );
        assert_eq!(audio_events_last_error_code(), ErrorCode::StaleDevice as i32);
        assert!(audio_events_toggle_mute(handle, device_id.as_ptr()).is_null());
        assert_eq!(audio_events_last_error_code(), ErrorCode::StaleDevice as i32);

        // An id the host never used is still simply unknown.
        let ghost = CString::new("ghost").unwrap();
        assert_eq!(
            audio_events_set_mute(handle, ghost.as_ptr(), 1),
            ErrorCode::DeviceNotFound as i32
        );

        // Plugging the device back in makes it usable again.
        backend.add_device(AudioDevice::new(
            "mic1",
            "Microphone",
            DataFlow::Capture,
            DeviceState::ACTIVE,
        ));
        assert_eq!(
            audio_events_set_mute(handle, device_id.as_ptr(), 1),
            ErrorCode::Success as i32
        );

        audio_events_destroy(handle);
    }

    #[test]
    fn test_version() {
        let version = audio_events_version();
        assert!(!version.is_null());
        unsafe {
            let s = CStr::from_ptr(version).to_str().unwrap();
            assert!(!s.is_empty());
        }
        audio_events_free_string(version);
    }
}
