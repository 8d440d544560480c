//! Device enumeration using Windows MMDevice API.
//!
//! Provides per-thread COM initialization and endpoint lookup.

use std::cell::RefCell;

use tracing::debug;
use windows::core::{Interface, PCWSTR, PWSTR};
use windows::Win32::Devices::Properties::DEVPKEY_Device_FriendlyName;
use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::Media::Audio::{
    EDataFlow, ERole, IMMDevice, IMMDeviceEnumerator, IMMEndpoint, MMDeviceEnumerator,
    DEVICE_STATE,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CoUninitialize, CLSCTX_ALL,
    COINIT_MULTITHREADED, STGM,
};
use windows::Win32::UI::Shell::PropertiesSystem::{IPropertyStore, PROPERTYKEY};

use super::device::{AudioDevice, AudioError, DataFlow, DeviceState, OsError, Role};

/// Map a `windows` error into an [`AudioError`] variant.
pub(crate) trait OsResultExt<T> {
    fn os_err(self, wrap: fn(OsError) -> AudioError) -> Result<T, AudioError>;
}

impl<T> OsResultExt<T> for windows::core::Result<T> {
    fn os_err(self, wrap: fn(OsError) -> AudioError) -> Result<T, AudioError> {
        self.map_err(|e| wrap(e.into()))
    }
}

/// COM initialization guard that uninitializes COM on drop.
pub struct ComGuard {
    initialized: bool,
}

impl ComGuard {
    /// Join the multithreaded apartment on the current thread.
    ///
    /// A thread that already lives in a single-threaded apartment keeps it;
    /// the endpoint interfaces work from either.
    pub fn new() -> Result<Self, AudioError> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if hr == RPC_E_CHANGED_MODE {
            debug!("Thread already initialized COM in another apartment");
            return Ok(Self { initialized: false });
        }
        hr.ok().os_err(AudioError::ComInitFailed)?;
        Ok(Self { initialized: true })
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.initialized {
            unsafe {
                CoUninitialize();
            }
        }
    }
}

thread_local! {
    static COM: RefCell<Option<ComGuard>> = const { RefCell::new(None) };
}

/// Initialize COM once for the calling thread; released at thread exit.
pub fn ensure_com() -> Result<(), AudioError> {
    COM.with(|com| {
        let mut com = com.borrow_mut();
        if com.is_none() {
            *com = Some(ComGuard::new()?);
        }
        Ok(())
    })
}

pub(crate) fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

pub(crate) fn edataflow(flow: DataFlow) -> EDataFlow {
    EDataFlow(flow as i32)
}

pub(crate) fn erole(role: Role) -> ERole {
    ERole(role as i32)
}

/// Take ownership of a COM-allocated string.
unsafe fn take_pwstr(value: PWSTR) -> Result<String, AudioError> {
    let result = value
        .to_string()
        .map_err(|e| AudioError::StringConversion(e.to_string()));
    CoTaskMemFree(Some(value.0 as *const _));
    result
}

/// Device enumerator using Windows MMDevice API.
pub struct DeviceEnumerator {
    enumerator: IMMDeviceEnumerator,
}

impl DeviceEnumerator {
    /// Create a new DeviceEnumerator.
    ///
    /// Note: COM must be initialized before calling this function.
    pub fn new() -> Result<Self, AudioError> {
        unsafe {
            let enumerator: IMMDeviceEnumerator =
                CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
                    .os_err(AudioError::EnumerationFailed)?;

            Ok(Self { enumerator })
        }
    }

    /// Endpoints of `dataflow` whose state is in `state_mask`.
    pub fn enumerate(
        &self,
        dataflow: DataFlow,
        state_mask: DeviceState,
    ) -> Result<Vec<AudioDevice>, AudioError> {
        unsafe {
            let collection = self
                .enumerator
                .EnumAudioEndpoints(edataflow(dataflow), DEVICE_STATE(state_mask.bits()))
                .os_err(AudioError::EnumerationFailed)?;

            let count = collection
                .GetCount()
                .os_err(AudioError::EnumerationFailed)?;

            let mut devices = Vec::with_capacity(count as usize);
            for i in 0..count {
                let device = collection.Item(i).os_err(AudioError::EnumerationFailed)?;
                match self.describe(&device) {
                    Ok(device) => devices.push(device),
                    Err(e) => debug!(error = %e, "Skipping endpoint that vanished during enumeration"),
                }
            }

            Ok(devices)
        }
    }

    /// Raw device by ID.
    pub fn device(&self, device_id: &str) -> Result<IMMDevice, AudioError> {
        let wide = to_wide(device_id);
        unsafe {
            self.enumerator
                .GetDevice(PCWSTR::from_raw(wide.as_ptr()))
                .map_err(|_| AudioError::DeviceNotFound {
                    device_id: device_id.to_string(),
                })
        }
    }

    /// Get a specific device by ID.
    pub fn get_device(&self, device_id: &str) -> Result<AudioDevice, AudioError> {
        let device = self.device(device_id)?;
        self.describe(&device)
    }

    /// Default endpoint for a (flow, role) pair; `None` if there is none.
    pub fn default_device(
        &self,
        dataflow: DataFlow,
        role: Role,
    ) -> Result<Option<AudioDevice>, AudioError> {
        let device = unsafe {
            match self
                .enumerator
                .GetDefaultAudioEndpoint(edataflow(dataflow), erole(role))
            {
                Ok(d) => d,
                Err(_) => return Ok(None),
            }
        };
        self.describe(&device).map(Some)
    }

    /// Get the raw IMMDeviceEnumerator for notification registration.
    pub fn raw_enumerator(&self) -> &IMMDeviceEnumerator {
        &self.enumerator
    }

    /// Convert an IMMDevice to an AudioDevice.
    fn describe(&self, device: &IMMDevice) -> Result<AudioDevice, AudioError> {
        unsafe {
            let device_id = take_pwstr(device.GetId().os_err(AudioError::EnumerationFailed)?)?;

            let props: IPropertyStore = device
                .OpenPropertyStore(STGM(0))
                .os_err(AudioError::EnumerationFailed)?;
            let name = self
                .get_device_name(&props)
                .unwrap_or_else(|| "Unknown".to_string());

            let endpoint: IMMEndpoint = device.cast().os_err(AudioError::WindowsError)?;
            let flow = endpoint.GetDataFlow().os_err(AudioError::WindowsError)?;
            let dataflow = DataFlow::from_raw(flow.0).unwrap_or(DataFlow::Render);

            let state = device.GetState().os_err(AudioError::WindowsError)?;

            Ok(AudioDevice {
                device_id,
                name,
                dataflow,
                state: DeviceState::from_bits_truncate(state.0),
            })
        }
    }

    /// Get the friendly name of a device from its property store.
    fn get_device_name(&self, props: &IPropertyStore) -> Option<String> {
        unsafe {
            // Convert DEVPROPKEY to PROPERTYKEY
            let key = PROPERTYKEY {
                fmtid: DEVPKEY_Device_FriendlyName.fmtid,
                pid: DEVPKEY_Device_FriendlyName.pid,
            };

            let prop = props.GetValue(&key).ok()?;
            let s = prop.to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        }
    }
}
