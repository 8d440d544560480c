//! Device change notifications using IMMNotificationClient.
//!
//! The client only converts the OS arguments into a [`DeviceCollectionEvent`]
//! and hands it to the bridge callback; it never blocks beyond the channel's
//! push timeout and never touches bridge state itself.

use tracing::{debug, warn};
use windows::core::{implement, PCWSTR};
use windows::Win32::Foundation::E_UNEXPECTED;
use windows::Win32::Media::Audio::{
    EDataFlow, ERole, IMMDeviceEnumerator, IMMNotificationClient, IMMNotificationClient_Impl,
    DEVICE_STATE,
};
use windows::Win32::UI::Shell::PropertiesSystem::PROPERTYKEY;
// Re-export windows_core so the implement macro can find it
#[allow(unused_imports)]
use windows_core;

use super::backend::{NativeEvent, NotificationCallback};
use super::device::{DataFlow, DeviceCollectionEvent, DeviceState, Role};

/// Notification client that forwards collection changes to a callback.
#[implement(IMMNotificationClient)]
pub struct DeviceNotificationClient {
    callback: NotificationCallback,
}

impl DeviceNotificationClient {
    pub fn new(callback: NotificationCallback) -> Self {
        Self { callback }
    }

    /// Register this notification client with an enumerator.
    /// Takes ownership of self because the COM interface needs to own the data.
    pub fn register(
        self,
        enumerator: &IMMDeviceEnumerator,
    ) -> Result<IMMNotificationClient, windows::core::Error> {
        unsafe {
            let client: IMMNotificationClient = self.into();
            enumerator.RegisterEndpointNotificationCallback(&client)?;
            Ok(client)
        }
    }

    fn forward(&self, event: DeviceCollectionEvent) -> windows::core::Result<()> {
        (self.callback)(NativeEvent::Collection(event)).map_err(|e| {
            warn!(error = %e, "Collection notification rejected");
            E_UNEXPECTED.into()
        })
    }
}

unsafe fn device_id(pwstr: &PCWSTR) -> Option<String> {
    if pwstr.is_null() {
        return None;
    }
    match pwstr.to_string() {
        Ok(id) => Some(id),
        Err(e) => {
            debug!(error = %e, "Dropping notification with an undecodable device ID");
            None
        }
    }
}

impl IMMNotificationClient_Impl for DeviceNotificationClient_Impl {
    fn OnDeviceStateChanged(
        &self,
        pwstrdeviceid: &PCWSTR,
        dwnewstate: DEVICE_STATE,
    ) -> windows::core::Result<()> {
        match unsafe { device_id(pwstrdeviceid) } {
            Some(device_id) => self.forward(DeviceCollectionEvent::StateChanged {
                device_id,
                state: DeviceState::from_bits_truncate(dwnewstate.0),
            }),
            None => Ok(()),
        }
    }

    fn OnDeviceAdded(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        match unsafe { device_id(pwstrdeviceid) } {
            Some(device_id) => self.forward(DeviceCollectionEvent::Added { device_id }),
            None => Ok(()),
        }
    }

    fn OnDeviceRemoved(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        match unsafe { device_id(pwstrdeviceid) } {
            Some(device_id) => self.forward(DeviceCollectionEvent::Removed { device_id }),
            None => Ok(()),
        }
    }

    fn OnDefaultDeviceChanged(
        &self,
        flow: EDataFlow,
        role: ERole,
        pwstrdefaultdeviceid: &PCWSTR,
    ) -> windows::core::Result<()> {
        let (Some(dataflow), Some(role)) =
            (DataFlow::from_raw(flow.0), Role::from_raw(role.0 as u32))
        else {
            debug!(flow = flow.0, role = role.0, "Ignoring default change with unknown flow or role");
            return Ok(());
        };

        self.forward(DeviceCollectionEvent::DefaultChanged {
            device_id: unsafe { device_id(pwstrdefaultdeviceid) },
            dataflow,
            role,
        })
    }

    fn OnPropertyValueChanged(
        &self,
        _pwstrdeviceid: &PCWSTR,
        _key: &PROPERTYKEY,
    ) -> windows::core::Result<()> {
        Ok(())
    }
}
