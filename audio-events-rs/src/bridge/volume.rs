//! Per-device volume relay and the device handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio::{
    AudioDevice, AudioError, DataFlow, DeviceState, EndpointVolume, Role, Scope,
    VolumeChangeEvent,
};

use super::channel::{EventChannel, Notification, Popped};
use super::error::{BridgeError, Result};
use super::registration::{DeviceStatus, RegistrationHandle, RegistrationManager};
use super::stream::{EventSource, EventStream};
use super::BridgeInner;

/// Async sequence of one device's volume and mute changes.
pub type VolumeEvents = EventStream<VolumeSource>;

struct Layout {
    expected: usize,

    /// Event held back while its layout marker is handed out
    held: Option<VolumeChangeEvent>,
}

/// Consumer side of a [`VolumeEvents`] stream.
pub struct VolumeSource {
    device_id: String,
    channel: Arc<EventChannel<VolumeChangeEvent>>,
    layout: Mutex<Layout>,
    cancelled: AtomicBool,
    manager: Arc<RegistrationManager>,
    registrations: Mutex<Vec<RegistrationHandle>>,
}

impl VolumeSource {
    fn check_layout(
        &self,
        layout: &mut Layout,
        item: Notification<VolumeChangeEvent>,
    ) -> Notification<VolumeChangeEvent> {
        match item {
            Notification::Event(event) if event.channel_volumes.len() != layout.expected => {
                let expected = layout.expected;
                let actual = event.channel_volumes.len();
                warn!(device_id = %self.device_id, expected, actual, "Channel count changed");

                layout.expected = actual;
                layout.held = Some(event);
                Notification::ChannelLayoutChanged { expected, actual }
            }
            other => other,
        }
    }

    /// Drop our references to the device's registrations. Runs once.
    fn release(&self) {
        let handles = std::mem::take(&mut *self.registrations.lock());
        for handle in handles {
            if let Err(e) = self.manager.unregister(&handle) {
                warn!(device_id = %self.device_id, error = %e, "Failed to release volume registration");
            }
        }
    }
}

impl EventSource for VolumeSource {
    type Item = VolumeChangeEvent;

    fn poll_pop(&self, cx: &mut Context<'_>) -> Poll<Option<Notification<VolumeChangeEvent>>> {
        let mut layout = self.layout.lock();
        if self.cancelled.load(Ordering::Acquire) {
            drop(layout);
            self.release();
            return Poll::Ready(None);
        }
        if let Some(event) = layout.held.take() {
            return Poll::Ready(Some(Notification::Event(event)));
        }

        match self.channel.poll_pop(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(self.check_layout(&mut layout, item))),
            Poll::Ready(None) => {
                drop(layout);
                self.release();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn pop_until(&self, deadline: Instant) -> Option<Notification<VolumeChangeEvent>> {
        let mut layout = self.layout.lock();
        if self.cancelled.load(Ordering::Acquire) {
            drop(layout);
            self.release();
            return None;
        }
        if let Some(event) = layout.held.take() {
            return Some(Notification::Event(event));
        }

        match self.channel.pop_until(deadline) {
            Popped::Item(item) => Some(self.check_layout(&mut layout, item)),
            Popped::Empty => None,
            Popped::Closed => {
                drop(layout);
                self.release();
                None
            }
        }
    }

    fn close(&self) -> bool {
        self.cancelled.store(true, Ordering::Release);
        self.layout.lock().held = None;
        let closed = self.channel.close();
        self.release();
        if closed {
            debug!(device_id = %self.device_id, "Volume stream closed");
        }
        closed
    }

    fn is_closed(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || (self.channel.is_closed() && self.layout.lock().held.is_none())
    }
}

/// Open a volume stream for `device_id`.
///
/// Each call gets its own channel; the OS registration is shared per device.
/// A device that is already gone yields a stream that has ended.
pub(crate) fn observe(inner: &Arc<BridgeInner>, device_id: &str) -> Result<VolumeEvents> {
    let manager = &inner.manager;
    let channel = Arc::new(EventChannel::new(inner.config.channel()));
    let finished = |channel: Arc<EventChannel<VolumeChangeEvent>>| {
        channel.close();
        EventStream::new(VolumeSource {
            device_id: device_id.to_string(),
            channel,
            layout: Mutex::new(Layout {
                expected: 0,
                held: None,
            }),
            cancelled: AtomicBool::new(false),
            manager: Arc::clone(manager),
            registrations: Mutex::new(Vec::new()),
        })
    };

    let status = manager.track(device_id);
    if status.is_removed() {
        debug!(device_id = %device_id, "Observing a removed device");
        return Ok(finished(channel));
    }

    let expected = match inner.backend.get_endpoint_volume(device_id) {
        Ok(volume) => volume.channel_volumes.len(),
        Err(e) if status.is_removed() => {
            debug!(device_id = %device_id, error = %e, "Device removed while opening volume stream");
            return Ok(finished(channel));
        }
        Err(e) => return Err(e.into()),
    };

    // The collection scope is what tells the manager about removals.
    let watch = manager.register(Scope::GlobalCollection, None)?;
    let volume = match manager.register(
        Scope::DeviceVolume(device_id.to_string()),
        Some(channel.clone()),
    ) {
        Ok(handle) => handle,
        Err(e) => {
            if let Err(release) = manager.unregister(&watch) {
                warn!(error = %release, "Failed to release collection registration");
            }
            return Err(e);
        }
    };

    info!(device_id = %device_id, channels = expected, "Observing device volume");
    Ok(EventStream::new(VolumeSource {
        device_id: device_id.to_string(),
        channel,
        layout: Mutex::new(Layout {
            expected,
            held: None,
        }),
        cancelled: AtomicBool::new(false),
        manager: Arc::clone(manager),
        registrations: Mutex::new(vec![volume, watch]),
    }))
}

/// Stable reference to one endpoint.
///
/// Identity fields are a snapshot taken when the handle was created; the
/// handle does not follow later state changes. Once the device is removed
/// the handle stays valid but mutations fail with
/// [`BridgeError::StaleDeviceReference`].
#[derive(Clone)]
pub struct AudioDeviceHandle {
    device: AudioDevice,
    status: Arc<DeviceStatus>,
    inner: Arc<BridgeInner>,
}

impl AudioDeviceHandle {
    pub(crate) fn new(device: AudioDevice, inner: Arc<BridgeInner>) -> Self {
        let status = inner.manager.track(&device.device_id);
        Self {
            device,
            status,
            inner,
        }
    }

    pub fn device(&self) -> &AudioDevice {
        &self.device
    }

    pub fn device_id(&self) -> &str {
        &self.device.device_id
    }

    pub fn name(&self) -> &str {
        &self.device.name
    }

    pub fn dataflow(&self) -> DataFlow {
        self.device.dataflow
    }

    pub fn state(&self) -> DeviceState {
        self.device.state
    }

    /// True once the OS reported the device removed.
    pub fn is_removed(&self) -> bool {
        self.status.is_removed()
    }

    /// Read volume, mute and per-channel levels from the OS.
    pub fn current_volume(&self) -> Result<EndpointVolume> {
        self.inner
            .backend
            .get_endpoint_volume(self.device_id())
            .map_err(|e| self.os_error(e))
    }

    /// Flip the mute state. Returns the new state.
    ///
    /// The change is confirmed asynchronously by a volume event.
    pub fn toggle_mute(&self) -> Result<bool> {
        let mute = !self.current_volume()?.mute;
        self.set_mute(mute)?;
        Ok(mute)
    }

    pub fn set_mute(&self, mute: bool) -> Result<()> {
        info!(device_id = %self.device_id(), mute, "Setting mute");
        self.inner
            .backend
            .set_endpoint_mute(self.device_id(), mute)
            .map_err(|e| self.os_error(e))
    }

    /// Set the master volume scalar (clamped to 0.0..=1.0).
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        let volume = volume.clamp(0.0, 1.0);
        info!(device_id = %self.device_id(), volume, "Setting volume");
        self.inner
            .backend
            .set_endpoint_volume(self.device_id(), volume)
            .map_err(|e| self.os_error(e))
    }

    /// Make this device the default for `role`.
    pub fn set_default(&self, role: Role) -> Result<()> {
        info!(device_id = %self.device_id(), ?role, "Setting default device");
        self.inner
            .backend
            .set_default_device(self.device_id(), role)
            .map_err(|e| self.os_error(e))
    }

    /// Open a stream of this device's volume changes.
    pub fn observe_volume(&self) -> Result<VolumeEvents> {
        observe(&self.inner, self.device_id()).map_err(|e| match e {
            BridgeError::Backend(e) => self.os_error(e),
            other => other,
        })
    }

    fn os_error(&self, error: AudioError) -> BridgeError {
        if self.is_removed() || matches!(error, AudioError::DeviceNotFound { .. }) {
            debug!(device_id = %self.device_id(), error = %error, "Operation on a removed device");
            BridgeError::StaleDeviceReference {
                device_id: self.device.device_id.clone(),
            }
        } else {
            BridgeError::Backend(error)
        }
    }
}

impl PartialEq for AudioDeviceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device
    }
}

impl fmt::Debug for AudioDeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioDeviceHandle")
            .field("device_id", &self.device.device_id)
            .field("name", &self.device.name)
            .field("dataflow", &self.device.dataflow)
            .field("state", &self.device.state)
            .finish()
    }
}
