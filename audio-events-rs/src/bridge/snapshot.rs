//! In-process mirror of the endpoints known to the OS.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::audio::{AudioDevice, AudioError, DataFlow, DeviceCollectionEvent, DeviceState, Role};

/// Ordered device table plus the (flow, role) default side table.
///
/// Mutated only through [`apply`](Self::apply) and [`reset`](Self::reset).
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    devices: Vec<AudioDevice>,
    defaults: HashMap<(DataFlow, Role), String>,
}

impl DeviceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole table, e.g. after enumeration.
    ///
    /// Duplicate ids keep the last entry.
    pub fn reset(&mut self, devices: Vec<AudioDevice>) {
        self.devices.clear();
        for device in devices {
            self.upsert(device);
        }
        self.defaults
            .retain(|_, device_id| self.devices.iter().any(|d| d.device_id == *device_id));
    }

    /// Apply one collection event.
    ///
    /// `lookup` resolves device details for ADDED; a failed lookup leaves the
    /// table unchanged (the device may already be gone again).
    pub fn apply<F>(&mut self, event: &DeviceCollectionEvent, lookup: F)
    where
        F: FnOnce(&str) -> Result<AudioDevice, AudioError>,
    {
        match event {
            DeviceCollectionEvent::Added { device_id } => match lookup(device_id) {
                Ok(device) => {
                    if self.upsert(device) {
                        warn!(device_id = %device_id, "ADDED for a device already present, overwriting");
                    }
                }
                Err(e) => {
                    debug!(device_id = %device_id, error = %e, "Could not resolve added device");
                }
            },
            DeviceCollectionEvent::Removed { device_id } => {
                self.devices.retain(|d| d.device_id != *device_id);
                self.defaults.retain(|_, default| *default != *device_id);
            }
            DeviceCollectionEvent::StateChanged { device_id, state } => {
                match self.devices.iter_mut().find(|d| d.device_id == *device_id) {
                    Some(device) => device.state = *state,
                    None => debug!(device_id = %device_id, "State change for unknown device"),
                }
            }
            DeviceCollectionEvent::DefaultChanged {
                device_id,
                dataflow,
                role,
            } => self.set_default(*dataflow, *role, device_id.clone()),
        }
    }

    /// Record the default for a (flow, role) pair; `None` clears it.
    pub fn set_default(&mut self, dataflow: DataFlow, role: Role, device_id: Option<String>) {
        if dataflow == DataFlow::All {
            warn!(?role, "Ignoring default change with a wildcard data flow");
            return;
        }
        match device_id {
            Some(device_id) => {
                self.defaults.insert((dataflow, role), device_id);
            }
            None => {
                self.defaults.remove(&(dataflow, role));
            }
        }
    }

    pub fn get(&self, device_id: &str) -> Option<&AudioDevice> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.get(device_id).is_some()
    }

    pub fn devices(&self) -> &[AudioDevice] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Id of the default device for a pair, as last reported by the OS.
    pub fn default_id(&self, dataflow: DataFlow, role: Role) -> Option<&str> {
        self.defaults.get(&(dataflow, role)).map(String::as_str)
    }

    /// The default device for a pair, if it is in the table.
    pub fn default_device(&self, dataflow: DataFlow, role: Role) -> Option<&AudioDevice> {
        self.default_id(dataflow, role).and_then(|id| self.get(id))
    }

    /// Point-in-time projection; later events do not update it.
    pub fn filter(&self, dataflow: DataFlow, state_mask: DeviceState) -> FilteredView {
        FilteredView {
            devices: self
                .devices
                .iter()
                .filter(|d| d.matches(dataflow, state_mask))
                .cloned()
                .collect(),
        }
    }

    /// Insert or overwrite in place. Returns true if the id was present.
    fn upsert(&mut self, device: AudioDevice) -> bool {
        match self
            .devices
            .iter_mut()
            .find(|d| d.device_id == device.device_id)
        {
            Some(existing) => {
                *existing = device;
                true
            }
            None => {
                self.devices.push(device);
                false
            }
        }
    }
}

/// Read-only, order-preserving subset of a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilteredView {
    devices: Vec<AudioDevice>,
}

impl FilteredView {
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&AudioDevice> {
        self.devices.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AudioDevice> {
        self.devices.iter()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.devices.iter().map(|d| d.device_id.as_str()).collect()
    }

    pub fn into_vec(self) -> Vec<AudioDevice> {
        self.devices
    }
}

impl<'a> IntoIterator for &'a FilteredView {
    type Item = &'a AudioDevice;
    type IntoIter = std::slice::Iter<'a, AudioDevice>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}
