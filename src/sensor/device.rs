use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;

pub const UNKNOWN_DEVICE_NAME: &str = "UNKNOWN";

#[derive(Debug, Clone)]
pub struct Device {
    pub id: u8,

    pub name: String,

    /// `host:port` of the device's UDP endpoint.
    pub address: String,

    /// Time of the last successful reply, `None` until the first one.
    pub last_contact: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(id: u8, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            address: address.into(),
            last_contact: None,
        }
    }

    /// Whether the device should be queried at `now`.
    ///
    /// A last contact in the future (wall clock stepped back) counts as due.
    pub fn is_due(&self, now: DateTime<Utc>, poll_interval: Duration) -> bool {
        let Some(last_contact) = self.last_contact else {
            return true;
        };

        now.signed_duration_since(last_contact)
            .to_std()
            .map_or(true, |elapsed| elapsed >= poll_interval)
    }
}

/// The live device table, in configuration order.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: IndexMap<u8, Device>,
}

impl DeviceRegistry {
    pub fn new(devices: impl IntoIterator<Item = Device>) -> Result<Self> {
        let mut registry: IndexMap<u8, Device> = IndexMap::new();
        for device in devices {
            if let Some(existing) = registry.get(&device.id) {
                bail!(
                    "duplicate device id {}: {:?} and {:?}",
                    device.id,
                    existing.name,
                    device.name
                );
            }
            registry.insert(device.id, device);
        }

        Ok(Self { devices: registry })
    }

    pub fn lookup(&self, id: u8) -> &str {
        self.devices
            .get(&id)
            .map_or(UNKNOWN_DEVICE_NAME, |d| d.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Detached id -> name map for stages that must not see the live table.
    pub fn names(&self) -> DeviceNames {
        DeviceNames(
            self.devices
                .values()
                .map(|d| (d.id, d.name.clone()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceNames(HashMap<u8, String>);

impl DeviceNames {
    pub fn resolve(&self, id: u8) -> &str {
        self.0.get(&id).map_or(UNKNOWN_DEVICE_NAME, String::as_str)
    }
}

impl FromIterator<(u8, String)> for DeviceNames {
    fn from_iter<T: IntoIterator<Item = (u8, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
