//! Defines the registry of sighted devices.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{identity::DecodedIdentity, transport::Advertisement};

/// Name shown (and filtered on) for devices that advertise none.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Latest advertisement of a device with the identity decoded from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub advertisement: Advertisement,
    pub identity: DecodedIdentity,
}

impl DeviceEntry {
    pub fn address(&self) -> &str {
        &self.advertisement.address
    }

    pub fn display_name(&self) -> &str {
        self.advertisement
            .display_name
            .as_deref()
            .unwrap_or(UNKNOWN_NAME)
    }

    pub fn rssi(&self) -> i16 {
        self.advertisement.rssi
    }
}

/// Devices keyed by address; a re-sighting replaces the previous entry whole.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Arc<DashMap<String, DeviceEntry>>,
}

impl Registry {
    pub fn upsert(&self, entry: DeviceEntry) {
        self.entries.insert(entry.address().to_string(), entry);
    }

    pub fn get(&self, address: &str) -> Option<DeviceEntry> {
        self.entries.get(address).map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> Vec<DeviceEntry> {
        let mut entries: Vec<DeviceEntry> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| a.address().cmp(b.address()));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
