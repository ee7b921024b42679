//! Picks the read and write characteristics to use on a freshly connected peripheral.
//!
//! Characteristics whose UUID equals the configured fixed read/write UUIDs always win. Failing
//! that, the first non-system characteristic with a suitable property is used as a fallback.

use log::debug;

use crate::transport::{Characteristic, Service};

/// Standard characteristics never used as a fallback channel (device name, appearance, ...).
pub const DEFAULT_SYSTEM_SHORT_IDS: [&str; 5] = ["2b29", "2b2a", "2a00", "2a01", "2a05"];

pub const DEFAULT_TARGET_SERVICE_UUID: &str = "0000fff0-0000-1000-8000-00805f9b34fb";
pub const DEFAULT_TARGET_WRITE_UUID: &str = "0000fff1-0000-1000-8000-00805f9b34fb";
pub const DEFAULT_TARGET_READ_UUID: &str = "0000fff2-0000-1000-8000-00805f9b34fb";

/// Known-device characteristic UUIDs and the system denylist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorConfig {
    pub target_service_uuid: String,
    pub fixed_write_uuid: String,
    pub fixed_read_uuid: String,
    pub system_short_ids: Vec<String>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        SelectorConfig {
            target_service_uuid: DEFAULT_TARGET_SERVICE_UUID.to_string(),
            fixed_write_uuid: DEFAULT_TARGET_WRITE_UUID.to_string(),
            fixed_read_uuid: DEFAULT_TARGET_READ_UUID.to_string(),
            system_short_ids: DEFAULT_SYSTEM_SHORT_IDS
                .iter()
                .map(|id| id.to_string())
                .collect(),
        }
    }
}

/// How a channel got bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingSource {
    /// UUID equals the configured fixed UUID.
    Fixed,
    /// First suitable non-system characteristic.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub characteristic: Characteristic,
    pub source: BindingSource,
}

impl Binding {
    /// Label such as `fff1 (Fixed)` or `fff3`.
    pub fn label(&self) -> String {
        match self.source {
            BindingSource::Fixed => format!("{} (Fixed)", self.characteristic.short_id()),
            BindingSource::Fallback => self.characteristic.short_id(),
        }
    }
}

/// Result of negotiating channels on one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSelection {
    pub write: Option<Binding>,
    pub read: Option<Binding>,
    /// First fallback read characteristic; read once to recover order information.
    pub probe: Option<Characteristic>,
    /// Human-readable record of every decision taken.
    pub trail: Vec<String>,
}

impl ChannelSelection {
    pub fn write_characteristic(&self) -> Option<&Characteristic> {
        self.write.as_ref().map(|binding| &binding.characteristic)
    }

    pub fn read_characteristic(&self) -> Option<&Characteristic> {
        self.read.as_ref().map(|binding| &binding.characteristic)
    }

    pub fn write_label(&self) -> String {
        label_or_not_found(self.write.as_ref())
    }

    pub fn read_label(&self) -> String {
        label_or_not_found(self.read.as_ref())
    }
}

fn label_or_not_found(binding: Option<&Binding>) -> String {
    binding
        .map(Binding::label)
        .unwrap_or_else(|| "Not found".to_string())
}

/// Walks `services` in order and binds the read and write channels.
pub fn select(services: &[Service], config: &SelectorConfig) -> ChannelSelection {
    let fixed_write = config.fixed_write_uuid.to_lowercase();
    let fixed_read = config.fixed_read_uuid.to_lowercase();
    let target_service = config.target_service_uuid.to_lowercase();

    let mut selection = ChannelSelection::default();

    for service in services {
        let service_uuid = service.uuid.to_lowercase();
        if service_uuid == target_service {
            selection
                .trail
                .push(format!("[Service] {} (target service)", service.uuid));
        } else {
            selection.trail.push(format!("[Service] {}", service.uuid));
        }

        for characteristic in &service.characteristics {
            let uuid = characteristic.uuid.to_lowercase();
            let short_id = characteristic.short_id();
            let is_system = config.system_short_ids.iter().any(|id| *id == short_id);
            selection.trail.push(format!(
                "  [Char] {} (Short: {short_id}) | Props: {}",
                characteristic.uuid, characteristic.properties
            ));

            if uuid == fixed_write {
                bind_fixed(&mut selection.write, characteristic, "WRITE", &mut selection.trail);
            }
            if uuid == fixed_read {
                bind_fixed(&mut selection.read, characteristic, "READ", &mut selection.trail);
            }

            if selection.write.is_none() && !is_system && characteristic.properties.is_writable()
            {
                selection.write = Some(Binding {
                    characteristic: characteristic.clone(),
                    source: BindingSource::Fallback,
                });
                selection
                    .trail
                    .push("    -> Selected as fallback WRITE target".to_string());
            }

            if selection.read.is_none() && !is_system && characteristic.properties.read {
                selection.read = Some(Binding {
                    characteristic: characteristic.clone(),
                    source: BindingSource::Fallback,
                });
                if selection.probe.is_none() {
                    selection.probe = Some(characteristic.clone());
                }
                selection
                    .trail
                    .push("    -> Selected as fallback READ target".to_string());
            }
        }
    }

    if selection.write.is_none() {
        selection
            .trail
            .push("[WARN] No suitable writable application characteristic found".to_string());
    }
    if selection.read.is_none() {
        selection
            .trail
            .push("[WARN] No readable application characteristic found".to_string());
    }

    debug!(
        "Selected write channel {} and read channel {}",
        selection.write_label(),
        selection.read_label()
    );
    selection
}

/// Binds an exact match unless an earlier exact match already holds the slot.
fn bind_fixed(
    slot: &mut Option<Binding>,
    characteristic: &Characteristic,
    role: &str,
    trail: &mut Vec<String>,
) {
    match slot {
        Some(Binding {
            source: BindingSource::Fixed,
            ..
        }) => {
            trail.push(format!(
                "    -> [MATCH] duplicate TARGET {role} characteristic in service {}; keeping the first",
                characteristic.service_uuid
            ));
        }
        _ => {
            *slot = Some(Binding {
                characteristic: characteristic.clone(),
                source: BindingSource::Fixed,
            });
            trail.push(format!("    -> [MATCH] TARGET {role} characteristic found"));
        }
    }
}
