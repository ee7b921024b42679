//! Defines the capability contract the controller consumes from a BLE stack.

use std::{fmt, time::Duration};

use async_trait::async_trait;

use crate::error::TransportError;

/// One advertisement as reported by a discovery window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub display_name: Option<String>,
    pub rssi: i16,
    pub service_uuids: Vec<String>,
}

/// Properties a characteristic declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharProperties {
    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }
}

impl fmt::Display for CharProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.read, "read"),
            (self.write, "write"),
            (self.write_without_response, "write-without-response"),
            (self.notify, "notify"),
            (self.indicate, "indicate"),
        ];
        let present: Vec<&str> = names
            .iter()
            .filter(|(set, _)| *set)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", present.join(", "))
    }
}

/// A GATT characteristic as enumerated after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: String,
    pub properties: CharProperties,
    pub service_uuid: String,
}

impl Characteristic {
    /// Last four hex digits of the first UUID segment, e.g. `fff1` for
    /// `0000fff1-0000-1000-8000-00805f9b34fb`.
    pub fn short_id(&self) -> String {
        short_id(&self.uuid)
    }
}

/// See [`Characteristic::short_id`].
pub fn short_id(uuid: &str) -> String {
    let first = uuid.split('-').next().unwrap_or_default().to_lowercase();
    let skip = first.chars().count().saturating_sub(4);
    first.chars().skip(skip).collect()
}

/// A GATT service with its characteristics in the order the peripheral reported them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: String,
    pub characteristics: Vec<Characteristic>,
}

/// How a write is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

impl WriteMode {
    /// Picks the mode for a characteristic, preferring acknowledged writes.
    pub fn for_properties(properties: &CharProperties) -> Option<Self> {
        if properties.write {
            Some(WriteMode::WithResponse)
        } else if properties.write_without_response {
            Some(WriteMode::WithoutResponse)
        } else {
            None
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::WithResponse => write!(f, "With Response"),
            WriteMode::WithoutResponse => write!(f, "No Response"),
        }
    }
}

/// BLE central role: bounded discovery windows and outgoing connections.
#[async_trait]
pub trait Central: Send + Sync + 'static {
    /// Runs one discovery window of `window` and returns what was seen in it.
    async fn scan(&self, window: Duration) -> Result<Vec<Advertisement>, TransportError>;

    /// Establishes a link to the peripheral at `address`.
    async fn connect(&self, address: &str) -> Result<Box<dyn GattLink>, TransportError>;
}

/// An established link to one peripheral.
#[async_trait]
pub trait GattLink: Send + Sync {
    fn address(&self) -> &str;

    /// Enumerates services and characteristics in peripheral order.
    async fn services(&self) -> Result<Vec<Service>, TransportError>;

    async fn read(&self, uuid: &str) -> Result<Vec<u8>, TransportError>;

    async fn write(&self, uuid: &str, data: &[u8], mode: WriteMode)
        -> Result<(), TransportError>;

    /// Releases the link. Safe to call more than once.
    async fn disconnect(&self);
}
