//! Defines central logic: the BlueZ transport.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bluer::{
    gatt::{
        remote::{Characteristic as RemoteCharacteristic, CharacteristicWriteRequest},
        WriteOp,
    },
    Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport, ErrorKind,
};
use futures::{pin_mut, select, FutureExt, StreamExt};
use log::{debug, info, warn};
use tokio::{sync::Mutex, time::sleep};

use crate::{
    error::{TransportError, WriteFailure},
    transport::{
        Advertisement, Central, CharProperties, Characteristic, GattLink, Service, WriteMode,
    },
};

/// How long to wait for BlueZ to resolve GATT services after connecting.
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra connection attempts after the first one fails.
const CONNECT_RETRIES: u32 = 2;

/// A BLE central on the default BlueZ adapter.
pub struct BluerCentral {
    // Keeps the D-Bus connection alive for as long as the adapter is used.
    _session: bluer::Session,
    adapter: Adapter,
}

impl BluerCentral {
    /// Opens a bluer session, powers the default adapter and restricts discovery to LE.
    pub async fn new() -> Result<Self> {
        debug!("Getting bluer session");
        let session = bluer::Session::new().await?;

        debug!("Getting default adapter");
        let adapter = session.default_adapter().await?;
        if !adapter.is_powered().await? {
            adapter.set_powered(true).await?;
        }
        log_adapter_info(&adapter).await?;

        let filter = DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            ..Default::default()
        };
        adapter.set_discovery_filter(filter).await?;

        info!(
            "Discovering on Bluetooth adapter {} with address {}",
            adapter.name(),
            adapter.address().await?
        );
        Ok(BluerCentral {
            _session: session,
            adapter,
        })
    }

    /// Reads the advertised properties of `addr`. Devices with no RSSI are out of range.
    async fn advertisement(&self, addr: Address) -> bluer::Result<Option<Advertisement>> {
        let device = self.adapter.device(addr)?;
        let rssi = match device.rssi().await? {
            Some(rssi) => rssi,
            None => {
                debug!("Device {addr} has no RSSI; skipping");
                return Ok(None);
            }
        };

        // BlueZ reports service UUIDs as a set; sort them so decoding is repeatable.
        let mut service_uuids: Vec<String> = device
            .uuids()
            .await?
            .unwrap_or_default()
            .into_iter()
            .map(|uuid| uuid.to_string())
            .collect();
        service_uuids.sort();

        Ok(Some(Advertisement {
            address: addr.to_string(),
            display_name: device.name().await?,
            rssi,
            service_uuids,
        }))
    }
}

#[async_trait]
impl Central for BluerCentral {
    async fn scan(&self, window: Duration) -> Result<Vec<Advertisement>, TransportError> {
        debug!("Starting discovery window of {window:?}");
        let discover = self
            .adapter
            .discover_devices()
            .await
            .map_err(scan_error)?
            .fuse();
        pin_mut!(discover);
        let deadline = sleep(window).fuse();
        pin_mut!(deadline);

        let mut addresses: Vec<Address> = Vec::new();
        loop {
            select! {
                evt = discover.next() => {
                    match evt {
                        Some(AdapterEvent::DeviceAdded(addr)) => {
                            if !addresses.contains(&addr) {
                                addresses.push(addr);
                            }
                        }
                        Some(_) => (), // Ignore all events beyond DeviceAdded.
                        None => {
                            debug!("Discovery stream ended before the window closed");
                            break;
                        }
                    }
                },
                () = &mut deadline => break,
            }
        }

        let mut advertisements = Vec::with_capacity(addresses.len());
        for addr in addresses {
            match self.advertisement(addr).await {
                Ok(Some(advertisement)) => advertisements.push(advertisement),
                Ok(None) => {}
                Err(e) => debug!("Could not read properties of {addr}: {e}"),
            }
        }
        debug!("Discovery window saw {} devices", advertisements.len());
        Ok(advertisements)
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn GattLink>, TransportError> {
        let addr: Address = address.parse().map_err(|e| {
            TransportError::Connection(format!("invalid device address \"{address}\": {e}"))
        })?;
        let device = self.adapter.device(addr).map_err(connection_error)?;

        if !device.is_connected().await.map_err(connection_error)? {
            let mut retries = CONNECT_RETRIES;
            loop {
                debug!("Connecting to {addr}...");
                match device.connect().await {
                    Ok(()) => break,
                    Err(e) if retries > 0 => {
                        warn!("Connecting to {addr} failed ({e}); {retries} retries left");
                        retries -= 1;
                    }
                    Err(e) => return Err(connection_error(e)),
                }
            }
        }
        info!("Device {addr} connected");

        let link = BluerLink {
            address: address.to_string(),
            device,
            characteristics: Mutex::new(Vec::new()),
        };
        if let Err(e) = link.wait_for_services().await {
            link.disconnect().await;
            return Err(e);
        }
        Ok(Box::new(link))
    }
}

/// A connected BlueZ device and the characteristics last enumerated on it.
struct BluerLink {
    address: String,
    device: Device,
    characteristics: Mutex<Vec<(String, RemoteCharacteristic)>>,
}

impl BluerLink {
    /// Waits until BlueZ has resolved the device's GATT services.
    async fn wait_for_services(&self) -> Result<(), TransportError> {
        let changes = self.device.events().await.map_err(connection_error)?.fuse();
        pin_mut!(changes);
        if self
            .device
            .is_services_resolved()
            .await
            .map_err(connection_error)?
        {
            return Ok(());
        }

        debug!("Waiting for GATT services to resolve");
        let timeout = sleep(SERVICES_RESOLVE_TIMEOUT).fuse();
        pin_mut!(timeout);

        loop {
            select! {
                change_opt = changes.next() => {
                    match change_opt {
                        Some(DeviceEvent::PropertyChanged(DeviceProperty::ServicesResolved(true))) => {
                            debug!("GATT services resolved");
                            return Ok(());
                        },
                        Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) => {
                            return Err(TransportError::Connection(
                                "lost connection while waiting for GATT service resolution".to_string(),
                            ));
                        },
                        Some(_) => { // check anyway
                            if self.device.is_services_resolved().await.map_err(connection_error)? {
                                debug!("GATT services resolved");
                                return Ok(());
                            }
                        },
                        None => {
                            return Err(TransportError::Connection(
                                "device events stopped before GATT services resolved".to_string(),
                            ));
                        },
                    }
                },
                () = &mut timeout => {
                    return Err(TransportError::Connection(format!(
                        "GATT services failed to resolve after {SERVICES_RESOLVE_TIMEOUT:?}"
                    )));
                },
            }
        }
    }

    /// First enumerated characteristic with `uuid`.
    async fn characteristic(&self, uuid: &str) -> Option<RemoteCharacteristic> {
        let uuid = uuid.to_lowercase();
        self.characteristics
            .lock()
            .await
            .iter()
            .find(|(candidate, _)| *candidate == uuid)
            .map(|(_, characteristic)| characteristic.clone())
    }
}

#[async_trait]
impl GattLink for BluerLink {
    fn address(&self) -> &str {
        &self.address
    }

    async fn services(&self) -> Result<Vec<Service>, TransportError> {
        let mut remote_services = self.device.services().await.map_err(discovery_error)?;
        // Attribute handle order is the order the peripheral declares them in.
        remote_services.sort_by_key(|service| service.id());
        debug!("... found {} services", remote_services.len());

        let mut services = Vec::with_capacity(remote_services.len());
        let mut handles = Vec::new();
        for remote_service in remote_services {
            let service_uuid = remote_service
                .uuid()
                .await
                .map_err(discovery_error)?
                .to_string();
            debug!("Service UUID: {service_uuid}");

            let mut remote_characteristics = remote_service
                .characteristics()
                .await
                .map_err(discovery_error)?;
            remote_characteristics.sort_by_key(|characteristic| characteristic.id());

            let mut characteristics = Vec::with_capacity(remote_characteristics.len());
            for remote_characteristic in remote_characteristics {
                let uuid = remote_characteristic
                    .uuid()
                    .await
                    .map_err(discovery_error)?
                    .to_string();
                let flags = remote_characteristic
                    .flags()
                    .await
                    .map_err(discovery_error)?;
                debug!("Characteristic UUID: {uuid}");
                characteristics.push(Characteristic {
                    uuid: uuid.clone(),
                    properties: CharProperties {
                        read: flags.read,
                        write: flags.write,
                        write_without_response: flags.write_without_response,
                        notify: flags.notify,
                        indicate: flags.indicate,
                    },
                    service_uuid: service_uuid.clone(),
                });
                handles.push((uuid, remote_characteristic));
            }
            services.push(Service {
                uuid: service_uuid,
                characteristics,
            });
        }

        *self.characteristics.lock().await = handles;
        Ok(services)
    }

    async fn read(&self, uuid: &str) -> Result<Vec<u8>, TransportError> {
        let characteristic = self
            .characteristic(uuid)
            .await
            .ok_or_else(|| TransportError::Read(format!("characteristic {uuid} not found")))?;
        debug!("Reading characteristic value of {uuid}");
        let value = characteristic
            .read()
            .await
            .map_err(|e| TransportError::Read(e.to_string()))?;
        debug!("Read value: {value:x?}");
        Ok(value)
    }

    async fn write(
        &self,
        uuid: &str,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let characteristic = self
            .characteristic(uuid)
            .await
            .ok_or_else(|| TransportError::write(format!("characteristic {uuid} not found")))?;
        let request = CharacteristicWriteRequest {
            op_type: match mode {
                WriteMode::WithResponse => WriteOp::Request,
                WriteMode::WithoutResponse => WriteOp::Command,
            },
            ..Default::default()
        };

        let e = match characteristic.write_ext(data, &request).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if !self.device.is_connected().await.unwrap_or(false) {
            return Err(TransportError::LinkLost(e.to_string()));
        }
        if matches!(e.kind, ErrorKind::NotPermitted | ErrorKind::NotAuthorized) {
            return Err(TransportError::Write {
                failure: WriteFailure::AccessDenied,
                message: e.to_string(),
            });
        }
        Err(TransportError::write(e.to_string()))
    }

    async fn disconnect(&self) {
        match self.device.is_connected().await {
            Ok(true) => {
                if let Err(e) = self.device.disconnect().await {
                    warn!("Error disconnecting {} (may have already been disconnected): {e}", self.address);
                } else {
                    info!("Disconnected from {}", self.address);
                }
            }
            Ok(false) => debug!("{} already disconnected", self.address),
            Err(e) => warn!("Could not query connection state of {}: {e}", self.address),
        }
    }
}

/// Adapter gone or BlueZ session torn down: scanning cannot recover.
fn scan_error(e: bluer::Error) -> TransportError {
    if matches!(e.kind, ErrorKind::DoesNotExist) || e.message.to_lowercase().contains("destroyed") {
        TransportError::SessionDestroyed(e.to_string())
    } else {
        TransportError::Scan(e.to_string())
    }
}

fn connection_error(e: bluer::Error) -> TransportError {
    TransportError::Connection(e.to_string())
}

fn discovery_error(e: bluer::Error) -> TransportError {
    TransportError::Connection(format!("service discovery failed: {e}"))
}

// Logs (at debug level) the adapter properties relevant to scanning.
async fn log_adapter_info(adapter: &Adapter) -> Result<()> {
    let mut properties_log = String::new();

    properties_log.push_str("Bluetooth adapter properties:\n");
    properties_log.push_str("{\n");

    properties_log.push_str(&format!("\tName: {}\n", adapter.name()));
    if let Ok(addr) = adapter.address().await {
        properties_log.push_str(&format!("\tAddress: {addr}\n"));
    }
    if let Ok(addr_type) = adapter.address_type().await {
        properties_log.push_str(&format!("\tAddress type: {addr_type}\n"));
    }
    if let Ok(alias) = adapter.alias().await {
        properties_log.push_str(&format!("\tAlias: {alias}\n"));
    }
    if let Ok(powered) = adapter.is_powered().await {
        properties_log.push_str(&format!("\tPowered: {powered}\n"));
    }
    if let Ok(discovering) = adapter.is_discovering().await {
        properties_log.push_str(&format!("\tDiscovering: {discovering}\n"));
    }

    properties_log.push('}');

    debug!("{}", properties_log);
    Ok(())
}
