//! Defines the repeating discovery loop.

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use async_channel::Sender;
use log::{debug, info, trace, warn};
use tokio::{sync::RwLock, time::sleep};

use super::{publish, Controller, DeviceEntry, Event, Registry, ScanTask};
use crate::{
    error::TransportError,
    identity::{self, DecoderConfig},
    transport::{Advertisement, Central},
};

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const EXITED: u8 = 2;

/// Lifecycle of one discovery loop: `RUNNING` -> `STOPPING` -> `EXITED`.
///
/// A stop only takes effect at a window boundary, so a start that arrives while the loop is
/// still `STOPPING` moves it back to `RUNNING` instead of spawning a second loop.
#[derive(Debug)]
pub(super) struct ScanLifecycle(AtomicU8);

impl ScanLifecycle {
    fn new() -> Self {
        ScanLifecycle(AtomicU8::new(RUNNING))
    }

    fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst) == RUNNING
    }

    fn swap_state(&self, from: u8, to: u8) -> bool {
        self.0
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn stop(&self) -> bool {
        self.swap_state(RUNNING, STOPPING)
    }

    fn resume(&self) -> bool {
        self.swap_state(STOPPING, RUNNING)
    }

    /// Called by the loop at a window boundary. True once the loop must exit.
    fn try_exit(&self) -> bool {
        match self
            .0
            .compare_exchange(STOPPING, EXITED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(current) => current == EXITED,
        }
    }

    fn exit(&self) {
        self.0.store(EXITED, Ordering::SeqCst);
    }
}

impl<C: Central> Controller<C> {
    /// Starts the discovery loop. Returns false (and does nothing) if one is already running.
    ///
    /// A loop that was asked to stop but is still finishing its window is resumed rather than
    /// replaced.
    pub async fn start_scan(&self) -> bool {
        let mut scan = self.scan.lock().await;
        if let Some(task) = scan.as_ref() {
            if !task.handle.is_finished() {
                if task.lifecycle.is_running() {
                    debug!("Scan already running");
                    return false;
                }
                if task.lifecycle.resume() {
                    info!("Scan resumed before the current discovery window ended");
                    publish(&self.events, Event::ScanStarted);
                    return true;
                }
            }
        }
        if let Some(previous) = scan.take() {
            // Exited already; all that is left is its `ScanStopped`.
            if let Err(e) = previous.handle.await {
                warn!("Previous scan loop ended abnormally: {e}");
            }
        }

        let lifecycle = Arc::new(ScanLifecycle::new());
        let scan_loop = ScanLoop {
            central: self.central.clone(),
            registry: self.registry.clone(),
            name_filter: self.name_filter.clone(),
            decoder: self.config.decoder.clone(),
            window: self.config.scan_window,
            pause: self.config.scan_pause,
            lifecycle: lifecycle.clone(),
            events: self.events.clone(),
        };
        publish(&self.events, Event::ScanStarted);
        let handle = tokio::spawn(scan_loop.run());
        *scan = Some(ScanTask { lifecycle, handle });
        true
    }

    /// Asks the discovery loop to stop after its current window. Returns false if none was running.
    pub async fn stop_scan(&self) -> bool {
        let scan = self.scan.lock().await;
        match scan.as_ref() {
            Some(task) if task.lifecycle.stop() => {
                info!("Scan stop requested; finishing current discovery window");
                true
            }
            _ => false,
        }
    }

    pub async fn is_scanning(&self) -> bool {
        let scan = self.scan.lock().await;
        scan.as_ref()
            .is_some_and(|task| task.lifecycle.is_running() && !task.handle.is_finished())
    }
}

/// State moved into the spawned discovery task.
struct ScanLoop<C: Central> {
    central: Arc<C>,
    registry: Registry,
    name_filter: Arc<RwLock<String>>,
    decoder: DecoderConfig,
    window: Duration,
    pause: Duration,
    lifecycle: Arc<ScanLifecycle>,
    events: Sender<Event>,
}

impl<C: Central> ScanLoop<C> {
    async fn run(self) {
        info!("Starting BLE scan ({:?} windows, {:?} pause)", self.window, self.pause);

        while !self.lifecycle.try_exit() {
            match self.central.scan(self.window).await {
                Ok(advertisements) => self.absorb(advertisements).await,
                Err(TransportError::SessionDestroyed(message)) => {
                    warn!("BLE session destroyed ({message}); ending scan loop");
                    self.lifecycle.exit();
                    break;
                }
                Err(e) => {
                    warn!("Scan error: {e}; retrying after pause");
                    publish(&self.events, Event::ScanFailed(e.to_string()));
                }
            }

            if self.lifecycle.try_exit() {
                break;
            }
            sleep(self.pause).await;
        }

        info!("Scan stopped");
        publish(&self.events, Event::ScanStopped);
    }

    /// Filters, decodes and records one window's advertisements.
    async fn absorb(&self, advertisements: Vec<Advertisement>) {
        let filter = self.name_filter.read().await.to_lowercase();
        let mut sighted = 0;

        for advertisement in advertisements {
            let entry = DeviceEntry {
                identity: identity::decode(&advertisement.service_uuids, &self.decoder),
                advertisement,
            };
            let name = entry.display_name();
            if !filter.is_empty() && !name.to_lowercase().contains(&filter) {
                trace!("Skipping {name} ({}); does not match filter", entry.address());
                continue;
            }

            info!(
                "[SCAN] Found: {name} ({}) | RSSI: {}",
                entry.address(),
                entry.rssi()
            );
            if !entry.advertisement.service_uuids.is_empty() {
                debug!("  - UUIDs: {:?}", entry.advertisement.service_uuids);
            }
            if let Some(phone) = &entry.identity.phone {
                info!("  - DECODED PHONE: {phone}");
            }
            if let Some(card) = &entry.identity.card {
                info!("  - DECODED CARD: {card}");
            }

            self.registry.upsert(entry.clone());
            publish(&self.events, Event::DeviceSeen(entry));
            sighted += 1;
        }

        debug!("Discovery window done; {sighted} devices matched");
        publish(&self.events, Event::ScanCycle { sighted });
    }
}
