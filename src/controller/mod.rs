//! Defines the session controller: the discovery loop, the device registry and the single
//! peripheral session.
//!
//! Transport failures stop here. They are logged, published as [`Event`]s and turned into
//! session state; nothing below the presentation layer ever sees a raw transport error.

mod registry;
mod scanner;
mod session;

pub use registry::{DeviceEntry, Registry, UNKNOWN_NAME};
pub use session::{SendReport, SessionState, SessionStatus};

use std::{sync::Arc, time::Duration};

use async_channel::{Receiver, Sender};
use log::{debug, warn};
use tokio::{
    sync::{watch, Mutex, RwLock},
    task::JoinHandle,
};

use crate::{
    identity::DecoderConfig,
    selector::{ChannelSelection, SelectorConfig},
    transport::Central,
};

/// Everything the controller needs besides a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Length of one discovery window.
    pub scan_window: Duration,
    /// Pause between two discovery windows.
    pub scan_pause: Duration,
    /// Initial name filter; empty matches every device.
    pub name_filter: String,
    pub decoder: DecoderConfig,
    pub selector: SelectorConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            scan_window: Duration::from_secs(5),
            scan_pause: Duration::from_secs(1),
            name_filter: String::new(),
            decoder: DecoderConfig::default(),
            selector: SelectorConfig::default(),
        }
    }
}

/// What the controller tells the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ScanStarted,
    ScanStopped,
    /// A single discovery window failed; the loop keeps going.
    ScanFailed(String),
    /// A discovery window finished with `sighted` devices passing the name filter.
    ScanCycle { sighted: usize },
    DeviceSeen(DeviceEntry),
    Session {
        address: String,
        state: SessionState,
        detail: String,
    },
    /// One line of the channel selection trail.
    Trail(String),
    ChannelsSelected { read: String, write: String },
    OrderInformation(String),
}

/// A discovery loop and the lifecycle it shares with the controller.
struct ScanTask {
    lifecycle: Arc<scanner::ScanLifecycle>,
    handle: JoinHandle<()>,
}

/// Owns the discovery loop and at most one peripheral session over a transport `C`.
pub struct Controller<C: Central> {
    central: Arc<C>,
    config: ControllerConfig,
    registry: Registry,
    name_filter: Arc<RwLock<String>>,
    events: Sender<Event>,
    scan: Mutex<Option<ScanTask>>,
    // Held for the whole of connect, send and disconnect.
    session: Mutex<Option<session::Session>>,
    status: watch::Sender<SessionStatus>,
}

impl<C: Central> Controller<C> {
    /// Creates a controller and the receiving end of its event stream.
    pub fn new(central: C, config: ControllerConfig) -> (Self, Receiver<Event>) {
        let (events, events_receive) = async_channel::unbounded();
        let (status, _) = watch::channel(SessionStatus::default());
        let controller = Controller {
            central: Arc::new(central),
            name_filter: Arc::new(RwLock::new(config.name_filter.clone())),
            config,
            registry: Registry::default(),
            events,
            scan: Mutex::new(None),
            session: Mutex::new(None),
            status,
        };
        (controller, events_receive)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Replaces the name filter; applied from the next discovery window on.
    pub async fn set_name_filter(&self, filter: impl Into<String>) {
        let filter = filter.into();
        debug!("Name filter set to {filter:?}");
        *self.name_filter.write().await = filter;
    }

    pub async fn name_filter(&self) -> String {
        self.name_filter.read().await.clone()
    }

    /// Registry snapshot, sorted by address.
    pub fn devices(&self) -> Vec<DeviceEntry> {
        self.registry.snapshot()
    }

    pub fn device(&self, address: &str) -> Option<DeviceEntry> {
        self.registry.get(address)
    }

    /// Forgets every sighted device.
    pub fn clear_devices(&self) {
        self.registry.clear();
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Watches session status changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Message of the last failed connect, while the session stays `Failed`.
    pub fn failure(&self) -> Option<String> {
        let status = self.status.borrow();
        (status.state == SessionState::Failed).then(|| status.detail.clone())
    }

    pub fn selection(&self) -> Option<ChannelSelection> {
        self.status.borrow().selection.clone()
    }

    pub fn order_info(&self) -> Option<String> {
        self.status.borrow().order_info.clone()
    }

    /// Stops scanning, waits for the loop to finish its window and releases any session.
    pub async fn shutdown(&self) {
        self.stop_scan().await;
        let task = self.scan.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.handle.await {
                warn!("Scan loop ended abnormally: {e}");
            }
        }
        self.disconnect().await;
    }
}

impl<C: Central> Drop for Controller<C> {
    fn drop(&mut self) {
        if let Some(task) = self.scan.get_mut().take() {
            task.handle.abort();
        }
        if let Some(session) = self.session.get_mut() {
            warn!(
                "Controller dropped with an open session to {}; call `shutdown` to disconnect cleanly",
                session.address
            );
        }
    }
}

/// Publishes `event` without ever blocking; a closed stream is ignored.
fn publish(events: &Sender<Event>, event: Event) {
    if let Err(e) = events.try_send(event) {
        debug!("Event not delivered (no presentation listening): {e}");
    }
}
