//! Defines the single-peripheral session: connect, negotiate, send and teardown.

use std::fmt;

use log::{debug, error, info, warn};

use super::{publish, Controller, Event};
use crate::{
    error::{SendError, TransportError, WriteFailure},
    selector::{self, ChannelSelection},
    transport::{Central, GattLink, WriteMode},
};

/// Shown when the probe read produced nothing usable.
const NO_ORDER_INFO: &str = "No readable data found.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Negotiating,
    Ready,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting",
            SessionState::Negotiating => "Negotiating",
            SessionState::Ready => "Ready",
            SessionState::Failed => "Failed",
        };
        write!(f, "{name}")
    }
}

/// Observable view of the session, published on every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub address: Option<String>,
    pub state: SessionState,
    /// Status text for display; the error message while `Failed`.
    pub detail: String,
    pub selection: Option<ChannelSelection>,
    pub order_info: Option<String>,
}

/// A successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub short_id: String,
    pub uuid: String,
    pub mode: WriteMode,
    pub bytes: usize,
}

impl fmt::Display for SendReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Data sent to {} ({})", self.short_id, self.mode)
    }
}

/// The live link and what was negotiated on it.
pub(super) struct Session {
    pub(super) address: String,
    link: Box<dyn GattLink>,
    selection: ChannelSelection,
}

impl<C: Central> Controller<C> {
    /// Connects to `address` and negotiates channels, replacing any existing session.
    ///
    /// Returns the resulting state: `Ready` on success, `Failed` (see [`Controller::failure`])
    /// if the transport refused.
    pub async fn connect(&self, address: &str) -> SessionState {
        let mut active = self.session.lock().await;
        if let Some(previous) = active.take() {
            info!(
                "Releasing session with {} before connecting to {address}",
                previous.address
            );
            // Leave `Ready` before the link is released so no send can still target it.
            self.transition(&previous.address, SessionState::Disconnected, "Disconnected");
            previous.link.disconnect().await;
        }

        info!("[CONNECT] Attempting to connect to {address}...");
        self.transition(
            address,
            SessionState::Connecting,
            format!("Connecting to {address}..."),
        );
        let link = match self.central.connect(address).await {
            Ok(link) => link,
            Err(e) => return self.fail(address, &e),
        };

        self.transition(
            address,
            SessionState::Negotiating,
            format!("Connected to {address}; discovering services"),
        );
        let (selection, order_info) = match self.negotiate(link.as_ref()).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                link.disconnect().await;
                return self.fail(address, &e);
            }
        };

        publish(
            &self.events,
            Event::ChannelsSelected {
                read: selection.read_label(),
                write: selection.write_label(),
            },
        );
        publish(
            &self.events,
            Event::OrderInformation(order_info.clone().unwrap_or_else(|| NO_ORDER_INFO.to_string())),
        );

        self.status.send_modify(|status| {
            status.selection = Some(selection.clone());
            status.order_info = order_info;
        });
        self.transition(address, SessionState::Ready, format!("Connected to {address}"));
        *active = Some(Session {
            address: address.to_string(),
            link,
            selection,
        });
        SessionState::Ready
    }

    /// Enumerates services, selects channels and probes the fallback read channel.
    async fn negotiate(
        &self,
        link: &dyn GattLink,
    ) -> Result<(ChannelSelection, Option<String>), TransportError> {
        info!("[GATT] Discovering services for {}...", link.address());
        let services = link.services().await?;
        let mut selection = selector::select(&services, &self.config.selector);

        let mut order_info = None;
        if let Some(probe) = selection.probe.clone() {
            match link.read(&probe.uuid).await {
                Ok(value) => {
                    let text = decode_order_info(&value);
                    if text.trim().is_empty() {
                        debug!("Probe read of {} returned no text", probe.short_id());
                    } else {
                        selection
                            .trail
                            .push(format!("    -> Initial Read Data: {text}"));
                        order_info = Some(text);
                    }
                }
                Err(e) => {
                    warn!("Read of {} failed: {e}", probe.uuid);
                    selection.trail.push(format!("    -> Read failed: {e}"));
                }
            }
        }

        for line in &selection.trail {
            debug!("{line}");
            publish(&self.events, Event::Trail(line.clone()));
        }
        Ok((selection, order_info))
    }

    /// Writes `payload` unchanged to the negotiated write channel.
    pub async fn send(&self, payload: &[u8]) -> Result<SendReport, SendError> {
        let target = {
            let status = self.status.borrow();
            if status.state != SessionState::Ready {
                return Err(SendError::NotReady);
            }
            status.address.clone()
        };
        let mut active = self.session.lock().await;
        let Some(session) = active.as_ref() else {
            return Err(SendError::NotReady);
        };
        // A reconnect may have replaced the session while we waited for the lock.
        if self.state() != SessionState::Ready
            || target.as_deref() != Some(session.address.as_str())
        {
            debug!("Session changed while waiting to send; dropping payload");
            return Err(SendError::NotReady);
        }
        let Some(characteristic) = session.selection.write_characteristic().cloned() else {
            return Err(SendError::NotReady);
        };

        let short_id = characteristic.short_id();
        let Some(mode) = WriteMode::for_properties(&characteristic.properties) else {
            warn!("Characteristic {short_id} is not writable");
            return Err(SendError::NotWritable { short_id });
        };

        info!(
            "[SEND] Sending {} bytes to {short_id} ({}) using {mode}",
            payload.len(),
            characteristic.uuid
        );
        let written = session
            .link
            .write(&characteristic.uuid, payload, mode)
            .await;
        match written {
            Ok(()) => {
                info!("  - Result: Sent successfully");
                Ok(SendReport {
                    short_id,
                    uuid: characteristic.uuid,
                    mode,
                    bytes: payload.len(),
                })
            }
            Err(TransportError::Write {
                failure: WriteFailure::AccessDenied,
                message,
            }) => {
                error!("  - Result: FAILED (access denied for {short_id}): {message}");
                Err(SendError::PairingRequired { short_id, message })
            }
            Err(TransportError::LinkLost(message)) => {
                error!("  - Result: FAILED (connection lost): {message}");
                if let Some(lost) = active.take() {
                    lost.link.disconnect().await;
                    self.transition(
                        &lost.address,
                        SessionState::Disconnected,
                        format!("Connection lost: {message}"),
                    );
                }
                Err(SendError::LinkLost(message))
            }
            Err(e) => {
                error!("  - Result: FAILED: {e}");
                Err(SendError::Write(e.to_string()))
            }
        }
    }

    /// Releases the current session, if any. Returns whether there was one.
    pub async fn disconnect(&self) -> bool {
        let mut active = self.session.lock().await;
        match active.take() {
            Some(session) => {
                session.link.disconnect().await;
                self.transition(&session.address, SessionState::Disconnected, "Disconnected");
                true
            }
            None => false,
        }
    }

    fn fail(&self, address: &str, error: &TransportError) -> SessionState {
        error!("[ERROR] Connection to {address} failed: {error}");
        self.transition(address, SessionState::Failed, error.to_string());
        SessionState::Failed
    }

    fn transition(&self, address: &str, state: SessionState, detail: impl Into<String>) {
        let detail = detail.into();
        debug!("Session {address}: {state} ({detail})");
        self.status.send_modify(|status| {
            // Selection and order information only describe a ready session.
            if state != SessionState::Ready {
                status.selection = None;
                status.order_info = None;
            }
            status.address = Some(address.to_string());
            status.state = state;
            status.detail = detail.clone();
        });
        publish(
            &self.events,
            Event::Session {
                address: address.to_string(),
                state,
                detail,
            },
        );
    }
}

/// Decodes probe bytes as UTF-8, dropping invalid sequences.
fn decode_order_info(value: &[u8]) -> String {
    value.utf8_chunks().map(|chunk| chunk.valid()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_info_drops_invalid_utf8() {
        assert_eq!(decode_order_info(b"ORDER-42"), "ORDER-42");
        assert_eq!(decode_order_info(&[0x4f, 0xff, 0x4b]), "OK");
        assert_eq!(decode_order_info(&[]), "");
    }

    #[test]
    fn order_info_keeps_encoded_replacement_character() {
        assert_eq!(decode_order_info(&[0x41, 0xef, 0xbf, 0xbd, 0x42]), "A\u{fffd}B");
        assert_eq!(decode_order_info(&[0xef, 0xbf, 0xbd, 0xc3]), "\u{fffd}");
    }

    #[test]
    fn states_display_their_names() {
        assert_eq!(SessionState::Negotiating.to_string(), "Negotiating");
        assert_eq!(SessionState::default(), SessionState::Disconnected);
    }
}
