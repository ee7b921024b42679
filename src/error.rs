//! Defines the error taxonomy shared by the transport contract and the session controller.

use thiserror::Error;

/// Texts a BLE stack uses when it refuses a write for lack of pairing or authorization.
const ACCESS_DENIED_MARKERS: [&str; 3] = ["access denied", "not permitted", "not authorized"];

/// Why a write was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    /// The peripheral refused the write; pairing is likely required.
    AccessDenied,
    Other,
}

impl WriteFailure {
    /// Classifies a write failure from the text the BLE stack supplied.
    pub fn classify(message: &str) -> Self {
        let lowered = message.to_lowercase();
        if ACCESS_DENIED_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
        {
            WriteFailure::AccessDenied
        } else {
            WriteFailure::Other
        }
    }
}

/// Errors reported by a transport. These never travel past the controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {message}")]
    Write {
        failure: WriteFailure,
        message: String,
    },
    #[error("link lost: {0}")]
    LinkLost(String),
    #[error("scan failed: {0}")]
    Scan(String),
    /// The underlying BLE session is gone for good; scanning cannot continue.
    #[error("transport session destroyed: {0}")]
    SessionDestroyed(String),
}

impl TransportError {
    /// Builds a write error, classifying access denial from `message`.
    pub fn write(message: impl Into<String>) -> Self {
        let message = message.into();
        TransportError::Write {
            failure: WriteFailure::classify(&message),
            message,
        }
    }
}

/// Outcome of a failed `send`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// No session in the `Ready` state, or no write channel was bound.
    #[error("no device connected or no write channel available")]
    NotReady,
    #[error("characteristic {short_id} is not writable")]
    NotWritable { short_id: String },
    #[error("access denied for {short_id}; pairing may be required ({message})")]
    PairingRequired { short_id: String, message: String },
    #[error("connection lost while sending: {0}")]
    LinkLost(String),
    #[error("send failed: {0}")]
    Write(String),
}
