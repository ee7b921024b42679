//! Scans for BLE peripherals, decodes the phone and card numbers hidden in their advertised
//! service UUIDs, and exchanges order data with a chosen peripheral over GATT.
//!
//! The [`controller::Controller`] owns the discovery loop and the single peripheral session. It
//! talks to the radio only through the [`transport::Central`] / [`transport::GattLink`] traits;
//! [`central::BluerCentral`] implements them on top of BlueZ.

pub mod central;
pub mod controller;
pub mod env;
pub mod error;
pub mod identity;
pub mod selector;
pub mod transport;
