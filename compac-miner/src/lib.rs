//! Driver core for USB-attached BM13xx SHA-256 miners.
//!
//! The crate talks to GekkoScience-class sticks and pods over libusb:
//! per-device lifecycle (chip enumeration, core-opening ramp, mining,
//! recovery), work dispatch and nonce collection, rolling rate estimation
//! for auto-tuning, an auxiliary-MCU telemetry channel, and the
//! cgminer-compatible JSON/text control API. The pool protocol itself is a
//! collaborator behind [`work::WorkSource`].

pub mod api;
pub mod asic;
pub mod config;
pub mod device;
pub mod error;
pub mod stats;
pub mod usb;
pub mod util;
pub mod work;

pub use error::{Error, Result};
