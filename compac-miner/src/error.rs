//! Crate-wide error types.

use std::io;

/// Errors surfaced by the USB transport layer.
///
/// `Timeout` is never fatal; every other variant means the session is in
/// doubt and the caller decides between retry and teardown.
#[derive(Debug, thiserror::Error)]
pub enum UsbError {
    /// The device disappeared from the bus.
    #[error("device no longer present")]
    NoDevice,

    /// The transfer did not complete within its wall-clock budget.
    /// Carries whatever bytes were moved before the deadline.
    #[error("transfer timed out after {partial} byte(s)")]
    Timeout { partial: usize },

    /// Another process (or another instance) holds the device lock.
    #[error("device is in use by another instance")]
    InUse,

    /// The device does not match the descriptor that claimed it;
    /// another table entry may still want it.
    #[error("descriptor mismatch: {0}")]
    Ignore(String),

    /// The kernel refused a configuration or claim step.
    #[error("device busy: {0}")]
    Busy(&'static str),

    /// Endpoint layout on the wire differs from the table entry.
    #[error("endpoint {0:#04x} not found in active configuration")]
    MissingEndpoint(u8),

    #[error("usb: {0}")]
    Rusb(#[from] rusb::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl UsbError {
    /// True for errors that should tear the session down rather than retry.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, UsbError::Timeout { .. })
    }
}

impl From<rusb::Error> for Box<UsbError> {
    fn from(e: rusb::Error) -> Self {
        Box::new(UsbError::from(e))
    }
}

/// Errors from the API listener setup and request handling.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid API group '{0}'")]
    InvalidGroup(char),

    #[error("unknown command '{0}' in API group definition")]
    UnknownGroupCommand(String),

    #[error("invalid --api-allow entry '{0}'")]
    InvalidAllow(String),

    #[error("API bind to port {port} failed: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("invalid multicast address '{0}'")]
    InvalidMcastAddr(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Top-level error for the miner core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Usb(#[from] UsbError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("invalid --usb selector '{0}'")]
    InvalidUsbSelector(String),

    #[error("device limit reached ({0})")]
    DeviceLimit(&'static str),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
