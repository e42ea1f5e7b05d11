use nusb::transfer::TransferError;
use thiserror::Error;

/// The primary error type for the `hantek-dso` library.
#[derive(Error, Debug)]
pub enum DsoError {
    #[error("no matching oscilloscope found on the bus")]
    DeviceNotFound,

    #[error("device {0} enumerated with its pre-firmware id, firmware upload required")]
    NeedsFirmware(&'static str),

    #[error("device is already open")]
    AlreadyOpen,

    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    #[error("USB transfer error: {0}")]
    Transfer(TransferError),

    #[error("USB transfer timed out")]
    Timeout,

    #[error("device disconnected")]
    NoDevice,

    #[error("device reported unknown connection speed {0:#04x}")]
    UnknownSpeed(u8),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("firmware image rejected: {0}")]
    Firmware(String),
}

impl DsoError {
    /// true when the transfer may simply be retried.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DsoError::Timeout)
    }

    /// true when the error means the cable was pulled or the bus was reset.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, DsoError::NoDevice)
    }
}
