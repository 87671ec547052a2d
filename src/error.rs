use crate::protocol::DeviceError;
use crate::transport::TransportError;

/// Errors surfaced by the DFU driver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The update package could not be read or its manifest is invalid.
    #[error("malformed update package: {0}")]
    MalformedPackage(String),

    /// The peer exposes the DFU service but not both the control point and
    /// packet characteristics.
    #[error("DFU control point or packet characteristic not found")]
    MissingCharacteristics,

    /// Neither bootloader-mode characteristics nor a buttonless
    /// characteristic are present.
    #[error("device supports neither DFU nor buttonless mode switching")]
    UnsupportedDevice,

    /// The peer dropped the link while operations were pending.
    #[error("peripheral disconnected")]
    Disconnected,

    /// The transport kept reporting a write in progress until the retry
    /// budget ran out.
    #[error("transport busy: write retry budget exhausted")]
    TransportBusy,

    /// The peer sent a notification the driver cannot interpret.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The peer answered a control request with a non-success result code.
    #[error("{0}")]
    Device(DeviceError),

    /// The device-reported CRC disagrees with the local one at a window
    /// boundary.
    #[error("CRC mismatch at offset {offset}")]
    CrcMismatch { offset: u32 },

    /// Any other transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    /// Whether the smart-speed controller may retry after this error.
    ///
    /// Link loss, framing garbage, and fatal transport errors (e.g. a write
    /// exceeding the MTU) are not retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Device(_) | Error::CrcMismatch { .. } | Error::TransportBusy
        )
    }
}
