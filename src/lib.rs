//! Client-side driver for Nordic Semiconductor's Secure DFU protocol over a
//! BLE GATT transport.
//!
//! Given a firmware update package (a ZIP archive with a manifest and one or
//! more signed images) and a connected peer exposing the Secure DFU service,
//! the driver uploads each image object by object, validates every window
//! with CRC-32, and instructs the device to execute it. Persistent errors
//! are retried and, when that fails, the transfer is degraded to a smaller
//! packet size or tighter flow control before giving up.
//!
//! The engine is transport-agnostic: anything implementing
//! [`transport::DfuTransport`] will do. [`transport_btleplug`] provides the
//! production implementation.

pub mod dfu;
pub mod error;
pub mod events;
pub mod package;
pub mod protocol;
pub mod queue;
pub mod speed;
pub mod transport;
pub mod transport_btleplug;

pub use dfu::{CrcFn, DfuConfig, DfuDriver, ModeSwitch, TransferState};
pub use error::Error;
pub use events::{DfuEvent, EventKind, EventSink, ListenerId};
pub use package::{DfuPackage, FirmwareImage, Manifest, ManifestEntry};
pub use transport::{dfu_uuids, DfuTransport, TransportError, WriteKind};
