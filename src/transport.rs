//! Abstraction over a connected GATT peer exposing the Secure DFU service.

use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

pub mod dfu_uuids {
    use uuid::Uuid;

    /// 16-bit Secure DFU service UUID `0xFE59`, expanded to 128 bits.
    pub const SERVICE: Uuid = Uuid::from_u128(0x0000FE59_0000_1000_8000_00805F9B34FB);
    /// Control point characteristic (write + notify).
    pub const CTRL_PT: Uuid = Uuid::from_u128(0x8EC90001_F315_4F60_9FB8_838830DAEA50);
    /// Packet characteristic (write without response).
    pub const DATA_PT: Uuid = Uuid::from_u128(0x8EC90002_F315_4F60_9FB8_838830DAEA50);
    /// Buttonless DFU characteristic, present on application-mode devices.
    pub const BTTNLSS: Uuid = Uuid::from_u128(0x8EC90003_F315_4F60_9FB8_838830DAEA50);
}

/// An opaque transport failure.
///
/// Host GATT stacks report errors as free-form messages, so classification
/// is by substring: `"in progress"` marks a transient busy condition the
/// write serializer may retry, `"disconnected"` marks link loss.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        TransportError(message.into())
    }

    pub fn is_busy(&self) -> bool {
        self.0.contains("in progress")
    }

    pub fn is_disconnected(&self) -> bool {
        self.0.contains("disconnected")
    }
}

/// How a GATT write should be issued.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// A connected GATT peer as the DFU engine sees it.
///
/// Notifications for a subscribed characteristic are delivered through the
/// returned channel; the channel closing is the disconnect signal. All
/// methods take `&mut self`, so at most one operation is in flight at a
/// time by construction.
#[allow(async_fn_in_trait)]
pub trait DfuTransport {
    /// Largest single-write payload the stack accepts.
    fn mtu(&self) -> usize;

    fn is_connected(&self) -> bool;

    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// UUIDs of the characteristics under the DFU service.
    async fn characteristics(&mut self) -> Result<Vec<Uuid>, TransportError>;

    /// Enable notifications on `characteristic` and return their stream.
    async fn subscribe(
        &mut self,
        characteristic: Uuid,
    ) -> Result<UnboundedReceiver<Vec<u8>>, TransportError>;

    async fn write(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError>;
}
