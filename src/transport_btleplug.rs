//! Production transport over btleplug.

use std::collections::HashMap;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use uuid::Uuid;

use crate::transport::{dfu_uuids, DfuTransport, TransportError, WriteKind};

/// Advertising name of a Nordic device that has rebooted into the
/// bootloader.
pub const DFU_TARGET_NAME: &str = "DfuTarg";

/// Write payload btleplug accepts without negotiating a larger MTU.
const DEFAULT_MTU: usize = 244;

fn transport_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::new(e.to_string())
}

/// Scan the first adapter until a peripheral advertising `name` shows up.
pub async fn find_peripheral_by_name(name: &str) -> Result<Peripheral, TransportError> {
    tracing::info!("Searching for {name} ...");
    let manager = Manager::new().await.map_err(transport_err)?;
    let adapters = manager.adapters().await.map_err(transport_err)?;
    let central = adapters
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::new("no Bluetooth adapter found"))?;

    let mut events = central.events().await.map_err(transport_err)?;

    central
        .start_scan(ScanFilter::default())
        .await
        .map_err(transport_err)?;
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDiscovered(id) = event {
            let peripheral = central.peripheral(&id).await.map_err(transport_err)?;
            let local_name = peripheral
                .properties()
                .await
                .map_err(transport_err)?
                .and_then(|p| p.local_name);
            if let Some(n) = local_name {
                tracing::info!("Found [{n}] at [{id}]");
                if n == name {
                    return Ok(peripheral);
                }
            }
        }
    }
    Err(TransportError::new("scan ended before the device appeared"))
}

/// A connected Secure DFU peer reached through btleplug.
pub struct NrfDfuTransport {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
    connected: bool,
    mtu: usize,
}

impl NrfDfuTransport {
    /// Scan for a peripheral advertising `name` and wrap it; call
    /// [`DfuTransport::connect`] before using it.
    pub async fn discover(name: &str) -> Result<Self, TransportError> {
        let peripheral = find_peripheral_by_name(name).await?;
        Ok(Self::from_peripheral(peripheral))
    }

    pub fn from_peripheral(peripheral: Peripheral) -> Self {
        NrfDfuTransport {
            peripheral,
            characteristics: HashMap::new(),
            connected: false,
            mtu: DEFAULT_MTU,
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .get(&uuid)
            .ok_or_else(|| TransportError::new("characteristic not found"))
    }
}

impl DfuTransport for NrfDfuTransport {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.peripheral.connect().await.map_err(transport_err)?;
        self.peripheral
            .discover_services()
            .await
            .map_err(transport_err)?;
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.peripheral.disconnect().await.map_err(transport_err)?;
        self.connected = false;
        self.characteristics.clear();
        Ok(())
    }

    async fn characteristics(&mut self) -> Result<Vec<Uuid>, TransportError> {
        self.characteristics = self
            .peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == dfu_uuids::SERVICE)
            .map(|c| (c.uuid, c))
            .collect();
        Ok(self.characteristics.keys().copied().collect())
    }

    async fn subscribe(
        &mut self,
        characteristic: Uuid,
    ) -> Result<UnboundedReceiver<Vec<u8>>, TransportError> {
        let chr = self.characteristic(characteristic)?.clone();
        self.peripheral.subscribe(&chr).await.map_err(transport_err)?;
        let mut stream = self
            .peripheral
            .notifications()
            .await
            .map_err(transport_err)?;
        let (tx, rx) = unbounded_channel();
        tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == characteristic && tx.send(notification.value).is_err() {
                    break;
                }
            }
            // The stream ends when the link drops; dropping the sender
            // closes the channel and signals the disconnect.
        });
        Ok(rx)
    }

    async fn write(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError> {
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        let chr = self.characteristic(characteristic)?.clone();
        self.peripheral
            .write(&chr, value, write_type)
            .await
            .map_err(transport_err)
    }
}
