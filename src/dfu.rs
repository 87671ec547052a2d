//! The DFU engine: control dialog, object transfer, image driver and
//! session orchestration.
//!
//! An update walks each image through SELECT, then per object window
//! CREATE → packet stream → CHECKSUM → EXECUTE, validating every window
//! with CRC-32 before the device commits it. All GATT writes are funneled
//! through the write serializer; control responses and packet receipts
//! arrive on the control-point notification channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::Error;
use crate::events::{DfuEvent, EventSink};
use crate::protocol::{self, Notification, ObjectKind, ObjectWindow, Request};
use crate::queue::WriteQueue;
use crate::speed::{self, SpeedPolicy};
use crate::transport::{dfu_uuids, DfuTransport, WriteKind};

/// Same-parameter attempts before the speed controller degrades.
const MAX_RETRIES: u32 = 3;
/// How long to wait for a packet receipt before proceeding without one.
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(3);
/// Settle time between the init packet and the firmware image.
const POST_INIT_PAUSE: Duration = Duration::from_millis(500);
/// Budget for the final link-drop wait; elapsed means we resolve anyway.
const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Checksum function over a byte slice, injectable to match the host stack.
pub type CrcFn = Arc<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// Tuning knobs for one driver instance.
pub struct DfuConfig {
    /// Bytes per packet-characteristic write.
    pub packet_size: usize,
    /// Packets between receipt notifications; 0 disables flow control.
    pub prn_interval: u16,
    /// Pause applied after every control response and between packets.
    pub delay: Duration,
    /// Re-upload from byte 0 even when the device reports partial progress.
    pub force_restart: bool,
    /// Retry-and-degrade on recoverable transfer errors.
    pub smart_speed: bool,
    /// Replacement for the built-in degradation ladder.
    pub speed_policy: Option<SpeedPolicy>,
    /// CRC-32 implementation; defaults to [`protocol::crc32`].
    pub crc: CrcFn,
}

impl Default for DfuConfig {
    fn default() -> Self {
        DfuConfig {
            packet_size: 20,
            prn_interval: 0,
            delay: Duration::ZERO,
            force_restart: false,
            smart_speed: true,
            speed_policy: None,
            crc: Arc::new(protocol::crc32),
        }
    }
}

/// Live counters for the image currently being transferred.
///
/// Byte counters reset at image boundaries; the speed parameters persist
/// for the whole update so a degraded transfer stays degraded.
#[derive(Debug, Clone)]
pub struct TransferState {
    pub total_bytes: usize,
    pub sent_bytes: usize,
    pub validated_bytes: usize,
    pub current_object: ObjectKind,
    pub prn_interval: u16,
    pub packet_size: usize,
    packets_since_receipt: u16,
    retries_at_speed: u32,
}

impl TransferState {
    fn new(config: &DfuConfig) -> Self {
        TransferState {
            total_bytes: 0,
            sent_bytes: 0,
            validated_bytes: 0,
            current_object: ObjectKind::Command,
            prn_interval: config.prn_interval,
            packet_size: config.packet_size,
            packets_since_receipt: 0,
            retries_at_speed: 0,
        }
    }

    fn begin_image(&mut self, kind: ObjectKind, total: usize, offset: usize) {
        self.current_object = kind;
        self.total_bytes = total;
        self.sent_bytes = offset;
        self.validated_bytes = offset;
        self.packets_since_receipt = 0;
    }
}

/// Outcome of a buttonless mode switch attempt.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ModeSwitch {
    /// The command was sent and the device dropped the link to reboot into
    /// the bootloader; re-discover it before updating.
    Rebooting,
    /// The device already exposes the bootloader characteristics.
    AlreadyInDfu,
}

/// Client-side driver for the Secure DFU protocol over one GATT peer.
///
/// A driver instance runs one `update` at a time; it borrows the peer's
/// lifetime and owns the transfer counters and notification subscription
/// for the duration of a run.
pub struct DfuDriver<T: DfuTransport> {
    transport: T,
    config: DfuConfig,
    events: EventSink,
    queue: WriteQueue,
    state: TransferState,
    notifications: Option<UnboundedReceiver<Vec<u8>>>,
}

impl<T: DfuTransport> DfuDriver<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, DfuConfig::default())
    }

    pub fn with_config(transport: T, config: DfuConfig) -> Self {
        let state = TransferState::new(&config);
        DfuDriver {
            transport,
            config,
            events: EventSink::default(),
            queue: WriteQueue::default(),
            state,
            notifications: None,
        }
    }

    pub fn events(&mut self) -> &mut EventSink {
        &mut self.events
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Current counters and speed parameters.
    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// Reboot an application-mode device into the bootloader via the
    /// buttonless characteristic, if it has one.
    pub async fn set_dfu_mode(&mut self) -> Result<ModeSwitch, Error> {
        if !self.transport.is_connected() {
            self.transport.connect().await?;
        }
        let characteristics = self.transport.characteristics().await?;
        if characteristics.contains(&dfu_uuids::BTTNLSS) {
            let mut receiver = self.transport.subscribe(dfu_uuids::BTTNLSS).await?;
            self.log("Sending buttonless DFU command, device will reboot into bootloader");
            self.queue
                .submit(
                    &mut self.transport,
                    dfu_uuids::BTTNLSS,
                    &[protocol::BUTTON_COMMAND],
                    WriteKind::WithResponse,
                )
                .await?;
            // The device acknowledges and then drops the link; channel
            // closure is the completion signal.
            let drained = async {
                while receiver.recv().await.is_some() {}
            };
            let _ = tokio::time::timeout(DISCONNECT_TIMEOUT, drained).await;
            Ok(ModeSwitch::Rebooting)
        } else if characteristics.contains(&dfu_uuids::CTRL_PT)
            && characteristics.contains(&dfu_uuids::DATA_PT)
        {
            Ok(ModeSwitch::AlreadyInDfu)
        } else {
            Err(Error::UnsupportedDevice)
        }
    }

    /// Run one complete update: the init packet, then the firmware image.
    pub async fn update(&mut self, init: &[u8], firmware: &[u8]) -> Result<(), Error> {
        let result = self.run_update(init, firmware).await;
        // Link state is per-update: drop the subscription together with any
        // queued notifications and return the serializer to idle.
        self.notifications = None;
        self.queue.reset();
        result
    }

    async fn run_update(&mut self, init: &[u8], firmware: &[u8]) -> Result<(), Error> {
        if !self.transport.is_connected() {
            self.transport.connect().await?;
        }
        let characteristics = self.transport.characteristics().await?;
        if !characteristics.contains(&dfu_uuids::CTRL_PT)
            || !characteristics.contains(&dfu_uuids::DATA_PT)
        {
            return Err(Error::MissingCharacteristics);
        }
        let receiver = self.transport.subscribe(dfu_uuids::CTRL_PT).await?;
        self.notifications = Some(receiver);
        self.state = TransferState::new(&self.config);

        if self.state.prn_interval > 0 {
            let interval = self.state.prn_interval;
            self.request(Request::SetPrn(interval)).await?;
            self.log(format!("Requesting packet receipts every {interval} packets"));
        }

        self.transfer_image(ObjectKind::Command, init).await?;
        tokio::time::sleep(POST_INIT_PAUSE).await;
        self.transfer_image(ObjectKind::Data, firmware).await?;

        self.log("Transfer complete, disconnecting");
        self.transport.disconnect().await?;
        self.wait_for_link_drop().await;
        Ok(())
    }

    /// SELECT the object, decide between skip, restart and resume, then run
    /// the windows.
    async fn transfer_image(&mut self, kind: ObjectKind, image: &[u8]) -> Result<(), Error> {
        let payload = self.request(Request::Select(kind)).await?;
        let window = ObjectWindow::parse(&payload)?;
        tracing::debug!(
            object = kind.label(),
            max_size = window.max_size,
            offset = window.offset,
            crc = window.crc,
            "selected object"
        );

        let mut offset = window.offset as usize;
        if offset > image.len() {
            self.log(format!(
                "Device reports {offset} bytes but the {} image holds {}, restarting",
                kind.label(),
                image.len()
            ));
            offset = 0;
        }

        if self.config.force_restart && offset > 0 {
            self.log(format!(
                "Force restart: discarding {offset} bytes already on the device"
            ));
            offset = 0;
        } else if kind == ObjectKind::Command
            && offset == image.len()
            && window.crc == (self.config.crc)(image)
        {
            self.log("init packet already available, skipping transfer");
            return Ok(());
        } else if offset == 0 {
            self.log(format!(
                "Starting fresh transfer of {} ({} bytes)",
                kind.label(),
                image.len()
            ));
        } else {
            self.log(format!(
                "Resuming {} transfer at offset {offset}",
                kind.label()
            ));
        }

        self.state.begin_image(kind, image.len(), offset);
        self.emit_progress();

        if image.is_empty() {
            return Ok(());
        }
        let max_size = window.max_size as usize;
        if max_size == 0 {
            return Err(Error::ProtocolViolation("device reported a zero object size"));
        }

        // Align the window start with the device's pages when resuming.
        let mut start = offset - offset % max_size;
        while start < image.len() {
            let end = usize::min(start + max_size, image.len());
            self.transfer_window_with_retry(kind, image, start, end)
                .await?;
            self.state.retries_at_speed = 0;
            start = end;
        }
        Ok(())
    }

    /// Run one window, retrying and degrading on recoverable errors.
    ///
    /// Re-entry is always at the same window start; the device discards the
    /// partial object on CREATE. The device is not re-SELECTed after a
    /// parameter change.
    async fn transfer_window_with_retry(
        &mut self,
        kind: ObjectKind,
        image: &[u8],
        start: usize,
        end: usize,
    ) -> Result<(), Error> {
        loop {
            let err = match self.transfer_window(kind, image, start, end).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if !self.config.smart_speed || !err.is_recoverable() {
                return Err(err);
            }

            self.state.retries_at_speed += 1;
            if self.state.retries_at_speed <= MAX_RETRIES {
                self.log(format!(
                    "Retrying with same parameters (Attempt {}/{})",
                    self.state.retries_at_speed, MAX_RETRIES
                ));
            } else {
                self.state.retries_at_speed = 0;
                let current = (self.state.prn_interval, self.state.packet_size);
                let next = match &self.config.speed_policy {
                    Some(policy) => policy(&err.to_string(), current.0, current.1),
                    None => speed::degrade(current.0, current.1),
                };
                match next {
                    Some(next) if next != current => {
                        self.log(format!(
                            "Lowering transfer speed: packet size {} bytes, receipt interval {}",
                            next.1, next.0
                        ));
                        self.state.prn_interval = next.0;
                        self.state.packet_size = next.1;
                    }
                    _ => return Err(err),
                }
            }

            self.queue.reset();
            if self.state.prn_interval > 0 {
                let interval = self.state.prn_interval;
                self.request(Request::SetPrn(interval)).await?;
            }
            self.state.packets_since_receipt = 0;
        }
    }

    /// CREATE one object window, stream it, verify its checksum, EXECUTE.
    async fn transfer_window(
        &mut self,
        kind: ObjectKind,
        image: &[u8],
        start: usize,
        end: usize,
    ) -> Result<(), Error> {
        self.request(Request::Create(kind, (end - start) as u32))
            .await?;
        self.state.packets_since_receipt = 0;

        let packet_size = self.state.packet_size;
        let mut pos = start;
        while pos < end {
            if self.state.prn_interval > 0
                && self.state.packets_since_receipt >= self.state.prn_interval
            {
                self.await_receipt().await?;
            }
            let chunk_end = usize::min(pos + packet_size, end);
            self.queue
                .submit(
                    &mut self.transport,
                    dfu_uuids::DATA_PT,
                    &image[pos..chunk_end],
                    WriteKind::WithoutResponse,
                )
                .await?;
            pos = chunk_end;
            self.state.packets_since_receipt += 1;
            self.state.sent_bytes = self.state.sent_bytes.max(pos);
            if !self.config.delay.is_zero() {
                tokio::time::sleep(self.config.delay).await;
            }
            self.emit_progress();
        }

        let payload = self.request(Request::GetCrc).await?;
        let (offset, device_crc) = protocol::parse_checksum(&payload)?;
        let prefix = usize::min(offset as usize, image.len());
        let local_crc = (self.config.crc)(&image[..prefix]);
        if device_crc != local_crc {
            tracing::warn!(offset, device_crc, local_crc, "checksum disagreement");
            return Err(Error::CrcMismatch { offset });
        }
        self.state.validated_bytes = self.state.validated_bytes.max(offset as usize);
        self.emit_progress();
        self.request(Request::Execute).await?;
        Ok(())
    }

    /// Send a control request and await its response.
    ///
    /// Receipt notifications arriving in between update the validated
    /// counter and are skipped; the first response must carry the opcode
    /// that was sent.
    async fn request(&mut self, request: Request) -> Result<Vec<u8>, Error> {
        let expected = request.opcode();
        let bytes = request.to_bytes();
        self.queue
            .submit(
                &mut self.transport,
                dfu_uuids::CTRL_PT,
                &bytes,
                WriteKind::WithResponse,
            )
            .await?;
        loop {
            let value = self.recv_ctrl().await?;
            match Notification::parse(&value)? {
                Notification::Receipt { offset } => self.note_receipt(offset),
                Notification::Response { request: opcode, result } => {
                    if opcode != expected {
                        return Err(Error::ProtocolViolation(
                            "response does not match the pending request",
                        ));
                    }
                    let payload = result.map_err(Error::Device)?;
                    if !self.config.delay.is_zero() {
                        tokio::time::sleep(self.config.delay).await;
                    }
                    return Ok(payload);
                }
            }
        }
    }

    /// Block until the device confirms receipt of the outstanding packets,
    /// or proceed after a soft timeout.
    async fn await_receipt(&mut self) -> Result<(), Error> {
        match self.recv_ctrl_timeout().await? {
            None => {
                self.log("Timed out waiting for a packet receipt, continuing");
                self.state.packets_since_receipt = 0;
                Ok(())
            }
            Some(value) => match Notification::parse(&value)? {
                Notification::Receipt { offset } => {
                    self.note_receipt(offset);
                    Ok(())
                }
                Notification::Response { .. } => Err(Error::ProtocolViolation(
                    "unexpected control response during data transfer",
                )),
            },
        }
    }

    async fn recv_ctrl(&mut self) -> Result<Vec<u8>, Error> {
        match self.notifications.as_mut() {
            Some(receiver) => receiver.recv().await.ok_or(Error::Disconnected),
            None => Err(Error::Disconnected),
        }
    }

    async fn recv_ctrl_timeout(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match tokio::time::timeout(RECEIPT_TIMEOUT, self.recv_ctrl()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn wait_for_link_drop(&mut self) {
        let Some(receiver) = self.notifications.as_mut() else {
            return;
        };
        let drained = async {
            while receiver.recv().await.is_some() {}
        };
        if tokio::time::timeout(DISCONNECT_TIMEOUT, drained).await.is_err() {
            tracing::warn!("no disconnect event within {DISCONNECT_TIMEOUT:?}, continuing");
        }
    }

    fn note_receipt(&mut self, offset: u32) {
        self.state.validated_bytes = self.state.validated_bytes.max(offset as usize);
        self.state.packets_since_receipt = 0;
        self.emit_progress();
    }

    fn log(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!("{message}");
        self.events.dispatch(&DfuEvent::Log { message });
    }

    fn emit_progress(&self) {
        self.events.dispatch(&DfuEvent::Progress {
            object: self.state.current_object.label(),
            total_bytes: self.state.total_bytes.max(1),
            sent_bytes: self.state.sent_bytes,
            validated_bytes: self.state.validated_bytes,
        });
    }
}
