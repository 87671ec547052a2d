//! In-memory Secure DFU device for exercising the driver end to end.
//!
//! Models the bootloader's object banks (committed bytes survive EXECUTE,
//! pending bytes are discarded on CREATE), receipt notifications, and a set
//! of fault injections: deterministic busy errors, MTU enforcement,
//! checksum corruption, extended-error responses, and link drops.

use std::collections::HashMap;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use nrf_secure_dfu::protocol::{crc32, OBJ_COMMAND};
use nrf_secure_dfu::transport::{dfu_uuids, DfuTransport, TransportError, WriteKind};

pub const BUSY_MSG: &str = "GATT operation already in progress";

/// One write as the device saw it, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Control(Vec<u8>),
    Packet(Vec<u8>),
    Button(Vec<u8>),
}

#[derive(Default)]
struct ObjectBank {
    received: Vec<u8>,
    committed: usize,
}

impl ObjectBank {
    fn flash(&self) -> &[u8] {
        &self.received[..self.committed]
    }
}

pub struct MockDevice {
    pub mtu: usize,
    pub max_object_size: usize,
    pub has_dfu: bool,
    pub has_button: bool,

    // Fault injection.
    /// Every Nth write attempt reports busy (and is accepted on retry).
    pub busy_every: Option<u64>,
    /// Corrupt this many checksum responses before answering honestly.
    pub fail_checksums: u32,
    /// Answer the next CREATE with an extended error of this code.
    pub fail_create_extended: Option<u8>,
    /// Drop the link after this many accepted packet writes.
    pub drop_link_after_packets: Option<u64>,

    connected: bool,
    command: ObjectBank,
    data: ObjectBank,
    current_type: u8,
    prn: u16,
    writes_since_receipt: u16,
    subscribers: HashMap<Uuid, UnboundedSender<Vec<u8>>>,

    write_attempts: u64,
    busy_injected: u64,
    accepted_packets: u64,
    records: Vec<Record>,
}

impl MockDevice {
    pub fn new() -> Self {
        MockDevice {
            mtu: 512,
            max_object_size: 4096,
            has_dfu: true,
            has_button: false,
            busy_every: None,
            fail_checksums: 0,
            fail_create_extended: None,
            drop_link_after_packets: None,
            connected: false,
            command: ObjectBank::default(),
            data: ObjectBank::default(),
            current_type: OBJ_COMMAND,
            prn: 0,
            writes_since_receipt: 0,
            subscribers: HashMap::new(),
            write_attempts: 0,
            busy_injected: 0,
            accepted_packets: 0,
            records: Vec::new(),
        }
    }

    /// Pretend a previous run already delivered and executed this init
    /// packet.
    pub fn preload_init(&mut self, init: &[u8]) {
        self.command.received = init.to_vec();
        self.command.committed = init.len();
    }

    /// Pretend a previous run delivered `received` firmware bytes, of which
    /// the first `committed` were executed.
    pub fn preload_firmware(&mut self, received: &[u8], committed: usize) {
        assert!(committed <= received.len());
        self.data.received = received.to_vec();
        self.data.committed = committed;
    }

    pub fn init_flash(&self) -> &[u8] {
        self.command.flash()
    }

    pub fn firmware_flash(&self) -> &[u8] {
        self.data.flash()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn busy_injected(&self) -> u64 {
        self.busy_injected
    }

    pub fn write_attempts(&self) -> u64 {
        self.write_attempts
    }

    /// Sizes of the data objects created, in order.
    pub fn data_creates(&self) -> Vec<u32> {
        self.records
            .iter()
            .filter_map(|r| match r {
                Record::Control(bytes) if bytes.len() == 6 && bytes[0] == 0x01 && bytes[1] == 0x02 => {
                    Some(u32::from_le_bytes(bytes[2..6].try_into().unwrap()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn command_create_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, Record::Control(bytes) if bytes.len() == 6 && bytes[0] == 0x01 && bytes[1] == 0x01))
            .count()
    }

    fn bank(&mut self, object_type: u8) -> &mut ObjectBank {
        if object_type == OBJ_COMMAND {
            &mut self.command
        } else {
            &mut self.data
        }
    }

    fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        if let Some(tx) = self.subscribers.get(&characteristic) {
            let _ = tx.send(value);
        }
    }

    fn respond(&self, opcode: u8, payload: &[u8]) {
        let mut value = vec![0x60, opcode, 0x01];
        value.extend_from_slice(payload);
        self.notify(dfu_uuids::CTRL_PT, value);
    }

    fn drop_link(&mut self) {
        self.connected = false;
        self.subscribers.clear();
    }

    fn handle_control(&mut self, value: &[u8]) {
        match value[0] {
            // CREATE
            0x01 => {
                if let Some(code) = self.fail_create_extended.take() {
                    self.notify(dfu_uuids::CTRL_PT, vec![0x60, 0x01, 0x0B, code]);
                    return;
                }
                let object_type = value[1];
                self.current_type = object_type;
                // A new command object replaces the single init slot; a new
                // data object discards only the unexecuted tail.
                let bank = self.bank(object_type);
                if object_type == OBJ_COMMAND {
                    bank.received.clear();
                    bank.committed = 0;
                } else {
                    let committed = bank.committed;
                    bank.received.truncate(committed);
                }
                self.writes_since_receipt = 0;
                self.respond(0x01, &[]);
            }
            // SET_PRN
            0x02 => {
                self.prn = u16::from_le_bytes(value[1..3].try_into().unwrap());
                self.writes_since_receipt = 0;
                self.respond(0x02, &[]);
            }
            // CHECKSUM
            0x03 => {
                let bank = self.bank(self.current_type);
                let offset = bank.received.len() as u32;
                let mut crc = crc32(&bank.received);
                if self.fail_checksums > 0 {
                    self.fail_checksums -= 1;
                    crc ^= 0x5A5A_5A5A;
                }
                let mut payload = offset.to_le_bytes().to_vec();
                payload.extend_from_slice(&crc.to_le_bytes());
                self.respond(0x03, &payload);
            }
            // EXECUTE
            0x04 => {
                let object_type = self.current_type;
                let bank = self.bank(object_type);
                bank.committed = bank.received.len();
                if object_type == OBJ_COMMAND {
                    // Executing an init packet starts a new firmware
                    // transfer from scratch.
                    self.data.received.clear();
                    self.data.committed = 0;
                }
                self.respond(0x04, &[]);
            }
            // SELECT
            0x06 => {
                let object_type = value[1];
                self.current_type = object_type;
                let max_size = self.max_object_size as u32;
                let bank = self.bank(object_type);
                let offset = bank.received.len() as u32;
                let crc = crc32(&bank.received);
                let mut payload = max_size.to_le_bytes().to_vec();
                payload.extend_from_slice(&offset.to_le_bytes());
                payload.extend_from_slice(&crc.to_le_bytes());
                self.respond(0x06, &payload);
            }
            other => panic!("mock device got unknown control opcode {other:#04x}"),
        }
    }

    fn handle_packet(&mut self, value: &[u8]) {
        let object_type = self.current_type;
        self.bank(object_type).received.extend_from_slice(value);
        self.accepted_packets += 1;
        if let Some(limit) = self.drop_link_after_packets {
            if self.accepted_packets >= limit {
                self.drop_link();
                return;
            }
        }
        if self.prn > 0 {
            self.writes_since_receipt += 1;
            if self.writes_since_receipt >= self.prn {
                self.writes_since_receipt = 0;
                let offset = self.bank(object_type).received.len() as u32;
                let mut value = vec![0x03];
                value.extend_from_slice(&offset.to_le_bytes());
                self.notify(dfu_uuids::CTRL_PT, value);
            }
        }
    }

    fn handle_button(&mut self, value: &[u8]) {
        assert_eq!(value, [0x01]);
        self.notify(dfu_uuids::BTTNLSS, vec![0x20, 0x01, 0x01]);
        // The device reboots into the bootloader.
        self.drop_link();
    }
}

impl DfuTransport for MockDevice {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.drop_link();
        Ok(())
    }

    async fn characteristics(&mut self) -> Result<Vec<Uuid>, TransportError> {
        if !self.connected {
            return Err(TransportError::new("peripheral disconnected"));
        }
        let mut uuids = Vec::new();
        if self.has_dfu {
            uuids.push(dfu_uuids::CTRL_PT);
            uuids.push(dfu_uuids::DATA_PT);
        }
        if self.has_button {
            uuids.push(dfu_uuids::BTTNLSS);
        }
        Ok(uuids)
    }

    async fn subscribe(
        &mut self,
        characteristic: Uuid,
    ) -> Result<UnboundedReceiver<Vec<u8>>, TransportError> {
        if !self.connected {
            return Err(TransportError::new("peripheral disconnected"));
        }
        let (tx, rx) = unbounded_channel();
        self.subscribers.insert(characteristic, tx);
        Ok(rx)
    }

    async fn write(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
        _kind: WriteKind,
    ) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::new("peripheral disconnected"));
        }
        self.write_attempts += 1;
        if let Some(n) = self.busy_every {
            if self.write_attempts % n == 0 {
                self.busy_injected += 1;
                return Err(TransportError::new(BUSY_MSG));
            }
        }
        if value.len() > self.mtu {
            return Err(TransportError::new(format!(
                "Attempt to write {} bytes which is longer than maximum length of {}",
                value.len(),
                self.mtu
            )));
        }
        match characteristic {
            c if c == dfu_uuids::CTRL_PT => {
                self.records.push(Record::Control(value.to_vec()));
                self.handle_control(value);
            }
            c if c == dfu_uuids::DATA_PT => {
                self.records.push(Record::Packet(value.to_vec()));
                self.handle_packet(value);
            }
            c if c == dfu_uuids::BTTNLSS => {
                self.records.push(Record::Button(value.to_vec()));
                self.handle_button(value);
            }
            other => {
                return Err(TransportError::new(format!(
                    "unknown characteristic {other}"
                )))
            }
        }
        Ok(())
    }
}
