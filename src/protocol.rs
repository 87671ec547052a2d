//! Secure DFU wire protocol: opcodes, result codes, request encoding and
//! notification decoding.
//!
//! Control requests are an opcode byte, an optional object-type byte, and a
//! little-endian parameter block. Responses arrive as notifications of the
//! form `0x60 <opcode> <result> [payload]`; packet receipt notifications use
//! the alternate header `0x03 <u32 offset>`.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::Error;

pub const OBJ_COMMAND: u8 = 0x01;
pub const OBJ_DATA: u8 = 0x02;

/// Header byte of a control response notification.
pub const RESPONSE_HEADER: u8 = 0x60;
/// Header byte of a packet receipt notification.
pub const RECEIPT_HEADER: u8 = 0x03;
/// Single-byte command written to the buttonless characteristic to reboot
/// an application-mode device into the bootloader.
pub const BUTTON_COMMAND: u8 = 0x01;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpCode {
    ProtocolVersion = 0x00,
    ObjectCreate = 0x01,
    ReceiptNotifSet = 0x02,
    CrcGet = 0x03,
    ObjectExecute = 0x04,
    ObjectSelect = 0x06,
    MtuGet = 0x07,
    ObjectWrite = 0x08,
    Ping = 0x09,
    HardwareVersion = 0x0A,
    FirmwareVersion = 0x0B,
    Abort = 0x0C,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    Invalid = 0x00,
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    ExtError = 0x0B,
}

impl ResponseCode {
    fn description(self) -> &'static str {
        match self {
            ResponseCode::Invalid => "Invalid opcode",
            ResponseCode::Success => "Success",
            ResponseCode::OpCodeNotSupported => "Opcode not supported",
            ResponseCode::InvalidParameter => "Invalid parameter",
            ResponseCode::InsufficientResources => "Out of memory",
            ResponseCode::InvalidObject => "Invalid object",
            ResponseCode::UnsupportedType => "Invalid type",
            ResponseCode::OperationNotPermitted => "Wrong state",
            ResponseCode::OperationFailed => "Operation failed",
            ResponseCode::ExtError => "Extended error",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ExtendedError {
    NoError = 0x00,
    InvalidErrorCode = 0x01,
    WrongCommandFormat = 0x02,
    UnknownCommand = 0x03,
    InitCommandInvalid = 0x04,
    FwVersionFailure = 0x05,
    HwVersionFailure = 0x06,
    SdVersionFailure = 0x07,
    SignatureMissing = 0x08,
    WrongHashType = 0x09,
    HashFailed = 0x0A,
    WrongSignatureType = 0x0B,
    VerificationFailed = 0x0C,
    InsufficientSpace = 0x0D,
}

impl ExtendedError {
    fn description(self) -> &'static str {
        match self {
            ExtendedError::NoError => "No error",
            ExtendedError::InvalidErrorCode => "Invalid error code",
            ExtendedError::WrongCommandFormat => "Wrong command format",
            ExtendedError::UnknownCommand => "Unknown command",
            ExtendedError::InitCommandInvalid => "Init command invalid",
            ExtendedError::FwVersionFailure => "Firmware version failure",
            ExtendedError::HwVersionFailure => "Hardware version failure",
            ExtendedError::SdVersionFailure => "Softdevice version failure",
            ExtendedError::SignatureMissing => "Signature missing",
            ExtendedError::WrongHashType => "Wrong hash type",
            ExtendedError::HashFailed => "Hash failed",
            ExtendedError::WrongSignatureType => "Wrong signature type",
            ExtendedError::VerificationFailed => "CRC mismatch",
            ExtendedError::InsufficientSpace => "Insufficient space",
        }
    }
}

/// A non-success result code reported by the peer, with the extended error
/// byte when the result was `0x0B`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DeviceError {
    pub code: u8,
    pub extended: Option<u8>,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.extended {
            Some(ext) => {
                let description = ExtendedError::try_from(ext)
                    .map(ExtendedError::description)
                    .unwrap_or("Unknown extended error");
                write!(f, "Error {ext:#04x}: {description}")
            }
            None => {
                let description = ResponseCode::try_from(self.code)
                    .map(ResponseCode::description)
                    .unwrap_or("Unknown error");
                write!(f, "Error {:#04x}: {description}", self.code)
            }
        }
    }
}

/// The two kinds of DFU object, selecting the init-packet or firmware slot.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ObjectKind {
    Command,
    Data,
}

impl ObjectKind {
    pub fn label(self) -> &'static str {
        match self {
            ObjectKind::Command => "init",
            ObjectKind::Data => "firmware",
        }
    }

    pub fn type_byte(self) -> u8 {
        match self {
            ObjectKind::Command => OBJ_COMMAND,
            ObjectKind::Data => OBJ_DATA,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Request {
    Create(ObjectKind, u32),
    SetPrn(u16),
    GetCrc,
    Execute,
    Select(ObjectKind),
}

impl Request {
    pub fn opcode(&self) -> OpCode {
        match self {
            Request::Create(..) => OpCode::ObjectCreate,
            Request::SetPrn(_) => OpCode::ReceiptNotifSet,
            Request::GetCrc => OpCode::CrcGet,
            Request::Execute => OpCode::ObjectExecute,
            Request::Select(_) => OpCode::ObjectSelect,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = vec![self.opcode().into()];
        match self {
            Request::Create(kind, len) => {
                bytes.push(kind.type_byte());
                bytes.extend_from_slice(&len.to_le_bytes());
            }
            Request::SetPrn(interval) => {
                bytes.extend_from_slice(&interval.to_le_bytes());
            }
            Request::GetCrc | Request::Execute => {}
            Request::Select(kind) => {
                bytes.push(kind.type_byte());
            }
        }
        bytes
    }
}

/// The `(max_size, offset, crc)` triple reported by SELECT for an object.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ObjectWindow {
    pub max_size: u32,
    pub offset: u32,
    pub crc: u32,
}

impl ObjectWindow {
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() < 12 {
            return Err(Error::ProtocolViolation("truncated select response"));
        }
        Ok(ObjectWindow {
            max_size: u32le(payload, 0),
            offset: u32le(payload, 4),
            crc: u32le(payload, 8),
        })
    }
}

/// Parse a CHECKSUM response payload into `(offset, crc)`.
pub fn parse_checksum(payload: &[u8]) -> Result<(u32, u32), Error> {
    if payload.len() < 8 {
        return Err(Error::ProtocolViolation("truncated checksum response"));
    }
    Ok((u32le(payload, 0), u32le(payload, 4)))
}

/// A decoded control-point notification.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Notification {
    /// Packet receipt: the device has validated `offset` bytes so far.
    Receipt { offset: u32 },
    /// Response to a control request.
    Response {
        request: OpCode,
        result: Result<Vec<u8>, DeviceError>,
    },
}

impl Notification {
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        match bytes.first() {
            Some(&RECEIPT_HEADER) => {
                if bytes.len() < 5 {
                    return Err(Error::ProtocolViolation("truncated receipt notification"));
                }
                Ok(Notification::Receipt {
                    offset: u32le(bytes, 1),
                })
            }
            Some(&RESPONSE_HEADER) => {
                if bytes.len() < 3 {
                    return Err(Error::ProtocolViolation("truncated control response"));
                }
                let request = OpCode::try_from(bytes[1])
                    .map_err(|_| Error::ProtocolViolation("unknown opcode in control response"))?;
                let result = match bytes[2] {
                    code if code == ResponseCode::Success as u8 => Ok(bytes[3..].to_vec()),
                    code if code == ResponseCode::ExtError as u8 => Err(DeviceError {
                        code,
                        extended: bytes.get(3).copied(),
                    }),
                    code => Err(DeviceError {
                        code,
                        extended: None,
                    }),
                };
                Ok(Notification::Response { request, result })
            }
            _ => Err(Error::ProtocolViolation("Unrecognised control response")),
        }
    }
}

fn u32le(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

/// CRC-32 (IEEE 802.3), the checksum the bootloader reports.
pub fn crc32(buf: &[u8]) -> u32 {
    crc32fast::hash(buf)
}
