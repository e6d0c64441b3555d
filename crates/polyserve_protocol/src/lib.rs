//! Wire protocol between the dispatcher and worker processes.
//!
//! # Frame format
//!
//! Header (24 bytes, Network Byte Order / Big Endian):
//! ```text
//! [VER:1][OP:1][RES:2][REQ_ID:16][LEN:4]
//! ```
//!
//! - VER (u8): Protocol version (0x01)
//! - OP (u8): OpCode
//! - RES (u16): Reserved for future use
//! - REQ_ID (u128): Request correlation id (UUID bytes; zero for
//!   lifecycle frames)
//! - LEN (u32): Payload length in bytes
//!
//! The payload is JSON, typed per opcode (see [`types`]). Frames travel
//! over the worker's stdin/stdout, which gives ordered delivery; the
//! length prefix gives framing.

pub mod app_config;
pub mod codec;
pub mod defaults;
pub mod error;
pub mod types;

pub use app_config::{ProxyRule, WorkerConfig};
pub use error::{ErrorKind, ProtocolError, Result};
pub use types::{ErrorPayload, ReadyPayload, WireRequest, WireResponse, WorkerStatus};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use uuid::Uuid;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Header size in bytes
pub const HEADER_SIZE: usize = 24;

/// Maximum payload size (64 MiB; a request body larger than this is a
/// dispatcher bug, not a legitimate frame)
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Protocol OpCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Unknown = 0,

    // Worker -> Dispatcher (Handshake)
    Ready = 1, // "Handler loaded. Send requests."

    // Dispatcher -> Worker (Request)
    Request = 2, // "Serve this HTTP request."

    // Worker -> Dispatcher (Completion)
    Response = 3, // "Here is the response."

    // Bidirectional (Error)
    Err = 4, // "Something went wrong."

    // Dispatcher -> Worker (Advisory)
    Idle = 5, // "Release cached resources if you like."

    // Dispatcher -> Worker (Shutdown)
    Terminate = 6, // "Run the terminate hook and exit."
}

impl OpCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(OpCode::Unknown),
            1 => Ok(OpCode::Ready),
            2 => Ok(OpCode::Request),
            3 => Ok(OpCode::Response),
            4 => Ok(OpCode::Err),
            5 => Ok(OpCode::Idle),
            6 => Ok(OpCode::Terminate),
            _ => Err(ProtocolError::InvalidOpCode(value)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Protocol header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub opcode: OpCode,
    pub reserved: u16,
    pub req_id: Uuid,
    pub payload_len: u32,
}

impl Header {
    pub fn new(opcode: OpCode, req_id: Uuid, payload_len: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            opcode,
            reserved: 0,
            req_id,
            payload_len,
        }
    }

    /// Pack header into a 24-byte buffer
    pub fn pack(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);

        cursor.write_u8(self.version)?;
        cursor.write_u8(self.opcode.as_u8())?;
        cursor.write_u16::<BigEndian>(self.reserved)?;
        cursor.write_u128::<BigEndian>(self.req_id.as_u128())?;
        cursor.write_u32::<BigEndian>(self.payload_len)?;

        Ok(buf)
    }

    /// Unpack header from a 24-byte buffer
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::HeaderTooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }

        let mut cursor = Cursor::new(&data[..HEADER_SIZE]);

        let version = cursor.read_u8()?;
        let op_raw = cursor.read_u8()?;
        let reserved = cursor.read_u16::<BigEndian>()?;
        let req_id = Uuid::from_u128(cursor.read_u128::<BigEndian>()?);
        let payload_len = cursor.read_u32::<BigEndian>()?;

        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        let opcode = OpCode::from_u8(op_raw)?;

        Ok(Self {
            version,
            opcode,
            reserved,
            req_id,
            payload_len,
        })
    }
}

/// Protocol message (header + payload)
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a new message.
    ///
    /// Returns an error if payload exceeds [`MAX_PAYLOAD_SIZE`].
    pub fn new(opcode: OpCode, req_id: Uuid, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header = Header::new(opcode, req_id, payload.len() as u32);
        Ok(Self { header, payload })
    }

    /// Create a lifecycle message (no correlation id, no payload).
    pub fn lifecycle(opcode: OpCode) -> Self {
        Self {
            header: Header::new(opcode, Uuid::nil(), 0),
            payload: Vec::new(),
        }
    }

    /// Create a message with a JSON-serialized payload.
    pub fn with_payload<T: serde::Serialize>(
        opcode: OpCode,
        req_id: Uuid,
        payload: &T,
    ) -> Result<Self> {
        let bytes = serde_json::to_vec(payload)?;
        Self::new(opcode, req_id, bytes)
    }

    /// Deserialize the JSON payload.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Pack into one contiguous frame (header followed by payload).
    pub fn pack(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.pack()?);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Unpack from one contiguous frame.
    pub fn unpack(data: &[u8]) -> Result<Self> {
        let header = Header::unpack(data)?;
        let payload = data[HEADER_SIZE..].to_vec();

        if payload.len() != header.payload_len as usize {
            return Err(ProtocolError::PayloadLengthMismatch {
                expected: header.payload_len as usize,
                got: payload.len(),
            });
        }

        Ok(Self { header, payload })
    }
}
