//! Length-framed messages carried on the command and event sockets.
//!
//! Every message is a 36-byte little-endian header followed by
//! `payload_len` bytes of payload:
//!
//! | bytes | field |
//! |---|---|
//! | 0..4   | sync1 `"iv4 "` |
//! | 4..8   | sync2 `"hal\0"` |
//! | 8..10  | protocol revision (1) |
//! | 10     | message type |
//! | 11     | message subtype |
//! | 12..28 | four 32-bit immediate values |
//! | 28..32 | payload length |
//! | 32..36 | header checksum (unused, zero) |

use crate::{VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH};

pub const SYNC1: u32 = u32::from_le_bytes(*b"iv4 ");
pub const SYNC2: u32 = u32::from_le_bytes(*b"hal\0");
pub const REVISION: u16 = 1;
pub const HEADER_SIZE: usize = 36;

/// Sanity bound on inbound payloads.
pub const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Management messages.
pub mod management {
    pub const TYPE: u8 = 0x01;
    pub const INITIALIZE: u8 = 0x01;
    pub const ACK: u8 = 0xF0;
    pub const NACK: u8 = 0xFB;
}

/// Imaging messages.
pub mod image {
    pub const TYPE: u8 = 0x02;
    pub const CAPTURE_IMAGE: u8 = 0x01;
    pub const CONTINUOUS_CAPTURE: u8 = 0x02;
    pub const IMAGE_CAPTURED: u8 = 0x08;
    pub const GET_IMAGE: u8 = 0x10;
    pub const SEND_IMAGE: u8 = 0x18;
}

/// Cold-cube messages.
pub mod cups {
    pub const TYPE: u8 = 0x03;
    pub const SET_TEMPERATURE: u8 = 0x10;
    pub const GET_TEMPERATURE: u8 = 0x11;
    pub const GET_ALL_TEMPERATURES: u8 = 0x18;
    pub const SET_DEFROST_PARAMS: u8 = 0x20;
    pub const GET_DEFROST_PARAMS: u8 = 0x21;
    pub const INITIATE_DEFROST: u8 = 0x22;
    pub const INITIATE_BATTERY_TEST: u8 = 0x32;
    pub const GET_ALL_VOLTAGES: u8 = 0x38;
    pub const GET_BATTERY_PERCENT: u8 = 0x3A;
    pub const GET_STORED_TEMPERATURES: u8 = 0x40;
    pub const GET_PROBE_IDS: u8 = 0x50;
    pub const RESET: u8 = 0x60;
    pub const COMPRESSOR_ERROR: u8 = 0xB0;
    pub const FAILURE: u8 = 0xB2;
    pub const AC_STATE_CHANGED: u8 = 0xB5;
}

/// Drawer sensor board messages.
pub mod dsb {
    pub const TYPE: u8 = 0x04;
    pub const SET_BOOTLOADER_MODE: u8 = 0x04;
    pub const RESET: u8 = 0x10;
    pub const SET_GLOBAL_LOCK: u8 = 0x12;
    pub const DRAWER_OVERRIDE: u8 = 0x13;
    pub const SET_FACTORY_MODE: u8 = 0x14;
    pub const CLEAR_DRAWER_INDICES: u8 = 0x16;
    pub const ASSIGN_DRAWER_INDEX: u8 = 0x17;
    pub const DRAWER_RECALIBRATION: u8 = 0x1A;
    pub const GET_DRAWER_STATES: u8 = 0x20;
    pub const DRAWER_STATE_CHANGED: u8 = 0x22;
    pub const GET_DEBUG_DATA: u8 = 0x70;
    pub const DRAWER_ERRORS: u8 = 0xA0;
    pub const ENUMERATION: u8 = 0xA4;
}

/// Hardware messages (door sensor).
pub mod hardware {
    pub const TYPE: u8 = 0x05;
    pub const DOOR_EVENT: u8 = 0xA0;
}

/// One socket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u8,
    pub sub_type: u8,
    pub imm: [u32; 4],
    pub payload: Vec<u8>,
}

/// Header parse failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    BadSync,
    BadRevision,
    PayloadTooLarge,
}

impl Message {
    pub fn new(msg_type: u8, sub_type: u8, imm: [u32; 4], payload: Vec<u8>) -> Message {
        Message { msg_type, sub_type, imm, payload }
    }

    /// An ACK for `of`, echoing its type and subtype.
    pub fn ack(of: &Message) -> Message {
        Message::new(
            management::TYPE,
            management::ACK,
            [of.msg_type as u32, of.sub_type as u32, 0, 0],
            Vec::new(),
        )
    }

    /// A NACK for `of` with a human-readable reason in the payload.
    pub fn nack(of: &Message, reason: &str) -> Message {
        let mut payload = reason.as_bytes().to_vec();
        payload.push(0);
        Message::new(
            management::TYPE,
            management::NACK,
            [of.msg_type as u32, of.sub_type as u32, 0, 0],
            payload,
        )
    }

    /// The daemon revision packed for the Initialize reply.
    pub fn daemon_revision() -> u32 {
        ((VERSION_MAJOR as u32) << 16) | ((VERSION_MINOR as u32) << 8) | VERSION_PATCH as u32
    }

    /// Serialise header + payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&SYNC1.to_le_bytes());
        out.extend_from_slice(&SYNC2.to_le_bytes());
        out.extend_from_slice(&REVISION.to_le_bytes());
        out.push(self.msg_type);
        out.push(self.sub_type);
        for imm in self.imm {
            out.extend_from_slice(&imm.to_le_bytes());
        }
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a header, returning the payload length still to be read.
    pub fn parse_header(buf: &[u8; HEADER_SIZE]) -> Result<(Message, usize), MessageError> {
        let sync1 = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let sync2 = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if sync1 != SYNC1 || sync2 != SYNC2 {
            return Err(MessageError::BadSync);
        }
        let rev = u16::from_le_bytes([buf[8], buf[9]]);
        if rev != REVISION {
            return Err(MessageError::BadRevision);
        }
        let mut imm = [0u32; 4];
        for (n, slot) in imm.iter_mut().enumerate() {
            let at = 12 + 4 * n;
            *slot = u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        }
        let plen = u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]);
        if plen > MAX_PAYLOAD {
            return Err(MessageError::PayloadTooLarge);
        }
        let msg = Message::new(buf[10], buf[11], imm, Vec::new());
        Ok((msg, plen as usize))
    }
}
