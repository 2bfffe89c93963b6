//! Frame encode/decode for the drawer bus.
//!
//! A frame is 3..10 bytes on the wire:
//!
//! `HDR | TYPE | PAYLOAD[1|2|4|8] | CRC`
//!
//! * HDR: bit 7 = read/write (1 = read), bits 6..5 = length class,
//!   bits 4..0 = peer address
//! * TYPE: request types in 0x00..0x7F, replies are the request OR'd with 0x80
//! * PAYLOAD: exactly the width named by the length class
//! * CRC: [`crc8`] over HDR, TYPE and PAYLOAD
//!
//! The decoder is a per-byte state machine with an inter-byte deadline: the
//! clock restarts every time a byte is consumed, and a stalled frame is
//! discarded with [`BusError::Timeout`].

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::BusError;
use crate::crc::crc8;
use crate::port::BusPort;

/// First drawer sensor board address.
pub const DSB_FIRST_ADDR: u8 = 1;
/// Last drawer sensor board address.
pub const DSB_LAST_ADDR: u8 = 13;
/// The single cold-cube UPS controller.
pub const CUPS_ADDR: u8 = 14;
/// Source address of every reply ("to controller").
pub const CONTROLLER_ADDR: u8 = 15;
/// Firmware download target, used only by the programmer.
pub const DOWNLOAD_ADDR: u8 = 30;
/// Write-only broadcast sink; every peer listens.
pub const BROADCAST_ADDR: u8 = 31;

/// Header bit 7: this frame is a read request.
pub const READ_BIT: u8 = 0x80;

/// Delay between input-queue polls while waiting for the next byte.
const RECV_POLL: Duration = Duration::from_micros(500);

/// Payload width named by the two-bit header field.
///
/// A three-byte payload does not exist on the wire; the programmer pads it
/// to four before the frame layer sees it. `Eight` doubles as the HEX-record
/// class: the programmer stamps it on records of any length and the DSB
/// bootloader accepts the full record for that one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthClass {
    One = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
}

impl LengthClass {
    /// Class for an exact payload length. Only 1, 2, 4 and 8 exist.
    pub fn from_len(len: usize) -> Option<LengthClass> {
        match len {
            1 => Some(LengthClass::One),
            2 => Some(LengthClass::Two),
            4 => Some(LengthClass::Four),
            8 => Some(LengthClass::Eight),
            _ => None,
        }
    }

    /// Class from the two header bits (6..5).
    pub fn from_bits(bits: u8) -> LengthClass {
        match bits & 0x03 {
            0 => LengthClass::One,
            1 => LengthClass::Two,
            2 => LengthClass::Four,
            _ => LengthClass::Eight,
        }
    }

    /// Payload width in bytes.
    pub fn len(self) -> usize {
        match self {
            LengthClass::One => 1,
            LengthClass::Two => 2,
            LengthClass::Four => 4,
            LengthClass::Eight => 8,
        }
    }

    /// The two-bit field value.
    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// A decoded bus frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub addr: u8,
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

/// Encode a frame. The payload length must be 1, 2, 4 or 8.
pub fn encode(addr: u8, msg_type: u8, read: bool, payload: &[u8]) -> Result<Vec<u8>, BusError> {
    let class = LengthClass::from_len(payload.len()).ok_or(BusError::BadLengthClass)?;
    let mut out = Vec::with_capacity(payload.len() + 3);
    let hdr = if read { READ_BIT } else { 0 } | (class.bits() << 5) | (addr & 0x1F);
    out.push(hdr);
    out.push(msg_type);
    out.extend_from_slice(payload);
    out.push(crc8(&out));
    Ok(out)
}

/// Encode a firmware HEX record to the download address.
///
/// The header always carries [`LengthClass::Eight`] even though the record
/// is usually longer; the bootloader consumes the record to its CRC. Only
/// `dsbflash` sends this shape.
pub fn encode_hex_record(msg_type: u8, record: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(record.len() + 3);
    out.push((LengthClass::Eight.bits() << 5) | DOWNLOAD_ADDR);
    out.push(msg_type);
    out.extend_from_slice(record);
    out.push(crc8(&out));
    out
}

enum RecvState {
    WaitHeader,
    WaitType,
    ReadPayload,
    WaitCrc,
}

/// Decode one frame from `port` within `budget`.
///
/// The budget is an inter-byte deadline; a zero budget consumes only bytes
/// that are already queued and times out as soon as the queue runs dry.
/// Partial state is dropped on timeout.
///
/// Resynchronisation: bytes with the read bit set are reply headers, which
/// only the controller should ever see on a healthy bus. They are discarded
/// (and logged) rather than parsed, as are reserved addresses, so a glitch
/// cannot wedge the state machine.
pub fn decode<P: BusPort>(port: &mut P, budget: Duration) -> Result<Frame, BusError> {
    let mut state = RecvState::WaitHeader;
    let mut raw: Vec<u8> = Vec::with_capacity(10);
    let mut payload: Vec<u8> = Vec::with_capacity(8);
    let mut addr = 0u8;
    let mut msg_type = 0u8;
    let mut want = 0usize;
    let mut last_byte = Instant::now();

    loop {
        let avail = port.bytes_available().map_err(|e| {
            warn!("serial input-queue query failed: {e}");
            BusError::SerialRead
        })?;

        if avail == 0 {
            if budget.is_zero() || last_byte.elapsed() >= budget {
                return Err(BusError::Timeout);
            }
            std::thread::sleep(RECV_POLL);
            continue;
        }

        let byte = port.read_one().map_err(|e| {
            warn!("serial read failed: {e}");
            BusError::SerialRead
        })?;
        last_byte = Instant::now();

        match state {
            RecvState::WaitHeader => {
                if byte & READ_BIT != 0 {
                    // Reply header looped back at us; only the controller
                    // transmits these. Discard and resynchronise.
                    debug!("discarding stray read-header byte {byte:#04x}");
                    continue;
                }
                let a = byte & 0x1F;
                if a == 0 || (16..BROADCAST_ADDR).contains(&a) {
                    debug!("discarding header with reserved address {a}");
                    continue;
                }
                addr = a;
                want = LengthClass::from_bits(byte >> 5).len();
                raw.push(byte);
                state = RecvState::WaitType;
            }
            RecvState::WaitType => {
                raw.push(byte);
                msg_type = byte;
                state = RecvState::ReadPayload;
            }
            RecvState::ReadPayload => {
                raw.push(byte);
                payload.push(byte);
                if payload.len() == want {
                    state = RecvState::WaitCrc;
                }
            }
            RecvState::WaitCrc => {
                let expect = crc8(&raw);
                if byte != expect {
                    warn!(
                        "frame CRC mismatch from addr {addr} type {msg_type:#04x}: \
                         got {byte:#04x} want {expect:#04x}"
                    );
                    return Err(BusError::Crc);
                }
                return Ok(Frame { addr, msg_type, payload });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testport::ScriptPort;
    use proptest::prelude::*;

    fn script(bytes: &[u8]) -> ScriptPort {
        let mut port = ScriptPort::new();
        port.queue(bytes);
        port
    }

    #[test]
    fn encode_status_request() {
        // Read request, one payload byte, address 3.
        let bytes = encode(3, 0x03, true, &[0x00]).unwrap();
        assert_eq!(bytes, vec![0x83, 0x03, 0x00, 0xD3]);
    }

    #[test]
    fn encode_class_bits() {
        assert_eq!(encode(1, 0x01, false, &[0u8; 1]).unwrap()[0], 0x01);
        assert_eq!(encode(1, 0x01, false, &[0u8; 2]).unwrap()[0], 0x21);
        assert_eq!(encode(1, 0x01, false, &[0u8; 4]).unwrap()[0], 0x41);
        assert_eq!(encode(1, 0x01, false, &[0u8; 8]).unwrap()[0], 0x61);
    }

    #[test]
    fn encode_rejects_odd_lengths() {
        assert_eq!(encode(1, 0x01, false, &[]), Err(BusError::BadLengthClass));
        assert_eq!(encode(1, 0x01, false, &[0u8; 3]), Err(BusError::BadLengthClass));
        assert_eq!(encode(1, 0x01, false, &[0u8; 5]), Err(BusError::BadLengthClass));
        assert_eq!(encode(1, 0x01, false, &[0u8; 9]), Err(BusError::BadLengthClass));
    }

    #[test]
    fn hex_record_class_is_eight() {
        let rec = [0x15u8; 21];
        let bytes = encode_hex_record(0x77, &rec);
        assert_eq!(bytes[0], 0x60 | DOWNLOAD_ADDR);
        assert_eq!(bytes[1], 0x77);
        assert_eq!(&bytes[2..23], &rec[..]);
        assert_eq!(bytes[23], crc8(&bytes[..23]));
    }

    #[test]
    fn decode_roundtrip() {
        let wire = encode(CONTROLLER_ADDR, 0x83, false, &[0x11, 0x22, 0x33, 0x44]).unwrap();
        let mut port = script(&wire);
        let frame = decode(&mut port, Duration::from_millis(100)).unwrap();
        assert_eq!(frame.addr, CONTROLLER_ADDR);
        assert_eq!(frame.msg_type, 0x83);
        assert_eq!(frame.payload, vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn decode_skips_noise_before_header() {
        // A stray read-header byte and a reserved-address byte before a
        // valid frame must both be eaten.
        let mut wire = vec![0x85, 0x10];
        wire.extend(encode(CONTROLLER_ADDR, 0x84, false, &[0x05, 0x7F]).unwrap());
        let mut port = script(&wire);
        let frame = decode(&mut port, Duration::from_millis(100)).unwrap();
        assert_eq!(frame.addr, CONTROLLER_ADDR);
        assert_eq!(frame.payload, vec![0x05, 0x7F]);
    }

    #[test]
    fn decode_crc_failure() {
        let mut wire = encode(CONTROLLER_ADDR, 0x83, false, &[0x00]).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        let mut port = script(&wire);
        assert_eq!(decode(&mut port, Duration::from_millis(100)), Err(BusError::Crc));
    }

    #[test]
    fn decode_zero_budget_times_out_immediately() {
        let mut port = script(&[]);
        assert_eq!(decode(&mut port, Duration::ZERO), Err(BusError::Timeout));
    }

    #[test]
    fn decode_times_out_mid_frame() {
        // Header and type only; the payload never arrives.
        let mut port = script(&[0x2F, 0x83]);
        assert_eq!(
            decode(&mut port, Duration::from_millis(5)),
            Err(BusError::Timeout)
        );
    }

    proptest! {
        #[test]
        fn encode_decode_roundtrip(
            addr in 1u8..=14,
            msg_type in 0u8..=0x7F,
            len in prop_oneof![Just(1usize), Just(2usize), Just(4usize), Just(8usize)],
            seed in any::<u64>(),
        ) {
            let payload: Vec<u8> =
                (0..len).map(|i| (seed >> (8 * (i % 8))) as u8).collect();
            let wire = encode(addr, msg_type, false, &payload).unwrap();
            prop_assert_eq!(wire.len(), payload.len() + 3);
            let mut port = script(&wire);
            let frame = decode(&mut port, Duration::from_millis(50)).unwrap();
            prop_assert_eq!(frame.addr, addr);
            prop_assert_eq!(frame.msg_type, msg_type);
            prop_assert_eq!(frame.payload, payload);
        }
    }
}
