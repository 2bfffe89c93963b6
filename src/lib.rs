//! # chillbus: RS-485 bus subsystem for a refrigerated drawer appliance
//!
//! One controller drives a multi-drop half-duplex RS-485 bus carrying up to
//! thirteen drawer sensor boards (DSBs) and a single cold-cube UPS. The
//! crate provides:
//!
//! - the framed link protocol: [`crc`], [`frame`], [`port`]
//! - the bus controller with broadcast demultiplexing: [`bus`]
//! - the application-layer peer models: [`dsb`], [`cups`], with their
//!   request builders and reply decoders under [`cmd`]
//! - the cooperative single-threaded scheduler and socket front-end:
//!   [`daemon`], [`socket`], [`message`]
//! - the offline firmware programmer: [`prog`], [`hex`]
//!
//! The daemon binary is `chillbusd`; the programmer is `dsbflash`. They
//! never share the serial device at the same time.

use std::fmt;

pub mod bus;
pub mod cmd;
pub mod crc;
pub mod cups;
pub mod daemon;
pub mod dsb;
pub mod frame;
pub mod hex;
pub mod logging;
pub mod message;
pub mod port;
pub mod prog;
pub mod socket;
pub mod status;

#[cfg(test)]
pub(crate) mod testport;

pub use bus::{Bus, EventSink};
pub use frame::{Frame, LengthClass};
pub use port::{Baud, BusPort, SerialPort};

pub const VERSION_MAJOR: u8 = 2;
pub const VERSION_MINOR: u8 = 0;
pub const VERSION_PATCH: u8 = 0;

/// Errors surfaced by the bus stack.
///
/// Framing errors come out of the decoder; the peer-protocol variants are
/// raised when a reply arrives intact but violates the register map. Peers
/// log failures and leave their cached state stale; nothing at this layer
/// retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// No byte arrived before the frame deadline; partial state dropped.
    Timeout,
    /// A full frame arrived but its CRC did not match.
    Crc,
    /// Payload length is not one of 1, 2, 4 or 8 bytes.
    BadLengthClass,
    /// OS-level failure writing to the serial device.
    SerialWrite,
    /// OS-level failure reading from the serial device.
    SerialRead,
    /// Fifty unsolicited broadcasts inside one receive; yielded so other
    /// subsystems get a turn.
    TooManyBroadcasts,
    /// Reply source was not the controller return address (15).
    UnexpectedSource,
    /// Reply type did not match the request.
    UnexpectedType,
    /// Reply payload width did not match the register map.
    BadPayloadLength,
    /// Discovery reply device type inconsistent with the address plan.
    DiscoveryMismatch,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BusError::Timeout => "receive timed out",
            BusError::Crc => "frame CRC mismatch",
            BusError::BadLengthClass => "payload length is not 1, 2, 4 or 8",
            BusError::SerialWrite => "serial write failed",
            BusError::SerialRead => "serial read failed",
            BusError::TooManyBroadcasts => "too many broadcasts in one receive",
            BusError::UnexpectedSource => "reply from unexpected source address",
            BusError::UnexpectedType => "reply type does not match request",
            BusError::BadPayloadLength => "reply payload has the wrong width",
            BusError::DiscoveryMismatch => "device type does not fit the address plan",
        };
        f.write_str(s)
    }
}

impl std::error::Error for BusError {}

/// Asynchronous notifications produced by the peer state machines and
/// drained onto the event socket at the end of every scheduler tick.
#[derive(Debug, Clone)]
pub enum HalEvent {
    /// A drawer changed state (unsolicited broadcast from a DSB).
    DrawerStateChanged(dsb::DrawerEvent),
    /// A DSB reported errors; the log was drained.
    DrawerErrors { address: u8, codes: Vec<u8> },
    /// Discovery rebuilt the roster.
    DsbEnumeration(Vec<dsb::DsbSummary>),
    /// Cold-cube compressor error bitfield.
    CompressorError(u8),
    /// Cold-cube AC supply state changed.
    AcStateChanged(bool),
    /// Cold-cube firmware-OK bit dropped; catastrophic failure.
    CupsFailure,
    /// The cabinet door sensor changed.
    DoorChanged(bool),
    /// A camera produced a frame.
    ImageCaptured(daemon::CapturedFrame),
}
