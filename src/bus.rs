//! Bus controller: single-outstanding request/reply with broadcast
//! demultiplexing.
//!
//! The controller owns the serial transport exclusively. Peers formulate
//! requests and consume replies through it; unsolicited broadcast events
//! observed while waiting for a reply are dispatched to the [`EventSink`]
//! *before* the reply is returned, so an event semantically happened before
//! the reply's contents are acted on.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::BusError;
use crate::cmd::cmd_dsb;
use crate::frame::{self, BROADCAST_ADDR, Frame};
use crate::port::BusPort;

/// Default per-request deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);
/// Per-frame budget of the scheduler's opportunistic drain.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(5);
/// Broadcast budget of a single receive before yielding.
pub const BROADCASTS_PER_RECEIVE: usize = 50;
/// Consecutive CRC failures tolerated inside one drain tick.
const DRAIN_CRC_LIMIT: u32 = 10;

/// Capability for routing unsolicited broadcast events to their consumer.
///
/// The DSB subsystem owns the implementation; the controller only knows
/// this handle, which keeps the two from referencing each other.
pub trait EventSink {
    /// A drawer state-change broadcast (type 0x99) arrived.
    fn on_drawer_event(&mut self, payload: &[u8]);
    /// A self-assign broadcast (type 0x9A) arrived.
    fn on_self_assign(&mut self);
}

/// A sink that drops everything; used by the programmer, whose peers are
/// silenced in bootloader mode.
pub struct NullSink;

impl EventSink for NullSink {
    fn on_drawer_event(&mut self, _payload: &[u8]) {}
    fn on_self_assign(&mut self) {}
}

/// Running counters, dumped after discovery and on demand.
#[derive(Debug, Default, Clone, Copy)]
pub struct BusStats {
    pub frames_written: u64,
    pub replies: u64,
    pub broadcasts_seen: u64,
    pub crc_failures: u64,
    pub timeouts: u64,
    pub write_failures: u64,
}

/// The bus controller. At most one request is outstanding at any instant.
pub struct Bus<P> {
    port: P,
    stats: BusStats,
    jitter: u32,
}

impl<P: BusPort> Bus<P> {
    pub fn new(port: P) -> Bus<P> {
        // The jitter state only decorrelates broadcast repeats on the wire.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0x5EED_1234);
        Bus { port, stats: BusStats::default(), jitter: seed | 1 }
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    #[cfg(test)]
    pub(crate) fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn log_stats(&self) {
        let s = &self.stats;
        info!(
            "bus stats - written: {} replies: {} broadcasts: {} crc: {} timeouts: {} wfail: {}",
            s.frames_written,
            s.replies,
            s.broadcasts_seen,
            s.crc_failures,
            s.timeouts,
            s.write_failures,
        );
    }

    /// 5..20 ms gap between broadcast repeats (xorshift).
    fn gap(&mut self) -> Duration {
        let mut x = self.jitter;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.jitter = x;
        Duration::from_millis(5 + (x % 15) as u64)
    }

    /// Encode and write one frame. Broadcasts are written three times with
    /// a randomised gap; every repeated delivery is idempotent for the
    /// message types that get broadcast.
    pub fn send(
        &mut self,
        addr: u8,
        msg_type: u8,
        read: bool,
        payload: &[u8],
    ) -> Result<(), BusError> {
        let wire = frame::encode(addr, msg_type, read, payload)?;
        let repeats = if addr == BROADCAST_ADDR { 3 } else { 1 };
        debug!(
            "send addr {addr} type {msg_type:#04x} read {read} len {} x{repeats}",
            payload.len()
        );
        for n in 0..repeats {
            if n > 0 {
                std::thread::sleep(self.gap());
            }
            self.port.write(&wire).map_err(|e| {
                warn!("serial write failed (addr {addr} type {msg_type:#04x}): {e}");
                self.stats.write_failures += 1;
                BusError::SerialWrite
            })?;
            self.stats.frames_written += 1;
        }
        Ok(())
    }

    /// Write one firmware HEX record to the download address. The record
    /// travels under the 8-byte length class regardless of its real length;
    /// a 3-byte record is padded to 4 first. Programmer only.
    pub fn send_hex_record(&mut self, record: &[u8]) -> Result<(), BusError> {
        let wire = match record.len() {
            1 | 2 | 4 => {
                frame::encode(frame::DOWNLOAD_ADDR, cmd_dsb::HEX_RECORD, false, record)?
            }
            3 => {
                let mut padded = [0u8; 4];
                padded[..3].copy_from_slice(record);
                frame::encode(frame::DOWNLOAD_ADDR, cmd_dsb::HEX_RECORD, false, &padded)?
            }
            _ => frame::encode_hex_record(cmd_dsb::HEX_RECORD, record),
        };
        self.port.write(&wire).map_err(|e| {
            warn!("serial write failed (hex record): {e}");
            self.stats.write_failures += 1;
            BusError::SerialWrite
        })?;
        self.stats.frames_written += 1;
        Ok(())
    }

    /// Receive one solicited frame, dispatching any broadcasts that arrive
    /// first. Bounded to [`BROADCASTS_PER_RECEIVE`] events so a chattering
    /// bus cannot starve the rest of the daemon.
    pub fn receive(
        &mut self,
        sink: &mut dyn EventSink,
        budget: Duration,
    ) -> Result<Frame, BusError> {
        for _ in 0..BROADCASTS_PER_RECEIVE {
            let frame = frame::decode(&mut self.port, budget).map_err(|e| {
                match e {
                    BusError::Crc => self.stats.crc_failures += 1,
                    BusError::Timeout => self.stats.timeouts += 1,
                    _ => {}
                }
                e
            })?;

            if frame.addr != BROADCAST_ADDR {
                self.stats.replies += 1;
                return Ok(frame);
            }

            self.stats.broadcasts_seen += 1;
            match frame.msg_type {
                cmd_dsb::DRAWER_STATE_EVENT => {
                    if frame.payload.len() == 2 {
                        sink.on_drawer_event(&frame.payload);
                    } else {
                        warn!(
                            "drawer state-change broadcast with {} payload bytes",
                            frame.payload.len()
                        );
                    }
                }
                cmd_dsb::SELF_ASSIGN_EVENT => sink.on_self_assign(),
                t => warn!("unknown broadcast event type {t:#04x}"),
            }
        }
        Err(BusError::TooManyBroadcasts)
    }

    /// Send, then receive with broadcast demultiplexing.
    pub fn send_and_receive(
        &mut self,
        sink: &mut dyn EventSink,
        addr: u8,
        msg_type: u8,
        read: bool,
        payload: &[u8],
        budget: Duration,
    ) -> Result<Frame, BusError> {
        self.send(addr, msg_type, read, payload)?;
        self.receive(sink, budget)
    }

    /// Scheduler tick: drain any queued broadcasts with a short per-frame
    /// budget. Yields after ten consecutive CRC failures so other
    /// subsystems get a turn.
    pub fn tick(&mut self, sink: &mut dyn EventSink) {
        let mut crc_failures = 0u32;
        loop {
            match self.port.bytes_available() {
                Err(e) => {
                    warn!("serial input-queue query failed in drain: {e}");
                    return;
                }
                Ok(0) => return,
                Ok(_) => {}
            }
            match self.receive(sink, DRAIN_TIMEOUT) {
                Ok(frame) => {
                    // A solicited reply with no request outstanding.
                    warn!(
                        "unsolicited unicast frame from addr {} type {:#04x} dropped",
                        frame.addr, frame.msg_type
                    );
                    return;
                }
                Err(BusError::Crc) => {
                    crc_failures += 1;
                    if crc_failures >= DRAIN_CRC_LIMIT {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CONTROLLER_ADDR;
    use crate::testport::{RecordingSink, ScriptPort};

    #[test]
    fn unicast_written_once() {
        let mut bus = Bus::new(ScriptPort::new());
        bus.send(3, 0x03, true, &[0x00]).unwrap();
        assert_eq!(bus.port.tx, vec![0x83, 0x03, 0x00, 0xD3]);
        assert_eq!(bus.stats().frames_written, 1);
    }

    #[test]
    fn broadcast_written_three_times() {
        let mut bus = Bus::new(ScriptPort::new());
        bus.send(BROADCAST_ADDR, 0x06, false, &[0x00]).unwrap();
        let one = frame::encode(BROADCAST_ADDR, 0x06, false, &[0x00]).unwrap();
        let mut expect = one.clone();
        expect.extend_from_slice(&one);
        expect.extend_from_slice(&one);
        assert_eq!(bus.port.tx, expect);
        assert_eq!(bus.stats().frames_written, 3);
    }

    #[test]
    fn broadcasts_dispatch_before_reply() {
        let mut bus = Bus::new(ScriptPort::new());
        // Two drawer events and a self-assign queued ahead of the reply.
        bus.port.queue_frame(BROADCAST_ADDR, cmd_dsb::DRAWER_STATE_EVENT, &[0x02, 0xA5]);
        bus.port.queue_frame(BROADCAST_ADDR, cmd_dsb::DRAWER_STATE_EVENT, &[0x03, 0x10]);
        bus.port.queue_frame(BROADCAST_ADDR, cmd_dsb::SELF_ASSIGN_EVENT, &[0x21]);
        bus.port.queue_frame(CONTROLLER_ADDR, 0x83, &[0; 8]);

        let mut sink = RecordingSink::default();
        let frame = bus
            .send_and_receive(&mut sink, 2, 0x03, true, &[0x00], DEFAULT_TIMEOUT)
            .unwrap();
        assert_eq!(frame.addr, CONTROLLER_ADDR);
        assert_eq!(frame.msg_type, 0x83);
        assert_eq!(sink.drawer_events.len(), 2);
        assert_eq!(sink.drawer_events[0], vec![0x02, 0xA5]);
        assert_eq!(sink.self_assigns, 1);
        assert_eq!(bus.stats().broadcasts_seen, 3);
    }

    #[test]
    fn too_many_broadcasts_yields() {
        let mut bus = Bus::new(ScriptPort::new());
        for _ in 0..(BROADCASTS_PER_RECEIVE + 1) {
            bus.port.queue_frame(BROADCAST_ADDR, cmd_dsb::DRAWER_STATE_EVENT, &[0x01, 0x00]);
        }
        let mut sink = RecordingSink::default();
        assert_eq!(
            bus.receive(&mut sink, DEFAULT_TIMEOUT),
            Err(BusError::TooManyBroadcasts)
        );
        assert_eq!(sink.drawer_events.len(), BROADCASTS_PER_RECEIVE);
    }

    #[test]
    fn hex_record_padding() {
        let mut bus = Bus::new(ScriptPort::new());

        // 3-byte record pads to the 4-byte class with a trailing zero.
        bus.send_hex_record(&[0xAA, 0xBB, 0xCC]).unwrap();
        let expect = frame::encode(
            frame::DOWNLOAD_ADDR,
            cmd_dsb::HEX_RECORD,
            false,
            &[0xAA, 0xBB, 0xCC, 0x00],
        )
        .unwrap();
        assert_eq!(bus.port.tx, expect);

        // A long record rides the 8-byte class with its full body.
        bus.port.tx.clear();
        let record: Vec<u8> = (0u8..21).collect();
        bus.send_hex_record(&record).unwrap();
        assert_eq!(bus.port.tx[0], 0x60 | frame::DOWNLOAD_ADDR);
        assert_eq!(bus.port.tx.len(), record.len() + 3);
    }

    #[test]
    fn drain_tick_consumes_broadcasts() {
        let mut bus = Bus::new(ScriptPort::new());
        bus.port.queue_frame(BROADCAST_ADDR, cmd_dsb::DRAWER_STATE_EVENT, &[0x05, 0x30]);
        bus.port.queue_frame(BROADCAST_ADDR, cmd_dsb::DRAWER_STATE_EVENT, &[0x06, 0x30]);
        let mut sink = RecordingSink::default();
        bus.tick(&mut sink);
        assert_eq!(sink.drawer_events.len(), 2);
        assert_eq!(bus.port.rx.len(), 0);
    }
}
