//! # Drawer sensor board subsystem
//!
//! Keeps the roster of enrolled DSBs (addresses 1..13) and drives their
//! application-layer state machine:
//!
//! - [`discover`](DsbSubsystem::discover) - silence the bus, probe every
//!   address, rebuild the roster, resume normal operation
//! - [`tick`](DsbSubsystem::tick) - reset cooldown, periodic status and
//!   temperature polls, error drain, event flush
//! - configuration broadcasts: global lock, drawer override, factory mode,
//!   recalibration, index assignment/clearing, bootloader mode, reset
//! - [`get_debug_data`](DsbSubsystem::get_debug_data) - per-sensor
//!   diagnostic dump assembled from a multi-request sequence
//!
//! Unsolicited drawer state-change and self-assign broadcasts arrive
//! through [`DsbIntake`], the subsystem's [`EventSink`], and are turned
//! into [`HalEvent`]s at the end of the tick. A failure on any single
//! board is logged and leaves that board's cached state stale; the next
//! cycle retries naturally.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::bus::{Bus, DEFAULT_TIMEOUT, EventSink};
use crate::cmd::{cmd_dsb, reply_of};
use crate::frame::{BROADCAST_ADDR, CONTROLLER_ADDR, DSB_FIRST_ADDR, DSB_LAST_ADDR};
use crate::port::BusPort;
use crate::status::{DsbStatus, SolenoidState};
use crate::{BusError, HalEvent};

/// Default status/temperature poll cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Quiet period between a reset (or the last self-assign) and re-discovery.
const RESET_DISCOVER_WAIT: Duration = Duration::from_secs(1);
/// Poll intervals outside 1 s..5 min fall back to the default.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60 * 5);

/// One drawer behind a DSB.
#[derive(Debug, Clone)]
pub struct Drawer {
    /// Assigned index, 1..30; independent of the physical slot.
    pub index: u8,
    pub solenoid: SolenoidState,
    pub open: bool,
    /// Millimetres from the position sensor; 15 means ">= 15 mm".
    pub position: u8,
}

/// One enrolled drawer sensor board.
#[derive(Debug, Clone)]
pub struct Dsb {
    pub address: u8,
    /// Firmware version, major.minor nibbles.
    pub version: u8,
    pub bootloader: bool,
    /// Board temperature, whole degrees C.
    pub temperature: i8,
    /// Supply voltage in 0.1 V steps.
    pub voltage: u8,
    /// Last received status byte; never inferred from other fields.
    pub status: DsbStatus,
    /// Up to three drawers.
    pub drawers: Vec<Drawer>,
}

/// A decoded drawer state-change broadcast.
#[derive(Debug, Clone)]
pub struct DrawerEvent {
    pub index: u8,
    pub solenoid: SolenoidState,
    pub open: bool,
    /// Event kind: true for a lock event, false for an unlock.
    pub is_lock: bool,
    pub position: u8,
}

/// Roster summary entry carried by the enumeration event.
#[derive(Debug, Clone)]
pub struct DsbSummary {
    pub address: u8,
    pub version: u8,
    pub drawer_indices: Vec<u8>,
}

/// Mailbox the bus controller dispatches unsolicited broadcasts into.
/// Owned by [`DsbSubsystem`] and drained once per tick.
#[derive(Default)]
pub struct DsbIntake {
    events: Vec<DrawerEvent>,
    self_assign: bool,
}

impl EventSink for DsbIntake {
    fn on_drawer_event(&mut self, payload: &[u8]) {
        let Some(rsp) = cmd_dsb::DrawerEventRsp::from_payload(payload) else {
            warn!("drawer event payload has wrong size: {}", payload.len());
            return;
        };
        let flags = rsp.flags();
        let evt = DrawerEvent {
            index: rsp.index(),
            solenoid: flags.solenoid(),
            open: flags.open(),
            is_lock: flags.is_lock_event(),
            position: flags.position(),
        };
        debug!(
            "drawer event: index {} solenoid {:?} open {} lock {} position {}",
            evt.index, evt.solenoid, evt.open, evt.is_lock, evt.position
        );
        self.events.push(evt);
    }

    fn on_self_assign(&mut self) {
        self.self_assign = true;
    }
}

/// The DSB peer component.
pub struct DsbSubsystem {
    roster: Vec<Dsb>,
    intake: DsbIntake,
    poll_interval: Duration,
    last_poll: Option<Instant>,
    discover_after: Option<Instant>,
    pending_enumeration: bool,
    global_lock: bool,
    solenoid_manual: bool,
    factory_mode: bool,
}

impl DsbSubsystem {
    pub fn new(poll_interval: Duration) -> DsbSubsystem {
        let poll_interval = if poll_interval >= Duration::from_secs(1)
            && poll_interval < MAX_POLL_INTERVAL
        {
            poll_interval
        } else {
            DEFAULT_POLL_INTERVAL
        };
        DsbSubsystem {
            roster: Vec::new(),
            intake: DsbIntake::default(),
            poll_interval,
            last_poll: None,
            discover_after: None,
            pending_enumeration: false,
            global_lock: false,
            solenoid_manual: false,
            factory_mode: false,
        }
    }

    /// The broadcast mailbox, handed to [`Bus::tick`] by the scheduler.
    pub fn intake_mut(&mut self) -> &mut DsbIntake {
        &mut self.intake
    }

    pub fn roster(&self) -> &[Dsb] {
        &self.roster
    }

    /// Last commanded global lock state and solenoid drive mode.
    pub fn global_lock_state(&self) -> (bool, bool) {
        (self.global_lock, self.solenoid_manual)
    }

    /// Last commanded factory-mode state.
    pub fn factory_mode(&self) -> bool {
        self.factory_mode
    }

    pub fn count(&self) -> usize {
        self.roster.len()
    }

    /// Version rollup for the management handshake: one byte per board,
    /// most recently enrolled in the low byte.
    pub fn versions(&self) -> u32 {
        let mut vers: u32 = 0xFFFF_FFFF;
        for dsb in &self.roster {
            vers = (vers << 8) | dsb.version as u32;
        }
        vers
    }

    /// Rebuild the roster.
    ///
    /// Broadcasts the silence configuration first so boards do not report
    /// drawer changes mid-ceremony, probes every DSB address, then resumes
    /// normal operation and arms the enumeration event.
    pub fn discover<P: BusPort>(&mut self, bus: &mut Bus<P>) {
        if let Err(e) = bus.send(
            BROADCAST_ADDR,
            cmd_dsb::GLOBAL_LOCK,
            false,
            &cmd_dsb::lockdown_cmd(),
        ) {
            warn!("failed to broadcast lockdown before discovery: {e}");
        }

        self.roster.clear();

        for addr in DSB_FIRST_ADDR..=DSB_LAST_ADDR {
            let frame = match bus.send_and_receive(
                &mut self.intake,
                addr,
                cmd_dsb::DISCOVERY,
                true,
                &cmd_dsb::discovery_req(),
                DEFAULT_TIMEOUT,
            ) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("discovery: no reply from address {addr}: {e}");
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
            };

            if frame.addr != CONTROLLER_ADDR {
                warn!("discovery reply from wrong source address {}", frame.addr);
                continue;
            }
            if frame.msg_type != reply_of(cmd_dsb::DISCOVERY) {
                warn!("discovery reply has wrong type {:#04x}", frame.msg_type);
                continue;
            }
            let Some(rsp) = cmd_dsb::DiscoveryRsp::from_payload(&frame.payload) else {
                warn!("discovery reply has {} payload bytes", frame.payload.len());
                continue;
            };

            let dtype = rsp.device_type();
            if !dtype.is_dsb() {
                // Cold-cube or unknown silicon answering on a DSB address.
                warn!("device type {dtype:?} at DSB address {addr}, not enrolling");
                continue;
            }

            let mut dsb = Dsb {
                address: addr,
                version: rsp.version(),
                bootloader: rsp.bootloader(),
                temperature: 0,
                voltage: 0,
                status: DsbStatus::default(),
                drawers: Vec::new(),
            };

            for slot in 0..3 {
                let Some(index) = rsp.drawer_index(slot) else { continue };
                let taken = self
                    .roster
                    .iter()
                    .flat_map(|d| d.drawers.iter())
                    .chain(dsb.drawers.iter())
                    .any(|d| d.index == index);
                if taken {
                    warn!("drawer index {index} reported twice, ignoring duplicate");
                    continue;
                }
                dsb.drawers.push(Drawer {
                    index,
                    solenoid: SolenoidState::Locked,
                    open: false,
                    position: 0,
                });
            }

            debug!(
                "DSB v{}.{} at address {}{}, {} drawers",
                rsp.version_major(),
                rsp.version_minor(),
                addr,
                if dsb.bootloader { " (bootloader)" } else { "" },
                dsb.drawers.len()
            );
            self.roster.push(dsb);
        }

        if let Err(e) = bus.send(
            BROADCAST_ADDR,
            cmd_dsb::GLOBAL_LOCK,
            false,
            &cmd_dsb::resume_cmd(),
        ) {
            warn!("failed to broadcast resume after discovery: {e}");
        }

        info!("discovered {} DSBs", self.roster.len());
        self.pending_enumeration = true;
        bus.log_stats();
    }

    /// One scheduler tick: reset cooldown, cadenced polls, event flush.
    pub fn tick<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        now: Instant,
        events: &mut Vec<HalEvent>,
    ) {
        // Every self-assign pushes the discovery out by another quiet
        // period, so a burst of rebooting boards coalesces into one sweep.
        if self.intake.self_assign {
            self.intake.self_assign = false;
            self.discover_after = Some(now + RESET_DISCOVER_WAIT);
            debug!("self-assign seen, discovery armed");
        }

        if let Some(when) = self.discover_after {
            if now < when {
                // Quiet period: no polls, no events.
                return;
            }
            self.discover_after = None;
            self.discover(bus);
            self.last_poll = None;
        }

        let poll_due = self
            .last_poll
            .is_none_or(|t| now.duration_since(t) >= self.poll_interval);
        if poll_due {
            self.poll_status(bus);
            self.poll_temperatures(bus);

            let erroring: Vec<u8> = self
                .roster
                .iter()
                .filter(|d| d.status.errors())
                .map(|d| d.address)
                .collect();
            for addr in erroring {
                info!("DSB {addr} reported errors, draining log");
                match Self::drain_errors(bus, &mut self.intake, addr) {
                    Ok(codes) => events.push(HalEvent::DrawerErrors { address: addr, codes }),
                    Err(e) => warn!("failed to drain errors from DSB {addr}: {e}"),
                }
            }
            self.last_poll = Some(now);
        }

        for evt in self.intake.events.drain(..) {
            events.push(HalEvent::DrawerStateChanged(evt));
        }

        if self.pending_enumeration {
            self.pending_enumeration = false;
            let summary = self
                .roster
                .iter()
                .map(|d| DsbSummary {
                    address: d.address,
                    version: d.version,
                    drawer_indices: d.drawers.iter().map(|dr| dr.index).collect(),
                })
                .collect();
            events.push(HalEvent::DsbEnumeration(summary));
        }
    }

    /// Status sweep: one Get-Status per enrolled board, matching stored
    /// drawers to the reply by index.
    fn poll_status<P: BusPort>(&mut self, bus: &mut Bus<P>) {
        for i in 0..self.roster.len() {
            let addr = self.roster[i].address;
            let frame = match bus.send_and_receive(
                &mut self.intake,
                addr,
                cmd_dsb::GET_STATUS,
                true,
                &cmd_dsb::get_status_req(),
                DEFAULT_TIMEOUT,
            ) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("status poll failed for DSB {addr}: {e}");
                    continue;
                }
            };

            if frame.addr != CONTROLLER_ADDR {
                warn!("status reply from wrong source address {}", frame.addr);
                continue;
            }
            if frame.msg_type != reply_of(cmd_dsb::GET_STATUS) {
                warn!("status reply has wrong type {:#04x}", frame.msg_type);
                continue;
            }
            let Some(rsp) = cmd_dsb::DrawerStatusRsp::from_payload(&frame.payload) else {
                warn!("status reply has {} payload bytes", frame.payload.len());
                continue;
            };

            let dsb = &mut self.roster[i];
            for drawer in &mut dsb.drawers {
                let mut found = false;
                for slot in 0..3 {
                    let (index, flags) = rsp.pair(slot);
                    if index == drawer.index {
                        drawer.solenoid = flags.solenoid();
                        drawer.open = flags.open();
                        drawer.position = flags.position();
                        found = true;
                    }
                }
                if !found {
                    warn!(
                        "drawer {} missing from status reply of DSB {addr}",
                        drawer.index
                    );
                }
            }
            dsb.status = rsp.status();
        }
    }

    /// Temperature sweep, on the same cadence as the status poll.
    fn poll_temperatures<P: BusPort>(&mut self, bus: &mut Bus<P>) {
        for i in 0..self.roster.len() {
            let addr = self.roster[i].address;
            let frame = match bus.send_and_receive(
                &mut self.intake,
                addr,
                cmd_dsb::GET_TEMP,
                true,
                &cmd_dsb::get_temp_req(),
                DEFAULT_TIMEOUT,
            ) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("temperature poll failed for DSB {addr}: {e}");
                    continue;
                }
            };

            if frame.addr != CONTROLLER_ADDR
                || frame.msg_type != reply_of(cmd_dsb::GET_TEMP)
            {
                warn!(
                    "bad temperature reply from DSB {addr}: source {} type {:#04x}",
                    frame.addr, frame.msg_type
                );
                continue;
            }
            let Some(rsp) = cmd_dsb::TempRsp::from_payload(&frame.payload) else {
                warn!("temperature reply has {} payload bytes", frame.payload.len());
                continue;
            };

            self.roster[i].temperature = rsp.temperature();
            self.roster[i].voltage = rsp.voltage_tenths();
        }
    }

    /// Read (and clear) the error log of one board.
    fn drain_errors<P: BusPort>(
        bus: &mut Bus<P>,
        intake: &mut DsbIntake,
        addr: u8,
    ) -> Result<Vec<u8>, BusError> {
        let frame = bus.send_and_receive(
            intake,
            addr,
            cmd_dsb::GET_ERRORS,
            true,
            &cmd_dsb::get_errors_req(),
            DEFAULT_TIMEOUT,
        )?;
        if frame.addr != CONTROLLER_ADDR {
            return Err(BusError::UnexpectedSource);
        }
        if frame.msg_type != reply_of(cmd_dsb::GET_ERRORS) {
            return Err(BusError::UnexpectedType);
        }
        let rsp = cmd_dsb::ErrorsRsp::from_payload(&frame.payload)
            .ok_or(BusError::BadPayloadLength)?;
        Ok(rsp.codes())
    }

    // Configuration commands. Each is a single broadcast; per the bus
    // rules the controller writes broadcasts three times.

    pub fn set_bootloader_mode<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        enable: bool,
    ) -> Result<(), BusError> {
        bus.send(
            BROADCAST_ADDR,
            cmd_dsb::BOOTLOADER_MODE,
            false,
            &cmd_dsb::bootloader_mode_cmd(enable),
        )
    }

    /// Broadcast a global reset and arm the re-discovery cooldown.
    pub fn global_reset<P: BusPort>(&mut self, bus: &mut Bus<P>) -> Result<(), BusError> {
        bus.send(
            BROADCAST_ADDR,
            cmd_dsb::GLOBAL_RESET,
            false,
            &cmd_dsb::global_reset_cmd(),
        )?;
        self.discover_after = Some(Instant::now() + RESET_DISCOVER_WAIT);
        Ok(())
    }

    pub fn set_global_lock<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        locked: bool,
        manual_solenoids: bool,
    ) -> Result<(), BusError> {
        bus.send(
            BROADCAST_ADDR,
            cmd_dsb::GLOBAL_LOCK,
            false,
            &cmd_dsb::global_lock_cmd(locked, manual_solenoids),
        )?;
        self.global_lock = locked;
        self.solenoid_manual = manual_solenoids;
        Ok(())
    }

    pub fn drawer_override<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        index: u8,
        lock: bool,
    ) -> Result<(), BusError> {
        bus.send(
            BROADCAST_ADDR,
            cmd_dsb::DRAWER_OVERRIDE,
            false,
            &cmd_dsb::drawer_override_cmd(index, lock),
        )
    }

    pub fn set_factory_mode<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        enable: bool,
    ) -> Result<(), BusError> {
        bus.send(
            BROADCAST_ADDR,
            cmd_dsb::FACTORY_MODE,
            false,
            &cmd_dsb::factory_mode_cmd(enable),
        )?;
        self.factory_mode = enable;
        Ok(())
    }

    /// `override_byte` comes from a validated clear-indices token; without
    /// the token the daemon passes zero and boards ignore the wipe.
    pub fn clear_indices<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        override_byte: u8,
    ) -> Result<(), BusError> {
        debug!("clearing drawer indices, override {override_byte:#04x}");
        bus.send(
            BROADCAST_ADDR,
            cmd_dsb::CLEAR_INDICES,
            false,
            &cmd_dsb::clear_indices_cmd(override_byte),
        )
    }

    pub fn assign_index<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        index: u8,
    ) -> Result<(), BusError> {
        bus.send(
            BROADCAST_ADDR,
            cmd_dsb::ASSIGN_INDEX,
            false,
            &cmd_dsb::assign_index_cmd(index),
        )
    }

    pub fn recalibrate<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        save: bool,
    ) -> Result<(), BusError> {
        bus.send(
            BROADCAST_ADDR,
            cmd_dsb::DRAWER_RECALIBRATION,
            false,
            &cmd_dsb::recalibration_cmd(save),
        )
    }

    /// Assemble the per-sensor OSC/DAC diagnostic dump of one board into a
    /// human-readable string. `roster_index` is the position in the roster,
    /// not a bus address.
    pub fn get_debug_data<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        roster_index: usize,
    ) -> Result<String, BusError> {
        let Some(dsb) = self.roster.get(roster_index) else {
            return Ok(format!(
                "index is {} but only {} DSBs are enrolled",
                roster_index,
                self.roster.len()
            ));
        };
        let addr = dsb.address;

        const ITEMS: [(&str, u8); 5] = [
            ("OSC_offset", 6),
            ("OSC_val", 9),
            ("OSC_adj", 12),
            ("DAC_val", 15),
            ("trip_val", 18),
        ];

        let mut out = String::new();
        for sensor in 0u8..3 {
            if sensor > 0 {
                out.push('\n');
            }
            for (n, (label, base)) in ITEMS.iter().enumerate() {
                let item = base + sensor;
                let frame = bus.send_and_receive(
                    &mut self.intake,
                    addr,
                    cmd_dsb::GET_DEBUG,
                    true,
                    &cmd_dsb::get_debug_req(item),
                    DEFAULT_TIMEOUT,
                )?;
                if frame.msg_type != reply_of(cmd_dsb::GET_DEBUG) {
                    warn!("debug reply has wrong type {:#04x}", frame.msg_type);
                    return Err(BusError::UnexpectedType);
                }
                let rsp = cmd_dsb::DebugRsp::from_payload(&frame.payload)
                    .ok_or(BusError::BadPayloadLength)?;
                if rsp.item() != item {
                    warn!("debug reply echoes item {} not {item}", rsp.item());
                    return Err(BusError::UnexpectedType);
                }
                if n > 0 {
                    out.push_str("      ");
                }
                out.push_str(&format!("S{sensor}_{label} = {}", rsp.value()));
            }
        }
        debug!("debug dump for DSB {addr}: {out}");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::cmd_dsb::{
        DISCOVERY, DRAWER_STATE_EVENT, GET_ERRORS, GET_STATUS, GET_TEMP, SELF_ASSIGN_EVENT,
    };
    use crate::testport::ScriptPort;

    fn bus_with(port: ScriptPort) -> Bus<ScriptPort> {
        Bus::new(port)
    }

    fn queue_discovery_reply(port: &mut ScriptPort, payload: &[u8]) {
        port.queue_frame(CONTROLLER_ADDR, reply_of(DISCOVERY), payload);
    }

    #[test]
    fn discovery_enrolls_replying_boards() {
        let mut port = ScriptPort::new();
        // Address 1: three-drawer DSB with drawers 1, 2, 3, firmware 1.4.
        queue_discovery_reply(&mut port, &[0x23, 0x03, 0x01, 0x02, 0x03, 0x00, 0x00, 0x14]);
        // Address 2: two-drawer DSB with drawers 4 and 5.
        queue_discovery_reply(&mut port, &[0x02, 0x02, 0x04, 0x05, 0x00, 0x00, 0x00, 0x21]);
        let mut bus = bus_with(port);

        let mut dsbs = DsbSubsystem::new(DEFAULT_POLL_INTERVAL);
        dsbs.discover(&mut bus);

        assert_eq!(dsbs.count(), 2);
        let roster = dsbs.roster();
        assert_eq!(roster[0].address, 1);
        assert_eq!(roster[0].version, 0x14);
        assert_eq!(
            roster[0].drawers.iter().map(|d| d.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(roster[1].address, 2);
        assert_eq!(
            roster[1].drawers.iter().map(|d| d.index).collect::<Vec<_>>(),
            vec![4, 5]
        );
    }

    #[test]
    fn discovery_rejects_cold_cube_on_dsb_address() {
        let mut port = ScriptPort::new();
        // Device type nibble 7 (cold-cube) answering at address 1.
        queue_discovery_reply(&mut port, &[0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10]);
        let mut bus = bus_with(port);

        let mut dsbs = DsbSubsystem::new(DEFAULT_POLL_INTERVAL);
        dsbs.discover(&mut bus);
        assert_eq!(dsbs.count(), 0);
    }

    #[test]
    fn discovery_drops_duplicate_drawer_indices() {
        let mut port = ScriptPort::new();
        queue_discovery_reply(&mut port, &[0x23, 0x02, 0x01, 0x02, 0x00, 0x00, 0x00, 0x11]);
        // Second board claims drawer 2 again plus drawer 6.
        queue_discovery_reply(&mut port, &[0x23, 0x02, 0x02, 0x06, 0x00, 0x00, 0x00, 0x11]);
        let mut bus = bus_with(port);

        let mut dsbs = DsbSubsystem::new(DEFAULT_POLL_INTERVAL);
        dsbs.discover(&mut bus);
        assert_eq!(
            dsbs.roster()[1]
                .drawers
                .iter()
                .map(|d| d.index)
                .collect::<Vec<_>>(),
            vec![6]
        );
    }

    #[test]
    fn discovery_queues_enumeration_event() {
        let mut port = ScriptPort::new();
        queue_discovery_reply(&mut port, &[0x23, 0x01, 0x07, 0x00, 0x00, 0x00, 0x00, 0x11]);
        let mut bus = bus_with(port);

        let mut dsbs = DsbSubsystem::new(DEFAULT_POLL_INTERVAL);
        dsbs.discover(&mut bus);

        let mut events = Vec::new();
        dsbs.tick(&mut bus, Instant::now(), &mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            HalEvent::DsbEnumeration(s) if s.len() == 1 && s[0].drawer_indices == vec![7]
        )));
    }

    #[test]
    fn poll_updates_drawer_state_and_drains_errors() {
        let mut port = ScriptPort::new();
        queue_discovery_reply(&mut port, &[0x23, 0x02, 0x01, 0x02, 0x00, 0x00, 0x00, 0x11]);
        let mut bus = bus_with(port);

        let mut dsbs = DsbSubsystem::new(DEFAULT_POLL_INTERVAL);
        dsbs.discover(&mut bus);

        // Status: drawer 1 unlocked+open at 5 mm, drawer 2 locked shut;
        // status byte has the error bit set.
        bus_port(&mut bus).queue_frame(
            CONTROLLER_ADDR,
            reply_of(GET_STATUS),
            &[0x01, 0x65, 0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
        );
        // Temperature: -7 C, 3.3 V.
        bus_port(&mut bus).queue_frame(CONTROLLER_ADDR, reply_of(GET_TEMP), &[0xF9, 33]);
        // Error log: two codes.
        bus_port(&mut bus).queue_frame(
            CONTROLLER_ADDR,
            reply_of(GET_ERRORS),
            &[0x32, 0x04, 0x00, 0x00],
        );

        let mut events = Vec::new();
        dsbs.tick(&mut bus, Instant::now(), &mut events);

        let dsb = &dsbs.roster()[0];
        assert_eq!(dsb.drawers[0].solenoid, SolenoidState::Unlocked);
        assert!(dsb.drawers[0].open);
        assert_eq!(dsb.drawers[0].position, 5);
        assert_eq!(dsb.drawers[1].solenoid, SolenoidState::Locked);
        assert!(!dsb.drawers[1].open);
        assert_eq!(dsb.temperature, -7);
        assert_eq!(dsb.voltage, 33);
        assert!(dsb.status.errors());

        assert!(events.iter().any(|e| matches!(
            e,
            HalEvent::DrawerErrors { address: 1, codes } if codes == &vec![3, 4]
        )));
    }

    #[test]
    fn reset_arms_cooldown_and_discovery_runs_after() {
        let mut bus = bus_with(ScriptPort::new());
        let mut dsbs = DsbSubsystem::new(DEFAULT_POLL_INTERVAL);

        dsbs.global_reset(&mut bus).unwrap();
        let after_reset = bus.stats().frames_written;

        // Inside the quiet period nothing is written.
        let mut events = Vec::new();
        dsbs.tick(&mut bus, Instant::now(), &mut events);
        assert_eq!(bus.stats().frames_written, after_reset);
        assert!(events.is_empty());

        // Past the quiet period discovery probes every DSB address.
        dsbs.tick(
            &mut bus,
            Instant::now() + Duration::from_millis(1100),
            &mut events,
        );
        // Lockdown broadcast (x3) + 13 probes + resume broadcast (x3).
        assert_eq!(bus.stats().frames_written, after_reset + 19);
    }

    #[test]
    fn self_assign_triggers_rediscovery() {
        let mut bus = bus_with(ScriptPort::new());
        let mut dsbs = DsbSubsystem::new(DEFAULT_POLL_INTERVAL);

        dsbs.intake_mut().on_self_assign();
        let mut events = Vec::new();
        let t0 = Instant::now();
        dsbs.tick(&mut bus, t0, &mut events);
        // Armed but still quiet.
        assert_eq!(bus.stats().frames_written, 0);

        dsbs.tick(&mut bus, t0 + Duration::from_millis(1100), &mut events);
        assert!(bus.stats().frames_written > 0);
    }

    #[test]
    fn drawer_events_flush_once() {
        let mut bus = bus_with(ScriptPort::new());
        let mut dsbs = DsbSubsystem::new(DEFAULT_POLL_INTERVAL);

        dsbs.intake_mut().on_drawer_event(&[0x02, 0xA5]);
        dsbs.intake_mut().on_drawer_event(&[0x03, 0x95]);

        let mut events = Vec::new();
        dsbs.tick(&mut bus, Instant::now(), &mut events);
        let drawer_events: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, HalEvent::DrawerStateChanged(_)))
            .collect();
        assert_eq!(drawer_events.len(), 2);

        // Next tick must not replay them.
        let mut events = Vec::new();
        dsbs.tick(&mut bus, Instant::now(), &mut events);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, HalEvent::DrawerStateChanged(_)))
        );
    }

    #[test]
    fn broadcasts_demuxed_during_poll_land_in_events() {
        let mut port = ScriptPort::new();
        queue_discovery_reply(&mut port, &[0x23, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x11]);
        let mut bus = bus_with(port);
        let mut dsbs = DsbSubsystem::new(DEFAULT_POLL_INTERVAL);
        dsbs.discover(&mut bus);

        // Two drawer broadcasts arrive ahead of the status reply.
        bus_port(&mut bus).queue_frame(BROADCAST_ADDR, DRAWER_STATE_EVENT, &[0x01, 0x65]);
        bus_port(&mut bus).queue_frame(BROADCAST_ADDR, SELF_ASSIGN_EVENT, &[0x01]);
        bus_port(&mut bus).queue_frame(
            CONTROLLER_ADDR,
            reply_of(GET_STATUS),
            &[0x01, 0x65, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        );
        bus_port(&mut bus).queue_frame(CONTROLLER_ADDR, reply_of(GET_TEMP), &[0x05, 30]);

        let mut events = Vec::new();
        dsbs.tick(&mut bus, Instant::now(), &mut events);

        assert!(
            events
                .iter()
                .any(|e| matches!(e, HalEvent::DrawerStateChanged(evt) if evt.index == 1))
        );
    }

    // Unit tests poke replies into the bus mid-scenario.
    fn bus_port(bus: &mut Bus<ScriptPort>) -> &mut ScriptPort {
        bus.port_mut()
    }
}
