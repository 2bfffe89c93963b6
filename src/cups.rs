//! # Cold-cube UPS peer
//!
//! The single environmental and power-backup controller at bus address 14.
//! Two cadences drive it:
//!
//! - fast (10 s): main status byte; changes are diffed against the previous
//!   read and surfaced as events (AC state, firmware health, compressor)
//! - slow (120 s): temperatures, voltages, persistent settings, and a
//!   drain of the logged-temperature store down to its (0,0) sentinel
//!
//! First contact runs discovery (device type nibble must be 7) and the
//! boot handshake: if the status byte's boot-ACK bit is clear the
//! controller issues Initiate-Operation and re-reads status.
//!
//! Writes follow the register map: Set-Temperature, Set-Defrost, and the
//! defrost/battery-test triggers, which come in an automatic and a manual
//! flavour selected by the `auto_chill` policy bit.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::bus::{Bus, DEFAULT_TIMEOUT, EventSink};
use crate::cmd::{cmd_cups, cmd_dsb, reply_of};
use crate::frame::{CONTROLLER_ADDR, CUPS_ADDR};
use crate::port::BusPort;
use crate::status::{CupsStatus, DeviceType};
use crate::{BusError, HalEvent};

/// Main status cadence.
pub const FAST_INTERVAL: Duration = Duration::from_secs(10);
/// Temperatures/voltages/settings cadence.
pub const SLOW_INTERVAL: Duration = Duration::from_secs(120);
/// Settle time between a settings write and the follow-up read-back.
const SET_READBACK_DELAY: Duration = Duration::from_micros(2500);
/// Upper bound on one logged-temperature drain; the store is far smaller.
const LOGGED_TEMP_LIMIT: usize = 1024;

/// Identity read out of the discovery reply.
#[derive(Debug, Default, Clone, Copy)]
pub struct BoardConfig {
    pub id: u8,
    pub cal_cold_present: bool,
    pub cal_ambient_present: bool,
}

/// The cold-cube peer record and state machine.
pub struct ColdCube {
    discovered: bool,
    version_major: u8,
    version_minor: u8,
    board: BoardConfig,
    status: CupsStatus,
    status_valid: bool,
    /// Policy bit: chilling is managed automatically. Selects the variant
    /// of the defrost and battery-test trigger sequences.
    auto_chill: bool,

    thermistor_temp: f32,
    calibrated_cold_temp: f32,
    calibrated_ambient_temp: f32,
    set_point: f32,
    temp_range: f32,
    defrost_period: u16,
    defrost_length: u8,
    defrost_temp_limit: f32,
    supply_voltage: f32,
    battery_voltage: f32,
    backplane_voltage: f32,
    charger_voltage: f32,
    charge_percent: u8,
    compressor_error_bits: u8,
    logged_temps: Vec<(u16, f32)>,

    last_fast: Option<Instant>,
    last_slow: Option<Instant>,
}

impl ColdCube {
    pub fn new() -> ColdCube {
        ColdCube {
            discovered: false,
            version_major: 0,
            version_minor: 0,
            board: BoardConfig::default(),
            status: CupsStatus::default(),
            status_valid: false,
            auto_chill: true,
            thermistor_temp: 0.0,
            calibrated_cold_temp: 0.0,
            calibrated_ambient_temp: 0.0,
            set_point: 0.0,
            temp_range: 0.0,
            defrost_period: 0,
            defrost_length: 0,
            defrost_temp_limit: 0.0,
            supply_voltage: 0.0,
            battery_voltage: 0.0,
            backplane_voltage: 0.0,
            charger_voltage: 0.0,
            charge_percent: 0,
            compressor_error_bits: 0,
            logged_temps: Vec::new(),
            last_fast: None,
            last_slow: None,
        }
    }

    pub fn version(&self) -> (u8, u8) {
        (self.version_major, self.version_minor)
    }

    pub fn board_config(&self) -> BoardConfig {
        self.board
    }

    pub fn status(&self) -> CupsStatus {
        self.status
    }

    pub fn set_point(&self) -> f32 {
        self.set_point
    }

    pub fn temp_range(&self) -> f32 {
        self.temp_range
    }

    pub fn defrost_params(&self) -> (u16, u8, f32) {
        (self.defrost_period, self.defrost_length, self.defrost_temp_limit)
    }

    pub fn thermistor_temp(&self) -> f32 {
        self.thermistor_temp
    }

    pub fn calibrated_cold_temp(&self) -> f32 {
        self.calibrated_cold_temp
    }

    pub fn calibrated_ambient_temp(&self) -> f32 {
        self.calibrated_ambient_temp
    }

    /// (supply, battery, backplane, charger) in volts.
    pub fn voltages(&self) -> (f32, f32, f32, f32) {
        (
            self.supply_voltage,
            self.battery_voltage,
            self.backplane_voltage,
            self.charger_voltage,
        )
    }

    pub fn charge_percent(&self) -> u8 {
        self.charge_percent
    }

    pub fn compressor_error_bits(&self) -> u8 {
        self.compressor_error_bits
    }

    /// Hand over (and clear) the accumulated logged temperatures.
    pub fn take_logged_temps(&mut self) -> Vec<(u16, f32)> {
        std::mem::take(&mut self.logged_temps)
    }

    pub fn set_auto_chill(&mut self, auto_chill: bool) {
        self.auto_chill = auto_chill;
    }

    /// First contact: discovery, boot handshake, initial readings.
    pub fn initialize<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
        events: &mut Vec<HalEvent>,
    ) -> Result<(), BusError> {
        info!("running cold-cube discovery");
        self.discover(bus, sink)?;

        if !self.status.boot_ack() {
            if let Err(e) = self.acknowledge_boot(bus, sink) {
                warn!("boot acknowledge failed: {e}");
            }
            if !self.status.boot_ack() {
                info!("cold-cube did not acknowledge boot");
            }
        }

        self.read_status(bus, sink)?;

        if !self.status.firmware_ok() {
            warn!("cold-cube reports firmware failure at initialize");
            events.push(HalEvent::CupsFailure);
        }
        if self.status.compressor_error() {
            match self.read_compressor_error(bus, sink) {
                Ok(bits) => events.push(HalEvent::CompressorError(bits)),
                Err(e) => warn!("failed to read compressor error: {e}"),
            }
        }

        self.update_slow(bus, sink);
        Ok(())
    }

    /// Probe address 14. The reply must carry device-type nibble 7.
    fn discover<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
    ) -> Result<(), BusError> {
        let frame = bus.send_and_receive(
            sink,
            CUPS_ADDR,
            cmd_dsb::DISCOVERY,
            true,
            &cmd_dsb::discovery_req(),
            DEFAULT_TIMEOUT,
        )?;
        if frame.addr != CONTROLLER_ADDR {
            return Err(BusError::UnexpectedSource);
        }
        if frame.msg_type != reply_of(cmd_dsb::DISCOVERY) {
            return Err(BusError::UnexpectedType);
        }
        let rsp = cmd_cups::CupsDiscoveryRsp::from_payload(&frame.payload)
            .ok_or(BusError::BadPayloadLength)?;
        if rsp.device_type() != DeviceType::ColdCube {
            warn!(
                "device type {:?} at cold-cube address, not enrolling",
                rsp.device_type()
            );
            return Err(BusError::DiscoveryMismatch);
        }

        self.version_major = rsp.version_major();
        self.version_minor = rsp.version_minor();
        self.board = BoardConfig {
            id: rsp.board_id(),
            cal_cold_present: rsp.cal_cold_present(),
            cal_ambient_present: rsp.cal_ambient_present(),
        };
        self.discovered = true;
        info!(
            "cold-cube discovered - id {} v{}.{} cold-probe {} ambient-probe {}",
            self.board.id,
            self.version_major,
            self.version_minor,
            if self.board.cal_cold_present { "*" } else { "-" },
            if self.board.cal_ambient_present { "*" } else { "-" },
        );
        Ok(())
    }

    /// Issue Initiate-Operation to acknowledge boot; the reply is a status
    /// frame reflecting the cleared boot-ACK handshake.
    fn acknowledge_boot<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
    ) -> Result<(), BusError> {
        let frame = bus.send_and_receive(
            sink,
            CUPS_ADDR,
            cmd_cups::INITIATE_OPERATION,
            true,
            &cmd_cups::initiate_operation_req(),
            DEFAULT_TIMEOUT,
        )?;
        if frame.msg_type != reply_of(cmd_cups::GET_STATUS) {
            return Err(BusError::UnexpectedType);
        }
        if frame.payload.is_empty() {
            return Err(BusError::BadPayloadLength);
        }
        self.status = CupsStatus::from(frame.payload[0]);
        self.status_valid = true;
        Ok(())
    }

    fn read_status_byte<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
    ) -> Result<CupsStatus, BusError> {
        let frame = bus.send_and_receive(
            sink,
            CUPS_ADDR,
            cmd_cups::GET_STATUS,
            true,
            &cmd_cups::get_status_req(),
            DEFAULT_TIMEOUT,
        )?;
        if frame.addr != CONTROLLER_ADDR {
            return Err(BusError::UnexpectedSource);
        }
        if frame.msg_type != reply_of(cmd_cups::GET_STATUS) {
            return Err(BusError::UnexpectedType);
        }
        if frame.payload.is_empty() {
            return Err(BusError::BadPayloadLength);
        }
        Ok(CupsStatus::from(frame.payload[0]))
    }

    /// Read status without diffing; used during initialize.
    fn read_status<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
    ) -> Result<(), BusError> {
        self.status = self.read_status_byte(bus, sink)?;
        self.status_valid = true;
        Ok(())
    }

    /// Fast-cadence update: read status, diff, emit events on change.
    fn update_fast<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
        events: &mut Vec<HalEvent>,
    ) {
        let status = match self.read_status_byte(bus, sink) {
            Ok(s) => s,
            Err(e) => {
                warn!("cold-cube status read failed: {e}");
                return;
            }
        };

        if self.status_valid && status.value() == self.status.value() {
            return;
        }

        let prev = self.status;
        let had_valid = self.status_valid;
        self.status = status;
        self.status_valid = true;

        if !had_valid {
            return;
        }

        if status.ac_ok() != prev.ac_ok() {
            // The cabinet lighting follows AC presence.
            info!("cold-cube AC state changed: {}", status.ac_ok());
            events.push(HalEvent::AcStateChanged(status.ac_ok()));
        }
        if !status.firmware_ok() && prev.firmware_ok() {
            warn!("cold-cube firmware-OK bit dropped");
            events.push(HalEvent::CupsFailure);
        }
        if status.compressor_error() && !prev.compressor_error() {
            match self.read_compressor_error(bus, sink) {
                Ok(bits) => events.push(HalEvent::CompressorError(bits)),
                Err(e) => warn!("failed to read compressor error: {e}"),
            }
        }
    }

    /// Slow-cadence update: temperatures, voltages, persistent settings,
    /// logged-temperature drain. Failures leave the previous values.
    fn update_slow<P: BusPort>(&mut self, bus: &mut Bus<P>, sink: &mut dyn EventSink) {
        if let Err(e) = self.read_temperatures(bus, sink) {
            warn!("cold-cube temperature read failed: {e}");
        }
        if let Err(e) = self.read_voltages(bus, sink) {
            warn!("cold-cube voltage read failed: {e}");
        }
        if let Err(e) = self.read_persistent_settings(bus, sink) {
            warn!("cold-cube settings read failed: {e}");
        }
        if let Err(e) = self.drain_logged_temps(bus, sink) {
            warn!("cold-cube logged-temperature drain failed: {e}");
        }
    }

    /// One scheduler tick: fast and slow cadences.
    pub fn tick<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
        now: Instant,
        events: &mut Vec<HalEvent>,
    ) {
        if !self.discovered {
            return;
        }

        let fast_due = self
            .last_fast
            .is_none_or(|t| now.duration_since(t) >= FAST_INTERVAL);
        if fast_due {
            self.update_fast(bus, sink, events);
            self.last_fast = Some(now);
        }

        let slow_due = self
            .last_slow
            .is_none_or(|t| now.duration_since(t) >= SLOW_INTERVAL);
        if slow_due {
            self.update_slow(bus, sink);
            self.last_slow = Some(now);
        }
    }

    fn request<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
        msg_type: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, BusError> {
        let frame =
            bus.send_and_receive(sink, CUPS_ADDR, msg_type, true, payload, DEFAULT_TIMEOUT)?;
        if frame.addr != CONTROLLER_ADDR {
            return Err(BusError::UnexpectedSource);
        }
        if frame.msg_type != reply_of(msg_type) {
            return Err(BusError::UnexpectedType);
        }
        Ok(frame.payload)
    }

    fn read_temperatures<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
    ) -> Result<(), BusError> {
        let payload = self.request(
            bus,
            sink,
            cmd_cups::GET_TEMPERATURE,
            &cmd_cups::get_temperatures_req(),
        )?;
        let rsp = cmd_cups::TemperaturesRsp::from_payload(&payload)
            .ok_or(BusError::BadPayloadLength)?;
        self.thermistor_temp = rsp.thermistor();
        self.calibrated_cold_temp = rsp.calibrated_cold();
        self.calibrated_ambient_temp = rsp.calibrated_ambient();
        Ok(())
    }

    fn read_voltages<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
    ) -> Result<(), BusError> {
        let payload =
            self.request(bus, sink, cmd_cups::GET_VOLTAGE, &cmd_cups::get_voltages_req())?;
        let rsp =
            cmd_cups::VoltagesRsp::from_payload(&payload).ok_or(BusError::BadPayloadLength)?;
        self.charge_percent = rsp.charge_percent();
        self.supply_voltage = rsp.supply();
        self.backplane_voltage = rsp.backplane();
        self.battery_voltage = rsp.battery();
        self.charger_voltage = rsp.charger();
        Ok(())
    }

    fn read_persistent_settings<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
    ) -> Result<(), BusError> {
        let payload = self.request(
            bus,
            sink,
            cmd_cups::GET_PSETTINGS,
            &cmd_cups::get_psettings_req(),
        )?;
        let rsp = cmd_cups::PersistentSettingsRsp::from_payload(&payload)
            .ok_or(BusError::BadPayloadLength)?;
        self.set_point = rsp.set_point();
        self.temp_range = rsp.temp_range();
        self.defrost_period = rsp.defrost_period();
        self.defrost_length = rsp.defrost_length();
        self.defrost_temp_limit = rsp.defrost_limit();
        Ok(())
    }

    /// Pop logged temperatures until the (0,0) sentinel; entries append to
    /// the store, which is drained on request.
    fn drain_logged_temps<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
    ) -> Result<(), BusError> {
        for _ in 0..LOGGED_TEMP_LIMIT {
            let payload = self.request(
                bus,
                sink,
                cmd_cups::GET_LOGGED_TEMP,
                &cmd_cups::get_logged_temp_req(),
            )?;
            let rsp = cmd_cups::LoggedTempRsp::from_payload(&payload)
                .ok_or(BusError::BadPayloadLength)?;
            if rsp.is_sentinel() {
                return Ok(());
            }
            self.logged_temps.push((rsp.index(), rsp.temperature()));
        }
        warn!("logged-temperature drain hit its iteration bound");
        Ok(())
    }

    fn read_compressor_error<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
    ) -> Result<u8, BusError> {
        let payload = self.request(
            bus,
            sink,
            cmd_cups::GET_COMPR_ERROR,
            &cmd_cups::get_compressor_error_req(),
        )?;
        if payload.is_empty() {
            return Err(BusError::BadPayloadLength);
        }
        self.compressor_error_bits = payload[0];
        Ok(payload[0])
    }

    /// Read both calibrated probe IDs as display strings.
    pub fn probe_ids<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
    ) -> Result<(String, String), BusError> {
        let mut read = |channel| -> Result<String, BusError> {
            let payload =
                self.request(bus, sink, cmd_cups::GET_CAL_PROBE_ID, &cmd_cups::probe_id_req(channel))?;
            let rsp = cmd_cups::ProbeIdRsp::from_payload(&payload)
                .ok_or(BusError::BadPayloadLength)?;
            Ok(rsp.id_string())
        };
        let cold = read(cmd_cups::ProbeChannel::ColdCube)?;
        let ambient = read(cmd_cups::ProbeChannel::Ambient)?;
        Ok((cold, ambient))
    }

    /// Write set-point and range, then read the settings back after a
    /// short settle.
    pub fn set_temperature<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
        temp_hundredths: i16,
        range_hundredths: u8,
    ) -> Result<(), BusError> {
        debug!("setting temperature to {temp_hundredths} range {range_hundredths}");
        bus.send(
            CUPS_ADDR,
            cmd_cups::SET_TEMPERATURE,
            false,
            &cmd_cups::set_temperature_cmd(temp_hundredths, range_hundredths),
        )?;
        std::thread::sleep(SET_READBACK_DELAY);
        self.read_persistent_settings(bus, sink)
    }

    /// Write defrost period/length/limit, then read the settings back.
    pub fn set_defrost<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
        sink: &mut dyn EventSink,
        period: u16,
        length: u8,
        limit_hundredths: i16,
    ) -> Result<(), BusError> {
        debug!("setting defrost to period {period} length {length} limit {limit_hundredths}");
        bus.send(
            CUPS_ADDR,
            cmd_cups::SET_DEFROST,
            false,
            &cmd_cups::set_defrost_cmd(period, length, limit_hundredths),
        )?;
        std::thread::sleep(SET_READBACK_DELAY);
        self.read_persistent_settings(bus, sink)
    }

    /// Start a defrost cycle. Automatic chilling uses the arm-then-fire
    /// pair 0x20/0x60; manual uses 0x00/0x40.
    pub fn initiate_defrost<P: BusPort>(&mut self, bus: &mut Bus<P>) -> Result<(), BusError> {
        let (arm, fire) = if self.auto_chill { (0x20, 0x60) } else { (0x00, 0x40) };
        bus.send(
            CUPS_ADDR,
            cmd_cups::INITIATE_OPERATION,
            false,
            &cmd_cups::operation_cmd(arm),
        )?;
        bus.send(
            CUPS_ADDR,
            cmd_cups::INITIATE_OPERATION,
            false,
            &cmd_cups::operation_cmd(fire),
        )
    }

    /// Start a battery self-test: 0x21 in automatic mode, 0x01 in manual.
    pub fn initiate_battery_test<P: BusPort>(
        &mut self,
        bus: &mut Bus<P>,
    ) -> Result<(), BusError> {
        let op = if self.auto_chill { 0x21 } else { 0x01 };
        bus.send(
            CUPS_ADDR,
            cmd_cups::INITIATE_OPERATION,
            false,
            &cmd_cups::operation_cmd(op),
        )
    }

    /// Reset the cold-cube controller.
    pub fn reset<P: BusPort>(&mut self, bus: &mut Bus<P>) -> Result<(), BusError> {
        bus.send(CUPS_ADDR, cmd_cups::RESET, false, &cmd_cups::reset_cmd())
    }
}

impl Default for ColdCube {
    fn default() -> Self {
        ColdCube::new()
    }
}
