//! # Firmware programmer
//!
//! Drives the bus in the DSB bootloader-mode protocol. Never runs while
//! the daemon owns the serial device.
//!
//! Sequence: broadcast "enter bootloader", verify every responding board
//! switched with a discovery-light sweep, drain stale error logs, then
//! stream the Intel-HEX file record by record to the download address
//! with an operator-configured inter-record delay. Errors are reported
//! after the fact: each EOF record (and, in debug mode, every record)
//! triggers an error poll across all boards, attributed to the offending
//! line number. A final sweep verifies the boards left bootloader mode.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};

use crate::bus::{Bus, DEFAULT_TIMEOUT, NullSink};
use crate::cmd::{cmd_dsb, reply_of};
use crate::frame::{CONTROLLER_ADDR, DSB_FIRST_ADDR, DSB_LAST_ADDR};
use crate::hex::HexRecord;
use crate::port::BusPort;

/// Pause between the bootloader broadcast and the mode check.
const MODE_SWITCH_WAIT: Duration = Duration::from_secs(1);
/// Pause before the error poll on an EOF record.
const EOF_SETTLE: Duration = Duration::from_micros(100);

/// What a programming run did.
#[derive(Debug, Default, Clone)]
pub struct ProgramSummary {
    pub lines_sent: usize,
    pub lines_with_errors: usize,
    /// Boards were all in bootloader mode when streaming started.
    pub entered_bootloader: bool,
    /// Boards were all back in firmware mode afterwards.
    pub exited_bootloader: bool,
}

impl ProgramSummary {
    /// Strict success: both mode checks passed and no record errored.
    pub fn succeeded(&self) -> bool {
        self.entered_bootloader && self.exited_bootloader && self.lines_with_errors == 0
    }
}

pub struct Programmer<P> {
    bus: Bus<P>,
    delay: Duration,
    verbose: bool,
    check_every_record: bool,
    /// Which addresses answered the last sweep.
    present: [bool; 14],
}

impl<P: BusPort> Programmer<P> {
    /// `delay` is the inter-record gap; `check_every_record` polls errors
    /// after every record instead of only at EOF records.
    pub fn new(bus: Bus<P>, delay: Duration, verbose: bool, check_every_record: bool) -> Self {
        Programmer {
            bus,
            delay,
            verbose,
            check_every_record,
            // Until a sweep says otherwise, assume every address is there.
            present: [true; 14],
        }
    }

    /// Sweep every DSB address with a discovery-light probe, record who
    /// answers, and check each responder is in the expected mode.
    /// Returns false if any responding board is in the wrong mode.
    pub fn discover_light(&mut self, expect_bootloader: bool) -> bool {
        info!(
            "sweeping for DSBs, expecting {} mode",
            if expect_bootloader { "bootloader" } else { "firmware" }
        );
        let mut all_ok = true;

        for addr in DSB_FIRST_ADDR..=DSB_LAST_ADDR {
            self.present[addr as usize] = false;

            let frame = match self.bus.send_and_receive(
                &mut NullSink,
                addr,
                cmd_dsb::DISCOVER_LIGHT,
                true,
                &cmd_dsb::discover_light_req(),
                DEFAULT_TIMEOUT,
            ) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("no discovery-light reply from address {addr}: {e}");
                    continue;
                }
            };

            if frame.addr != CONTROLLER_ADDR {
                warn!("discovery-light reply from wrong source {}", frame.addr);
                continue;
            }
            if frame.msg_type != reply_of(cmd_dsb::DISCOVER_LIGHT) {
                warn!("discovery-light reply has wrong type {:#04x}", frame.msg_type);
                continue;
            }
            let Some(rsp) = cmd_dsb::DiscoverLightRsp::from_payload(&frame.payload) else {
                warn!("discovery-light reply has {} payload bytes", frame.payload.len());
                continue;
            };

            self.present[addr as usize] = true;
            info!(
                "DSB {addr} v{}.{} {}",
                rsp.version_major(),
                rsp.version_minor(),
                if rsp.bootloader() { "(bootloader)" } else { "" }
            );
            if rsp.bootloader() != expect_bootloader {
                warn!(
                    "DSB {addr} is in the wrong mode (bootloader: {})",
                    rsp.bootloader()
                );
                all_ok = false;
            }
        }
        all_ok
    }

    /// Poll the error log of every responding board. Reading clears the
    /// log on the board.
    pub fn check_errors(&mut self) -> Vec<(u8, Vec<u8>)> {
        let mut report = Vec::new();
        for addr in DSB_FIRST_ADDR..=DSB_LAST_ADDR {
            if !self.present[addr as usize] {
                continue;
            }
            let frame = match self.bus.send_and_receive(
                &mut NullSink,
                addr,
                cmd_dsb::GET_ERRORS,
                true,
                &cmd_dsb::get_errors_req(),
                DEFAULT_TIMEOUT,
            ) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("error poll of address {addr} failed: {e}");
                    continue;
                }
            };
            if frame.msg_type != reply_of(cmd_dsb::GET_ERRORS) {
                warn!(
                    "error poll of address {addr} returned type {:#04x}",
                    frame.msg_type
                );
                continue;
            }
            let Some(rsp) = cmd_dsb::ErrorsRsp::from_payload(&frame.payload) else {
                warn!("error reply has {} payload bytes", frame.payload.len());
                continue;
            };
            let codes = rsp.codes();
            if !codes.is_empty() {
                report.push((addr, codes));
            }
        }
        report
    }

    /// Stream `hex_path` to every board in bootloader mode.
    pub fn program(&mut self, hex_path: &Path) -> io::Result<ProgramSummary> {
        let file = File::open(hex_path)?;
        let reader = BufReader::new(file);
        let mut summary = ProgramSummary::default();

        info!("broadcasting bootloader mode");
        if let Err(e) = self.bus.send(
            crate::frame::BROADCAST_ADDR,
            cmd_dsb::BOOTLOADER_MODE,
            false,
            &cmd_dsb::bootloader_mode_cmd(true),
        ) {
            warn!("bootloader broadcast failed: {e}");
        }
        std::thread::sleep(MODE_SWITCH_WAIT);

        summary.entered_bootloader = self.discover_light(true);

        // Drop whatever stale errors the boards accumulated.
        let stale = self.check_errors();
        if !stale.is_empty() {
            debug!("cleared stale error logs: {stale:?}");
        }

        info!(
            "programming {} with {} ms between records",
            hex_path.display(),
            self.delay.as_millis()
        );

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let record = match HexRecord::parse(&line) {
                Ok(record) => record,
                Err(e) => {
                    warn!("line {line_num} is not a valid record ({e:?}): {line}");
                    continue;
                }
            };

            if record.is_eof() {
                info!("EOF record at line {line_num}, polling errors");
                std::thread::sleep(EOF_SETTLE);
                self.report_errors(line_num, &line, &mut summary);
            }

            if let Err(e) = self.bus.send_hex_record(&record.with_count_prefix()) {
                warn!("failed to send record at line {line_num}: {e}");
                summary.lines_with_errors += 1;
                continue;
            }
            summary.lines_sent += 1;
            std::thread::sleep(self.delay);

            if self.check_every_record {
                self.report_errors(line_num, &line, &mut summary);
            } else if self.verbose {
                info!("sent line {line_num}: {line}");
            }
        }

        info!(
            "processed {} lines with {} errors",
            summary.lines_sent, summary.lines_with_errors
        );

        // Give the boards a moment to reboot into firmware, then verify.
        std::thread::sleep(MODE_SWITCH_WAIT);
        summary.exited_bootloader = self.discover_light(false);

        Ok(summary)
    }

    fn report_errors(&mut self, line_num: usize, line: &str, summary: &mut ProgramSummary) {
        let failures = self.check_errors();
        if failures.is_empty() {
            return;
        }
        summary.lines_with_errors += 1;
        for (addr, codes) in failures {
            warn!("errors on line {line_num} from DSB {addr}: {codes:?} <{line}>");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use crate::testport::ScriptPort;

    #[test]
    fn discover_light_checks_mode() {
        let mut port = ScriptPort::new();
        // Address 1 answers in bootloader mode, firmware 2.1.
        port.queue_frame(
            CONTROLLER_ADDR,
            reply_of(cmd_dsb::DISCOVER_LIGHT),
            &[0x10, 0x21],
        );
        let mut prog = Programmer::new(
            Bus::new(port),
            Duration::from_millis(10),
            false,
            false,
        );
        assert!(prog.discover_light(true));
        assert!(prog.present[1]);
        assert!(!prog.present[2]);
    }

    #[test]
    fn discover_light_flags_wrong_mode() {
        let mut port = ScriptPort::new();
        // Still in firmware mode when bootloader mode was expected.
        port.queue_frame(
            CONTROLLER_ADDR,
            reply_of(cmd_dsb::DISCOVER_LIGHT),
            &[0x00, 0x21],
        );
        let mut prog = Programmer::new(
            Bus::new(port),
            Duration::from_millis(10),
            false,
            false,
        );
        assert!(!prog.discover_light(true));
    }

    #[test]
    fn check_errors_reports_per_address() {
        let mut port = ScriptPort::new();
        // Address 1: two errors. Address 2: clean log.
        port.queue_frame(
            CONTROLLER_ADDR,
            reply_of(cmd_dsb::GET_ERRORS),
            &[0x32, 0x04, 0x00, 0x00],
        );
        port.queue_frame(
            CONTROLLER_ADDR,
            reply_of(cmd_dsb::GET_ERRORS),
            &[0x00, 0x00, 0x00, 0x00],
        );
        let mut prog = Programmer::new(
            Bus::new(port),
            Duration::from_millis(10),
            false,
            false,
        );
        prog.present = [false; 14];
        prog.present[1] = true;
        prog.present[2] = true;

        let report = prog.check_errors();
        assert_eq!(report, vec![(1u8, vec![3u8, 4])]);
    }

    #[test]
    fn records_ride_the_download_address() {
        let mut prog = Programmer::new(
            Bus::new(ScriptPort::new()),
            Duration::from_millis(10),
            false,
            false,
        );
        let record = HexRecord::parse(":10010000214601360121470136007EFE09D2190140").unwrap();
        prog.bus.send_hex_record(&record.with_count_prefix()).unwrap();

        let tx = &prog.bus.port_mut().tx;
        // 8-byte length class to address 30, HEX record type.
        assert_eq!(tx[0], 0x60 | frame::DOWNLOAD_ADDR);
        assert_eq!(tx[1], cmd_dsb::HEX_RECORD);
        // Count prefix then the raw record.
        assert_eq!(tx[2], 21);
        assert_eq!(tx[3], 0x10);
    }
}
