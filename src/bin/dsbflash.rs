//! Offline DSB firmware programmer.
//!
//! Shares the bus framer and CRC with the daemon but speaks the
//! bootloader-mode protocol. Must not run while the daemon owns the
//! serial device.
//!
//! Exit codes: 0 success, -1 bad arguments, -2 device open failure,
//! -3 programming failure.

use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use log::LevelFilter;

use chillbus::bus::Bus;
use chillbus::logging;
use chillbus::port::{Baud, SerialPort};
use chillbus::prog::Programmer;

const PROGRAMMER_MAJOR: u8 = 1;
const PROGRAMMER_MINOR: u8 = 2;

fn usage(name: &str) {
    eprintln!(
        "Usage: {name}\n\
         \t-d <device>  : RS-485 dev file (default /dev/ttyUSB0)\n\
         \t-f <file>    : Hex file\n\
         \t-p           : Program the DSBs\n\
         \t-i           : Run discovery\n\
         \t-l <delay>   : Delay between hex records in ms. Valid range: 10 to 10000\n\
         \t-b <baud>    : Baud rate. Supported: 38400, 115200\n\
         \t-v           : Verbose. Print every hex record sent\n\
         \t-g           : Debug. Check for errors after every hex record\n"
    );
}

fn main() {
    println!("Programmer version: {PROGRAMMER_MAJOR}.{PROGRAMMER_MINOR}");

    let mut device = PathBuf::from("/dev/ttyUSB0");
    let mut hex_file: Option<PathBuf> = None;
    let mut baud = Baud::B115200;
    let mut delay_ms: u64 = 100;
    let mut do_program = false;
    let mut do_discover = false;
    let mut verbose = false;
    let mut debug = false;

    let argv: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "-d" => {
                i += 1;
                match argv.get(i) {
                    Some(dev) => device = PathBuf::from(dev),
                    None => {
                        eprintln!("device argument needs a parameter");
                        usage(&argv[0]);
                        exit(-1);
                    }
                }
            }
            "-f" => {
                i += 1;
                match argv.get(i) {
                    Some(f) => hex_file = Some(PathBuf::from(f)),
                    None => {
                        eprintln!("hex file argument needs a parameter");
                        usage(&argv[0]);
                        exit(-1);
                    }
                }
            }
            "-b" => {
                i += 1;
                baud = match argv.get(i).map(String::as_str) {
                    Some("115200") => Baud::B115200,
                    Some("38400") => Baud::B38400,
                    _ => {
                        eprintln!("invalid baud rate");
                        usage(&argv[0]);
                        exit(-1);
                    }
                };
            }
            "-l" => {
                i += 1;
                delay_ms = match argv.get(i).and_then(|s| s.parse().ok()) {
                    Some(ms) => ms,
                    None => {
                        eprintln!("delay needs a numeric argument");
                        usage(&argv[0]);
                        exit(-1);
                    }
                };
            }
            "-p" => do_program = true,
            "-i" => do_discover = true,
            "-v" => verbose = true,
            "-g" => debug = true,
            other => {
                eprintln!("unknown argument: {other}");
                usage(&argv[0]);
                exit(-1);
            }
        }
        i += 1;
    }

    if !(10..=10000).contains(&delay_ms) {
        eprintln!("delay out of bounds");
        usage(&argv[0]);
        exit(-1);
    }
    if !do_program && !do_discover {
        eprintln!("nothing to do: pass -p or -i");
        usage(&argv[0]);
        exit(-1);
    }
    if do_program && hex_file.is_none() {
        eprintln!("no programming file specified");
        usage(&argv[0]);
        exit(-1);
    }

    logging::init(if verbose || debug { LevelFilter::Debug } else { LevelFilter::Info });

    let port = match SerialPort::open(&device, baud) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("could not open device {}: {e}", device.display());
            exit(-2);
        }
    };

    let mut prog = Programmer::new(
        Bus::new(port),
        Duration::from_millis(delay_ms),
        verbose,
        debug,
    );

    let mut ok = true;
    if do_discover {
        ok &= prog.discover_light(false);
    }
    if let (true, Some(hex_file)) = (do_program, &hex_file) {
        match prog.program(hex_file) {
            Ok(summary) => {
                println!(
                    "sent {} lines, {} with errors",
                    summary.lines_sent, summary.lines_with_errors
                );
                ok &= summary.succeeded();
            }
            Err(e) => {
                eprintln!("programming failed: {e}");
                ok = false;
            }
        }
    }

    if !ok {
        eprintln!("programming failed");
        exit(-3);
    }
}
