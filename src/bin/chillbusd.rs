//! Hardware-abstraction daemon for the drawer appliance.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{LevelFilter, info};

use chillbus::daemon::{Daemon, DaemonConfig, install_signal_handlers};
use chillbus::{VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH, logging};

fn usage(name: &str) {
    eprintln!(
        "Usage: {name}\n\
         \t-d               : verbose (debug) logging\n\
         \t-q               : quiet logging (warnings only)\n\
         \t-f <seconds>     : DSB poll interval (default 2)\n\
         \t-i               : initialize peers at startup\n\
         \t--serial <dev>   : RS-485 device (default /dev/ttyPS1)\n\
         \t--urs485         : use /dev/ttyUSB0\n\
         \t--cups=0         : run without the cold-cube controller\n\
         \t--cmd-sock <p>   : command socket path\n\
         \t--event-sock <p> : event socket path\n"
    );
}

fn main() -> Result<()> {
    let mut cfg = DaemonConfig::default();
    let mut level = LevelFilter::Info;
    let mut init_on_start = false;

    let argv: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "-d" => level = LevelFilter::Debug,
            "-q" => level = LevelFilter::Warn,
            "-i" => init_on_start = true,
            "-f" => {
                i += 1;
                let secs: u64 = argv
                    .get(i)
                    .and_then(|s| s.parse().ok())
                    .context("-f needs a number of seconds")?;
                cfg.dsb_poll_interval = Duration::from_secs(secs);
            }
            "--serial" => {
                i += 1;
                cfg.serial_device =
                    PathBuf::from(argv.get(i).context("--serial needs a device path")?);
            }
            "--urs485" => cfg.serial_device = PathBuf::from("/dev/ttyUSB0"),
            "--cups=0" => cfg.use_cups = false,
            "--cmd-sock" => {
                i += 1;
                cfg.command_socket =
                    PathBuf::from(argv.get(i).context("--cmd-sock needs a path")?);
            }
            "--event-sock" => {
                i += 1;
                cfg.event_socket =
                    PathBuf::from(argv.get(i).context("--event-sock needs a path")?);
            }
            other => {
                usage(&argv[0]);
                bail!("unknown argument: {other}");
            }
        }
        i += 1;
    }

    logging::init(level);
    info!(
        "starting chillbus daemon v{VERSION_MAJOR}.{VERSION_MINOR}.{VERSION_PATCH} on {}",
        cfg.serial_device.display()
    );

    install_signal_handlers();

    let mut daemon = Daemon::new(&cfg).with_context(|| {
        format!("failed to bring up the daemon on {}", cfg.serial_device.display())
    })?;

    if init_on_start {
        daemon.initialize_peers();
    }

    daemon.run();
    Ok(())
}
