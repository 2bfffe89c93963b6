//! Serial port binding for the RS-485 bus.
//!
//! The bus code is written against the small [`BusPort`] trait so that the
//! framer, the bus controller and the peer state machines can all be driven
//! from an in-memory transport in tests. [`SerialPort`] is the real
//! implementation: a termios character device in raw mode at 115200 (or
//! 38400 for the firmware programmer) 8N1, no flow control.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use log::debug;

/// Byte-level transport the bus controller drives.
///
/// `write` may block on the kernel transmit buffer. `read_one` blocks, but
/// callers only invoke it once `bytes_available` reported pending input.
pub trait BusPort {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Number of bytes sitting in the input queue.
    fn bytes_available(&mut self) -> io::Result<usize>;
    fn read_one(&mut self) -> io::Result<u8>;
}

/// Line speed of the serial device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Baud {
    B115200,
    B38400,
}

impl Baud {
    fn speed(self) -> libc::speed_t {
        match self {
            Baud::B115200 => libc::B115200,
            Baud::B38400 => libc::B38400,
        }
    }
}

/// An open RS-485 serial device.
pub struct SerialPort {
    file: File,
}

impl SerialPort {
    /// Open `dev` and configure it raw: 8 data bits, no parity, 1 stop bit,
    /// no hardware or software flow control, receiver enabled, local mode,
    /// VMIN=1, VTIME=2 decaseconds.
    pub fn open(dev: &Path, baud: Baud) -> io::Result<SerialPort> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(dev)?;
        let fd = file.as_raw_fd();

        // SAFETY: fd is a valid open descriptor and tio is only handed to
        // termios calls that treat it as an out/in parameter.
        unsafe {
            let mut tio: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut tio) != 0 {
                return Err(io::Error::last_os_error());
            }

            libc::cfmakeraw(&mut tio);
            if libc::cfsetispeed(&mut tio, baud.speed()) != 0
                || libc::cfsetospeed(&mut tio, baud.speed()) != 0
            {
                return Err(io::Error::last_os_error());
            }

            tio.c_cflag |= libc::CLOCAL | libc::CREAD;
            tio.c_cflag &= !libc::CSTOPB;
            tio.c_cflag &= !libc::CRTSCTS;
            tio.c_cc[libc::VMIN] = 1;
            tio.c_cc[libc::VTIME] = 2;

            if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        debug!("opened {} at {:?}", dev.display(), baud);
        Ok(SerialPort { file })
    }
}

impl BusPort for SerialPort {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let mut avail: libc::c_int = 0;
        // SAFETY: FIONREAD writes a c_int for a valid descriptor.
        let rc = unsafe {
            libc::ioctl(self.file.as_raw_fd(), libc::FIONREAD as _, &mut avail)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(avail.max(0) as usize)
    }

    fn read_one(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.file.read_exact(&mut buf)?;
        Ok(buf[0])
    }
}
