//! # Cooperative scheduler
//!
//! Single-threaded event loop multiplexing the bus, the two stream
//! sockets, the camera frame path and the door-sensor GPIO. Each outer
//! iteration:
//!
//! 1. check the shutdown flag set by the signal handlers
//! 2. build a readiness set (sockets + camera fds) and poll it, 25 ms
//! 3. drain the command socket, one full message per tick
//! 4. drain the event socket (detects disconnect only)
//! 5. tick the bus controller (opportunistic broadcast drain)
//! 6. tick the cameras
//! 7. tick the cold-cube peer (fast + slow cadences)
//! 8. tick the DSB subsystem (reset cooldown, poll, event intake)
//! 9. poll the door-sensor GPIO
//!
//! Every tick ends with the pending-event queue flushed onto the event
//! socket. No step may block past its own internal timeout; 100 ms is the
//! standard per-frame bus budget and 25 ms the outer poll budget.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use std::{fmt, io};

use log::{debug, info, warn};

use crate::bus::Bus;
use crate::cmd::cmd_dsb::CLEAR_INDICES_TOKEN;
use crate::cups::ColdCube;
use crate::dsb::{DsbSubsystem, DEFAULT_POLL_INTERVAL};
use crate::message::{self, Message};
use crate::port::{Baud, BusPort, SerialPort};
use crate::socket::SocketServer;
use crate::HalEvent;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Install SIGINT/SIGTERM handlers that request a clean shutdown, and
/// ignore SIGPIPE so a vanished client surfaces as a write error.
pub fn install_signal_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int);
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

/// One frame out of a camera pipeline.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub camera: u8,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl fmt::Display for CapturedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "camera {} frame {}x{} ({} bytes)",
            self.camera,
            self.width,
            self.height,
            self.data.len()
        )
    }
}

/// Seam to the imaging collaborator. The daemon owns the scheduling; the
/// capture pipeline owns its buffers and the V4L2 plumbing behind this
/// trait.
pub trait FrameSource {
    /// Readiness descriptor to include in the outer poll, when streaming.
    fn poll_fd(&self) -> Option<std::os::unix::io::RawFd>;
    /// Dequeue one ready frame, or None if nothing is pending. Must not
    /// block; buffers are re-queued internally.
    fn pump(&mut self) -> Option<CapturedFrame>;
}

pub struct DaemonConfig {
    pub serial_device: PathBuf,
    pub command_socket: PathBuf,
    pub event_socket: PathBuf,
    pub dsb_poll_interval: std::time::Duration,
    pub door_gpio: PathBuf,
    pub use_cups: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            serial_device: PathBuf::from("/dev/ttyPS1"),
            command_socket: PathBuf::from("/run/chillbus-cmd.sock"),
            event_socket: PathBuf::from("/run/chillbus-event.sock"),
            dsb_poll_interval: DEFAULT_POLL_INTERVAL,
            door_gpio: PathBuf::from("/sys/class/gpio/gpio463/value"),
            use_cups: true,
        }
    }
}

pub struct Daemon<P> {
    bus: Bus<P>,
    dsbs: DsbSubsystem,
    cups: Option<ColdCube>,
    command: SocketServer,
    events: SocketServer,
    cameras: Vec<Box<dyn FrameSource>>,
    continuous_capture: bool,
    one_shot_armed: bool,
    cached_image: Option<CapturedFrame>,
    door_gpio: PathBuf,
    door_state: bool,
    door_fail_count: u32,
    initialized: bool,
    pending: Vec<HalEvent>,
}

impl Daemon<SerialPort> {
    /// Open the serial device and bind both sockets. Open failures are
    /// fatal; the daemon cannot run without its bus.
    pub fn new(cfg: &DaemonConfig) -> io::Result<Daemon<SerialPort>> {
        let port = SerialPort::open(&cfg.serial_device, Baud::B115200)?;
        Daemon::with_port(port, cfg)
    }
}

impl<P: BusPort> Daemon<P> {
    pub fn with_port(port: P, cfg: &DaemonConfig) -> io::Result<Daemon<P>> {
        let command = SocketServer::bind(&cfg.command_socket)?;
        let events = SocketServer::bind(&cfg.event_socket)?;
        let mut bus = Bus::new(port);
        let mut dsbs = DsbSubsystem::new(cfg.dsb_poll_interval);

        // Reset every peer into a known state; the boards' self-assign
        // broadcasts (or the cooldown alone) lead into first discovery.
        if let Err(e) = dsbs.global_reset(&mut bus) {
            warn!("failed to broadcast reset during startup: {e}");
        }

        Ok(Daemon {
            bus,
            dsbs,
            cups: cfg.use_cups.then(ColdCube::new),
            command,
            events,
            cameras: Vec::new(),
            continuous_capture: false,
            one_shot_armed: false,
            cached_image: None,
            door_gpio: cfg.door_gpio.clone(),
            door_state: false,
            door_fail_count: 0,
            initialized: false,
            pending: Vec::new(),
        })
    }

    /// Attach a camera pipeline. Order matters: clients address cameras
    /// by index.
    pub fn add_camera(&mut self, camera: Box<dyn FrameSource>) {
        self.cameras.push(camera);
    }

    /// Run until a signal requests shutdown.
    pub fn run(&mut self) {
        info!("entering event loop");
        while !shutdown_requested() {
            self.tick(Instant::now());
        }
        info!("shutting down");
        self.command.close();
        self.events.close();
    }

    /// One pass of the scheduler. Public so tests can drive the loop with
    /// their own clock.
    pub fn tick(&mut self, now: Instant) {
        self.poll_readiness();

        // One full command per tick keeps the bus and cameras serviced
        // even under a chatty client.
        self.command.accept_ready();
        if let Some(msg) = self.command.try_receive() {
            let reply = self.dispatch(msg);
            self.command.send(&reply);
        }

        // The event socket never carries inbound data; reading it is how
        // a disconnect is noticed.
        self.events.accept_ready();
        let _ = self.events.try_receive();

        self.bus.tick(self.dsbs.intake_mut());

        self.tick_cameras();

        if let Some(cups) = self.cups.as_mut() {
            if self.initialized {
                cups.tick(&mut self.bus, self.dsbs.intake_mut(), now, &mut self.pending);
            }
        }

        self.dsbs.tick(&mut self.bus, now, &mut self.pending);

        self.tick_door_sensor();

        // Every tick ends with the queue drained.
        for event in std::mem::take(&mut self.pending) {
            let msg = event_message(&event);
            self.events.send(&msg);
        }
    }

    /// Readiness multiplexing over the sockets and any streaming camera.
    /// The 25 ms budget paces the loop; all downstream reads are
    /// non-blocking either way.
    fn poll_readiness(&mut self) {
        let mut fds: Vec<libc::pollfd> = Vec::new();
        for fd in self.command.poll_fds().into_iter().chain(self.events.poll_fds()) {
            fds.push(libc::pollfd { fd, events: libc::POLLIN, revents: 0 });
        }
        for cam in &self.cameras {
            if let Some(fd) = cam.poll_fd() {
                fds.push(libc::pollfd { fd, events: libc::POLLIN, revents: 0 });
            }
        }
        // SAFETY: fds points at a live array for the duration of the call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 25) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                warn!("poll failed: {err}");
            }
        }
    }

    fn tick_cameras(&mut self) {
        for cam in &mut self.cameras {
            while let Some(frame) = cam.pump() {
                debug!("{frame}");
                if self.one_shot_armed {
                    self.one_shot_armed = false;
                    self.cached_image = Some(frame.clone());
                    self.pending.push(HalEvent::ImageCaptured(frame));
                } else if self.continuous_capture {
                    self.pending.push(HalEvent::ImageCaptured(frame));
                }
            }
        }
    }

    /// Sysfs GPIO door sensor; an edge becomes an event.
    fn tick_door_sensor(&mut self) {
        match std::fs::read_to_string(&self.door_gpio) {
            Ok(raw) => {
                let Some(first) = raw.trim().chars().next() else { return };
                let state = first == '1';
                if state != self.door_state {
                    self.door_state = state;
                    self.pending.push(HalEvent::DoorChanged(state));
                }
            }
            Err(_) => {
                self.door_fail_count += 1;
                if self.door_fail_count >= 50 {
                    debug!("failed to read door sensor at {}", self.door_gpio.display());
                    self.door_fail_count = 0;
                }
            }
        }
    }

    /// First-contact ceremony, shared by the Initialize message and the
    /// `-i` startup flag.
    pub fn initialize_peers(&mut self) {
        if self.initialized {
            return;
        }
        if let Some(cups) = self.cups.as_mut() {
            if let Err(e) =
                cups.initialize(&mut self.bus, self.dsbs.intake_mut(), &mut self.pending)
            {
                warn!("cold-cube initialize failed: {e}");
            }
        }
        self.initialized = true;
    }

    /// Translate one inbound request into its reply.
    fn dispatch(&mut self, msg: Message) -> Message {
        debug!(
            "request type {:#04x} sub {:#04x} imm {:?}",
            msg.msg_type, msg.sub_type, msg.imm
        );

        if msg.msg_type == message::management::TYPE
            && msg.sub_type == message::management::INITIALIZE
        {
            self.initialize_peers();
            let crev = self.cups.as_ref().map_or(0, |c| {
                let (major, minor) = c.version();
                (((major as u32) << 4) & 0xF0) | (minor as u32 & 0x0F)
            });
            let drev = self.dsbs.versions();
            info!("initialized: {} DSBs enrolled", self.dsbs.count());
            return Message::new(
                message::management::TYPE,
                message::management::INITIALIZE,
                [0, drev, crev, Message::daemon_revision()],
                Vec::new(),
            );
        }

        if !self.initialized {
            return Message::nack(&msg, "not yet initialized");
        }

        match msg.msg_type {
            message::image::TYPE => self.dispatch_image(msg),
            message::cups::TYPE => self.dispatch_cups(msg),
            message::dsb::TYPE => self.dispatch_dsb(msg),
            message::hardware::TYPE => Message::nack(&msg, "unknown hardware request"),
            _ => Message::nack(&msg, "unsupported message type"),
        }
    }

    fn dispatch_image(&mut self, msg: Message) -> Message {
        match msg.sub_type {
            message::image::CAPTURE_IMAGE => {
                if self.cameras.is_empty() {
                    return Message::nack(&msg, "no cameras attached");
                }
                self.one_shot_armed = true;
                Message::ack(&msg)
            }
            message::image::CONTINUOUS_CAPTURE => {
                self.continuous_capture = msg.imm[2] == 1;
                debug!("continuous capture: {}", self.continuous_capture);
                Message::ack(&msg)
            }
            message::image::GET_IMAGE => match &self.cached_image {
                Some(frame) => Message::new(
                    message::image::TYPE,
                    message::image::SEND_IMAGE,
                    [frame.camera as u32, frame.width, frame.height, frame.data.len() as u32],
                    frame.data.clone(),
                ),
                None => Message::nack(&msg, "no image captured"),
            },
            _ => Message::nack(&msg, "unknown image request"),
        }
    }

    fn dispatch_cups(&mut self, msg: Message) -> Message {
        let Some(cups) = self.cups.as_mut() else {
            return Message::nack(&msg, "running without cold-cube support");
        };
        let bus = &mut self.bus;
        let sink = self.dsbs.intake_mut();

        match msg.sub_type {
            message::cups::SET_TEMPERATURE => {
                let temp = msg.imm[0] as i32;
                let range = msg.imm[1] as i32;
                if !(-2000..=4000).contains(&temp) {
                    return Message::nack(&msg, "temperature out of range");
                }
                if !(0..=255).contains(&range) {
                    return Message::nack(&msg, "range out of bounds");
                }
                match cups.set_temperature(bus, sink, temp as i16, range as u8) {
                    Ok(()) => Message::ack(&msg),
                    Err(e) => {
                        warn!("set temperature failed: {e}");
                        Message::nack(&msg, "failed to set temperature")
                    }
                }
            }
            message::cups::GET_TEMPERATURE => Message::new(
                message::cups::TYPE,
                message::cups::GET_TEMPERATURE,
                [
                    (cups.set_point() * 100.0) as i32 as u32,
                    (cups.temp_range() * 100.0) as i32 as u32,
                    0,
                    0,
                ],
                Vec::new(),
            ),
            message::cups::GET_ALL_TEMPERATURES => {
                let board = cups.board_config();
                let mut entries =
                    vec![("thermistor", cups.thermistor_temp())];
                if board.cal_cold_present {
                    entries.push(("calibrated_cold_cube", cups.calibrated_cold_temp()));
                }
                if board.cal_ambient_present {
                    entries.push(("calibrated_ambient", cups.calibrated_ambient_temp()));
                }
                let count = entries.len() as u32;
                let payload = named_list(&entries);
                Message::new(
                    message::cups::TYPE,
                    message::cups::GET_ALL_TEMPERATURES,
                    [count, 0, 0, 0],
                    payload,
                )
            }
            message::cups::SET_DEFROST_PARAMS => {
                if msg.imm[0] > u16::MAX as u32 {
                    return Message::nack(&msg, "defrost period out of range");
                }
                if msg.imm[1] > u8::MAX as u32 {
                    return Message::nack(&msg, "defrost length out of range");
                }
                let limit = msg.imm[2] as i32;
                if !(-2000..=4000).contains(&limit) {
                    return Message::nack(&msg, "defrost limit out of range");
                }
                match cups.set_defrost(bus, sink, msg.imm[0] as u16, msg.imm[1] as u8, limit as i16)
                {
                    Ok(()) => Message::ack(&msg),
                    Err(e) => {
                        warn!("set defrost failed: {e}");
                        Message::nack(&msg, "failed to set defrost settings")
                    }
                }
            }
            message::cups::GET_DEFROST_PARAMS => {
                let (period, length, limit) = cups.defrost_params();
                Message::new(
                    message::cups::TYPE,
                    message::cups::GET_DEFROST_PARAMS,
                    [period as u32, length as u32, (limit * 100.0) as i32 as u32, 0],
                    Vec::new(),
                )
            }
            message::cups::INITIATE_DEFROST => match cups.initiate_defrost(bus) {
                Ok(()) => Message::ack(&msg),
                Err(_) => Message::nack(&msg, "failed to initiate defrost"),
            },
            message::cups::INITIATE_BATTERY_TEST => match cups.initiate_battery_test(bus) {
                Ok(()) => Message::ack(&msg),
                Err(_) => Message::nack(&msg, "failed to initiate battery test"),
            },
            message::cups::GET_ALL_VOLTAGES => {
                let (supply, battery, backplane, charger) = cups.voltages();
                let entries = [
                    ("supply", supply),
                    ("battery", battery),
                    ("backplane", backplane),
                    ("charger", charger),
                ];
                Message::new(
                    message::cups::TYPE,
                    message::cups::GET_ALL_VOLTAGES,
                    [entries.len() as u32, 0, 0, 0],
                    named_list(&entries),
                )
            }
            message::cups::GET_BATTERY_PERCENT => Message::new(
                message::cups::TYPE,
                message::cups::GET_BATTERY_PERCENT,
                [cups.charge_percent() as u32, 0, 0, 0],
                Vec::new(),
            ),
            message::cups::GET_STORED_TEMPERATURES => {
                let temps = cups.take_logged_temps();
                let mut payload = Vec::new();
                for (index, temp) in &temps {
                    payload.extend_from_slice(format!("{index}:{temp:.2}").as_bytes());
                    payload.push(0);
                }
                Message::new(
                    message::cups::TYPE,
                    message::cups::GET_STORED_TEMPERATURES,
                    [temps.len() as u32, 0, 0, 0],
                    payload,
                )
            }
            message::cups::GET_PROBE_IDS => match cups.probe_ids(bus, sink) {
                Ok((cold, ambient)) => {
                    let mut payload = Vec::new();
                    payload.extend_from_slice(format!("coldcube:{cold}").as_bytes());
                    payload.push(0);
                    payload.extend_from_slice(format!("ambient:{ambient}").as_bytes());
                    payload.push(0);
                    Message::new(
                        message::cups::TYPE,
                        message::cups::GET_PROBE_IDS,
                        [2, 0, 0, 0],
                        payload,
                    )
                }
                Err(e) => {
                    warn!("probe ID read failed: {e}");
                    Message::nack(&msg, "failed to read probe IDs")
                }
            },
            message::cups::COMPRESSOR_ERROR => Message::new(
                message::cups::TYPE,
                message::cups::COMPRESSOR_ERROR,
                [cups.compressor_error_bits() as u32, 0, 0, 0],
                Vec::new(),
            ),
            message::cups::RESET => match cups.reset(bus) {
                Ok(()) => Message::ack(&msg),
                Err(e) => {
                    warn!("cold-cube reset failed: {e}");
                    Message::nack(&msg, "failed to reset the cold-cube")
                }
            },
            _ => Message::nack(&msg, "unknown cold-cube request"),
        }
    }

    fn dispatch_dsb(&mut self, msg: Message) -> Message {
        let bus = &mut self.bus;
        match msg.sub_type {
            message::dsb::SET_BOOTLOADER_MODE => {
                let mode = msg.imm[0] != 0;
                reply_for(&msg, self.dsbs.set_bootloader_mode(bus, mode))
            }
            message::dsb::RESET => reply_for(&msg, self.dsbs.global_reset(bus)),
            message::dsb::SET_GLOBAL_LOCK => {
                let locked = msg.imm[0] != 0;
                let manual = msg.imm[1] != 0;
                debug!("set global lock: {locked}:{manual}");
                reply_for(&msg, self.dsbs.set_global_lock(bus, locked, manual))
            }
            message::dsb::DRAWER_OVERRIDE => {
                let index = (msg.imm[0] & 0x1F) as u8;
                let lock = msg.imm[1] != 1;
                reply_for(&msg, self.dsbs.drawer_override(bus, index, lock))
            }
            message::dsb::SET_FACTORY_MODE => {
                reply_for(&msg, self.dsbs.set_factory_mode(bus, msg.imm[0] != 0))
            }
            message::dsb::CLEAR_DRAWER_INDICES => {
                // The wipe only happens with a valid override token.
                let override_byte = if msg.imm[0] & 0xFFFF_FF00 == CLEAR_INDICES_TOKEN {
                    (msg.imm[0] & 0xFF) as u8
                } else {
                    0
                };
                reply_for(&msg, self.dsbs.clear_indices(bus, override_byte))
            }
            message::dsb::ASSIGN_DRAWER_INDEX => {
                let index = msg.imm[0];
                if !(1..=30).contains(&index) {
                    return Message::nack(&msg, "invalid drawer index");
                }
                reply_for(&msg, self.dsbs.assign_index(bus, index as u8))
            }
            message::dsb::DRAWER_RECALIBRATION => {
                reply_for(&msg, self.dsbs.recalibrate(bus, msg.imm[0] == 1))
            }
            message::dsb::GET_DRAWER_STATES => {
                let mut payload = Vec::new();
                let mut count = 0u32;
                for dsb in self.dsbs.roster() {
                    for drawer in &dsb.drawers {
                        payload.extend_from_slice(
                            format!(
                                "{}:{}:{}:{}:{}:{}",
                                drawer.index,
                                drawer.solenoid.value(),
                                drawer.open as u8,
                                drawer.position,
                                dsb.temperature,
                                dsb.status.value(),
                            )
                            .as_bytes(),
                        );
                        payload.push(0);
                        count += 1;
                    }
                }
                // imm[1]: last commanded global lock (bit 0) and solenoid
                // manual mode (bit 1); imm[2]: factory mode.
                let (locked, manual) = self.dsbs.global_lock_state();
                let lock_bits = locked as u32 | ((manual as u32) << 1);
                Message::new(
                    message::dsb::TYPE,
                    message::dsb::GET_DRAWER_STATES,
                    [count, lock_bits, self.dsbs.factory_mode() as u32, 0],
                    payload,
                )
            }
            message::dsb::GET_DEBUG_DATA => {
                let roster_index = (msg.imm[0] & 0x1F) as usize;
                match self.dsbs.get_debug_data(bus, roster_index) {
                    Ok(text) => Message::new(
                        message::dsb::TYPE,
                        message::dsb::GET_DEBUG_DATA,
                        [roster_index as u32, 0, 0, 0],
                        text.into_bytes(),
                    ),
                    Err(e) => {
                        warn!("debug data read failed: {e}");
                        Message::nack(&msg, "failed to collect debug data")
                    }
                }
            }
            _ => Message::nack(&msg, "unknown DSB request"),
        }
    }
}

fn reply_for(msg: &Message, result: Result<(), crate::BusError>) -> Message {
    match result {
        Ok(()) => Message::ack(msg),
        Err(e) => {
            warn!("command failed: {e}");
            Message::nack(msg, "command failed")
        }
    }
}

/// `name:value` entries, NUL-delimited, for the list-shaped replies.
fn named_list(entries: &[(&str, f32)]) -> Vec<u8> {
    let mut payload = Vec::new();
    for (name, value) in entries {
        payload.extend_from_slice(format!("{name}:{value:.2}").as_bytes());
        payload.push(0);
    }
    payload
}

/// Render a peer event as an event-socket message.
fn event_message(event: &HalEvent) -> Message {
    match event {
        HalEvent::DrawerStateChanged(evt) => Message::new(
            message::dsb::TYPE,
            message::dsb::DRAWER_STATE_CHANGED,
            [
                evt.index as u32,
                evt.solenoid.value() as u32,
                evt.is_lock as u32,
                evt.position as u32,
            ],
            Vec::new(),
        ),
        HalEvent::DrawerErrors { address, codes } => {
            let mut payload = Vec::new();
            for code in codes {
                payload.extend_from_slice(code.to_string().as_bytes());
                payload.push(0);
            }
            Message::new(
                message::dsb::TYPE,
                message::dsb::DRAWER_ERRORS,
                [*address as u32, codes.len() as u32, 0, 0],
                payload,
            )
        }
        HalEvent::DsbEnumeration(summaries) => {
            let mut payload = Vec::new();
            for s in summaries {
                payload.push(s.address);
                payload.push(s.version);
                for slot in 0..5 {
                    payload.push(s.drawer_indices.get(slot).copied().unwrap_or(0xFF));
                }
                payload.push(0);
            }
            Message::new(
                message::dsb::TYPE,
                message::dsb::ENUMERATION,
                [summaries.len() as u32, 0, 0, 0],
                payload,
            )
        }
        HalEvent::CompressorError(bits) => Message::new(
            message::cups::TYPE,
            message::cups::COMPRESSOR_ERROR,
            [*bits as u32, 0, 0, 0],
            Vec::new(),
        ),
        HalEvent::AcStateChanged(ac_ok) => Message::new(
            message::cups::TYPE,
            message::cups::AC_STATE_CHANGED,
            [*ac_ok as u32, 0, 0, 0],
            Vec::new(),
        ),
        HalEvent::CupsFailure => Message::new(
            message::cups::TYPE,
            message::cups::FAILURE,
            [0, 0, 0, 0],
            Vec::new(),
        ),
        HalEvent::DoorChanged(open) => Message::new(
            message::hardware::TYPE,
            message::hardware::DOOR_EVENT,
            [*open as u32, 0, 0, 0],
            Vec::new(),
        ),
        HalEvent::ImageCaptured(frame) => Message::new(
            message::image::TYPE,
            message::image::IMAGE_CAPTURED,
            [frame.camera as u32, frame.width, frame.height, frame.data.len() as u32],
            frame.data.clone(),
        ),
    }
}
