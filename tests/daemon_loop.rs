//! End-to-end scheduler tests: a daemon over an in-memory bus, driven
//! through real unix sockets.

mod util;

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chillbus::cmd::{cmd_cups, cmd_dsb};
use chillbus::daemon::{Daemon, DaemonConfig};
use chillbus::frame::{BROADCAST_ADDR, CUPS_ADDR};
use chillbus::message::{self, HEADER_SIZE, Message};

use util::{ResponderPort, SharedPort};

fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("chillbus-it-{}-{tag}", std::process::id()))
}

fn test_config(tag: &str) -> DaemonConfig {
    DaemonConfig {
        serial_device: PathBuf::new(),
        command_socket: temp_path(&format!("{tag}-cmd.sock")),
        event_socket: temp_path(&format!("{tag}-event.sock")),
        dsb_poll_interval: Duration::from_secs(2),
        door_gpio: temp_path(&format!("{tag}-door")),
        use_cups: true,
    }
}

/// Script the replies the cold-cube initialize ceremony consumes.
fn script_cups_initialize(port: &mut ResponderPort) {
    // Identity: cold-cube, board 1, both probes, firmware 2.3.
    port.respond(CUPS_ADDR, cmd_dsb::DISCOVERY, &[0x07, 0x31, 0, 0, 0, 0, 0, 0x23]);
    // Status: AC on, boot acked, firmware ok.
    port.respond(CUPS_ADDR, cmd_cups::GET_STATUS, &[0x89]);
    port.respond(
        CUPS_ADDR,
        cmd_cups::GET_TEMPERATURE,
        &[0x01, 0x2C, 0x01, 0x2C, 0x08, 0x6B, 0, 0],
    );
    port.respond(CUPS_ADDR, cmd_cups::GET_VOLTAGE, &[90, 120, 119, 0, 135, 0, 141, 0]);
    port.respond(
        CUPS_ADDR,
        cmd_cups::GET_PSETTINGS,
        &[0x01, 0x90, 50, 0x00, 24, 30, 0x03, 0x20],
    );
    port.respond(CUPS_ADDR, cmd_cups::GET_LOGGED_TEMP, &[0, 0, 0, 0]);
}

fn read_messages(stream: &mut UnixStream, window: Duration) -> Vec<Message> {
    stream.set_read_timeout(Some(window)).unwrap();
    let mut out = Vec::new();
    loop {
        let mut header = [0u8; HEADER_SIZE];
        match stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(_) => break,
        }
        let (mut msg, plen) = Message::parse_header(&header).unwrap();
        let mut payload = vec![0u8; plen];
        if plen > 0 {
            stream.read_exact(&mut payload).unwrap();
        }
        msg.payload = payload;
        out.push(msg);
    }
    out
}

#[test]
fn initialize_reports_peer_revisions() {
    let cfg = test_config("init");
    std::fs::write(&cfg.door_gpio, "0\n").unwrap();

    let mut port = ResponderPort::new();
    script_cups_initialize(&mut port);
    let mut daemon = Daemon::with_port(port, &cfg).unwrap();

    let mut cmd = UnixStream::connect(&cfg.command_socket).unwrap();
    daemon.tick(Instant::now());

    let init = Message::new(
        message::management::TYPE,
        message::management::INITIALIZE,
        [0; 4],
        Vec::new(),
    );
    cmd.write_all(&init.to_bytes()).unwrap();
    // One tick to accept the bytes and dispatch.
    daemon.tick(Instant::now());

    let replies = read_messages(&mut cmd, Duration::from_millis(500));
    assert_eq!(replies.len(), 1);
    let reply = &replies[0];
    assert_eq!(reply.msg_type, message::management::TYPE);
    assert_eq!(reply.sub_type, message::management::INITIALIZE);
    // Cold-cube firmware 2.3 packed in imm[2].
    assert_eq!(reply.imm[2], 0x23);
    assert_eq!(reply.imm[3], Message::daemon_revision());
}

#[test]
fn requests_before_initialize_are_nacked() {
    let cfg = test_config("nack");
    std::fs::write(&cfg.door_gpio, "0\n").unwrap();
    let mut daemon = Daemon::with_port(ResponderPort::new(), &cfg).unwrap();

    let mut cmd = UnixStream::connect(&cfg.command_socket).unwrap();
    daemon.tick(Instant::now());

    let req = Message::new(
        message::dsb::TYPE,
        message::dsb::GET_DRAWER_STATES,
        [0; 4],
        Vec::new(),
    );
    cmd.write_all(&req.to_bytes()).unwrap();
    daemon.tick(Instant::now());

    let replies = read_messages(&mut cmd, Duration::from_millis(500));
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].sub_type, message::management::NACK);
}

#[test]
fn lock_state_and_cold_cube_reset_round_trip() {
    let cfg = test_config("lockreset");
    std::fs::write(&cfg.door_gpio, "0\n").unwrap();

    let mut port = ResponderPort::new();
    script_cups_initialize(&mut port);
    let shared = SharedPort::new(port);
    let mut daemon = Daemon::with_port(shared.clone(), &cfg).unwrap();

    let mut cmd = UnixStream::connect(&cfg.command_socket).unwrap();
    daemon.tick(Instant::now());

    let init = Message::new(
        message::management::TYPE,
        message::management::INITIALIZE,
        [0; 4],
        Vec::new(),
    );
    cmd.write_all(&init.to_bytes()).unwrap();
    daemon.tick(Instant::now());
    let _ = read_messages(&mut cmd, Duration::from_millis(200));

    // Lock everything with manual solenoids, then flip factory mode on.
    let lock = Message::new(
        message::dsb::TYPE,
        message::dsb::SET_GLOBAL_LOCK,
        [1, 1, 0, 0],
        Vec::new(),
    );
    cmd.write_all(&lock.to_bytes()).unwrap();
    daemon.tick(Instant::now());
    let factory = Message::new(
        message::dsb::TYPE,
        message::dsb::SET_FACTORY_MODE,
        [1, 0, 0, 0],
        Vec::new(),
    );
    cmd.write_all(&factory.to_bytes()).unwrap();
    daemon.tick(Instant::now());
    let _ = read_messages(&mut cmd, Duration::from_millis(200));

    // The drawer-states reply carries the commanded roster-wide state.
    let states = Message::new(
        message::dsb::TYPE,
        message::dsb::GET_DRAWER_STATES,
        [0; 4],
        Vec::new(),
    );
    cmd.write_all(&states.to_bytes()).unwrap();
    daemon.tick(Instant::now());
    let replies = read_messages(&mut cmd, Duration::from_millis(500));
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].sub_type, message::dsb::GET_DRAWER_STATES);
    assert_eq!(replies[0].imm[1], 0b11, "locked + manual solenoids");
    assert_eq!(replies[0].imm[2], 1, "factory mode on");

    // A cold-cube reset is acknowledged and hits the wire once.
    let wire_before = shared.0.borrow().tx.len();
    let reset = Message::new(
        message::cups::TYPE,
        message::cups::RESET,
        [0; 4],
        Vec::new(),
    );
    cmd.write_all(&reset.to_bytes()).unwrap();
    daemon.tick(Instant::now());
    let replies = read_messages(&mut cmd, Duration::from_millis(500));
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].sub_type, message::management::ACK);

    let reset_frame =
        chillbus::frame::encode(CUPS_ADDR, chillbus::cmd::cmd_cups::RESET, false, &[0x00])
            .unwrap();
    let tx = shared.0.borrow().tx.clone();
    let count = tx[wire_before..]
        .windows(reset_frame.len())
        .filter(|w| *w == &reset_frame[..])
        .count();
    assert_eq!(count, 1);
}

#[test]
fn drawer_broadcast_and_door_edge_reach_the_event_socket() {
    let cfg = test_config("events");
    std::fs::write(&cfg.door_gpio, "0\n").unwrap();

    let mut port = ResponderPort::new();
    script_cups_initialize(&mut port);
    // One DSB answers discovery after the reset cooldown.
    port.respond(1, cmd_dsb::DISCOVERY, &[0x23, 0x01, 0x04, 0x00, 0x00, 0x00, 0x00, 0x12]);
    let shared = SharedPort::new(port);
    let mut daemon = Daemon::with_port(shared.clone(), &cfg).unwrap();

    let mut cmd = UnixStream::connect(&cfg.command_socket).unwrap();
    let mut events = UnixStream::connect(&cfg.event_socket).unwrap();
    daemon.tick(Instant::now());

    let init = Message::new(
        message::management::TYPE,
        message::management::INITIALIZE,
        [0; 4],
        Vec::new(),
    );
    cmd.write_all(&init.to_bytes()).unwrap();
    daemon.tick(Instant::now());
    let _ = read_messages(&mut cmd, Duration::from_millis(200));

    // A drawer unlock broadcast and a door edge arrive mid-run.
    shared
        .0
        .borrow_mut()
        .inject_frame(BROADCAST_ADDR, cmd_dsb::DRAWER_STATE_EVENT, &[0x04, 0xA5]);
    std::fs::write(&cfg.door_gpio, "1\n").unwrap();

    // Run past the reset cooldown so discovery also happens eventually.
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        daemon.tick(Instant::now());
        std::thread::sleep(Duration::from_millis(10));
    }

    let messages = read_messages(&mut events, Duration::from_millis(500));
    assert!(
        messages.iter().any(|m| {
            m.msg_type == message::dsb::TYPE
                && m.sub_type == message::dsb::DRAWER_STATE_CHANGED
                && m.imm[0] == 4
        }),
        "drawer event missing from {messages:?}"
    );
    assert!(
        messages.iter().any(|m| {
            m.msg_type == message::hardware::TYPE
                && m.sub_type == message::hardware::DOOR_EVENT
                && m.imm[0] == 1
        }),
        "door event missing from {messages:?}"
    );
    assert!(
        messages.iter().any(|m| {
            m.msg_type == message::dsb::TYPE && m.sub_type == message::dsb::ENUMERATION
        }),
        "enumeration event missing from {messages:?}"
    );
}
