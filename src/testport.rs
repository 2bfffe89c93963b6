//! In-memory transport used by unit tests. Compiled only for tests.

use std::collections::VecDeque;
use std::io;

use crate::bus::EventSink;
use crate::frame;
use crate::port::BusPort;

/// A scripted port: tests queue reply bytes into `rx` and inspect
/// everything the code under test wrote in `tx`.
pub struct ScriptPort {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
}

impl ScriptPort {
    pub fn new() -> ScriptPort {
        ScriptPort { rx: VecDeque::new(), tx: Vec::new() }
    }

    pub fn queue(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    /// Queue a well-formed frame as if a peer had written it.
    pub fn queue_frame(&mut self, addr: u8, msg_type: u8, payload: &[u8]) {
        let wire = frame::encode(addr, msg_type, false, payload).unwrap();
        self.rx.extend(wire);
    }
}

impl BusPort for ScriptPort {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.tx.extend_from_slice(bytes);
        Ok(())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.rx.len())
    }

    fn read_one(&mut self) -> io::Result<u8> {
        self.rx
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "script drained"))
    }
}

/// Sink that records every dispatched broadcast.
#[derive(Default)]
pub struct RecordingSink {
    pub drawer_events: Vec<Vec<u8>>,
    pub self_assigns: u32,
}

impl EventSink for RecordingSink {
    fn on_drawer_event(&mut self, payload: &[u8]) {
        self.drawer_events.push(payload.to_vec());
    }

    fn on_self_assign(&mut self) {
        self.self_assigns += 1;
    }
}
