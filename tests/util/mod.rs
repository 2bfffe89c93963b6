//! Shared test transport: an in-memory port that answers read requests
//! from scripted per-peer reply queues.
//!
//! Each integration-test binary compiles its own copy and uses a subset.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Rc;

use chillbus::frame::{self, CONTROLLER_ADDR, READ_BIT};
use chillbus::port::BusPort;

pub struct ResponderPort {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    /// (peer address, request type) -> queue of reply payloads.
    responders: HashMap<(u8, u8), VecDeque<Vec<u8>>>,
}

impl ResponderPort {
    pub fn new() -> ResponderPort {
        ResponderPort { rx: VecDeque::new(), tx: Vec::new(), responders: HashMap::new() }
    }

    /// Script a reply payload for the next read request of `msg_type` to
    /// `addr`. Replies for one key are consumed in order.
    pub fn respond(&mut self, addr: u8, msg_type: u8, payload: &[u8]) {
        self.responders
            .entry((addr, msg_type))
            .or_default()
            .push_back(payload.to_vec());
    }

    /// Inject raw inbound bytes (e.g. an unsolicited broadcast frame).
    pub fn inject_frame(&mut self, addr: u8, msg_type: u8, payload: &[u8]) {
        let wire = frame::encode(addr, msg_type, false, payload).unwrap();
        self.rx.extend(wire);
    }
}

impl BusPort for ResponderPort {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.tx.extend_from_slice(bytes);
        // Each write carries exactly one frame; answer read requests from
        // the script.
        if bytes.len() >= 2 && bytes[0] & READ_BIT != 0 {
            let addr = bytes[0] & 0x1F;
            let msg_type = bytes[1];
            if let Some(queue) = self.responders.get_mut(&(addr, msg_type)) {
                if let Some(payload) = queue.pop_front() {
                    let reply =
                        frame::encode(CONTROLLER_ADDR, msg_type | 0x80, false, &payload).unwrap();
                    self.rx.extend(reply);
                }
            }
        }
        Ok(())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.rx.len())
    }

    fn read_one(&mut self) -> io::Result<u8> {
        self.rx
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted bytes"))
    }
}

/// A [`ResponderPort`] handle tests can keep after moving the port into
/// the code under test, to inject traffic mid-scenario.
#[derive(Clone)]
pub struct SharedPort(pub Rc<RefCell<ResponderPort>>);

impl SharedPort {
    pub fn new(port: ResponderPort) -> SharedPort {
        SharedPort(Rc::new(RefCell::new(port)))
    }
}

impl BusPort for SharedPort {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.borrow_mut().write(bytes)
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        self.0.borrow_mut().bytes_available()
    }

    fn read_one(&mut self) -> io::Result<u8> {
        self.0.borrow_mut().read_one()
    }
}
