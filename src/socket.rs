//! Stream-socket front-end.
//!
//! Two of these run inside the daemon: the command server (requests in,
//! one reply per request) and the event server (outbound only; its
//! readiness entry exists to detect disconnects). Each accepts a single
//! client at a time; a new connection replaces the old one.
//!
//! All descriptors are non-blocking; the scheduler polls them and calls
//! [`SocketServer::try_receive`] at most once per tick.

use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::message::{HEADER_SIZE, Message};

pub struct SocketServer {
    listener: UnixListener,
    client: Option<UnixStream>,
    rxbuf: Vec<u8>,
    path: PathBuf,
}

impl SocketServer {
    /// Bind `path`, replacing any stale socket file.
    pub fn bind(path: &Path) -> io::Result<SocketServer> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        info!("listening on {}", path.display());
        Ok(SocketServer {
            listener,
            client: None,
            rxbuf: Vec::new(),
            path: path.to_path_buf(),
        })
    }

    /// Descriptors to include in the scheduler's readiness set.
    pub fn poll_fds(&self) -> Vec<RawFd> {
        let mut fds = vec![self.listener.as_raw_fd()];
        if let Some(client) = &self.client {
            fds.push(client.as_raw_fd());
        }
        fds
    }

    /// Accept a pending connection, if any. A new client replaces the old.
    pub fn accept_ready(&mut self) {
        match self.listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(true).is_err() {
                    warn!("failed to make client socket non-blocking");
                    return;
                }
                if self.client.is_some() {
                    info!("replacing client on {}", self.path.display());
                }
                self.client = Some(stream);
                self.rxbuf.clear();
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!("accept failed on {}: {e}", self.path.display()),
        }
    }

    fn drop_client(&mut self) {
        debug!("client on {} disconnected", self.path.display());
        self.client = None;
        self.rxbuf.clear();
    }

    /// Pull whatever is readable and return one complete message, if a
    /// full one has accumulated. EOF or a socket error drops the client.
    pub fn try_receive(&mut self) -> Option<Message> {
        let client = self.client.as_mut()?;

        let mut chunk = [0u8; 4096];
        loop {
            match client.read(&mut chunk) {
                Ok(0) => {
                    self.drop_client();
                    return None;
                }
                Ok(n) => self.rxbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("socket read failed on {}: {e}", self.path.display());
                    self.drop_client();
                    return None;
                }
            }
        }

        if self.rxbuf.len() < HEADER_SIZE {
            return None;
        }
        let header: [u8; HEADER_SIZE] = self.rxbuf[..HEADER_SIZE].try_into().ok()?;
        let (mut msg, plen) = match Message::parse_header(&header) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("bad message header on {}: {e:?}", self.path.display());
                self.drop_client();
                return None;
            }
        };
        if self.rxbuf.len() < HEADER_SIZE + plen {
            return None;
        }

        msg.payload = self.rxbuf[HEADER_SIZE..HEADER_SIZE + plen].to_vec();
        self.rxbuf.drain(..HEADER_SIZE + plen);
        Some(msg)
    }

    /// Write one message to the connected client. A broken pipe drops the
    /// client; the peer will reconnect.
    pub fn send(&mut self, msg: &Message) {
        let Some(client) = self.client.as_mut() else {
            debug!("no client on {}, dropping outbound message", self.path.display());
            return;
        };
        let bytes = msg.to_bytes();
        if let Err(e) = client.write_all(&bytes) {
            warn!("socket write failed on {}: {e}", self.path.display());
            self.drop_client();
        }
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Close everything and remove the socket file.
    pub fn close(&mut self) {
        self.client = None;
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{self, Message};
    use std::os::unix::net::UnixStream;

    fn temp_socket_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("chillbus-test-{}-{tag}.sock", std::process::id()))
    }

    #[test]
    fn accept_receive_reply() {
        let path = temp_socket_path("cmd");
        let mut server = SocketServer::bind(&path).unwrap();

        let mut peer = UnixStream::connect(&path).unwrap();
        server.accept_ready();
        assert!(server.has_client());

        let req = Message::new(
            message::dsb::TYPE,
            message::dsb::GET_DRAWER_STATES,
            [0; 4],
            Vec::new(),
        );
        peer.write_all(&req.to_bytes()).unwrap();

        // Non-blocking read may need a moment for the bytes to land.
        let mut got = None;
        for _ in 0..100 {
            if let Some(msg) = server.try_receive() {
                got = Some(msg);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let got = got.expect("message should arrive");
        assert_eq!(got.msg_type, message::dsb::TYPE);

        server.send(&Message::ack(&got));
        let mut reply = vec![0u8; HEADER_SIZE];
        peer.read_exact(&mut reply).unwrap();
        assert_eq!(reply[10], message::management::TYPE);
        assert_eq!(reply[11], message::management::ACK);

        server.close();
        assert!(!path.exists());
    }

    #[test]
    fn split_delivery_reassembles() {
        let path = temp_socket_path("split");
        let mut server = SocketServer::bind(&path).unwrap();
        let mut peer = UnixStream::connect(&path).unwrap();
        server.accept_ready();

        let req = Message::new(1, 2, [3, 4, 5, 6], b"payload".to_vec());
        let bytes = req.to_bytes();
        peer.write_all(&bytes[..10]).unwrap();
        peer.flush().unwrap();
        // First poll sees a partial header.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(server.try_receive().is_none());

        peer.write_all(&bytes[10..]).unwrap();
        let mut got = None;
        for _ in 0..100 {
            if let Some(msg) = server.try_receive() {
                got = Some(msg);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(got.unwrap(), req);
    }
}
