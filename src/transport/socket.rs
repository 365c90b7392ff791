//! Unix socket transport for tests that need a real descriptor.

use super::{PacketConnection, PacketListener};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;
use vmmem_protocol::{read_message, write_message, Packet};

/// Server-side end of a socket pair.
pub(crate) struct SocketConnection {
    cid: u32,
    stream: UnixStream,
}

impl PacketConnection for SocketConnection {
    fn cid(&self) -> u32 {
        self.cid
    }

    fn read_packet(&mut self) -> Result<Packet> {
        Ok(read_message(&mut self.stream)?)
    }

    fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        Ok(write_message(&mut self.stream, packet)?)
    }

    fn readiness_fd(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }
}

/// Listener handing out queued socket pairs.
#[derive(Clone, Default)]
pub(crate) struct SocketListener {
    pending: Arc<Mutex<VecDeque<SocketConnection>>>,
}

impl SocketListener {
    /// Queue a connection from `cid` and return the peer's end.
    ///
    /// The server end times reads out after `read_timeout`.
    pub(crate) fn connect(&self, cid: u32, read_timeout: Duration) -> io::Result<UnixStream> {
        let (server, peer) = UnixStream::pair()?;
        server.set_read_timeout(Some(read_timeout))?;
        self.pending.lock().push_back(SocketConnection {
            cid,
            stream: server,
        });
        Ok(peer)
    }
}

impl PacketListener for SocketListener {
    fn accept(&mut self) -> Result<Box<dyn PacketConnection>> {
        match self.pending.lock().pop_front() {
            Some(conn) => Ok(Box::new(conn)),
            None => Err(io::Error::from(io::ErrorKind::WouldBlock).into()),
        }
    }
}
