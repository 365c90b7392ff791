//! In-memory transport for tests.

use super::{PacketConnection, PacketListener};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use vmmem_protocol::Packet;

#[derive(Default)]
struct PipeState {
    inbound: VecDeque<Packet>,
    outbound: Vec<Packet>,
    fail_writes: bool,
}

/// Test-side handle to one in-memory connection.
#[derive(Clone)]
pub(crate) struct MemoryPeer {
    cid: u32,
    state: Arc<Mutex<PipeState>>,
}

impl MemoryPeer {
    /// Queue a packet for the server to read.
    pub(crate) fn send(&self, packet: Packet) {
        self.state.lock().inbound.push_back(packet);
    }

    /// Take everything the server wrote so far.
    pub(crate) fn take_sent(&self) -> Vec<Packet> {
        std::mem::take(&mut self.state.lock().outbound)
    }

    /// Make every following server write fail.
    pub(crate) fn fail_writes(&self) {
        self.state.lock().fail_writes = true;
    }

    fn connection(&self) -> MemoryConnection {
        MemoryConnection {
            cid: self.cid,
            state: self.state.clone(),
        }
    }
}

/// Server-side end of an in-memory connection.
///
/// Reading with nothing queued fails like a closed socket.
struct MemoryConnection {
    cid: u32,
    state: Arc<Mutex<PipeState>>,
}

impl PacketConnection for MemoryConnection {
    fn cid(&self) -> u32 {
        self.cid
    }

    fn read_packet(&mut self) -> Result<Packet> {
        self.state
            .lock()
            .inbound
            .pop_front()
            .ok_or_else(|| Error::Io(io::ErrorKind::UnexpectedEof.into()))
    }

    fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(Error::Io(io::ErrorKind::BrokenPipe.into()));
        }
        state.outbound.push(packet.clone());
        Ok(())
    }
}

/// Listener handing out queued in-memory connections.
#[derive(Clone, Default)]
pub(crate) struct MemoryListener {
    pending: Arc<Mutex<VecDeque<MemoryConnection>>>,
}

impl MemoryListener {
    /// Queue a new connection from `cid` and return its test-side handle.
    pub(crate) fn connect(&self, cid: u32) -> MemoryPeer {
        let peer = MemoryPeer {
            cid,
            state: Arc::default(),
        };
        self.pending.lock().push_back(peer.connection());
        peer
    }
}

impl PacketListener for MemoryListener {
    fn accept(&mut self) -> Result<Box<dyn PacketConnection>> {
        match self.pending.lock().pop_front() {
            Some(conn) => Ok(Box::new(conn)),
            None => Err(Error::Io(io::ErrorKind::WouldBlock.into())),
        }
    }
}
