//! CID-addressed packet transport.
//!
//! The servers only see [`PacketListener`] and [`PacketConnection`]; the
//! vsock implementation lives in [`vsock`] and tests use an in-memory pair.

#[cfg(test)]
pub(crate) mod memory;
#[cfg(test)]
pub(crate) mod socket;
#[cfg(target_os = "linux")]
pub mod vsock;

use crate::error::Result;
use std::os::unix::io::RawFd;
use std::time::Duration;
use vmmem_protocol::Packet;

/// One accepted stream connection carrying typed packets.
pub trait PacketConnection: Send {
    /// CID of the peer.
    fn cid(&self) -> u32;

    /// Read exactly one packet, blocking until it arrives or the read
    /// timeout expires.
    fn read_packet(&mut self) -> Result<Packet>;

    /// Write one packet.
    fn write_packet(&mut self, packet: &Packet) -> Result<()>;

    /// File descriptor to watch for readability, if any.
    fn readiness_fd(&self) -> Option<RawFd> {
        None
    }
}

/// Non-blocking check for pending input or hangup on `fd`.
pub fn has_pending_input(fd: RawFd) -> bool {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pollfd is a single valid entry and the timeout is zero.
    let ret = unsafe { libc::poll(&mut pollfd, 1, 0) };
    ret > 0 && pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
}

/// A listening socket producing [`PacketConnection`]s.
pub trait PacketListener: Send {
    /// Accept one pending connection.
    fn accept(&mut self) -> Result<Box<dyn PacketConnection>>;

    /// File descriptor to watch for pending connections, if any.
    fn readiness_fd(&self) -> Option<RawFd> {
        None
    }
}

/// Socket timeouts applied to every accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketTimeouts {
    /// Read timeout. Bounds the blocking stats round trip.
    pub read: Duration,
    /// Write timeout.
    pub write: Duration,
}

impl Default for SocketTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(5),
            write: Duration::from_secs(2),
        }
    }
}

/// Bind a vsock listener on `port` for any CID.
pub fn bind_vsock(port: u32, timeouts: SocketTimeouts) -> Result<Box<dyn PacketListener>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(vsock::VsockListener::bind(port, timeouts)?))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (port, timeouts);
        Err(crate::error::Error::TransportUnavailable(
            "vsock is only supported on linux".into(),
        ))
    }
}
