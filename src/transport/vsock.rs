//! vsock listener and stream.

use super::{PacketConnection, PacketListener, SocketTimeouts};
use crate::error::Result;
use std::fs::File;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::debug;
use vmmem_protocol::{cid, read_message, write_message, Packet};

/// Pending connection backlog.
const BACKLOG: libc::c_int = 16;

/// A vsock listening socket.
pub struct VsockListener {
    fd: OwnedFd,
    port: u32,
    timeouts: SocketTimeouts,
}

impl VsockListener {
    /// Bind and listen on `port` for connections from any CID.
    pub fn bind(port: u32, timeouts: SocketTimeouts) -> Result<Self> {
        // SAFETY: plain socket(2) call; the result is checked below.
        let raw = unsafe {
            libc::socket(
                libc::AF_VSOCK,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: raw is a freshly created descriptor nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let addr = vsock_addr(cid::ANY, port);
        // SAFETY: addr is a valid sockaddr_vm and the length matches it.
        check(unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_vm as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t,
            )
        })?;
        // SAFETY: fd is a bound stream socket.
        check(unsafe { libc::listen(fd.as_raw_fd(), BACKLOG) })?;

        debug!(port, "vsock listener bound");
        Ok(Self { fd, port, timeouts })
    }

    /// Port this listener is bound to.
    pub fn port(&self) -> u32 {
        self.port
    }
}

impl PacketListener for VsockListener {
    fn accept(&mut self) -> Result<Box<dyn PacketConnection>> {
        // SAFETY: sockaddr_vm is plain old data.
        let mut addr: libc::sockaddr_vm = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t;

        // SAFETY: addr and len describe a writable sockaddr_vm.
        let raw = unsafe {
            libc::accept4(
                self.fd.as_raw_fd(),
                &mut addr as *mut libc::sockaddr_vm as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: accept4 returned a new descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        set_timeout(fd.as_raw_fd(), libc::SO_RCVTIMEO, self.timeouts.read)?;
        set_timeout(fd.as_raw_fd(), libc::SO_SNDTIMEO, self.timeouts.write)?;

        Ok(Box::new(VsockStream {
            file: File::from(fd),
            cid: addr.svm_cid,
        }))
    }

    fn readiness_fd(&self) -> Option<RawFd> {
        Some(self.fd.as_raw_fd())
    }
}

/// An accepted vsock stream.
pub struct VsockStream {
    file: File,
    cid: u32,
}

impl PacketConnection for VsockStream {
    fn cid(&self) -> u32 {
        self.cid
    }

    fn read_packet(&mut self) -> Result<Packet> {
        Ok(read_message(&mut self.file)?)
    }

    fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        Ok(write_message(&mut self.file, packet)?)
    }

    fn readiness_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }
}

impl Drop for VsockStream {
    fn drop(&mut self) {
        // Wake anyone polling a duplicate of this descriptor.
        // SAFETY: the descriptor is open until `file` is dropped after this.
        unsafe { libc::shutdown(self.file.as_raw_fd(), libc::SHUT_RDWR) };
    }
}

fn vsock_addr(cid: u32, port: u32) -> libc::sockaddr_vm {
    // SAFETY: sockaddr_vm is plain old data; reserved fields must be zero.
    let mut addr: libc::sockaddr_vm = unsafe { mem::zeroed() };
    addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
    addr.svm_cid = cid;
    addr.svm_port = port;
    addr
}

fn set_timeout(fd: RawFd, option: libc::c_int, timeout: Duration) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    // SAFETY: tv is a valid timeval and the length matches it.
    check(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &tv as *const libc::timeval as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    })
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
