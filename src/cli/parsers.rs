//! Shared CLI argument parsers.

use std::path::PathBuf;

/// A VM to manage, as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    /// VM CID.
    pub cid: u32,
    /// crosvm control socket of the VM.
    pub control_socket: PathBuf,
}

/// Parse a VM specification (CID:CONTROL_SOCKET).
pub fn parse_vm(s: &str) -> Result<VmSpec, String> {
    let (cid, socket) = s
        .split_once(':')
        .ok_or_else(|| format!("expected CID:CONTROL_SOCKET, got '{}'", s))?;

    let cid: u32 = cid.parse().map_err(|_| format!("invalid cid: {}", cid))?;
    if cid <= vmmem::protocol::cid::LOCAL || cid == vmmem::protocol::cid::ANY {
        return Err(format!("cid {} is reserved", cid));
    }
    if socket.is_empty() {
        return Err("control socket path is empty".to_string());
    }

    Ok(VmSpec {
        cid,
        control_socket: PathBuf::from(socket),
    })
}
