//! crosvm-backed balloon.

use super::Balloon;
use crate::error::{Error, Result};
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// Drives a VM balloon through `crosvm balloon <bytes> <socket>`.
#[derive(Debug, Clone)]
pub struct CrosvmBalloon {
    crosvm: PathBuf,
    control_socket: PathBuf,
}

impl CrosvmBalloon {
    /// Create a balloon for the VM behind `control_socket`.
    pub fn new(control_socket: impl Into<PathBuf>) -> Self {
        Self {
            crosvm: PathBuf::from("crosvm"),
            control_socket: control_socket.into(),
        }
    }

    /// Use a specific crosvm binary.
    pub fn with_binary(mut self, crosvm: impl Into<PathBuf>) -> Self {
        self.crosvm = crosvm.into();
        self
    }
}

impl Balloon for CrosvmBalloon {
    fn set_target(&self, bytes: u64) -> Result<()> {
        debug!(socket = %self.control_socket.display(), bytes, "setting balloon size");

        let output = Command::new(&self.crosvm)
            .arg("balloon")
            .arg(bytes.to_string())
            .arg(&self.control_socket)
            .output()
            .map_err(|e| Error::balloon_command("crosvm balloon", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::balloon_command("crosvm balloon", stderr.trim()));
        }

        Ok(())
    }
}
