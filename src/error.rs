//! Error types for vmmem.

use std::path::PathBuf;
use thiserror::Error;
use vmmem_protocol::DecodeError;

/// Result type alias using vmmem's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vmmem operations.
#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    /// Failed to read or write a packet.
    #[error("protocol error: {0}")]
    Protocol(#[from] DecodeError),

    /// Peer sent something other than a valid handshake.
    #[error("handshake failed for cid {cid}: {reason}")]
    Handshake {
        /// Peer CID.
        cid: u32,
        /// What was wrong.
        reason: String,
    },

    /// The transport is not available on this platform.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    // Balloon errors
    /// External balloon command failed.
    #[error("balloon command failed: {command}: {message}")]
    BalloonCommand {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    // MGLRU errors
    /// MGLRU stats file could not be parsed.
    #[error("invalid mglru stats in {}", path.display())]
    InvalidMglru {
        /// File that failed to parse.
        path: PathBuf,
    },

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // Service errors
    /// The memory service is no longer running.
    #[error("memory service stopped")]
    ServiceStopped,

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a handshake error.
    pub fn handshake(cid: u32, reason: impl Into<String>) -> Self {
        Self::Handshake {
            cid,
            reason: reason.into(),
        }
    }

    /// Create a balloon command error.
    pub fn balloon_command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BalloonCommand {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_includes_cid_and_reason() {
        let err = Error::handshake(42, "unspecified connection type");
        let msg = err.to_string();
        assert!(msg.contains("42"), "Error should include the peer cid");
        assert!(
            msg.contains("unspecified"),
            "Error should explain what's wrong"
        );
    }

    #[test]
    fn test_balloon_command_includes_command_and_message() {
        let err = Error::balloon_command("crosvm", "socket not found");
        let msg = err.to_string();
        assert!(msg.contains("crosvm"), "Error should include command name");
        assert!(
            msg.contains("socket not found"),
            "Error should include error message"
        );
    }

    #[test]
    fn test_invalid_mglru_includes_path() {
        let err = Error::InvalidMglru {
            path: PathBuf::from("/sys/kernel/debug/lru_gen"),
        };
        assert!(err.to_string().contains("/sys/kernel/debug/lru_gen"));
    }

    #[test]
    fn test_decode_error_converts() {
        let err: Error = DecodeError::TooLarge(10).into();
        assert!(err.to_string().contains("too large"));
    }
}
