//! Global vmmem configuration.
//!
//! Settings live in `$XDG_CONFIG_HOME/vmmem/config.toml`. Every field is
//! optional in the file; missing fields take their defaults.

use crate::balloon::DEFAULT_BLOCK_DURATION;
use crate::broker::{BrokerSettings, ReclaimSettings};
use crate::error::{Error, Result};
use crate::server::DEFAULT_MAX_CONNECTIONS;
use crate::transport::SocketTimeouts;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vmmem_protocol::ports;

/// Application name for config file storage.
const APP_NAME: &str = "vmmem";

/// Config file name.
const CONFIG_FILE: &str = "config.toml";

/// Default location of the host MGLRU stats.
pub const DEFAULT_LOCAL_MGLRU_PATH: &str = "/sys/kernel/debug/lru_gen";

/// Global vmmem configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmmemConfig {
    /// Port of the kill decision server.
    pub kills_port: u32,

    /// Port of the MGLRU telemetry server.
    pub telemetry_port: u32,

    /// Connection cap per server.
    pub max_connections: usize,

    /// Socket read timeout in milliseconds.
    pub read_timeout_ms: u64,

    /// Socket write timeout in milliseconds.
    pub write_timeout_ms: u64,

    /// Host MGLRU stats file.
    pub local_mglru_path: PathBuf,

    /// How often the host MGLRU file is checked for new generations.
    pub local_poll_interval_ms: u64,

    /// Minimum time between reclaim passes.
    pub reclaim_interval_secs: u64,

    /// Reclaim passes smaller than this are discarded.
    pub min_reclaim_bytes: u64,

    /// Memory moved when a context runs out of kill candidates.
    pub breathing_room_bytes: u64,

    /// Step size of reclaim-until-blocked.
    pub reclaim_increment_bytes: u64,

    /// Period of reclaim-until-blocked steps.
    pub reclaim_period_ms: u64,

    /// How long a resize blocks the opposite direction.
    pub block_duration_ms: u64,

    /// Decision latency treated as a timeout.
    pub decision_timeout_ms: u32,
}

impl Default for VmmemConfig {
    fn default() -> Self {
        let timeouts = SocketTimeouts::default();
        let broker = BrokerSettings::default();
        let reclaim = ReclaimSettings::default();

        Self {
            kills_port: ports::KILLS_SERVER,
            telemetry_port: ports::TELEMETRY_SERVER,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            read_timeout_ms: timeouts.read.as_millis() as u64,
            write_timeout_ms: timeouts.write.as_millis() as u64,
            local_mglru_path: PathBuf::from(DEFAULT_LOCAL_MGLRU_PATH),
            local_poll_interval_ms: 1000,
            reclaim_interval_secs: reclaim.min_interval.as_secs(),
            min_reclaim_bytes: reclaim.min_reclaim_bytes,
            breathing_room_bytes: broker.breathing_room_bytes,
            reclaim_increment_bytes: broker.reclaim_increment_bytes,
            reclaim_period_ms: 1000,
            block_duration_ms: DEFAULT_BLOCK_DURATION.as_millis() as u64,
            decision_timeout_ms: broker.decision_timeout_ms,
        }
    }
}

impl VmmemConfig {
    /// Path of the config file, if a config directory exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::ConfigLoad(format!("{}: {}", path.display(), e))),
        };

        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.kills_port == self.telemetry_port {
            return Err(Error::config("kills and telemetry ports must differ"));
        }
        if self.max_connections == 0 {
            return Err(Error::config("max_connections must be at least 1"));
        }
        if self.reclaim_period_ms == 0 || self.local_poll_interval_ms == 0 {
            return Err(Error::config("periods must be nonzero"));
        }
        Ok(())
    }

    /// Timeouts for accepted sockets.
    pub fn socket_timeouts(&self) -> SocketTimeouts {
        SocketTimeouts {
            read: Duration::from_millis(self.read_timeout_ms),
            write: Duration::from_millis(self.write_timeout_ms),
        }
    }

    /// Balloon broker tunables.
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            breathing_room_bytes: self.breathing_room_bytes,
            reclaim_increment_bytes: self.reclaim_increment_bytes,
            decision_timeout_ms: self.decision_timeout_ms,
        }
    }

    /// Reclaim broker tunables.
    pub fn reclaim_settings(&self) -> ReclaimSettings {
        ReclaimSettings {
            min_interval: Duration::from_secs(self.reclaim_interval_secs),
            min_reclaim_bytes: self.min_reclaim_bytes,
        }
    }

    /// Period of reclaim-until-blocked steps.
    pub fn reclaim_period(&self) -> Duration {
        Duration::from_millis(self.reclaim_period_ms)
    }

    /// Poll period of the host MGLRU file.
    pub fn local_poll_interval(&self) -> Duration {
        Duration::from_millis(self.local_poll_interval_ms)
    }

    /// Opposite-direction block duration.
    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }
}
