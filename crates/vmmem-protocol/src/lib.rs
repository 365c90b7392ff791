//! Protocol types for vmmem host-guest communication.
//!
//! This crate defines the wire protocol spoken over vsock between the host
//! memory service and the per-context low-memory killers and MGLRU telemetry
//! daemons (host or guest).
//!
//! # Protocol Overview
//!
//! Communication uses JSON-encoded packets over vsock. Each packet is
//! prefixed with a 4-byte big-endian length header.
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4 BE)  | JSON packet       |
//! +----------------+-------------------+
//! ```
//!
//! Every connection starts with exactly one [`PacketType::Handshake`] from the
//! peer declaring its [`ConnectionType`]. The host answers with
//! [`PacketType::ConnectionAck`] before any typed payload is exchanged.

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Maximum frame size (1 MB).
///
/// MGLRU payloads come from guests, so the frame cap is kept small.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Well-known vsock ports.
pub mod ports {
    /// Kill decision server.
    pub const KILLS_SERVER: u32 = 7070;
    /// MGLRU telemetry server.
    pub const TELEMETRY_SERVER: u32 = 7071;
}

/// vsock CID constants.
pub mod cid {
    /// Local loopback CID. Host-side clients connect from here, and it keys
    /// the host context everywhere in the service.
    pub const LOCAL: u32 = 1;
    /// Any CID (for listening).
    pub const ANY: u32 = u32::MAX;
}

// ============================================================================
// Priorities
// ============================================================================

/// Urgency of a balloon resize, ordered from least to most urgent.
///
/// A priority is used both to request a resize and to describe the floor
/// below which a balloon currently refuses to move.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResizePriority {
    /// Nothing is blocked.
    Lowest,
    /// Proactive reclaim driven by MGLRU aging.
    MglruReclaim,
    /// A guest killer reported it has nothing left to kill.
    NoKillCandidatesGuest,
    /// The host killer reported it has nothing left to kill.
    NoKillCandidatesHost,
    /// Killing a cached browser tab.
    CachedTab,
    /// Killing a cached app.
    CachedApp,
    /// Killing a perceptible browser tab.
    PerceptibleTab,
    /// Killing a perceptible app.
    PerceptibleApp,
    /// Killing the focused browser tab.
    FocusedTab,
    /// Killing the focused app.
    FocusedApp,
    /// Most urgent.
    Highest,
}

impl ResizePriority {
    /// Every priority, least urgent first.
    pub const ALL: [ResizePriority; 11] = [
        ResizePriority::Lowest,
        ResizePriority::MglruReclaim,
        ResizePriority::NoKillCandidatesGuest,
        ResizePriority::NoKillCandidatesHost,
        ResizePriority::CachedTab,
        ResizePriority::CachedApp,
        ResizePriority::PerceptibleTab,
        ResizePriority::PerceptibleApp,
        ResizePriority::FocusedTab,
        ResizePriority::FocusedApp,
        ResizePriority::Highest,
    ];

    /// The next more urgent priority, saturating at [`ResizePriority::Highest`].
    pub fn next(self) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|priority| *priority > self)
            .unwrap_or(ResizePriority::Highest)
    }

    /// Get the priority name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            ResizePriority::Lowest => "lowest",
            ResizePriority::MglruReclaim => "mglru_reclaim",
            ResizePriority::NoKillCandidatesGuest => "no_kill_candidates_guest",
            ResizePriority::NoKillCandidatesHost => "no_kill_candidates_host",
            ResizePriority::CachedTab => "cached_tab",
            ResizePriority::CachedApp => "cached_app",
            ResizePriority::PerceptibleTab => "perceptible_tab",
            ResizePriority::PerceptibleApp => "perceptible_app",
            ResizePriority::FocusedTab => "focused_tab",
            ResizePriority::FocusedApp => "focused_app",
            ResizePriority::Highest => "highest",
        }
    }
}

impl std::fmt::Display for ResizePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// Packets
// ============================================================================

/// Kind of service a peer wants after the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Not declared. Never valid in a handshake.
    #[default]
    Unspecified,
    /// Low-memory killer asking for kill decisions.
    Kills,
    /// MGLRU telemetry provider.
    Mglru,
}

/// Packet type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketType {
    /// Peer declares its connection type.
    Handshake,
    /// Host accepted the handshake.
    ConnectionAck,
    /// Host rejected the handshake.
    ConnectionNack,
    /// Killer asks how much can be freed before killing.
    KillRequest,
    /// Host reply to a kill request.
    KillDecision,
    /// Killer has nothing left to kill.
    NoKillCandidates,
    /// Killer reports how long a decision took.
    DecisionLatency,
    /// Host asks for current MGLRU stats.
    MglruRequest,
    /// MGLRU stats, either solicited or pushed on a new generation.
    MglruResponse,
}

/// Handshake payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Declared connection type.
    #[serde(default)]
    pub connection_type: ConnectionType,
}

/// Kill decision request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillDecisionRequest {
    /// Sequence number echoed in the decision.
    pub sequence_num: u32,
    /// Amount the killer wants freed, in KB.
    pub size_kb: u64,
    /// Priority of the process that would be killed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<ResizePriority>,
}

/// Kill decision response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillDecisionResponse {
    /// Sequence number of the request this answers.
    pub sequence_num: u32,
    /// Amount actually freed, in KB.
    pub size_kb: u64,
}

/// Decision latency report payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionLatency {
    /// Sequence number of the request being reported on.
    pub sequence_num: u32,
    /// Time the killer waited for the decision, in milliseconds.
    pub latency_ms: u32,
}

/// MGLRU response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MglruResponse {
    /// Current stats. Absent when the peer could not read them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<MglruStats>,
}

/// A single typed packet.
///
/// Payload fields are optional on the wire; a packet whose type requires a
/// payload that is missing is treated as malformed by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Packet type.
    #[serde(rename = "type")]
    pub kind: PacketType,
    /// Handshake payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<Handshake>,
    /// Kill request payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_request: Option<KillDecisionRequest>,
    /// Kill decision payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_decision: Option<KillDecisionResponse>,
    /// Decision latency payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_latency: Option<DecisionLatency>,
    /// MGLRU response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mglru_response: Option<MglruResponse>,
}

impl Packet {
    /// Create a packet of the given type with no payload.
    pub fn new(kind: PacketType) -> Self {
        Self {
            kind,
            handshake: None,
            kill_request: None,
            kill_decision: None,
            decision_latency: None,
            mglru_response: None,
        }
    }

    /// Create a handshake packet.
    pub fn handshake(connection_type: ConnectionType) -> Self {
        Self {
            handshake: Some(Handshake { connection_type }),
            ..Self::new(PacketType::Handshake)
        }
    }

    /// Create a kill request packet.
    pub fn kill_request(sequence_num: u32, size_kb: u64, priority: ResizePriority) -> Self {
        Self {
            kill_request: Some(KillDecisionRequest {
                sequence_num,
                size_kb,
                priority: Some(priority),
            }),
            ..Self::new(PacketType::KillRequest)
        }
    }

    /// Create a kill decision packet.
    pub fn kill_decision(sequence_num: u32, size_kb: u64) -> Self {
        Self {
            kill_decision: Some(KillDecisionResponse {
                sequence_num,
                size_kb,
            }),
            ..Self::new(PacketType::KillDecision)
        }
    }

    /// Create a decision latency packet.
    pub fn decision_latency(sequence_num: u32, latency_ms: u32) -> Self {
        Self {
            decision_latency: Some(DecisionLatency {
                sequence_num,
                latency_ms,
            }),
            ..Self::new(PacketType::DecisionLatency)
        }
    }

    /// Create an MGLRU response packet.
    pub fn mglru_response(stats: Option<MglruStats>) -> Self {
        Self {
            mglru_response: Some(MglruResponse { stats }),
            ..Self::new(PacketType::MglruResponse)
        }
    }
}

// ============================================================================
// MGLRU Stats
// ============================================================================

/// One MGLRU generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    /// Generation sequence number. Lower is older.
    pub sequence_num: u64,
    /// Creation time of the generation, in milliseconds.
    pub timestamp_ms: u64,
    /// Anonymous memory in the generation, in KB.
    pub anon_kb: u64,
    /// File-backed memory in the generation, in KB.
    pub file_kb: u64,
}

/// Generations of one NUMA node, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node ID.
    pub id: u32,
    /// Generations on this node.
    pub generations: Vec<Generation>,
}

/// Nodes of one memory cgroup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memcg {
    /// Memory cgroup ID.
    pub id: u32,
    /// Nodes in this cgroup.
    pub nodes: Vec<Node>,
}

/// A full MGLRU stats tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MglruStats {
    /// Memory cgroups.
    pub cgs: Vec<Memcg>,
}

// ============================================================================
// Wire Format Helpers
// ============================================================================

/// Encode a message to wire format (length-prefixed JSON).
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;

    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Read one length-prefixed message from a stream.
pub fn read_message<T, R>(reader: &mut R) -> Result<T, DecodeError>
where
    T: for<'de> Deserialize<'de>,
    R: Read + ?Sized,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).map_err(DecodeError::Io)?;

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE as usize {
        tracing::warn!(len, "rejecting oversized frame");
        return Err(DecodeError::TooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).map_err(DecodeError::Io)?;

    serde_json::from_slice(&buf).map_err(DecodeError::Json)
}

/// Write one length-prefixed message to a stream.
pub fn write_message<T, W>(writer: &mut W, msg: &T) -> Result<(), DecodeError>
where
    T: Serialize,
    W: Write + ?Sized,
{
    let buf = encode_message(msg).map_err(DecodeError::Json)?;
    writer.write_all(&buf).map_err(DecodeError::Io)?;
    writer.flush().map_err(DecodeError::Io)
}

/// Error decoding a wire message.
#[derive(Debug)]
pub enum DecodeError {
    /// Frame size exceeds maximum.
    TooLarge(usize),
    /// JSON parse error.
    Json(serde_json::Error),
    /// Stream error while reading or writing a frame.
    Io(std::io::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::TooLarge(size) => write!(f, "frame too large: {} bytes", size),
            DecodeError::Json(e) => write!(f, "JSON decode error: {}", e),
            DecodeError::Io(e) => write!(f, "stream error: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}
