//! Packet handling for MGLRU telemetry connections.

use super::{Client, ConnectionId, ConnectionServer, Outcome, ServerEvent};
use crate::broker::StatsSource;
use tracing::{debug, warn};
use vmmem_protocol::{ConnectionType, MglruStats, Packet, PacketType};

pub(super) fn handle_packet(client: &Client, packet: Packet) -> Outcome {
    match packet.kind {
        // An unsolicited response is a push for a new generation.
        PacketType::MglruResponse => Outcome::Keep(
            packet
                .mglru_response
                .and_then(|response| response.stats)
                .map(|stats| ServerEvent::NewGeneration {
                    cid: client.cid,
                    stats,
                }),
        ),

        other => {
            debug!(cid = client.cid, packet_type = ?other, "ignoring unexpected packet");
            Outcome::Keep(None)
        }
    }
}

impl ConnectionServer {
    /// Fetch current stats from the telemetry connection of `cid`.
    ///
    /// Sends a request and blocks for exactly one response. Returns `None`
    /// when there is no such connection, when the round trip fails (the
    /// connection is then dropped), or when the response carries no stats.
    pub fn get_stats(&mut self, cid: u32) -> Option<MglruStats> {
        let id = self.telemetry_connection(cid)?;
        let conn = self.connections.get_mut(&id)?;

        let response = conn
            .transport
            .write_packet(&Packet::new(PacketType::MglruRequest))
            .and_then(|_| conn.transport.read_packet());

        match response {
            Ok(packet) => {
                let stats = packet.mglru_response.and_then(|response| response.stats);
                if stats.is_none() {
                    debug!(cid, "stats response without payload");
                }
                stats
            }
            Err(e) => {
                warn!(cid, error = %e, "stats round trip failed");
                self.disconnect(id);
                None
            }
        }
    }

    fn telemetry_connection(&self, cid: u32) -> Option<ConnectionId> {
        self.connections
            .iter()
            .find(|(_, conn)| {
                conn.client.is_some_and(|client| {
                    client.cid == cid && client.connection_type == ConnectionType::Mglru
                })
            })
            .map(|(id, _)| *id)
    }
}

impl StatsSource for ConnectionServer {
    fn get_stats(&mut self, cid: u32) -> Option<MglruStats> {
        ConnectionServer::get_stats(self, cid)
    }
}
