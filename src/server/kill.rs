//! Packet handling for kill decision connections.

use super::{Client, KillDecisionHandler, Outcome, ServerEvent};
use crate::transport::PacketConnection;
use tracing::{debug, warn};
use vmmem_protocol::{Packet, PacketType};

pub(super) fn handle_packet(
    transport: &mut dyn PacketConnection,
    client: &Client,
    packet: Packet,
    handler: &mut dyn KillDecisionHandler,
) -> Outcome {
    match packet.kind {
        PacketType::KillRequest => {
            let Some((request, priority)) = packet
                .kill_request
                .and_then(|request| request.priority.map(|priority| (request, priority)))
            else {
                warn!(cid = client.cid, "kill request without payload or priority");
                return Outcome::Keep(None);
            };

            let freed = handler.handle_kill_request(
                client,
                request.size_kb.saturating_mul(1024),
                priority,
            );
            debug!(
                cid = client.cid,
                sequence_num = request.sequence_num,
                size_kb = request.size_kb,
                freed_kb = freed / 1024,
                %priority,
                "kill decision"
            );

            let reply = Packet::kill_decision(request.sequence_num, freed / 1024);
            if let Err(e) = transport.write_packet(&reply) {
                warn!(cid = client.cid, error = %e, "failed to send kill decision");
                return Outcome::Disconnect;
            }
            Outcome::Keep(None)
        }

        PacketType::NoKillCandidates => Outcome::Keep(Some(ServerEvent::NoKillCandidates(*client))),

        PacketType::DecisionLatency => Outcome::Keep(packet.decision_latency.map(|latency| {
            ServerEvent::DecisionLatency {
                client: *client,
                latency,
            }
        })),

        other => {
            debug!(cid = client.cid, packet_type = ?other, "ignoring unexpected packet");
            Outcome::Keep(None)
        }
    }
}
