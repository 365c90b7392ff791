//! Connection server for killers and telemetry providers.
//!
//! A [`ConnectionServer`] owns one listener and every connection accepted
//! from it. Each connection must open with a handshake declaring the
//! [`ConnectionType`] this server serves. After that, packets are dispatched
//! by connection type ([`kill`] or [`telemetry`]) and then by packet type.
//!
//! The server never calls back into other components except the
//! [`KillDecisionHandler`] passed to [`ConnectionServer::handle_readable`],
//! because a kill decision must be answered inline. Everything else is
//! queued as a [`ServerEvent`] for the owner to drain.

mod kill;
mod telemetry;

use crate::error::Error;
use crate::transport::{self, PacketConnection, PacketListener};
use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use tracing::{debug, info, warn};
use vmmem_protocol::{
    cid, ConnectionType, DecisionLatency, MglruStats, Packet, PacketType, ResizePriority,
};

/// Default cap on simultaneous connections per server.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;

/// Connection identifier, unique for the lifetime of a server.
pub type ConnectionId = u64;

/// Identity of one connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Client {
    /// Peer CID.
    pub cid: u32,
    /// Connection this client arrived on.
    pub connection_id: ConnectionId,
    /// Type declared in the handshake.
    pub connection_type: ConnectionType,
}

/// Notification produced by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A client completed its handshake.
    Connected(Client),
    /// A handshaked client went away.
    Disconnected(Client),
    /// A killer has nothing left to kill.
    NoKillCandidates(Client),
    /// A killer reported decision latency.
    DecisionLatency {
        /// Reporting client.
        client: Client,
        /// The report.
        latency: DecisionLatency,
    },
    /// A telemetry provider pushed stats for a new generation.
    NewGeneration {
        /// Originating CID.
        cid: u32,
        /// The pushed stats.
        stats: MglruStats,
    },
}

/// Answers kill decision requests.
pub trait KillDecisionHandler {
    /// Try to free `size_bytes` for `client` and return the bytes freed.
    fn handle_kill_request(
        &mut self,
        client: &Client,
        size_bytes: u64,
        priority: ResizePriority,
    ) -> u64;
}

/// What to do with a connection after dispatching one packet.
enum Outcome {
    Keep(Option<ServerEvent>),
    Disconnect,
}

struct Connection {
    cid: u32,
    /// Set once the handshake succeeded.
    client: Option<Client>,
    transport: Box<dyn PacketConnection>,
}

/// Accepts, handshakes and serves connections of one type.
pub struct ConnectionServer {
    connection_type: ConnectionType,
    listener: Box<dyn PacketListener>,
    connections: HashMap<ConnectionId, Connection>,
    allowed_cids: HashSet<u32>,
    next_connection_id: ConnectionId,
    max_connections: usize,
    events: Vec<ServerEvent>,
}

impl ConnectionServer {
    /// Create a server accepting `connection_type` peers from `listener`.
    ///
    /// The host CID is always allowed; VMs must be registered.
    pub fn new(
        connection_type: ConnectionType,
        listener: Box<dyn PacketListener>,
        max_connections: usize,
    ) -> Self {
        Self {
            connection_type,
            listener,
            connections: HashMap::new(),
            allowed_cids: HashSet::from([cid::LOCAL]),
            next_connection_id: 0,
            max_connections,
            events: Vec::new(),
        }
    }

    /// Connection type this server serves.
    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    /// Allow connections from `cid`.
    pub fn register_vm(&mut self, cid: u32) {
        self.allowed_cids.insert(cid);
    }

    /// Drop every connection from `cid` and stop allowing it.
    pub fn remove_vm(&mut self, cid: u32) {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.cid == cid)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            self.disconnect(id);
        }

        if cid != cid::LOCAL {
            self.allowed_cids.remove(&cid);
        }
    }

    /// Accept one pending connection.
    ///
    /// Connections from unregistered CIDs, or beyond the connection cap, are
    /// accepted and immediately dropped.
    pub fn handle_accept(&mut self) -> Option<ConnectionId> {
        let transport = match self.listener.accept() {
            Ok(transport) => transport,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return None;
            }
        };

        let cid = transport.cid();
        if !self.allowed_cids.contains(&cid) {
            debug!(cid, "rejecting connection from unregistered cid");
            return None;
        }

        if self.connections.len() >= self.max_connections {
            warn!(cid, max = self.max_connections, "too many connections, dropping");
            return None;
        }

        let id = self.next_connection_id;
        self.next_connection_id += 1;
        self.connections.insert(
            id,
            Connection {
                cid,
                client: None,
                transport,
            },
        );

        debug!(cid, connection_id = id, "accepted connection");
        Some(id)
    }

    /// Read and handle exactly one packet from connection `id`.
    ///
    /// A connection whose descriptor has nothing pending is left alone: its
    /// input may already have been consumed by a stats round trip.
    pub fn handle_readable(&mut self, id: ConnectionId, handler: &mut dyn KillDecisionHandler) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        if let Some(fd) = conn.transport.readiness_fd() {
            if !transport::has_pending_input(fd) {
                debug!(cid = conn.cid, connection_id = id, "nothing pending");
                return;
            }
        }

        let packet = match conn.transport.read_packet() {
            Ok(packet) => packet,
            Err(e) => {
                debug!(cid = conn.cid, connection_id = id, error = %e, "read failed");
                self.disconnect(id);
                return;
            }
        };

        let client = conn.client;
        let outcome = match client {
            None => self.handshake(id, packet),
            Some(client) => match client.connection_type {
                ConnectionType::Kills => {
                    kill::handle_packet(conn.transport.as_mut(), &client, packet, handler)
                }
                ConnectionType::Mglru => telemetry::handle_packet(&client, packet),
                ConnectionType::Unspecified => Outcome::Disconnect,
            },
        };

        match outcome {
            Outcome::Keep(Some(event)) => self.events.push(event),
            Outcome::Keep(None) => {}
            Outcome::Disconnect => self.disconnect(id),
        }
    }

    /// Take every queued event.
    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Whether connection `id` is still open.
    pub fn has_connection(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of open connections, handshaked or not.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Descriptor of the listener, for readiness watching.
    pub fn listener_fd(&self) -> Option<RawFd> {
        self.listener.readiness_fd()
    }

    /// Descriptor of connection `id`, for readiness watching.
    pub fn connection_fd(&self, id: ConnectionId) -> Option<RawFd> {
        self.connections
            .get(&id)
            .and_then(|conn| conn.transport.readiness_fd())
    }

    fn handshake(&mut self, id: ConnectionId, packet: Packet) -> Outcome {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Outcome::Disconnect;
        };

        let declared = match (packet.kind, packet.handshake) {
            (PacketType::Handshake, Some(handshake)) => handshake.connection_type,
            _ => ConnectionType::Unspecified,
        };

        if declared == ConnectionType::Unspecified || declared != self.connection_type {
            let err = Error::handshake(
                conn.cid,
                format!("declared {:?}, serving {:?}", declared, self.connection_type),
            );
            warn!(error = %err, "rejecting connection");
            let _ = conn
                .transport
                .write_packet(&Packet::new(PacketType::ConnectionNack));
            return Outcome::Disconnect;
        }

        if let Err(e) = conn
            .transport
            .write_packet(&Packet::new(PacketType::ConnectionAck))
        {
            warn!(cid = conn.cid, error = %e, "failed to acknowledge handshake");
            return Outcome::Disconnect;
        }

        let client = Client {
            cid: conn.cid,
            connection_id: id,
            connection_type: declared,
        };
        conn.client = Some(client);

        info!(cid = client.cid, connection_id = id, connection_type = ?declared, "client connected");
        Outcome::Keep(Some(ServerEvent::Connected(client)))
    }

    fn disconnect(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };

        if let Some(client) = conn.client {
            info!(cid = client.cid, connection_id = id, "client disconnected");
            self.events.push(ServerEvent::Disconnected(client));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryListener, MemoryPeer};
    use crate::transport::socket::SocketListener;
    use std::time::{Duration, Instant};
    use vmmem_protocol::{read_message, write_message};

    /// Frees whatever is asked, recording each request.
    #[derive(Default)]
    pub(crate) struct GenerousHandler {
        pub requests: Vec<(Client, u64, ResizePriority)>,
    }

    impl KillDecisionHandler for GenerousHandler {
        fn handle_kill_request(
            &mut self,
            client: &Client,
            size_bytes: u64,
            priority: ResizePriority,
        ) -> u64 {
            self.requests.push((*client, size_bytes, priority));
            size_bytes
        }
    }

    fn kills_server(listener: &MemoryListener) -> ConnectionServer {
        ConnectionServer::new(
            ConnectionType::Kills,
            Box::new(listener.clone()),
            DEFAULT_MAX_CONNECTIONS,
        )
    }

    fn connect(
        server: &mut ConnectionServer,
        listener: &MemoryListener,
        cid: u32,
    ) -> (ConnectionId, MemoryPeer) {
        let peer = listener.connect(cid);
        let id = server.handle_accept().expect("accepted");
        peer.send(Packet::handshake(server.connection_type()));
        server.handle_readable(id, &mut GenerousHandler::default());
        (id, peer)
    }

    #[test]
    fn test_handshake_acks_and_reports_connected() {
        let listener = MemoryListener::default();
        let mut server = kills_server(&listener);

        let (id, peer) = connect(&mut server, &listener, cid::LOCAL);

        let sent = peer.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, PacketType::ConnectionAck);
        assert_eq!(
            server.drain_events(),
            vec![ServerEvent::Connected(Client {
                cid: cid::LOCAL,
                connection_id: id,
                connection_type: ConnectionType::Kills,
            })]
        );
    }

    #[test]
    fn test_first_packet_must_be_handshake() {
        let listener = MemoryListener::default();
        let mut server = kills_server(&listener);

        let peer = listener.connect(cid::LOCAL);
        let id = server.handle_accept().unwrap();
        peer.send(Packet::kill_request(1, 4, ResizePriority::CachedTab));
        server.handle_readable(id, &mut GenerousHandler::default());

        assert!(!server.has_connection(id));
        assert_eq!(peer.take_sent()[0].kind, PacketType::ConnectionNack);
        assert!(server.drain_events().is_empty());
    }

    #[test]
    fn test_handshake_rejects_unspecified_and_wrong_type() {
        let listener = MemoryListener::default();
        let mut server = kills_server(&listener);

        for declared in [ConnectionType::Unspecified, ConnectionType::Mglru] {
            let peer = listener.connect(cid::LOCAL);
            let id = server.handle_accept().unwrap();
            peer.send(Packet::handshake(declared));
            server.handle_readable(id, &mut GenerousHandler::default());
            assert!(!server.has_connection(id), "{:?} should be rejected", declared);
        }
    }

    #[test]
    fn test_failed_ack_closes_connection() {
        let listener = MemoryListener::default();
        let mut server = kills_server(&listener);

        let peer = listener.connect(cid::LOCAL);
        let id = server.handle_accept().unwrap();
        peer.fail_writes();
        peer.send(Packet::handshake(ConnectionType::Kills));
        server.handle_readable(id, &mut GenerousHandler::default());

        assert!(!server.has_connection(id));
        assert!(server.drain_events().is_empty());
    }

    #[test]
    fn test_unregistered_cid_is_rejected() {
        let listener = MemoryListener::default();
        let mut server = kills_server(&listener);

        listener.connect(9);
        assert!(server.handle_accept().is_none());

        server.register_vm(9);
        listener.connect(9);
        assert!(server.handle_accept().is_some());
    }

    #[test]
    fn test_connection_cap() {
        let listener = MemoryListener::default();
        let mut server = kills_server(&listener);

        for _ in 0..DEFAULT_MAX_CONNECTIONS {
            listener.connect(cid::LOCAL);
            assert!(server.handle_accept().is_some());
        }

        listener.connect(cid::LOCAL);
        assert!(server.handle_accept().is_none());
        assert_eq!(server.connection_count(), DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let listener = MemoryListener::default();
        let mut server = kills_server(&listener);

        let (first, _) = connect(&mut server, &listener, cid::LOCAL);
        server.remove_vm(cid::LOCAL);
        let (second, _) = connect(&mut server, &listener, cid::LOCAL);

        assert_ne!(first, second);
    }

    #[test]
    fn test_read_failure_disconnects() {
        let listener = MemoryListener::default();
        let mut server = kills_server(&listener);
        let (id, _peer) = connect(&mut server, &listener, cid::LOCAL);
        server.drain_events();

        // Nothing queued reads like a closed socket.
        server.handle_readable(id, &mut GenerousHandler::default());

        assert!(!server.has_connection(id));
        assert!(matches!(
            server.drain_events().as_slice(),
            [ServerEvent::Disconnected(client)] if client.connection_id == id
        ));
    }

    #[test]
    fn test_idle_socket_is_not_read() {
        let listener = SocketListener::default();
        let mut server = ConnectionServer::new(
            ConnectionType::Kills,
            Box::new(listener.clone()),
            DEFAULT_MAX_CONNECTIONS,
        );
        let mut peer = listener
            .connect(cid::LOCAL, Duration::from_secs(2))
            .unwrap();
        let id = server.handle_accept().unwrap();

        write_message(&mut peer, &Packet::handshake(ConnectionType::Kills)).unwrap();
        server.handle_readable(id, &mut GenerousHandler::default());
        let ack: Packet = read_message(&mut peer).unwrap();
        assert_eq!(ack.kind, PacketType::ConnectionAck);

        let started = Instant::now();
        server.handle_readable(id, &mut GenerousHandler::default());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(server.has_connection(id));

        drop(peer);
        server.handle_readable(id, &mut GenerousHandler::default());
        assert!(!server.has_connection(id));
    }

    #[test]
    fn test_remove_vm_disconnects_every_connection_of_cid() {
        let listener = MemoryListener::default();
        let mut server = kills_server(&listener);
        server.register_vm(5);
        server.register_vm(6);

        let (a, _pa) = connect(&mut server, &listener, 5);
        let (b, _pb) = connect(&mut server, &listener, 5);
        let (c, _pc) = connect(&mut server, &listener, 6);
        server.drain_events();

        server.remove_vm(5);

        assert!(!server.has_connection(a));
        assert!(!server.has_connection(b));
        assert!(server.has_connection(c));
        let events = server.drain_events();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, ServerEvent::Disconnected(client) if client.cid == 5)));

        listener.connect(5);
        assert!(server.handle_accept().is_none(), "cid 5 is forgotten");
    }
}
