//! Balloon broker.

use super::ReclaimOperation;
use crate::balloon::{
    BalloonBlocker, BalloonWorker, BlockerFactory, ResizeDirection, ResizeRequest,
};
use crate::server::{Client, KillDecisionHandler};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};
use vmmem_protocol::{cid, DecisionLatency, ResizePriority};

/// Tunables for the balloon broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Amount moved when every killer of a context runs out of candidates.
    pub breathing_room_bytes: u64,
    /// Inflate step used by reclaim-until-blocked.
    pub reclaim_increment_bytes: u64,
    /// A decision latency at or above this counts as a timeout.
    pub decision_timeout_ms: u32,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            breathing_room_bytes: 128 * 1024 * 1024,
            reclaim_increment_bytes: 32 * 1024 * 1024,
            decision_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct KillRecord {
    priority: ResizePriority,
    freed_bytes: u64,
}

struct ClientState {
    client: Client,
    has_kill_candidates: bool,
    last_kill_request: Option<KillRecord>,
}

#[derive(Default)]
struct Context {
    /// Absent for the host.
    blocker: Option<Box<dyn BalloonBlocker>>,
    clients: Vec<ClientState>,
}

/// Routes kill requests and reclaim operations to per-VM balloons.
pub struct BalloonBroker {
    contexts: BTreeMap<u32, Context>,
    factory: BlockerFactory,
    worker: BalloonWorker,
    settings: BrokerSettings,
}

impl BalloonBroker {
    /// Create a broker with only the host context.
    pub fn new(factory: BlockerFactory, worker: BalloonWorker, settings: BrokerSettings) -> Self {
        let mut contexts = BTreeMap::new();
        contexts.insert(cid::LOCAL, Context::default());

        Self {
            contexts,
            factory,
            worker,
            settings,
        }
    }

    /// Start managing the balloon of VM `cid`. Registering twice is a no-op.
    pub fn register_vm(&mut self, cid: u32, target: &str) {
        if cid == cid::LOCAL {
            warn!(cid, "refusing to register a balloon for the host");
            return;
        }

        let context = self.contexts.entry(cid).or_default();
        if context.blocker.is_some() {
            return;
        }

        context.blocker = Some((self.factory)(cid, target, self.worker.clone()));
        info!(cid, target, "registered vm balloon");
    }

    /// Forget VM `cid` and everything known about it.
    pub fn remove_vm(&mut self, cid: u32) {
        if cid == cid::LOCAL {
            return;
        }

        if self.contexts.remove(&cid).is_some() {
            info!(cid, "removed vm balloon");
        }
    }

    /// Whether a context exists for `cid`.
    pub fn has_context(&self, cid: u32) -> bool {
        self.contexts.contains_key(&cid)
    }

    /// Track a newly connected kill client.
    pub fn on_client_connected(&mut self, client: &Client) {
        self.contexts
            .entry(client.cid)
            .or_default()
            .clients
            .push(ClientState {
                client: *client,
                has_kill_candidates: true,
                last_kill_request: None,
            });
    }

    /// Stop tracking a kill client.
    ///
    /// A guest context without a balloon goes away with its last client.
    pub fn on_client_disconnected(&mut self, client: &Client) {
        let Some(context) = self.contexts.get_mut(&client.cid) else {
            return;
        };

        context
            .clients
            .retain(|state| state.client.connection_id != client.connection_id);

        if client.cid != cid::LOCAL && context.clients.is_empty() && context.blocker.is_none() {
            self.contexts.remove(&client.cid);
        }
    }

    /// VMs with a balloon and at least one connected client.
    pub fn connected_vms(&self) -> Vec<u32> {
        self.contexts
            .iter()
            .filter(|(cid, context)| {
                **cid != cid::LOCAL && context.blocker.is_some() && !context.clients.is_empty()
            })
            .map(|(cid, _)| *cid)
            .collect()
    }

    /// Apply a reclaim operation.
    ///
    /// The host's share is split evenly over the connected VMs and added to
    /// each VM's own entry. VMs without a connected client are skipped.
    pub fn reclaim(&mut self, operation: &ReclaimOperation, priority: ResizePriority) {
        let connected = self.connected_vms();
        if connected.is_empty() {
            return;
        }

        let host_share = operation.get(&cid::LOCAL).copied().unwrap_or(0) / connected.len() as u64;

        for cid in connected {
            let total = host_share.saturating_add(operation.get(&cid).copied().unwrap_or(0));
            if total == 0 {
                continue;
            }
            let actual = self.adjust(cid, clamp_i64(total), priority);
            debug!(cid, requested = total, actual, %priority, "reclaim");
        }
    }

    /// Inflate VM `cid` by one increment.
    ///
    /// Returns true while the balloon keeps moving the full increment, i.e.
    /// while another step is worth scheduling.
    pub fn reclaim_until_blocked_step(&mut self, cid: u32, priority: ResizePriority) -> bool {
        let increment = clamp_i64(self.settings.reclaim_increment_bytes);
        let actual = self.adjust(cid, increment, priority);
        if actual < increment {
            debug!(cid, actual, "reclaim until blocked finished");
            return false;
        }
        true
    }

    /// Highest floor, over every VM and direction, below which some balloon
    /// refuses to move.
    pub fn lowest_unblocked_priority(&self, now: Instant) -> ResizePriority {
        self.contexts
            .values()
            .filter_map(|context| context.blocker.as_ref())
            .flat_map(|blocker| {
                ResizeDirection::ALL
                    .iter()
                    .map(move |direction| blocker.lowest_unblocked_priority(*direction, now))
            })
            .max()
            .unwrap_or(ResizePriority::Lowest)
    }

    /// Free up to `size_bytes` on behalf of a killer and return the bytes
    /// actually moved.
    ///
    /// The host asks VMs to inflate; a guest gets its own balloon deflated.
    pub fn handle_kill_request(
        &mut self,
        client: &Client,
        size_bytes: u64,
        priority: ResizePriority,
    ) -> u64 {
        if !self.contexts.contains_key(&client.cid) {
            return 0;
        }
        if let Some(state) = self.client_mut(client) {
            state.has_kill_candidates = true;
        }

        let size = clamp_i64(size_bytes);
        let freed = if client.cid == cid::LOCAL {
            let targets = self.connected_vms();
            self.evenly_adjust_balloons(&targets, size, priority)
        } else {
            self.adjust(client.cid, -size, priority)
        }
        .unsigned_abs();

        if let Some(state) = self.client_mut(client) {
            state.last_kill_request = Some(KillRecord {
                priority,
                freed_bytes: freed,
            });
        }

        freed
    }

    /// A killer has nothing left to kill.
    ///
    /// Once every killer of the context agrees, give the context some
    /// breathing room.
    pub fn handle_no_kill_candidates(&mut self, client: &Client) {
        let Some(state) = self.client_mut(client) else {
            return;
        };
        state.has_kill_candidates = false;

        let all_out = self
            .contexts
            .get(&client.cid)
            .map(|context| context.clients.iter().all(|state| !state.has_kill_candidates))
            .unwrap_or(false);
        if !all_out {
            return;
        }

        let amount = clamp_i64(self.settings.breathing_room_bytes);
        if client.cid == cid::LOCAL {
            let targets = self.connected_vms();
            let moved =
                self.evenly_adjust_balloons(&targets, amount, ResizePriority::NoKillCandidatesHost);
            debug!(moved, "host breathing room");
        } else {
            let moved = self.adjust(client.cid, -amount, ResizePriority::NoKillCandidatesGuest);
            debug!(cid = client.cid, moved, "guest breathing room");
        }
    }

    /// Log when a killer likely killed something it did not need to.
    pub fn handle_decision_latency(&mut self, client: &Client, latency: &DecisionLatency) {
        if latency.latency_ms < self.settings.decision_timeout_ms {
            return;
        }

        let last = self
            .client_mut(client)
            .and_then(|state| state.last_kill_request);
        if let Some(record) = last.filter(|record| record.freed_bytes > 0) {
            warn!(
                cid = client.cid,
                sequence_num = latency.sequence_num,
                latency_ms = latency.latency_ms,
                priority = %record.priority,
                freed_bytes = record.freed_bytes,
                "kill decision timed out after freeing memory, a kill may have been unnecessary"
            );
        }
    }

    /// Split `total` evenly over `targets` and return the sum actually moved.
    ///
    /// The split truncates, so up to `targets.len() - 1` bytes are dropped.
    pub fn evenly_adjust_balloons(
        &mut self,
        targets: &[u32],
        total: i64,
        priority: ResizePriority,
    ) -> i64 {
        if targets.is_empty() {
            return 0;
        }

        let share = total / targets.len() as i64;
        targets
            .iter()
            .map(|cid| self.adjust(*cid, share, priority))
            .sum()
    }

    fn adjust(&mut self, cid: u32, delta: i64, priority: ResizePriority) -> i64 {
        if delta == 0 {
            return 0;
        }

        match self
            .contexts
            .get_mut(&cid)
            .and_then(|context| context.blocker.as_mut())
        {
            Some(blocker) => blocker.try_resize(ResizeRequest::new(priority, delta)),
            None => 0,
        }
    }

    fn client_mut(&mut self, client: &Client) -> Option<&mut ClientState> {
        self.contexts
            .get_mut(&client.cid)?
            .clients
            .iter_mut()
            .find(|state| state.client.connection_id == client.connection_id)
    }
}

impl KillDecisionHandler for BalloonBroker {
    fn handle_kill_request(
        &mut self,
        client: &Client,
        size_bytes: u64,
        priority: ResizePriority,
    ) -> u64 {
        BalloonBroker::handle_kill_request(self, client, size_bytes, priority)
    }
}

fn clamp_i64(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}
