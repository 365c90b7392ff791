//! Memory service.
//!
//! All server and broker state is owned by [`MemoryService`], which runs on
//! its own thread and handles one [`Command`] at a time. Everything else
//! (readiness watchers, timers, the host generation watcher and the public
//! [`ServiceHandle`]) only ever talks to it through the command queue.
//!
//! Readiness watchers are tokio tasks around a duplicate of each socket
//! descriptor. A watcher only posts `Readable` while input is actually
//! pending, then waits for the service to acknowledge before looking at the
//! descriptor again, so a socket is never read from two places and a
//! still-readable socket is reported again.

use crate::balloon::{BalloonWorker, BlockerFactory};
use crate::broker::{
    BalloonBroker, BrokerSettings, Clock, LocalStats, ReclaimBroker, ReclaimOperation,
    ReclaimSettings,
};
use crate::error::{Error, Result};
use crate::mglru;
use crate::server::{ConnectionId, ConnectionServer, ServerEvent};
use crate::timer::RepeatingTimer;
use crate::transport::{self, PacketListener};
use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{spawn_blocking, JoinHandle};
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};
use vmmem_protocol::{cid, ConnectionType, MglruStats, ResizePriority};

/// Which socket became readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A listener has a pending connection.
    Listener(ConnectionType),
    /// A connection has data.
    Connection(ConnectionType, ConnectionId),
}

/// Work for the service thread.
#[derive(Debug)]
pub enum Command {
    /// Start managing a VM.
    RegisterVm {
        /// VM CID.
        cid: u32,
        /// Balloon target handed to the blocker factory.
        target: String,
    },
    /// Stop managing a VM.
    RemoveVm {
        /// VM CID.
        cid: u32,
    },
    /// Apply a reclaim operation.
    Reclaim {
        /// Bytes per context.
        operation: ReclaimOperation,
        /// Priority of the resizes.
        priority: ResizePriority,
    },
    /// Inflate a VM step by step until its balloon stops moving.
    ReclaimUntilBlocked {
        /// VM CID.
        cid: u32,
        /// Priority of the resizes.
        priority: ResizePriority,
    },
    /// Cancel reclaim-until-blocked for a VM.
    StopReclaimUntilBlocked {
        /// VM CID.
        cid: u32,
    },
    /// One reclaim-until-blocked step is due.
    ReclaimTick {
        /// VM CID.
        cid: u32,
        /// Priority of the resize.
        priority: ResizePriority,
        /// Timer that fired.
        generation: u64,
    },
    /// The host reported MGLRU telemetry.
    LocalTelemetry {
        /// Whether a new generation was created.
        new_generation: bool,
    },
    /// A watched socket is readable. `ack` receives false once the socket
    /// is gone.
    Readable {
        /// Socket that became readable.
        source: Source,
        /// Watcher acknowledgement.
        ack: oneshot::Sender<bool>,
    },
    /// Stop the service.
    Shutdown,
}

/// Everything the service is built from.
pub struct ServiceParts {
    /// Listener for kill decision clients.
    pub kills_listener: Box<dyn PacketListener>,
    /// Listener for MGLRU telemetry clients.
    pub telemetry_listener: Box<dyn PacketListener>,
    /// Connection cap per server.
    pub max_connections: usize,
    /// Builds a blocker for each registered VM.
    pub blocker_factory: BlockerFactory,
    /// Reads host MGLRU stats.
    pub local_stats: LocalStats,
    /// Clock in the time base of generation timestamps.
    pub clock: Clock,
    /// Balloon broker tunables.
    pub broker: BrokerSettings,
    /// Reclaim broker tunables.
    pub reclaim: ReclaimSettings,
    /// Period of reclaim-until-blocked steps.
    pub reclaim_period: Duration,
}

struct ReclaimTimer {
    generation: u64,
    _timer: RepeatingTimer,
}

/// Single owner of all server and broker state.
pub struct MemoryService {
    kills: ConnectionServer,
    telemetry: ConnectionServer,
    balloons: BalloonBroker,
    reclaim: ReclaimBroker,
    runtime: Handle,
    tx: mpsc::UnboundedSender<Command>,
    reclaim_timers: HashMap<u32, ReclaimTimer>,
    next_timer_generation: u64,
    reclaim_period: Duration,
    watchers: Vec<JoinHandle<()>>,
}

impl MemoryService {
    /// Build the service. `tx` must feed the queue the service is run on.
    pub fn new(
        parts: ServiceParts,
        runtime: Handle,
        tx: mpsc::UnboundedSender<Command>,
    ) -> Result<Self> {
        let worker = BalloonWorker::spawn()?;

        let mut service = Self {
            kills: ConnectionServer::new(
                ConnectionType::Kills,
                parts.kills_listener,
                parts.max_connections,
            ),
            telemetry: ConnectionServer::new(
                ConnectionType::Mglru,
                parts.telemetry_listener,
                parts.max_connections,
            ),
            balloons: BalloonBroker::new(parts.blocker_factory, worker, parts.broker),
            reclaim: ReclaimBroker::new(parts.local_stats, parts.clock, parts.reclaim),
            runtime,
            tx,
            reclaim_timers: HashMap::new(),
            next_timer_generation: 0,
            reclaim_period: parts.reclaim_period,
            watchers: Vec::new(),
        };

        for kind in [ConnectionType::Kills, ConnectionType::Mglru] {
            if let Some(fd) = service.server(kind).listener_fd() {
                service.watch(Source::Listener(kind), fd);
            }
        }

        Ok(service)
    }

    /// Handle commands until shutdown or until every sender is gone.
    pub fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!("memory service running");
        while let Some(command) = rx.blocking_recv() {
            if !self.handle(command) {
                break;
            }
        }
        info!("memory service stopped");
    }

    /// Handle one command. Returns false on shutdown.
    pub fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::RegisterVm { cid, target } => self.register_vm(cid, &target),
            Command::RemoveVm { cid } => self.remove_vm(cid),
            Command::Reclaim {
                operation,
                priority,
            } => self.balloons.reclaim(&operation, priority),
            Command::ReclaimUntilBlocked { cid, priority } => {
                self.reclaim_until_blocked(cid, priority)
            }
            Command::StopReclaimUntilBlocked { cid } => {
                self.reclaim_timers.remove(&cid);
            }
            Command::ReclaimTick {
                cid,
                priority,
                generation,
            } => self.reclaim_tick(cid, priority, generation),
            Command::LocalTelemetry { new_generation } => {
                if new_generation {
                    self.new_generation(cid::LOCAL, None);
                }
            }
            Command::Readable { source, ack } => {
                let alive = self.handle_readable(source);
                let _ = ack.send(alive);
            }
            Command::Shutdown => return false,
        }
        true
    }

    /// Whether reclaim-until-blocked is running for `cid`.
    pub fn is_reclaiming_until_blocked(&self, cid: u32) -> bool {
        self.reclaim_timers.contains_key(&cid)
    }

    fn server(&self, kind: ConnectionType) -> &ConnectionServer {
        match kind {
            ConnectionType::Mglru => &self.telemetry,
            _ => &self.kills,
        }
    }

    fn register_vm(&mut self, cid: u32, target: &str) {
        self.kills.register_vm(cid);
        self.telemetry.register_vm(cid);
        self.balloons.register_vm(cid, target);
        self.reclaim.register_vm(cid);
    }

    fn remove_vm(&mut self, cid: u32) {
        self.reclaim_timers.remove(&cid);
        self.kills.remove_vm(cid);
        self.telemetry.remove_vm(cid);
        self.dispatch_events();
        self.balloons.remove_vm(cid);
        self.reclaim.remove_vm(cid);
    }

    fn reclaim_until_blocked(&mut self, cid: u32, priority: ResizePriority) {
        self.reclaim_timers.remove(&cid);
        if !self.balloons.reclaim_until_blocked_step(cid, priority) {
            return;
        }

        let generation = self.next_timer_generation;
        self.next_timer_generation += 1;

        let tx = self.tx.clone();
        let timer = RepeatingTimer::start(&self.runtime, self.reclaim_period, move || {
            tx.send(Command::ReclaimTick {
                cid,
                priority,
                generation,
            })
            .is_ok()
        });

        self.reclaim_timers.insert(
            cid,
            ReclaimTimer {
                generation,
                _timer: timer,
            },
        );
    }

    fn reclaim_tick(&mut self, cid: u32, priority: ResizePriority, generation: u64) {
        match self.reclaim_timers.get(&cid) {
            Some(timer) if timer.generation == generation => {}
            _ => return,
        }

        if !self.balloons.reclaim_until_blocked_step(cid, priority) {
            self.reclaim_timers.remove(&cid);
        }
    }

    fn new_generation(&mut self, cid: u32, stats: Option<MglruStats>) {
        let lowest = self.balloons.lowest_unblocked_priority(Instant::now());
        if let Some(operation) =
            self.reclaim
                .handle_new_generation(cid, stats, lowest, &mut self.telemetry)
        {
            self.balloons
                .reclaim(&operation, ResizePriority::MglruReclaim);
        }
    }

    /// Handle one readiness report. Returns whether the source still exists.
    fn handle_readable(&mut self, source: Source) -> bool {
        let alive = match source {
            Source::Listener(kind) => {
                let server = match kind {
                    ConnectionType::Mglru => &mut self.telemetry,
                    _ => &mut self.kills,
                };
                if let Some(id) = server.handle_accept() {
                    if let Some(fd) = server.connection_fd(id) {
                        self.watch(Source::Connection(kind, id), fd);
                    }
                }
                true
            }
            Source::Connection(kind, id) => {
                let server = match kind {
                    ConnectionType::Mglru => &mut self.telemetry,
                    _ => &mut self.kills,
                };
                server.handle_readable(id, &mut self.balloons);
                server.has_connection(id)
            }
        };

        self.dispatch_events();
        alive
    }

    fn dispatch_events(&mut self) {
        loop {
            let mut events = self.kills.drain_events();
            events.extend(self.telemetry.drain_events());
            if events.is_empty() {
                break;
            }
            for event in events {
                self.handle_event(event);
            }
        }
    }

    fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected(client) if client.connection_type == ConnectionType::Kills => {
                self.balloons.on_client_connected(&client)
            }
            ServerEvent::Disconnected(client)
                if client.connection_type == ConnectionType::Kills =>
            {
                self.balloons.on_client_disconnected(&client)
            }
            ServerEvent::Connected(client) | ServerEvent::Disconnected(client) => {
                debug!(cid = client.cid, connection_id = client.connection_id, "telemetry client changed");
            }
            ServerEvent::NoKillCandidates(client) => {
                self.balloons.handle_no_kill_candidates(&client)
            }
            ServerEvent::DecisionLatency { client, latency } => {
                self.balloons.handle_decision_latency(&client, &latency)
            }
            ServerEvent::NewGeneration { cid, stats } => self.new_generation(cid, Some(stats)),
        }
    }

    fn watch(&mut self, source: Source, fd: RawFd) {
        // SAFETY: the owning server keeps `fd` open for the duration of this
        // call; the duplicate is independent of it afterwards.
        let owned = match unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned() {
            Ok(owned) => owned,
            Err(e) => {
                warn!(?source, error = %e, "failed to duplicate descriptor");
                return;
            }
        };

        self.watchers.retain(|watcher| !watcher.is_finished());
        let tx = self.tx.clone();
        self.watchers
            .push(self.runtime.spawn(watch_readable(owned, source, tx)));
    }
}

impl Drop for MemoryService {
    fn drop(&mut self) {
        for watcher in &self.watchers {
            watcher.abort();
        }
    }
}

async fn watch_readable(fd: OwnedFd, source: Source, tx: mpsc::UnboundedSender<Command>) {
    let fd = match AsyncFd::with_interest(fd, Interest::READABLE) {
        Ok(fd) => fd,
        Err(e) => {
            warn!(?source, error = %e, "cannot watch descriptor");
            return;
        }
    };

    loop {
        let mut guard = match fd.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(?source, error = %e, "readiness wait failed");
                return;
            }
        };

        // The service may already have consumed the input inline.
        if !transport::has_pending_input(fd.get_ref().as_raw_fd()) {
            guard.clear_ready();
            continue;
        }

        let (ack, acked) = oneshot::channel();
        if tx.send(Command::Readable { source, ack }).is_err() {
            return;
        }
        match acked.await {
            Ok(true) => {}
            _ => return,
        }
    }
}

/// Public handle to a running [`MemoryService`].
///
/// Dropping the handle stops the service.
pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<Command>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServiceHandle {
    /// Build the service and run it on a dedicated thread.
    ///
    /// Watchers and timers are spawned on `runtime`.
    pub fn spawn(parts: ServiceParts, runtime: Handle) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = MemoryService::new(parts, runtime, tx.clone())?;

        let thread = thread::Builder::new()
            .name("vmmem-service".into())
            .spawn(move || service.run(rx))?;

        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| Error::ServiceStopped)
    }

    /// Start managing VM `cid` with balloon `target`.
    pub fn register_vm(&self, cid: u32, target: impl Into<String>) -> Result<()> {
        self.send(Command::RegisterVm {
            cid,
            target: target.into(),
        })
    }

    /// Stop managing VM `cid`.
    pub fn remove_vm(&self, cid: u32) -> Result<()> {
        self.send(Command::RemoveVm { cid })
    }

    /// Apply a reclaim operation.
    pub fn reclaim(&self, operation: ReclaimOperation, priority: ResizePriority) -> Result<()> {
        self.send(Command::Reclaim {
            operation,
            priority,
        })
    }

    /// Inflate VM `cid` until its balloon stops moving.
    pub fn reclaim_until_blocked(&self, cid: u32, priority: ResizePriority) -> Result<()> {
        self.send(Command::ReclaimUntilBlocked { cid, priority })
    }

    /// Cancel reclaim-until-blocked for VM `cid`.
    pub fn stop_reclaim_until_blocked(&self, cid: u32) -> Result<()> {
        self.send(Command::StopReclaimUntilBlocked { cid })
    }

    /// Report host MGLRU telemetry.
    pub fn notify_local_telemetry(&self, new_generation: bool) -> Result<()> {
        self.send(Command::LocalTelemetry { new_generation })
    }

    /// A cloneable sender for host telemetry notifications.
    pub fn local_telemetry_notifier(&self) -> LocalTelemetryNotifier {
        LocalTelemetryNotifier {
            tx: self.tx.clone(),
        }
    }

    /// Stop the service and wait for its thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("memory service thread panicked");
            }
        }
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Host telemetry push callback.
#[derive(Clone)]
pub struct LocalTelemetryNotifier {
    tx: mpsc::UnboundedSender<Command>,
}

impl LocalTelemetryNotifier {
    /// Report host telemetry. Returns false once the service is gone.
    pub fn notify(&self, new_generation: bool) -> bool {
        self.tx
            .send(Command::LocalTelemetry { new_generation })
            .is_ok()
    }
}

/// Polls the host MGLRU file and reports new generations.
///
/// Stops when dropped or once the service is gone.
pub struct LocalGenerationWatcher {
    task: JoinHandle<()>,
}

impl LocalGenerationWatcher {
    /// Start polling `path` every `period`.
    pub fn start(
        runtime: &Handle,
        path: PathBuf,
        page_size: u64,
        period: Duration,
        notifier: LocalTelemetryNotifier,
    ) -> Self {
        let task = runtime.spawn(async move {
            let mut interval = interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut newest = None;

            loop {
                interval.tick().await;

                let read_path = path.clone();
                let read = spawn_blocking(move || mglru::read_stats(&read_path, page_size));
                let stats = match read.await {
                    Ok(Ok(stats)) => stats,
                    Ok(Err(e)) => {
                        debug!(error = %e, "host mglru stats unavailable");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "host mglru read task failed");
                        continue;
                    }
                };

                let latest = newest_sequence(&stats);
                let changed = newest.is_some() && latest != newest;
                newest = latest;

                if changed && !notifier.notify(true) {
                    break;
                }
            }
        });

        Self { task }
    }
}

impl Drop for LocalGenerationWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn newest_sequence(stats: &MglruStats) -> Option<u64> {
    mglru::generations(stats)
        .map(|generation| generation.sequence_num)
        .max()
}
