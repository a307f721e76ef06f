//! The coordinator: one actor task owning all authoritative state.
//!
//! Connection tasks, the sweep timer, fork completions and exit
//! notifications all feed a single event queue.  Each loop iteration drains
//! the queue into one timestep batch, applies it to `MasterState`, and
//! emits the step's effects (forwards, replays, fork spawns) at the
//! boundary.  While staged intake remains unassigned, the loop keeps
//! stepping immediately — one `recv_id` per recipient per step — instead of
//! sleeping until the next external event.

use aft_protocol::{InitialData, MsgRecv, NodeId, WireMessage};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MasterConfig;
use crate::net::{self, ConnId};
use crate::spawn::{ChildPid, ProcessHost, SpawnError, SpawnRequest};
use crate::state::{Intake, MasterState, ReplayMismatch};

// ---------------------------------------------------------------------------
// Events and errors
// ---------------------------------------------------------------------------

/// Everything that can reach the coordinator between timesteps.
#[derive(Debug)]
pub enum MasterEvent {
    Accepted {
        conn: ConnId,
        outbound: mpsc::UnboundedSender<WireMessage>,
        peer: Option<String>,
    },
    Frame {
        conn: ConnId,
        msg: WireMessage,
    },
    ConnClosed {
        conn: ConnId,
    },
    ForkDone {
        attempt_id: aft_protocol::AttemptId,
        result: Result<ChildPid, SpawnError>,
    },
    ChildExited {
        pid: ChildPid,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("listener error: {0}")]
    Listen(#[from] std::io::Error),
    /// A duplicate `msg_send` disagreed with the buffered row.  The log is
    /// no longer trustworthy, so the whole coordinator aborts.
    #[error(transparent)]
    ReplayInconsistency(#[from] ReplayMismatch),
    #[error("coordinator task failed: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// A running master.  Obtained from [`start`].
pub struct MasterHandle {
    addr: SocketAddr,
    events: mpsc::UnboundedSender<MasterEvent>,
    join: JoinHandle<Result<(), MasterError>>,
    accept: JoinHandle<()>,
}

impl MasterHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The URL children dial, as handed to the process host.
    pub fn master_url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Graceful shutdown: terminates every child the host has not already
    /// reported exited, then stops the coordinator.
    pub async fn shutdown(self) -> Result<(), MasterError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .events
            .send(MasterEvent::Shutdown { done: done_tx })
            .is_ok()
        {
            let _ = done_rx.await;
        }
        self.accept.abort();
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(MasterError::Join(e.to_string())),
        }
    }

    /// Wait for the coordinator to stop on its own.  It only does so on a
    /// fatal protocol violation, so this is how embedders (and tests)
    /// observe aborts.
    pub async fn join(self) -> Result<(), MasterError> {
        let result = match self.join.await {
            Ok(result) => result,
            Err(e) => Err(MasterError::Join(e.to_string())),
        };
        self.accept.abort();
        result
    }
}

/// Bind the child listener, bootstrap the attempt table, and start the
/// coordinator actor.  `exits` carries host-reported child exits (shutdown
/// bookkeeping only).
pub async fn start<H: ProcessHost>(
    cfg: MasterConfig,
    host: H,
    mut exits: mpsc::UnboundedReceiver<ChildPid>,
) -> Result<MasterHandle, MasterError> {
    let listener = TcpListener::bind(cfg.bind.as_str()).await?;
    let addr = listener.local_addr()?;
    info!(%addr, node_count = cfg.node_count, "master listening");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let accept = tokio::spawn(net::accept_loop(listener, events_tx.clone()));

    let exit_events = events_tx.clone();
    tokio::spawn(async move {
        while let Some(pid) = exits.recv().await {
            if exit_events.send(MasterEvent::ChildExited { pid }).is_err() {
                break;
            }
        }
    });

    let coordinator = Coordinator {
        master_url: format!("ws://{addr}/"),
        state: MasterState::bootstrap(cfg.node_count, Instant::now()),
        cfg,
        host: Arc::new(host),
        events_rx,
        events_tx: events_tx.clone(),
        conns: HashMap::new(),
        bindings: HashMap::new(),
        exited: HashSet::new(),
    };
    let join = tokio::spawn(coordinator.run());

    Ok(MasterHandle {
        addr,
        events: events_tx,
        join,
        accept,
    })
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct Coordinator<H> {
    cfg: MasterConfig,
    master_url: String,
    state: MasterState,
    host: Arc<H>,
    events_rx: mpsc::UnboundedReceiver<MasterEvent>,
    /// Kept for the fork-effect tasks to post their completions.
    events_tx: mpsc::UnboundedSender<MasterEvent>,
    conns: HashMap<ConnId, mpsc::UnboundedSender<WireMessage>>,
    /// Connection of each node's live attempt, bound at `child_ack`.
    bindings: HashMap<NodeId, ConnId>,
    exited: HashSet<ChildPid>,
}

impl<H: ProcessHost> Coordinator<H> {
    async fn run(mut self) -> Result<(), MasterError> {
        let mut sweep = tokio::time::interval(self.cfg.timing.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.tick().await;

        // Bootstrap step: fork the initial attempts.
        self.emit_fork_effects();

        loop {
            let mut batch = Vec::new();
            let mut sweep_due = false;

            if !self.state.has_staged() {
                tokio::select! {
                    maybe = self.events_rx.recv() => match maybe {
                        Some(ev) => batch.push(ev),
                        None => return Ok(()),
                    },
                    _ = sweep.tick() => sweep_due = true,
                }
            }
            while let Ok(ev) = self.events_rx.try_recv() {
                batch.push(ev);
            }

            if let Some(done) = self.step(batch, sweep_due)? {
                self.shutdown().await;
                let _ = done.send(());
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
    }

    /// One timestep: apply the drained inputs, then emit effects.
    fn step(
        &mut self,
        batch: Vec<MasterEvent>,
        sweep_due: bool,
    ) -> Result<Option<oneshot::Sender<()>>, MasterError> {
        let now = Instant::now();
        let mut shutdown = None;

        for event in batch {
            match event {
                MasterEvent::Accepted {
                    conn,
                    outbound,
                    peer,
                } => {
                    debug!(conn, peer = peer.as_deref().unwrap_or("?"), "child connected");
                    self.conns.insert(conn, outbound);
                }
                MasterEvent::ConnClosed { conn } => {
                    debug!(conn, "child connection closed");
                    self.conns.remove(&conn);
                    self.bindings.retain(|_, bound| *bound != conn);
                }
                MasterEvent::Frame { conn, msg } => self.handle_frame(conn, msg, now)?,
                MasterEvent::ForkDone {
                    attempt_id,
                    result: Ok(pid),
                } => self.state.fork_done(attempt_id, pid, now),
                MasterEvent::ForkDone {
                    attempt_id,
                    result: Err(e),
                } => {
                    error!(attempt_id, error = %e, "fork effect failed");
                    self.state.fork_failed(attempt_id);
                }
                MasterEvent::ChildExited { pid } => {
                    self.exited.insert(pid);
                }
                MasterEvent::Shutdown { done } => shutdown = Some(done),
            }
        }

        if sweep_due {
            self.state.sweep(now, self.cfg.timing.ping_timeout);
        }

        for respawn in self.state.take_respawns(now) {
            self.bindings.remove(&respawn.node_id);
        }

        for assigned in self.state.assign_recv_ids() {
            let live = self
                .state
                .live_attempt(assigned.recv_node)
                .and_then(|_| self.bindings.get(&assigned.recv_node).copied());
            if let Some(conn) = live {
                self.send_to_conn(
                    conn,
                    WireMessage::MsgRecv(MsgRecv {
                        recv_node: assigned.recv_node,
                        recv_id: assigned.recv_id,
                        send_node: assigned.send_node,
                        payload: assigned.payload,
                    }),
                );
            }
            // Otherwise the row stays buffered and reaches the node through
            // replay on its next child_ack.
        }

        self.emit_fork_effects();
        Ok(shutdown)
    }

    fn handle_frame(
        &mut self,
        conn: ConnId,
        msg: WireMessage,
        now: Instant,
    ) -> Result<(), MasterError> {
        match msg {
            WireMessage::Ping(ping) => {
                if !self.state.record_ping(ping.attempt_id, now) {
                    warn!(conn, attempt_id = ping.attempt_id, "ping from unknown attempt");
                }
            }
            WireMessage::ChildAck(ack) => {
                let attempt_id = ack.attempt_id;
                if let Some(node) = self.state.child_ack(attempt_id, ack.address, now) {
                    self.bindings.insert(node, conn);
                    let payload = self
                        .cfg
                        .initial_data
                        .get(&node)
                        .cloned()
                        .unwrap_or_default();
                    self.send_to_conn(conn, WireMessage::InitialData(InitialData { payload }));
                    let rows = self.state.replay_rows(node);
                    if !rows.is_empty() {
                        info!(node, attempt_id, count = rows.len(), "replaying history");
                    }
                    for row in rows {
                        self.send_to_conn(conn, WireMessage::MsgRecv(row));
                    }
                }
            }
            WireMessage::MsgSend(msg) => match self.state.intake(msg)? {
                Intake::Staged => {}
                Intake::Duplicate => debug!(conn, "duplicate msg_send dropped"),
                Intake::BadRecipient => warn!(conn, "msg_send to unknown node dropped"),
            },
            WireMessage::MsgRecv(_) | WireMessage::InitialData(_) => {
                warn!(conn, "unexpected master-bound message kind");
            }
        }
        Ok(())
    }

    /// Issue the fork effect for every attempt that needs one.  Marking the
    /// attempt requested and spawning happen in the same step.
    fn emit_fork_effects(&mut self) {
        for (attempt_id, node_id) in self.state.take_fork_candidates() {
            let host = Arc::clone(&self.host);
            let events = self.events_tx.clone();
            let req = SpawnRequest {
                attempt_id,
                node_id,
                master_url: self.master_url.clone(),
            };
            tokio::spawn(async move {
                let result = host.spawn(req).await;
                let _ = events.send(MasterEvent::ForkDone { attempt_id, result });
            });
        }
    }

    fn send_to_conn(&self, conn: ConnId, msg: WireMessage) {
        if let Some(outbound) = self.conns.get(&conn) {
            if outbound.send(msg).is_err() {
                debug!(conn, "outbound channel closed mid-step");
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("master shutting down");
        for pid in self.state.pids_to_terminate(&self.exited) {
            self.host.terminate(pid).await;
        }
        for node in 0..self.state.node_count() {
            let attempt_id = self.state.current_attempt_id(node);
            if let Some(rec) = self.state.attempt(attempt_id) {
                debug!(node, attempt_id, status = ?rec.status, "final attempt state");
            }
        }
    }
}
