//! Authoritative master state: attempt lifecycle, message buffer, counters.
//!
//! Everything here is synchronous and owned; the coordinator drives it one
//! timestep at a time and passes an explicit `now`, which keeps every
//! transition unit-testable without a clock.
//!
//! Two buffers hold messages.  `msg_buf` is the canonical append-only log,
//! keyed by `(send_node, send_id)`; once a row is inserted it is never
//! mutated or removed, and its `recv_id` is final.  `staging` holds intake
//! that has not been assigned a `recv_id` yet: per timestep, each distinct
//! recipient gets exactly one assignment — the staged row with the smallest
//! `(send_node, send_id)` — so assignment order is independent of arrival
//! order within a step.

use crate::spawn::ChildPid;
use aft_protocol::{AttemptId, MsgRecv, MsgSend, NodeId, RecvId, SendId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Attempt records
// ---------------------------------------------------------------------------

/// Lifecycle of one attempt.  `Dead` is terminal; a failed node gets a brand
/// new attempt rather than a resurrected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    /// Created, fork effect not yet completed.
    Init,
    /// Process launched, waiting for the child to ack.
    Fork,
    /// Acked and addressable; messages are forwarded directly.
    Live,
    /// Timed out or failed to launch.  Terminal.
    Dead,
}

#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt_id: AttemptId,
    pub node_id: NodeId,
    pub status: AttemptStatus,
    /// Present only once a `child_ack` has been received; cleared on death.
    pub address: Option<String>,
    /// Master-clock receive time of the latest ping (or the transition time
    /// before any ping has arrived).  Updated regardless of status.
    pub last_ping: Instant,
    pub pid: Option<ChildPid>,
    /// The fork effect is single-shot: set in the same step the spawn is
    /// issued so an attempt can never fork twice.
    fork_requested: bool,
}

impl AttemptRecord {
    fn new(attempt_id: AttemptId, node_id: NodeId, now: Instant) -> Self {
        AttemptRecord {
            attempt_id,
            node_id,
            status: AttemptStatus::Init,
            address: None,
            last_ping: now,
            pid: None,
            fork_requested: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Message rows
// ---------------------------------------------------------------------------

/// A canonical buffered message.  Lives forever.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub recv_node: NodeId,
    pub recv_id: RecvId,
    pub payload: String,
}

#[derive(Debug, Clone)]
struct StagedMessage {
    recv_node: NodeId,
    payload: String,
}

/// A row that received its `recv_id` this step and may need forwarding.
#[derive(Debug, Clone)]
pub struct AssignedMessage {
    pub send_node: NodeId,
    pub send_id: SendId,
    pub recv_node: NodeId,
    pub recv_id: RecvId,
    pub payload: String,
}

/// Outcome of one `msg_send` intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intake {
    /// New row, staged for recv_id assignment.
    Staged,
    /// Exact duplicate of a buffered or staged row; dropped.
    Duplicate,
    /// `recv_node` outside the configured node set; dropped.
    BadRecipient,
}

/// A duplicate `msg_send` whose fields disagree with the stored row.  Fatal.
#[derive(Debug, Clone, thiserror::Error)]
#[error("msg_send ({send_node}, {send_id}) disagrees with the buffered row")]
pub struct ReplayMismatch {
    pub send_node: NodeId,
    pub send_id: SendId,
}

/// One node's failover: the dead attempt and its freshly issued successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Respawn {
    pub node_id: NodeId,
    pub old_attempt_id: AttemptId,
    pub new_attempt_id: AttemptId,
}

// ---------------------------------------------------------------------------
// MasterState
// ---------------------------------------------------------------------------

pub struct MasterState {
    node_count: u64,
    attempts: HashMap<AttemptId, AttemptRecord>,
    /// The current attempt of each node, indexed by node id.
    node_status: Vec<AttemptId>,
    msg_buf: BTreeMap<(NodeId, SendId), StoredMessage>,
    staging: BTreeMap<(NodeId, SendId), StagedMessage>,
    next_recv_id: Vec<RecvId>,
    next_attempt_id: AttemptId,
    /// Attempts that died in the current step; drained by `take_respawns`.
    newly_dead: Vec<AttemptId>,
}

impl MasterState {
    /// Create the initial attempt set: node `n` gets attempt `n`, in `Init`.
    pub fn bootstrap(node_count: u64, now: Instant) -> Self {
        let mut attempts = HashMap::new();
        let mut node_status = Vec::with_capacity(node_count as usize);
        for node in 0..node_count {
            attempts.insert(node, AttemptRecord::new(node, node, now));
            node_status.push(node);
        }
        MasterState {
            node_count,
            attempts,
            node_status,
            msg_buf: BTreeMap::new(),
            staging: BTreeMap::new(),
            next_recv_id: vec![0; node_count as usize],
            next_attempt_id: node_count,
            newly_dead: Vec::new(),
        }
    }

    pub fn node_count(&self) -> u64 {
        self.node_count
    }

    pub fn attempt(&self, attempt_id: AttemptId) -> Option<&AttemptRecord> {
        self.attempts.get(&attempt_id)
    }

    pub fn current_attempt_id(&self, node: NodeId) -> AttemptId {
        self.node_status[node as usize]
    }

    /// The node's current attempt, if it is `Live`.
    pub fn live_attempt(&self, node: NodeId) -> Option<AttemptId> {
        let attempt_id = self.node_status[node as usize];
        self.attempts
            .get(&attempt_id)
            .filter(|rec| rec.status == AttemptStatus::Live)
            .map(|rec| rec.attempt_id)
    }

    // -----------------------------------------------------------------------
    // Spawning pipeline
    // -----------------------------------------------------------------------

    /// Attempts in `Init` that have not had their fork effect issued yet.
    /// Marks them requested in the same call, so each attempt produces
    /// exactly one fork effect.  Sorted by attempt id.
    pub fn take_fork_candidates(&mut self) -> Vec<(AttemptId, NodeId)> {
        let mut out: Vec<(AttemptId, NodeId)> = self
            .attempts
            .values_mut()
            .filter(|rec| rec.status == AttemptStatus::Init && !rec.fork_requested)
            .map(|rec| {
                rec.fork_requested = true;
                (rec.attempt_id, rec.node_id)
            })
            .collect();
        out.sort_unstable();
        out
    }

    /// Fork effect completed: `Init -> Fork`.  The liveness clock starts
    /// counting from here.
    pub fn fork_done(&mut self, attempt_id: AttemptId, pid: ChildPid, now: Instant) {
        if let Some(rec) = self.attempts.get_mut(&attempt_id) {
            if rec.status == AttemptStatus::Init {
                rec.status = AttemptStatus::Fork;
                rec.last_ping = now;
                rec.pid = Some(pid);
                info!(attempt_id, node_id = rec.node_id, pid, "attempt forked");
            } else {
                debug!(attempt_id, ?rec.status, "fork completion for non-init attempt ignored");
            }
        }
    }

    /// Fork effect failed: the attempt is marked dead and a successor will
    /// be issued through the ordinary respawn path.
    pub fn fork_failed(&mut self, attempt_id: AttemptId) {
        if let Some(rec) = self.attempts.get_mut(&attempt_id) {
            if rec.status == AttemptStatus::Init {
                rec.status = AttemptStatus::Dead;
                self.newly_dead.push(attempt_id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    /// Record a heartbeat.  The timestamp is taken regardless of status; a
    /// dead attempt's record moves but its status never does.  Returns false
    /// for an unknown attempt id.
    pub fn record_ping(&mut self, attempt_id: AttemptId, now: Instant) -> bool {
        match self.attempts.get_mut(&attempt_id) {
            Some(rec) => {
                rec.last_ping = now;
                true
            }
            None => false,
        }
    }

    /// Mark every `Fork`/`Live` attempt silent for longer than `timeout` as
    /// dead.  The dead set is drained by `take_respawns`.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) {
        for rec in self.attempts.values_mut() {
            if matches!(rec.status, AttemptStatus::Fork | AttemptStatus::Live)
                && now.duration_since(rec.last_ping) > timeout
            {
                rec.status = AttemptStatus::Dead;
                info!(
                    attempt_id = rec.attempt_id,
                    node_id = rec.node_id,
                    "attempt timed out"
                );
                self.newly_dead.push(rec.attempt_id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Respawn
    // -----------------------------------------------------------------------

    /// Issue successors for every attempt that died this step.  The dead set
    /// is sorted by old attempt id and the new ids are handed out in one
    /// block, so concurrent failures respawn deterministically.
    pub fn take_respawns(&mut self, now: Instant) -> Vec<Respawn> {
        if self.newly_dead.is_empty() {
            return Vec::new();
        }
        let mut dead = std::mem::take(&mut self.newly_dead);
        dead.sort_unstable();
        dead.dedup();

        let mut out = Vec::with_capacity(dead.len());
        for old_id in dead {
            let Some(old) = self.attempts.get_mut(&old_id) else {
                continue;
            };
            old.address = None;
            let node_id = old.node_id;

            let new_id = self.next_attempt_id;
            self.next_attempt_id += 1;
            self.attempts
                .insert(new_id, AttemptRecord::new(new_id, node_id, now));
            self.node_status[node_id as usize] = new_id;
            info!(
                node_id,
                old_attempt_id = old_id,
                new_attempt_id = new_id,
                "respawning node"
            );
            out.push(Respawn {
                node_id,
                old_attempt_id: old_id,
                new_attempt_id: new_id,
            });
        }
        out
    }

    // -----------------------------------------------------------------------
    // Move-to-live
    // -----------------------------------------------------------------------

    /// `child_ack` arrival.  Only an attempt still in `Fork` moves to
    /// `Live`; anything else (late ack from a superseded attempt, repeated
    /// ack) is ignored.  Returns the node id when the transition happened,
    /// which is the caller's cue to bind the connection and replay.
    pub fn child_ack(
        &mut self,
        attempt_id: AttemptId,
        address: String,
        now: Instant,
    ) -> Option<NodeId> {
        let rec = self.attempts.get_mut(&attempt_id)?;
        if rec.status != AttemptStatus::Fork {
            debug!(attempt_id, ?rec.status, "child_ack for non-forked attempt ignored");
            return None;
        }
        rec.status = AttemptStatus::Live;
        rec.address = Some(address);
        rec.last_ping = now;
        info!(attempt_id, node_id = rec.node_id, "attempt live");
        Some(rec.node_id)
    }

    // -----------------------------------------------------------------------
    // Intake and recv_id assignment
    // -----------------------------------------------------------------------

    /// Take one `msg_send`.  Duplicates of buffered or staged rows are
    /// dropped after verifying the fields agree; a disagreement is fatal for
    /// the whole master.
    pub fn intake(&mut self, msg: MsgSend) -> Result<Intake, ReplayMismatch> {
        if msg.recv_node >= self.node_count {
            return Ok(Intake::BadRecipient);
        }
        let key = (msg.send_node, msg.send_id);
        if let Some(stored) = self.msg_buf.get(&key) {
            if stored.recv_node != msg.recv_node || stored.payload != msg.payload {
                return Err(ReplayMismatch {
                    send_node: msg.send_node,
                    send_id: msg.send_id,
                });
            }
            return Ok(Intake::Duplicate);
        }
        if let Some(staged) = self.staging.get(&key) {
            if staged.recv_node != msg.recv_node || staged.payload != msg.payload {
                return Err(ReplayMismatch {
                    send_node: msg.send_node,
                    send_id: msg.send_id,
                });
            }
            return Ok(Intake::Duplicate);
        }
        self.staging.insert(
            key,
            StagedMessage {
                recv_node: msg.recv_node,
                payload: msg.payload,
            },
        );
        Ok(Intake::Staged)
    }

    /// Whether staged intake remains; the coordinator keeps stepping until
    /// this drains.
    pub fn has_staged(&self) -> bool {
        !self.staging.is_empty()
    }

    /// One assignment round: for each distinct recipient with staged rows,
    /// the row with the smallest `(send_node, send_id)` gets the next
    /// `recv_id` and moves into the canonical buffer.
    pub fn assign_recv_ids(&mut self) -> Vec<AssignedMessage> {
        let mut picked: Vec<(NodeId, SendId)> = Vec::new();
        let mut seen: HashSet<NodeId> = HashSet::new();
        for (&key, staged) in &self.staging {
            // Keys iterate in (send_node, send_id) order, so the first row
            // seen for a recipient is its argmin.
            if seen.insert(staged.recv_node) {
                picked.push(key);
            }
        }

        let mut out = Vec::with_capacity(picked.len());
        for key in picked {
            let Some(staged) = self.staging.remove(&key) else {
                continue;
            };
            let recv_id = self.next_recv_id[staged.recv_node as usize];
            self.next_recv_id[staged.recv_node as usize] += 1;
            self.msg_buf.insert(
                key,
                StoredMessage {
                    recv_node: staged.recv_node,
                    recv_id,
                    payload: staged.payload.clone(),
                },
            );
            out.push(AssignedMessage {
                send_node: key.0,
                send_id: key.1,
                recv_node: staged.recv_node,
                recv_id,
                payload: staged.payload,
            });
        }
        out
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    /// The node's entire receive history, in delivery order.
    pub fn replay_rows(&self, node: NodeId) -> Vec<MsgRecv> {
        let mut rows: Vec<MsgRecv> = self
            .msg_buf
            .iter()
            .filter(|(_, stored)| stored.recv_node == node)
            .map(|(&(send_node, _), stored)| MsgRecv {
                recv_node: node,
                recv_id: stored.recv_id,
                send_node,
                payload: stored.payload.clone(),
            })
            .collect();
        rows.sort_unstable_by_key(|row| row.recv_id);
        rows
    }

    // -----------------------------------------------------------------------
    // Shutdown bookkeeping
    // -----------------------------------------------------------------------

    /// Pids of every spawned child except those the host has already
    /// reported exited.
    pub fn pids_to_terminate(&self, exited: &HashSet<ChildPid>) -> Vec<ChildPid> {
        let mut pids: Vec<ChildPid> = self
            .attempts
            .values()
            .filter_map(|rec| rec.pid)
            .filter(|pid| !exited.contains(pid))
            .collect();
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    // -----------------------------------------------------------------------
    // Introspection (used by tests and the coordinator's trace output)
    // -----------------------------------------------------------------------

    pub fn buffered_rows(&self, node: NodeId) -> usize {
        self.msg_buf
            .values()
            .filter(|stored| stored.recv_node == node)
            .count()
    }

    pub fn next_recv_id(&self, node: NodeId) -> RecvId {
        self.next_recv_id[node as usize]
    }

    pub fn next_attempt_id(&self) -> AttemptId {
        self.next_attempt_id
    }
}
