//! The child-side protocol state machine, free of any I/O.
//!
//! The uplink drives this one timestep at a time.  Per step the agent ships
//! at most one outbound message and delivers at most one inbound message,
//! which makes both id assignments a pure function of the step inputs:
//!
//! - shipment pick: the buffered send with the smallest
//!   `(enqueued_step, payload, recv_node)` gets the next `send_id`, so the
//!   numbering does not depend on arrival order within a step;
//! - delivery: only the message whose `recv_id` continues the contiguous
//!   prefix, and only once the initial bulk data has been installed.

use aft_protocol::{MsgRecv, MsgSend, NodeId, RecvId, SendId};
use std::collections::BTreeMap;

/// One in-order message handed to user code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub send_node: NodeId,
    /// Strictly increasing from 0 with no gaps; equals the master-assigned
    /// `recv_id`.
    pub msg_id: RecvId,
    pub payload: String,
}

/// Everything user code can observe from an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    /// The one-shot bootstrap payload.  Always precedes every `Message`.
    InitialData(String),
    Message(Delivery),
}

/// A `msg_recv` addressed to some other node reached this one.  Fatal:
/// the channel cannot be trusted after routing corruption.
#[derive(Debug, Clone, thiserror::Error)]
#[error("msg_recv for node {got} arrived at node {expected} (recv_id {recv_id})")]
pub struct RoutingViolation {
    pub expected: NodeId,
    pub got: NodeId,
    pub recv_id: RecvId,
}

#[derive(Debug)]
struct PendingSend {
    recv_node: NodeId,
    payload: String,
    enqueued_step: u64,
}

#[derive(Debug)]
struct InboundRow {
    send_node: NodeId,
    payload: String,
}

#[derive(Debug)]
pub struct ChildState {
    node_id: NodeId,
    next_send_id: SendId,
    step: u64,
    outbound: Vec<PendingSend>,
    inbound: BTreeMap<RecvId, InboundRow>,
    /// The recv_id that would continue the delivered prefix.
    next_delivery: RecvId,
    got_initial_data: bool,
}

impl ChildState {
    pub fn new(node_id: NodeId) -> Self {
        ChildState {
            node_id,
            next_send_id: 0,
            step: 0,
            outbound: Vec::new(),
            inbound: BTreeMap::new(),
            next_delivery: 0,
            got_initial_data: false,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Open a new timestep.  Everything enqueued until the next call shares
    /// one enqueue stamp.
    pub fn begin_step(&mut self) {
        self.step += 1;
    }

    /// Enqueue a batch of user sends into the current step.
    pub fn enqueue(&mut self, batch: Vec<(NodeId, String)>) {
        for (recv_node, payload) in batch {
            self.outbound.push(PendingSend {
                recv_node,
                payload,
                enqueued_step: self.step,
            });
        }
    }

    /// Ship at most one buffered send: the minimum
    /// `(enqueued_step, payload, recv_node)` gets the next `send_id`.
    pub fn take_shipment(&mut self) -> Option<MsgSend> {
        let idx = self
            .outbound
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                (a.enqueued_step, &a.payload, a.recv_node)
                    .cmp(&(b.enqueued_step, &b.payload, b.recv_node))
            })
            .map(|(idx, _)| idx)?;
        let pending = self.outbound.remove(idx);
        let send_id = self.next_send_id;
        self.next_send_id += 1;
        Some(MsgSend {
            send_node: self.node_id,
            send_id,
            recv_node: pending.recv_node,
            payload: pending.payload,
        })
    }

    /// Buffer one inbound message.  Redundant redeliveries (already
    /// delivered or already buffered) are dropped silently; a message for a
    /// different node is a routing violation.
    pub fn accept(&mut self, msg: MsgRecv) -> Result<(), RoutingViolation> {
        if msg.recv_node != self.node_id {
            return Err(RoutingViolation {
                expected: self.node_id,
                got: msg.recv_node,
                recv_id: msg.recv_id,
            });
        }
        if msg.recv_id < self.next_delivery || self.inbound.contains_key(&msg.recv_id) {
            return Ok(());
        }
        self.inbound.insert(
            msg.recv_id,
            InboundRow {
                send_node: msg.send_node,
                payload: msg.payload,
            },
        );
        Ok(())
    }

    /// Install the bootstrap payload gate.  Returns false when it was
    /// already installed (replays of `initial_data` are idempotent).
    pub fn set_initial_data(&mut self) -> bool {
        if self.got_initial_data {
            return false;
        }
        self.got_initial_data = true;
        true
    }

    /// Deliver at most one message: the contiguous successor, gated on the
    /// bootstrap payload.
    pub fn take_delivery(&mut self) -> Option<Delivery> {
        if !self.got_initial_data {
            return None;
        }
        let row = self.inbound.remove(&self.next_delivery)?;
        let delivery = Delivery {
            send_node: row.send_node,
            msg_id: self.next_delivery,
            payload: row.payload,
        };
        self.next_delivery += 1;
        Some(delivery)
    }

    /// Whether another step would make progress without new input.
    pub fn has_backlog(&self) -> bool {
        !self.outbound.is_empty()
            || (self.got_initial_data && self.inbound.contains_key(&self.next_delivery))
    }
}
