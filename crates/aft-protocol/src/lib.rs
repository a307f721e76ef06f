// aft-protocol: Master <-> child wire protocol types and serialization.
//
// All channel messages use a top-level `kind` field for discriminated
// deserialization.  The enum variants map 1:1 to the wire message kinds;
// both endpoints consume this crate and nothing else is shared between them.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifier aliases
// ---------------------------------------------------------------------------

/// Dense logical node identifier, fixed at bootstrap: `0..node_count`.
pub type NodeId = u64;

/// Globally unique attempt identifier, monotonically issued by the master.
/// The initial attempt of node `n` has `attempt_id == n`.
pub type AttemptId = u64;

/// Per-sender-node monotonic message sequence, starting at 0.
pub type SendId = u64;

/// Per-receiver-node monotonic delivery sequence, starting at 0.  Assigned
/// by the master; determines the user-visible delivery order at the target.
pub type RecvId = u64;

// ---------------------------------------------------------------------------
// Protocol timing defaults
// ---------------------------------------------------------------------------

/// Default cadence of child heartbeats.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 3_000;

/// Default cadence of the master's liveness sweep.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 2_000;

/// Default silence threshold after which an attempt is presumed dead.
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 20_000;

// ---------------------------------------------------------------------------
// Child -> master messages
// ---------------------------------------------------------------------------

/// Heartbeat from a child attempt.
///
/// Sent on a periodic tick for the whole life of the attempt.  The master
/// stamps the receive time with its own clock, so child clock skew never
/// enters the liveness decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub attempt_id: AttemptId,
}

/// First message a child sends once it is addressable.
///
/// Moves the attempt from forked to live at the master and triggers the
/// initial-data broadcast plus full replay of the node's receive history.
/// An ack for an attempt the master no longer considers forked is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildAck {
    pub attempt_id: AttemptId,
    /// Transport address of the child end of the connection.  Recorded for
    /// observability; routing uses the connection the ack arrived on.
    pub address: String,
}

/// One numbered outbound message from a sending child.
///
/// `(send_node, send_id)` is the global dedup key: the master stores each
/// key exactly once and treats a redelivery with different `recv_node` or
/// `payload` as a fatal inconsistency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSend {
    pub send_node: NodeId,
    pub send_id: SendId,
    pub recv_node: NodeId,
    pub payload: String,
}

// ---------------------------------------------------------------------------
// Master -> child messages
// ---------------------------------------------------------------------------

/// One numbered message forwarded (or replayed) to a receiving child.
///
/// `recv_node` must equal the receiving child's own node id; anything else
/// indicates routing corruption and the child aborts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgRecv {
    pub recv_node: NodeId,
    pub recv_id: RecvId,
    pub send_node: NodeId,
    pub payload: String,
}

/// One-shot bulk bootstrap state for a freshly acked child.
///
/// Opaque to the protocol core.  A child delivers nothing to user code
/// until this has arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialData {
    pub payload: String,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All message kinds on the master <-> child channel.
///
/// Serializes/deserializes using the `kind` field as a tag.
///
/// ```json
/// { "kind": "msg_send", "send_node": 0, "send_id": 0, "recv_node": 1, "payload": "hello" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum WireMessage {
    Ping(Ping),
    ChildAck(ChildAck),
    MsgSend(MsgSend),
    MsgRecv(MsgRecv),
    InitialData(InitialData),
}
