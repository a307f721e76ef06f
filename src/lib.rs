//! AFT: an exactly-once, ordered message-delivery substrate for a fixed set
//! of worker nodes under a central deployment master.
//!
//! The workspace splits along the trust boundary:
//!
//! - [`protocol`] (`aft-protocol`) — the wire schema both endpoints share.
//! - `master` — the coordinator: spawns worker attempts, tracks liveness by
//!   heartbeat, assigns global delivery order, buffers every message, and
//!   replays full history to replacement attempts.
//! - `child` — the per-attempt agent: numbers outbound messages, delivers
//!   inbound ones to user code in strict gap-free order.
//!
//! This umbrella crate re-exports the schema and hosts the end-to-end test
//! suites under `tests/integration/`.

pub use aft_protocol as protocol;
