//! Child agent: the per-attempt endpoint of an AFT deployment.
//!
//! Connects to the master, heartbeats, numbers its outbound messages with a
//! local monotonic `send_id`, and hands inbound messages to user code in
//! strict gap-free `msg_id` order once the initial bulk data has arrived.
//!
//! Embedders use [`ChildAgent::connect`] and drive user code off the event
//! receiver; the bundled `aft-child` binary bridges stdin/stdout instead.

pub mod agent;
pub mod config;
pub mod uplink;

pub use agent::{ChildEvent, ChildState, Delivery, RoutingViolation};
pub use config::{ChildConfig, ConfigError};
pub use uplink::{ChildAgent, ChildError, SendHandle};
