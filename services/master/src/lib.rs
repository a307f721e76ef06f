//! Master coordinator: the single global authority of an AFT deployment.
//!
//! Spawns child attempts through a [`spawn::ProcessHost`], tracks their
//! liveness by heartbeat, assigns global delivery order (`recv_id`s),
//! buffers every routed message forever, and replays a node's entire
//! receive history to each replacement attempt.
//!
//! Embedders call [`start`] with a config and a process host; the bundled
//! `aft-master` binary wires in the `tokio::process`-backed host and a TOML
//! config file.

pub mod config;
pub mod coordinator;
pub mod net;
pub mod spawn;
pub mod state;

pub use config::{ConfigError, MasterConfig, load_config, parse_config};
pub use coordinator::{MasterError, MasterHandle, start};
pub use spawn::{ChildPid, ChildProcessHost, ProcessHost, SpawnError, SpawnRequest};
