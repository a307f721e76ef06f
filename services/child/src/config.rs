//! Child bootstrap configuration.
//!
//! A child is spawned, not administered: its identity arrives through
//! environment variables set by the master's process host, never from a
//! config file.
//!
//! | Variable | Meaning |
//! |---|---|
//! | `AFT_MASTER_URL` | WebSocket URL of the master |
//! | `AFT_NODE_ID` | Logical node this attempt runs |
//! | `AFT_ATTEMPT_ID` | This attempt's globally unique id |
//! | `AFT_PING_INTERVAL_MS` | Optional heartbeat cadence override |

use aft_protocol::{AttemptId, DEFAULT_PING_INTERVAL_MS, NodeId};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ChildConfig {
    pub master_url: String,
    pub node_id: NodeId,
    pub attempt_id: AttemptId,
    pub ping_interval: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

impl ChildConfig {
    /// Read identity from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|var| std::env::var(var).ok())
    }

    /// Read identity from an arbitrary variable source.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let master_url =
            lookup("AFT_MASTER_URL").ok_or(ConfigError::Missing("AFT_MASTER_URL"))?;
        let node_id = required_u64(&lookup, "AFT_NODE_ID")?;
        let attempt_id = required_u64(&lookup, "AFT_ATTEMPT_ID")?;
        let ping_interval_ms = match lookup("AFT_PING_INTERVAL_MS") {
            None => DEFAULT_PING_INTERVAL_MS,
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var: "AFT_PING_INTERVAL_MS",
                value,
            })?,
        };
        Ok(ChildConfig {
            master_url,
            node_id,
            attempt_id,
            ping_interval: Duration::from_millis(ping_interval_ms),
        })
    }
}

fn required_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<u64, ConfigError> {
    let value = lookup(var).ok_or(ConfigError::Missing(var))?;
    value
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}
