//! Master configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/aft/master.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `node_count` (at least 1)
//!
//! The `[child]` section configures how worker processes are launched and is
//! required only when running the bundled binary; embedders supplying their
//! own process host may omit it.  `[child.env]` is an opaque map handed to
//! every spawned child as extra environment variables.

use aft_protocol::{
    DEFAULT_PING_TIMEOUT_MS, DEFAULT_SWEEP_INTERVAL_MS, NodeId,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/aft/master.toml";

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level master configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub schema_version: u32,
    /// Number of logical nodes, fixed for the life of the deployment.
    pub node_count: u64,
    /// Listen address for child connections, e.g. `127.0.0.1:0`.
    pub bind: String,
    pub timing: TimingConfig,
    /// Child process launch settings; `None` when an embedder provides its
    /// own process host.
    pub child: Option<ChildLaunchConfig>,
    /// Optional per-node bootstrap payload, broadcast to every fresh attempt
    /// before normal delivery begins.  Nodes without an entry get an empty
    /// payload.
    pub initial_data: HashMap<NodeId, String>,
}

#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// An attempt with no ping for longer than this is presumed dead.
    pub ping_timeout: Duration,
    /// Cadence of the liveness sweep.
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ChildLaunchConfig {
    /// Path to the child executable.
    pub command: String,
    pub args: Vec<String>,
    /// Opaque deployment options, passed verbatim as environment variables.
    pub env: HashMap<String, String>,
}

impl MasterConfig {
    /// A minimal config for embedders and tests: given node count, ephemeral
    /// bind port, default timing, no child launcher, no initial data.
    pub fn for_embedding(node_count: u64) -> Self {
        MasterConfig {
            schema_version: 1,
            node_count,
            bind: "127.0.0.1:0".to_owned(),
            timing: TimingConfig {
                ping_timeout: Duration::from_millis(DEFAULT_PING_TIMEOUT_MS),
                sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            },
            child: None,
            initial_data: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    node_count: Option<u64>,
    bind: Option<String>,
    timing: Option<RawTimingConfig>,
    child: Option<RawChildConfig>,
    initial_data: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct RawTimingConfig {
    ping_timeout_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawChildConfig {
    command: Option<String>,
    args: Option<Vec<String>>,
    env: Option<HashMap<String, String>>,
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Load and validate the config at `path`.
pub fn load_config(path: &Path) -> Result<MasterConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&text)
}

/// Parse and validate config from TOML text.
pub fn parse_config(text: &str) -> Result<MasterConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(text)?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::Invalid("schema_version is required".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::Invalid(format!(
            "unsupported schema_version {schema_version} (expected 1)"
        )));
    }

    let node_count = raw
        .node_count
        .ok_or_else(|| ConfigError::Invalid("node_count is required".to_owned()))?;
    if node_count == 0 {
        return Err(ConfigError::Invalid(
            "node_count must be at least 1".to_owned(),
        ));
    }

    let timing = raw.timing.unwrap_or(RawTimingConfig {
        ping_timeout_ms: None,
        sweep_interval_ms: None,
    });
    let ping_timeout =
        Duration::from_millis(timing.ping_timeout_ms.unwrap_or(DEFAULT_PING_TIMEOUT_MS));
    let sweep_interval = Duration::from_millis(
        timing
            .sweep_interval_ms
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_MS),
    );
    if ping_timeout.is_zero() || sweep_interval.is_zero() {
        return Err(ConfigError::Invalid(
            "timing intervals must be non-zero".to_owned(),
        ));
    }

    let child = match raw.child {
        None => None,
        Some(c) => Some(ChildLaunchConfig {
            command: c
                .command
                .ok_or_else(|| ConfigError::Invalid("child.command is required".to_owned()))?,
            args: c.args.unwrap_or_default(),
            env: c.env.unwrap_or_default(),
        }),
    };

    let mut initial_data = HashMap::new();
    for (key, payload) in raw.initial_data.unwrap_or_default() {
        let node: NodeId = key.parse().map_err(|_| {
            ConfigError::Invalid(format!("initial_data key {key:?} is not a node id"))
        })?;
        if node >= node_count {
            return Err(ConfigError::Invalid(format!(
                "initial_data key {node} is outside 0..{node_count}"
            )));
        }
        initial_data.insert(node, payload);
    }

    Ok(MasterConfig {
        schema_version,
        node_count,
        bind: raw.bind.unwrap_or_else(|| "127.0.0.1:7400".to_owned()),
        timing: TimingConfig {
            ping_timeout,
            sweep_interval,
        },
        child,
        initial_data,
    })
}
