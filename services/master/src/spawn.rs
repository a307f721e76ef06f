//! Process host seam: how child attempts are actually launched and killed.
//!
//! The coordinator only ever asks for "a process for this attempt" and "kill
//! this pid"; everything OS-specific lives behind `ProcessHost`.  Exit
//! notifications flow back over a channel supplied at construction and feed
//! shutdown bookkeeping only — liveness is owned by the heartbeat timeout.

use aft_protocol::{AttemptId, NodeId};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{info, warn};

use crate::config::ChildLaunchConfig;

/// Host-level process identity.  For the bundled host this is the OS pid.
pub type ChildPid = u64;

/// Everything a host needs to launch one attempt.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub attempt_id: AttemptId,
    pub node_id: NodeId,
    /// WebSocket URL the child should dial, e.g. `ws://127.0.0.1:7400/`.
    pub master_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("spawn failed: {0}")]
    Io(String),
}

/// The host collaborator that owns child processes.
pub trait ProcessHost: Send + Sync + 'static {
    /// Launch a child bound to the requested identity.  Completion of this
    /// future is the fork effect completing.
    fn spawn(
        &self,
        req: SpawnRequest,
    ) -> impl Future<Output = Result<ChildPid, SpawnError>> + Send;

    /// Kill a previously spawned child.  Used only at shutdown.
    fn terminate(&self, pid: ChildPid) -> impl Future<Output = ()> + Send;
}

// ---------------------------------------------------------------------------
// ChildProcessHost: the real thing, on tokio::process
// ---------------------------------------------------------------------------

/// Launches the configured child executable, passing identity through
/// `AFT_MASTER_URL` / `AFT_NODE_ID` / `AFT_ATTEMPT_ID` plus the opaque
/// deployment env map from the config.
pub struct ChildProcessHost {
    launch: ChildLaunchConfig,
    exit_tx: mpsc::UnboundedSender<ChildPid>,
    /// Kill switches for the per-child wait tasks.
    kills: Arc<Mutex<HashMap<ChildPid, oneshot::Sender<()>>>>,
}

impl ChildProcessHost {
    pub fn new(launch: ChildLaunchConfig, exit_tx: mpsc::UnboundedSender<ChildPid>) -> Self {
        ChildProcessHost {
            launch,
            exit_tx,
            kills: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl ProcessHost for ChildProcessHost {
    async fn spawn(&self, req: SpawnRequest) -> Result<ChildPid, SpawnError> {
        let mut command = tokio::process::Command::new(&self.launch.command);
        command
            .args(&self.launch.args)
            .envs(&self.launch.env)
            .env("AFT_MASTER_URL", &req.master_url)
            .env("AFT_NODE_ID", req.node_id.to_string())
            .env("AFT_ATTEMPT_ID", req.attempt_id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| SpawnError::Io(e.to_string()))?;
        let pid = ChildPid::from(child.id().unwrap_or_default());
        info!(
            attempt_id = req.attempt_id,
            node_id = req.node_id,
            pid,
            "child process launched"
        );

        let (kill_tx, kill_rx) = oneshot::channel();
        self.kills.lock().await.insert(pid, kill_tx);

        let exit_tx = self.exit_tx.clone();
        let kills = Arc::clone(&self.kills);
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => info!(pid, %status, "child process exited"),
                        Err(e) => warn!(pid, error = %e, "child wait failed"),
                    }
                    let _ = exit_tx.send(pid);
                }
                _ = kill_rx => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    info!(pid, "child process terminated");
                }
            }
            kills.lock().await.remove(&pid);
        });

        Ok(pid)
    }

    async fn terminate(&self, pid: ChildPid) {
        if let Some(kill_tx) = self.kills.lock().await.remove(&pid) {
            let _ = kill_tx.send(());
        }
    }
}
