// hosts: ProcessHost implementations for in-process integration tests.
//
// TaskHost runs the real child agent as a tokio task per "process" and
// records everything user code would observe, across attempts.  NullHost
// launches nothing and just records spawn requests, for tests that drive
// the wire protocol by hand with MockChild.

use aft_protocol::{AttemptId, NodeId, RecvId};
use child::{ChildAgent, ChildConfig, ChildEvent, SendHandle};
use master::{ChildPid, ProcessHost, SpawnError, SpawnRequest};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// One in-order delivery observed at some attempt of some node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub node_id: NodeId,
    pub attempt_id: AttemptId,
    pub send_node: NodeId,
    pub msg_id: RecvId,
    pub payload: String,
}

// ---------------------------------------------------------------------------
// TaskHost
// ---------------------------------------------------------------------------

/// Runs each spawned attempt as an in-process tokio task hosting the real
/// `ChildAgent`.  Killing a task is indistinguishable from a crashed worker:
/// the pings just stop.
#[derive(Clone)]
pub struct TaskHost {
    inner: Arc<TaskHostInner>,
}

struct TaskHostInner {
    ping_interval: Duration,
    next_pid: AtomicU64,
    tasks: Mutex<HashMap<ChildPid, tokio::task::JoinHandle<()>>>,
    node_pids: Mutex<HashMap<NodeId, ChildPid>>,
    senders: Mutex<HashMap<NodeId, SendHandle>>,
    deliveries: Mutex<Vec<DeliveryRecord>>,
    initial_data: Mutex<Vec<(NodeId, AttemptId, String)>>,
    terminated: Mutex<Vec<ChildPid>>,
}

impl TaskHost {
    pub fn new(ping_interval: Duration) -> Self {
        TaskHost {
            inner: Arc::new(TaskHostInner {
                ping_interval,
                next_pid: AtomicU64::new(1),
                tasks: Mutex::new(HashMap::new()),
                node_pids: Mutex::new(HashMap::new()),
                senders: Mutex::new(HashMap::new()),
                deliveries: Mutex::new(Vec::new()),
                initial_data: Mutex::new(Vec::new()),
                terminated: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Crash the node's current attempt: abort its task so heartbeats stop.
    pub fn kill_node(&self, node_id: NodeId) {
        let pid = self.inner.node_pids.lock().unwrap().get(&node_id).copied();
        if let Some(pid) = pid {
            if let Some(task) = self.inner.tasks.lock().unwrap().remove(&pid) {
                task.abort();
            }
        }
        self.inner.senders.lock().unwrap().remove(&node_id);
    }

    /// The node's current send handle, waiting for its attempt to come up.
    pub async fn sender(&self, node_id: NodeId, timeout: Duration) -> Option<SendHandle> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(handle) = self.inner.senders.lock().unwrap().get(&node_id).cloned() {
                return Some(handle);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Everything delivered at any attempt of the node so far.
    pub fn deliveries_for(&self, node_id: NodeId) -> Vec<DeliveryRecord> {
        self.inner
            .deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|rec| rec.node_id == node_id)
            .cloned()
            .collect()
    }

    /// Wait until the node has seen at least `count` deliveries.
    pub async fn wait_for_deliveries(
        &self,
        node_id: NodeId,
        count: usize,
        timeout: Duration,
    ) -> Vec<DeliveryRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let seen = self.deliveries_for(node_id);
            if seen.len() >= count {
                return seen;
            }
            if tokio::time::Instant::now() >= deadline {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Initial-data payloads observed per (node, attempt), in arrival order.
    pub fn initial_data_seen(&self, node_id: NodeId) -> Vec<(AttemptId, String)> {
        self.inner
            .initial_data
            .lock()
            .unwrap()
            .iter()
            .filter(|(node, _, _)| *node == node_id)
            .map(|(_, attempt, payload)| (*attempt, payload.clone()))
            .collect()
    }

    pub fn terminated(&self) -> Vec<ChildPid> {
        self.inner.terminated.lock().unwrap().clone()
    }
}

impl ProcessHost for TaskHost {
    async fn spawn(&self, req: SpawnRequest) -> Result<ChildPid, SpawnError> {
        let pid = self.inner.next_pid.fetch_add(1, Ordering::Relaxed);
        let node_id = req.node_id;
        let attempt_id = req.attempt_id;
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let cfg = ChildConfig {
                master_url: req.master_url,
                node_id,
                attempt_id,
                ping_interval: inner.ping_interval,
            };
            let connected = ChildAgent::connect(cfg).await;
            let (agent, handle, mut events) = match connected {
                Ok(parts) => parts,
                Err(e) => {
                    debug!(error = %e, "in-process child failed to connect");
                    return;
                }
            };
            inner.senders.lock().unwrap().insert(node_id, handle);

            let observer = Arc::clone(&inner);
            let events_task = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        ChildEvent::InitialData(payload) => observer
                            .initial_data
                            .lock()
                            .unwrap()
                            .push((node_id, attempt_id, payload)),
                        ChildEvent::Message(delivery) => {
                            observer.deliveries.lock().unwrap().push(DeliveryRecord {
                                node_id,
                                attempt_id,
                                send_node: delivery.send_node,
                                msg_id: delivery.msg_id,
                                payload: delivery.payload,
                            });
                        }
                    }
                }
            });

            if let Err(e) = agent.run().await {
                debug!(error = %e, "in-process child stopped");
            }
            events_task.abort();
        });

        self.inner.tasks.lock().unwrap().insert(pid, task);
        self.inner.node_pids.lock().unwrap().insert(node_id, pid);
        Ok(pid)
    }

    async fn terminate(&self, pid: ChildPid) {
        self.inner.terminated.lock().unwrap().push(pid);
        if let Some(task) = self.inner.tasks.lock().unwrap().remove(&pid) {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// NullHost
// ---------------------------------------------------------------------------

/// Launches nothing.  Tests that want raw wire control connect MockChild
/// clients themselves and use the recorded spawn requests to learn attempt
/// ids.
#[derive(Clone, Default)]
pub struct NullHost {
    inner: Arc<NullHostInner>,
}

#[derive(Default)]
struct NullHostInner {
    next_pid: AtomicU64,
    spawns: Mutex<Vec<(ChildPid, SpawnRequest)>>,
    terminated: Mutex<Vec<ChildPid>>,
}

impl NullHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_requests(&self) -> Vec<SpawnRequest> {
        self.inner
            .spawns
            .lock()
            .unwrap()
            .iter()
            .map(|(_, req)| req.clone())
            .collect()
    }

    /// The pid handed out for the given node's most recent spawn.
    pub fn pid_for_node(&self, node_id: NodeId) -> Option<ChildPid> {
        self.inner
            .spawns
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, req)| req.node_id == node_id)
            .map(|(pid, _)| *pid)
    }

    pub fn terminated(&self) -> Vec<ChildPid> {
        self.inner.terminated.lock().unwrap().clone()
    }

    /// Wait until at least `count` spawn requests have been issued.
    pub async fn wait_for_spawns(&self, count: usize, timeout: Duration) -> Vec<SpawnRequest> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let seen = self.spawn_requests();
            if seen.len() >= count {
                return seen;
            }
            if tokio::time::Instant::now() >= deadline {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl ProcessHost for NullHost {
    async fn spawn(&self, req: SpawnRequest) -> Result<ChildPid, SpawnError> {
        let pid = 9000 + self.inner.next_pid.fetch_add(1, Ordering::Relaxed);
        self.inner.spawns.lock().unwrap().push((pid, req));
        Ok(pid)
    }

    async fn terminate(&self, pid: ChildPid) {
        self.inner.terminated.lock().unwrap().push(pid);
    }
}
