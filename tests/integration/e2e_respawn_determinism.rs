//! Deterministic successor ids for concurrent failures.
//!
//! When several attempts time out in the same sweep, new attempt ids are
//! handed out in one block, ordered by the dead attempts' ids.  The test
//! first staggers one failure so the three current attempts carry scrambled
//! ids, then silences all three at once.

use aft_test_utils::{MockChild, NullHost};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(10);

/// Heartbeat the given attempt until told to stop, then send one final ping
/// so every stopped attempt's deadline starts at (almost) the same instant.
fn spawn_pinger(
    mut client: MockChild,
    attempt_id: u64,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<MockChild> {
    tokio::spawn(async move {
        loop {
            if *stop.borrow() {
                break;
            }
            let _ = client.ping(attempt_id).await;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                _ = stop.changed() => {}
            }
        }
        let _ = client.ping(attempt_id).await;
        client
    })
}

#[tokio::test]
async fn concurrent_deaths_respawn_in_sorted_id_blocks() {
    let host = NullHost::new();
    let mut cfg = master::MasterConfig::for_embedding(3);
    cfg.timing.ping_timeout = Duration::from_millis(500);
    cfg.timing.sweep_interval = Duration::from_millis(250);
    let (_exit_tx, exit_rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = master::start(cfg, host.clone(), exit_rx)
        .await
        .expect("master start");
    let url = handle.master_url();
    host.wait_for_spawns(3, WAIT).await;

    // Bring the three initial attempts (ids 0, 1, 2) live.
    let mut clients = Vec::new();
    for attempt_id in 0..3u64 {
        let mut client = MockChild::connect(&url).await.expect("connect");
        client.ack(attempt_id).await.expect("ack");
        clients.push(client);
    }
    let node2 = clients.pop().expect("client 2");
    let node1 = clients.pop().expect("client 1");
    let node0 = clients.pop().expect("client 0");

    let (stop0_tx, stop0) = watch::channel(false);
    let (stop2_tx, stop2) = watch::channel(false);
    let pinger0 = spawn_pinger(node0, 0, stop0);
    let pinger2 = spawn_pinger(node2, 2, stop2);
    // Node 1's attempt never pings: it dies alone first, scrambling the
    // current attempt ids to {0, 2, 3}.
    drop(node1);

    let spawns = host.wait_for_spawns(4, WAIT).await;
    assert_eq!(spawns.len(), 4, "exactly one staggered respawn");
    assert_eq!(spawns[3].node_id, 1);
    assert_eq!(spawns[3].attempt_id, 3);

    // Bring node 1's successor live too, then silence all three together.
    let mut replacement = MockChild::connect(&url).await.expect("connect");
    replacement.ack(3).await.expect("ack");
    let (stop3_tx, stop3) = watch::channel(false);
    let pinger3 = spawn_pinger(replacement, 3, stop3);
    tokio::time::sleep(Duration::from_millis(200)).await;

    stop0_tx.send(true).expect("stop 0");
    stop2_tx.send(true).expect("stop 2");
    stop3_tx.send(true).expect("stop 3");
    let _ = pinger0.await;
    let _ = pinger2.await;
    let _ = pinger3.await;

    // Dead set {0, 2, 3} sorted by old id gets the block 4, 5, 6:
    // node 0 -> 4, node 2 -> 5, node 1 -> 6.
    let spawns = host.wait_for_spawns(7, WAIT).await;
    assert_eq!(spawns.len(), 7, "all three respawned");
    let block: HashSet<(u64, u64)> = spawns[4..]
        .iter()
        .map(|req| (req.attempt_id, req.node_id))
        .collect();
    let expected: HashSet<(u64, u64)> = [(4, 0), (5, 2), (6, 1)].into_iter().collect();
    assert_eq!(block, expected);

    handle.shutdown().await.expect("clean shutdown");
}
