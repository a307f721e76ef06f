//! Shutdown bookkeeping: every spawned child is terminated except those the
//! host already reported exited.  Exit signals feed nothing but this.

use aft_test_utils::{MockChild, NullHost};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn shutdown_terminates_survivors_and_skips_reported_exits() {
    let host = NullHost::new();
    let mut cfg = master::MasterConfig::for_embedding(2);
    cfg.timing.sweep_interval = Duration::from_millis(100);
    let (exit_tx, exit_rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = master::start(cfg, host.clone(), exit_rx)
        .await
        .expect("master start");

    host.wait_for_spawns(2, WAIT).await;
    let pid0 = host.pid_for_node(0).expect("node 0 pid");
    let pid1 = host.pid_for_node(1).expect("node 1 pid");

    // The host reports node 1's process gone (crash noticed by the OS).
    exit_tx.send(pid1).expect("report exit");
    tokio::time::sleep(Duration::from_millis(100)).await;

    handle.shutdown().await.expect("clean shutdown");
    assert_eq!(host.terminated(), vec![pid0]);
}

#[tokio::test]
async fn exit_signals_do_not_drive_liveness() {
    let host = NullHost::new();
    let mut cfg = master::MasterConfig::for_embedding(1);
    cfg.timing.sweep_interval = Duration::from_millis(100);
    let (exit_tx, exit_rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = master::start(cfg, host.clone(), exit_rx)
        .await
        .expect("master start");

    host.wait_for_spawns(1, WAIT).await;
    let pid0 = host.pid_for_node(0).expect("node 0 pid");
    let url = handle.master_url();

    let mut client = MockChild::connect(&url).await.expect("connect");
    client.ack(0).await.expect("ack");

    // An exit report for a live, still-pinging attempt must not respawn it:
    // death is decided by heartbeat silence alone.
    exit_tx.send(pid0).expect("report exit");
    for _ in 0..5 {
        client.ping(0).await.expect("ping");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let spawns = host.spawn_requests();
    assert_eq!(spawns.len(), 1, "no respawn was issued: {spawns:?}");

    handle.shutdown().await.expect("clean shutdown");
}
