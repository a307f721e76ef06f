//! Failover with full replay.
//!
//! A receiver dies mid-stream; the master times it out, spawns a successor
//! attempt, and replays the node's entire receive history.  The successor
//! must observe exactly the sequence the original would have seen, gap-free
//! from `msg_id` 0, including messages buffered while the node was down.

use aft_test_utils::TaskHost;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

async fn start_flaky(node_count: u64, host: TaskHost) -> master::MasterHandle {
    let mut cfg = master::MasterConfig::for_embedding(node_count);
    cfg.timing.ping_timeout = Duration::from_millis(400);
    cfg.timing.sweep_interval = Duration::from_millis(100);
    cfg.initial_data.insert(1, "bootstrap".to_owned());
    let (_exit_tx, exit_rx) = tokio::sync::mpsc::unbounded_channel();
    master::start(cfg, host, exit_rx).await.expect("master start")
}

#[tokio::test]
async fn successor_replays_the_full_history_in_order() {
    let host = TaskHost::new(Duration::from_millis(50));
    let handle = start_flaky(2, host.clone()).await;

    let sender = host.sender(0, WAIT).await.expect("node 0 came up");
    assert!(sender.send(1, "m0"));
    assert!(sender.send(1, "m1"));

    // The original attempt of node 1 sees the first two messages...
    let before = host.wait_for_deliveries(1, 2, WAIT).await;
    assert_eq!(before.len(), 2);
    let original_attempt = before[0].attempt_id;

    // ...then crashes.  A third message arrives while the node is down.
    host.kill_node(1);
    assert!(sender.send(1, "m2"));

    // Successor comes up, gets the replay, and continues past the crash.
    let deadline = tokio::time::Instant::now() + WAIT;
    let successor = loop {
        let successor: Vec<_> = host
            .deliveries_for(1)
            .into_iter()
            .filter(|rec| rec.attempt_id != original_attempt)
            .collect();
        if successor.len() >= 3 || tokio::time::Instant::now() >= deadline {
            break successor;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(successor.len(), 3, "successor saw {successor:?}");
    for (expected, rec) in successor.iter().enumerate() {
        assert_eq!(rec.msg_id, expected as u64);
        assert_eq!(rec.send_node, 0);
        assert_eq!(rec.payload, format!("m{expected}"));
    }

    // The bootstrap payload was re-broadcast to the successor.
    let initial = host.initial_data_seen(1);
    assert_eq!(initial.len(), 2);
    assert!(initial.iter().all(|(_, payload)| payload == "bootstrap"));

    handle.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn restarted_sender_replaying_its_sends_is_deduplicated() {
    let host = TaskHost::new(Duration::from_millis(50));
    let handle = start_flaky(2, host.clone()).await;

    let sender = host.sender(0, WAIT).await.expect("node 0 came up");
    assert!(sender.send(1, "before-crash"));
    host.wait_for_deliveries(1, 1, WAIT).await;

    // The *sender* dies.  Its successor re-runs deterministic user code, so
    // it regenerates send_id 0 with the identical message before producing
    // anything new; the master drops the replayed key and the receiver sees
    // each message exactly once.
    host.kill_node(0);
    let sender = host.sender(0, WAIT).await.expect("successor of node 0");
    assert!(sender.send(1, "before-crash"));
    assert!(sender.send(1, "after-crash"));

    let seen = host.wait_for_deliveries(1, 2, WAIT).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let seen_late = host.deliveries_for(1);
    assert_eq!(seen_late.len(), seen.len(), "no duplicate deliveries");
    let payloads: Vec<&str> = seen.iter().map(|rec| rec.payload.as_str()).collect();
    assert_eq!(payloads, vec!["before-crash", "after-crash"]);
    let ids: Vec<u64> = seen.iter().map(|rec| rec.msg_id).collect();
    assert_eq!(ids, vec![0, 1]);

    handle.shutdown().await.expect("clean shutdown");
}
