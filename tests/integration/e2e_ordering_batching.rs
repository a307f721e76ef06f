//! Ordering under same-step batching.
//!
//! Messages handed to the agent in one batch share an enqueue timestep, so
//! the shipment pick falls back to payload order and the receiver observes
//! payload-sorted `msg_id`s regardless of the order user code listed them.

use aft_test_utils::TaskHost;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

async fn start(node_count: u64, host: TaskHost) -> master::MasterHandle {
    let mut cfg = master::MasterConfig::for_embedding(node_count);
    cfg.timing.sweep_interval = Duration::from_millis(100);
    let (_exit_tx, exit_rx) = tokio::sync::mpsc::unbounded_channel();
    master::start(cfg, host, exit_rx).await.expect("master start")
}

#[tokio::test]
async fn same_batch_sends_arrive_in_payload_order() {
    let host = TaskHost::new(Duration::from_millis(100));
    let handle = start(2, host.clone()).await;

    let sender = host.sender(0, WAIT).await.expect("node 0 came up");
    // "B" listed first; the tie-break ships "A" first anyway.
    assert!(sender.send_batch(vec![(1, "B".to_owned()), (1, "A".to_owned())]));

    let seen = host.wait_for_deliveries(1, 2, WAIT).await;
    let observed: Vec<(u64, &str)> = seen
        .iter()
        .map(|rec| (rec.msg_id, rec.payload.as_str()))
        .collect();
    assert_eq!(observed, vec![(0, "A"), (1, "B")]);

    handle.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn buffered_backlog_drains_completely_and_in_order() {
    let host = TaskHost::new(Duration::from_millis(100));
    let handle = start(2, host.clone()).await;

    let sender = host.sender(0, WAIT).await.expect("node 0 came up");
    // One batch of ten: all share a timestep, so payload order decides.
    let batch: Vec<(u64, String)> = (0..10).map(|i| (1, format!("m{i:02}"))).collect();
    assert!(sender.send_batch(batch));

    let seen = host.wait_for_deliveries(1, 10, WAIT).await;
    assert_eq!(seen.len(), 10);
    for (expected, rec) in seen.iter().enumerate() {
        assert_eq!(rec.msg_id, expected as u64);
        assert_eq!(rec.payload, format!("m{expected:02}"));
    }

    handle.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn later_batches_never_overtake_earlier_ones() {
    let host = TaskHost::new(Duration::from_millis(100));
    let handle = start(2, host.clone()).await;

    let sender = host.sender(0, WAIT).await.expect("node 0 came up");
    // "z-first" enqueues in an earlier step than "a-second", so payload
    // order must not reorder them.
    assert!(sender.send(1, "z-first"));
    let first = host.wait_for_deliveries(1, 1, WAIT).await;
    assert_eq!(first[0].payload, "z-first");

    assert!(sender.send(1, "a-second"));
    let seen = host.wait_for_deliveries(1, 2, WAIT).await;
    let payloads: Vec<&str> = seen.iter().map(|rec| rec.payload.as_str()).collect();
    assert_eq!(payloads, vec!["z-first", "a-second"]);

    handle.shutdown().await.expect("clean shutdown");
}
