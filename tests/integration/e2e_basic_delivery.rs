//! End-to-end basic delivery.
//!
//! Two real child agents run in-process against a real master over loopback
//! WebSockets.  Covers first-message boundaries (`send_id 0`, `msg_id 0`,
//! nothing before the initial data) and parallel progress for distinct
//! recipients.

use aft_test_utils::TaskHost;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config(node_count: u64) -> master::MasterConfig {
    let mut cfg = master::MasterConfig::for_embedding(node_count);
    cfg.timing.sweep_interval = Duration::from_millis(100);
    cfg
}

async fn start(
    cfg: master::MasterConfig,
    host: TaskHost,
) -> master::MasterHandle {
    let (_exit_tx, exit_rx) = tokio::sync::mpsc::unbounded_channel();
    master::start(cfg, host, exit_rx).await.expect("master start")
}

#[tokio::test]
async fn first_message_arrives_with_ids_zero_after_initial_data() {
    let host = TaskHost::new(Duration::from_millis(100));
    let mut cfg = fast_config(2);
    cfg.initial_data.insert(1, "seed-one".to_owned());
    let handle = start(cfg, host.clone()).await;

    let sender = host.sender(0, WAIT).await.expect("node 0 came up");
    assert!(sender.send(1, "hello"));

    let seen = host.wait_for_deliveries(1, 1, WAIT).await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].send_node, 0);
    assert_eq!(seen[0].msg_id, 0);
    assert_eq!(seen[0].payload, "hello");

    // The bootstrap payload was installed before anything was delivered.
    let initial = host.initial_data_seen(1);
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].1, "seed-one");

    handle.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn distinct_recipients_each_start_at_msg_id_zero() {
    let host = TaskHost::new(Duration::from_millis(100));
    let handle = start(fast_config(3), host.clone()).await;

    let sender = host.sender(0, WAIT).await.expect("node 0 came up");
    assert!(sender.send_batch(vec![
        (1, "to-one".to_owned()),
        (2, "to-two".to_owned()),
    ]));

    let at_one = host.wait_for_deliveries(1, 1, WAIT).await;
    let at_two = host.wait_for_deliveries(2, 1, WAIT).await;
    assert_eq!(
        (at_one[0].msg_id, at_one[0].payload.as_str()),
        (0, "to-one")
    );
    assert_eq!(
        (at_two[0].msg_id, at_two[0].payload.as_str()),
        (0, "to-two")
    );

    handle.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn a_node_can_message_itself() {
    let host = TaskHost::new(Duration::from_millis(100));
    let handle = start(fast_config(1), host.clone()).await;

    let sender = host.sender(0, WAIT).await.expect("node 0 came up");
    assert!(sender.send(0, "note-to-self"));

    let seen = host.wait_for_deliveries(0, 1, WAIT).await;
    assert_eq!((seen[0].send_node, seen[0].msg_id), (0, 0));
    assert_eq!(seen[0].payload, "note-to-self");

    handle.shutdown().await.expect("clean shutdown");
}
