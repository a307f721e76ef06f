//! Child-side fatal and gating behavior, driven by a scripted master.

use aft_protocol::{InitialData, MsgRecv, WireMessage};
use aft_test_utils::MockMaster;
use child::{ChildAgent, ChildConfig, ChildError, ChildEvent};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

async fn connect_agent(
    mock: &mut MockMaster,
    node_id: u64,
    attempt_id: u64,
) -> (
    tokio::task::JoinHandle<Result<(), ChildError>>,
    child::SendHandle,
    tokio::sync::mpsc::UnboundedReceiver<ChildEvent>,
    aft_test_utils::MockMasterConn,
) {
    let cfg = ChildConfig {
        master_url: mock.url(),
        node_id,
        attempt_id,
        ping_interval: Duration::from_millis(100),
    };
    let (agent, sender, events) = ChildAgent::connect(cfg).await.expect("agent connect");
    let run = tokio::spawn(agent.run());
    let mut conn = mock.accept().await;

    // The very first frame announces the attempt.
    match tokio::time::timeout(WAIT, conn.recv()).await.expect("ack") {
        Some(WireMessage::ChildAck(ack)) => assert_eq!(ack.attempt_id, attempt_id),
        other => panic!("expected child_ack first, got {other:?}"),
    }
    (run, sender, events, conn)
}

fn recv_frame(recv_id: u64, recv_node: u64, payload: &str) -> WireMessage {
    WireMessage::MsgRecv(MsgRecv {
        recv_node,
        recv_id,
        send_node: 0,
        payload: payload.to_owned(),
    })
}

#[tokio::test]
async fn misrouted_msg_recv_aborts_the_child() {
    let mut mock = MockMaster::start().await.expect("mock master");
    let (run, _sender, _events, conn) = connect_agent(&mut mock, 1, 1).await;

    conn.send(WireMessage::InitialData(InitialData {
        payload: String::new(),
    }));
    // Addressed to node 2, delivered to node 1's channel.
    conn.send(recv_frame(0, 2, "misrouted"));

    let result = tokio::time::timeout(WAIT, run)
        .await
        .expect("child should stop")
        .expect("task should not panic");
    match result {
        Err(ChildError::Routing(violation)) => {
            assert_eq!((violation.expected, violation.got), (1, 2));
        }
        other => panic!("expected a routing abort, got {other:?}"),
    }
}

#[tokio::test]
async fn nothing_reaches_user_code_before_initial_data() {
    let mut mock = MockMaster::start().await.expect("mock master");
    let (run, _sender, mut events, conn) = connect_agent(&mut mock, 1, 1).await;

    // Deliverable messages arrive first; the gate must hold them.
    conn.send(recv_frame(0, 1, "m0"));
    conn.send(recv_frame(1, 1, "m1"));
    assert!(
        tokio::time::timeout(QUIET, events.recv()).await.is_err(),
        "delivery leaked past the initial-data gate"
    );

    conn.send(WireMessage::InitialData(InitialData {
        payload: "edb".to_owned(),
    }));

    // Now everything flows, bootstrap payload first, messages in order.
    let first = tokio::time::timeout(WAIT, events.recv()).await.unwrap();
    assert_eq!(first, Some(ChildEvent::InitialData("edb".to_owned())));
    for expected in 0..2u64 {
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap();
        match event {
            Some(ChildEvent::Message(delivery)) => {
                assert_eq!(delivery.msg_id, expected);
                assert_eq!(delivery.payload, format!("m{expected}"));
            }
            other => panic!("expected an in-order delivery, got {other:?}"),
        }
    }

    run.abort();
}

#[tokio::test]
async fn agent_heartbeats_and_ships_user_sends() {
    let mut mock = MockMaster::start().await.expect("mock master");
    let (run, sender, _events, mut conn) = connect_agent(&mut mock, 0, 4).await;

    assert!(sender.send(1, "outbound"));

    let mut saw_ping = false;
    let mut shipped = None;
    let deadline = tokio::time::Instant::now() + WAIT;
    while (shipped.is_none() || !saw_ping) && tokio::time::Instant::now() < deadline {
        match conn.recv_timeout(WAIT).await {
            Some(WireMessage::Ping(ping)) => {
                assert_eq!(ping.attempt_id, 4);
                saw_ping = true;
            }
            Some(WireMessage::MsgSend(msg)) => shipped = Some(msg),
            other => panic!("unexpected frame from child: {other:?}"),
        }
    }
    let shipped = shipped.expect("child shipped the send");
    assert_eq!((shipped.send_node, shipped.send_id), (0, 0));
    assert_eq!((shipped.recv_node, shipped.payload.as_str()), (1, "outbound"));
    assert!(saw_ping, "child heartbeated");

    run.abort();
}
