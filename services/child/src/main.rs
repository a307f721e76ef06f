// aft-child: worker shell for one attempt of one logical node.
//
// Identity comes from the environment (set by the master's process host).
// stdin lines of the form `<recv_node> <payload>` become sends; every
// observed event is printed to stdout as one JSON line, so the shell can be
// scripted or just watched.

use child::{ChildAgent, ChildConfig, ChildEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = match ChildConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: bad child identity: {e}");
            std::process::exit(1);
        }
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        node_id = cfg.node_id,
        attempt_id = cfg.attempt_id,
        "child starting"
    );

    let (agent, sender, mut events) = match ChildAgent::connect(cfg).await {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("FATAL: cannot reach master: {e}");
            std::process::exit(1);
        }
    };

    // stdin bridge: `<recv_node> <payload>` per line.
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(' ') {
                Some((node, payload)) => match node.parse() {
                    Ok(recv_node) => {
                        if !sender.send(recv_node, payload.to_owned()) {
                            break;
                        }
                    }
                    Err(_) => warn!(line, "ignoring line with bad node id"),
                },
                None => warn!(line, "ignoring line without a payload"),
            }
        }
    });

    // stdout bridge: one JSON line per event.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let line = match event {
                ChildEvent::InitialData(payload) => serde_json::json!({
                    "event": "initial_data",
                    "payload": payload,
                }),
                ChildEvent::Message(delivery) => serde_json::json!({
                    "event": "message",
                    "send_node": delivery.send_node,
                    "msg_id": delivery.msg_id,
                    "payload": delivery.payload,
                }),
            };
            println!("{line}");
        }
    });

    if let Err(e) = agent.run().await {
        error!(error = %e, "child aborted");
        std::process::exit(1);
    }
}
