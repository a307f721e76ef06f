//! Child-facing WebSocket listener.
//!
//! One connection per child attempt, dialed from the child.  Each accepted
//! connection gets a reader task (frames -> coordinator events) and a writer
//! task (outbound mpsc -> frames); the coordinator never touches a socket.

use aft_protocol::WireMessage;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use crate::coordinator::MasterEvent;

/// Identifies one accepted connection for the life of the process.
pub type ConnId = u64;

/// Accept loop: runs until the listener errors or the coordinator goes away.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    events: mpsc::UnboundedSender<MasterEvent>,
) {
    let mut next_conn_id: ConnId = 1;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let conn = next_conn_id;
                next_conn_id += 1;
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, conn, events).await {
                        debug!(conn, peer = %peer, error = %e, "connection ended with error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed; listener stopping");
                break;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    conn: ConnId,
    events: mpsc::UnboundedSender<MasterEvent>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let peer = stream.peer_addr().ok();
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();
    if events
        .send(MasterEvent::Accepted {
            conn,
            outbound: outbound_tx,
            peer: peer.map(|p| p.to_string()),
        })
        .is_err()
    {
        return Ok(());
    }

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!(conn, error = %e, "dropping unserializable frame");
                    continue;
                }
            };
            if write.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = write.send(Message::Close(None)).await;
    });

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<WireMessage>(&text) {
                Ok(msg) => {
                    if events.send(MasterEvent::Frame { conn, msg }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // A child speaking garbage cannot be trusted with the
                    // protocol; drop the connection and let liveness decide.
                    warn!(conn, error = %e, "undecodable frame; closing connection");
                    break;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn, error = %e, "read error");
                break;
            }
        }
    }

    writer.abort();
    let _ = events.send(MasterEvent::ConnClosed { conn });
    Ok(())
}
