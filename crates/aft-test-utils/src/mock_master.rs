// mock_master: a scripted master endpoint for testing child agents.
//
// Binds to port 0 (random) and exposes the bound URL.  Each accepted
// connection surfaces as a MockMasterConn: the test decides what frames to
// send and inspects what the child sent, with no coordinator logic in
// between.

use aft_protocol::WireMessage;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

/// A scripted WebSocket master for integration testing.
pub struct MockMaster {
    addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<MockMasterConn>,
    /// Handle to the background accept loop; dropped with the server.
    _task: tokio::task::JoinHandle<()>,
}

/// One child connection as seen from the scripted master.
pub struct MockMasterConn {
    incoming: mpsc::UnboundedReceiver<WireMessage>,
    outgoing: mpsc::UnboundedSender<WireMessage>,
}

impl MockMaster {
    /// Start the mock master on a random port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (conns_tx, conns) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let (incoming_tx, incoming) = mpsc::unbounded_channel();
                        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
                        if conns_tx
                            .send(MockMasterConn { incoming, outgoing })
                            .is_err()
                        {
                            break;
                        }
                        tokio::spawn(async move {
                            let _ = Self::pump_connection(stream, incoming_tx, outgoing_rx).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            conns,
            _task: task,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Wait for the next child connection.
    pub async fn accept(&mut self) -> MockMasterConn {
        self.conns.recv().await.expect("accept loop ended")
    }

    async fn pump_connection(
        stream: tokio::net::TcpStream,
        incoming_tx: mpsc::UnboundedSender<WireMessage>,
        mut outgoing_rx: mpsc::UnboundedReceiver<WireMessage>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws.split();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let Ok(json) = serde_json::to_string(&msg) else {
                    continue;
                };
                if write.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = read.next().await {
            match frame? {
                Message::Text(text) => {
                    let msg: WireMessage = serde_json::from_str(&text)?;
                    if incoming_tx.send(msg).is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        writer.abort();
        Ok(())
    }
}

impl MockMasterConn {
    /// Push a frame to the connected child.
    pub fn send(&self, msg: WireMessage) {
        let _ = self.outgoing.send(msg);
    }

    /// Next frame the child sent, if the connection is still up.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.incoming.recv().await
    }

    /// Receive with a deadline; `None` means nothing arrived in time.
    pub async fn recv_timeout(&mut self, timeout: std::time::Duration) -> Option<WireMessage> {
        tokio::time::timeout(timeout, self.incoming.recv())
            .await
            .ok()
            .flatten()
    }
}
