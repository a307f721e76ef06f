//! Child uplink: the WebSocket session with the master and the event loop
//! that drives the protocol state machine.
//!
//! # Protocol
//! 1. Dial `master_url`
//! 2. Send `child_ack` with this attempt's id and the local socket address
//! 3. Heartbeat `ping` on the configured interval
//! 4. Per timestep: ship at most one `msg_send`, deliver at most one
//!    contiguous `msg_recv`; self-tick while backlog remains

use aft_protocol::{ChildAck, Ping, WireMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::agent::{ChildEvent, ChildState, RoutingViolation};
use crate::config::ChildConfig;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ChildError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("WS: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Routing(#[from] RoutingViolation),
    /// The master channel lives exactly as long as this attempt should;
    /// losing it means the attempt is done.
    #[error("master connection closed")]
    Disconnected,
}

// ---------------------------------------------------------------------------
// User-facing handle
// ---------------------------------------------------------------------------

/// Cheap cloneable sender for user code.  Batches enqueue atomically: every
/// message in one batch shares an enqueue timestep.
#[derive(Debug, Clone)]
pub struct SendHandle {
    tx: mpsc::UnboundedSender<Vec<(aft_protocol::NodeId, String)>>,
}

impl SendHandle {
    /// Enqueue one message.  Returns false once the agent is gone.
    pub fn send(&self, recv_node: aft_protocol::NodeId, payload: impl Into<String>) -> bool {
        self.send_batch(vec![(recv_node, payload.into())])
    }

    /// Enqueue several messages into a single timestep.
    pub fn send_batch(&self, batch: Vec<(aft_protocol::NodeId, String)>) -> bool {
        self.tx.send(batch).is_ok()
    }
}

// ---------------------------------------------------------------------------
// ChildAgent
// ---------------------------------------------------------------------------

/// A connected child attempt.  Created by [`ChildAgent::connect`]; consumed
/// by [`ChildAgent::run`], which drives the protocol until the connection
/// drops or a fatal violation surfaces.
pub struct ChildAgent {
    cfg: ChildConfig,
    ws: WsStream,
    state: ChildState,
    user_rx: mpsc::UnboundedReceiver<Vec<(aft_protocol::NodeId, String)>>,
    events_tx: mpsc::UnboundedSender<ChildEvent>,
}

impl ChildAgent {
    /// Dial the master and announce this attempt.  The `child_ack` goes out
    /// before this returns, so the master can start the replay immediately.
    pub async fn connect(
        cfg: ChildConfig,
    ) -> Result<(Self, SendHandle, mpsc::UnboundedReceiver<ChildEvent>), ChildError> {
        let (mut ws, _response) = tokio_tungstenite::connect_async(cfg.master_url.as_str())
            .await
            .map_err(|e| ChildError::Connect(e.to_string()))?;

        let address = match ws.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            _ => String::new(),
        };

        let ack = WireMessage::ChildAck(ChildAck {
            attempt_id: cfg.attempt_id,
            address,
        });
        ws.send(Message::Text(serde_json::to_string(&ack)?.into()))
            .await?;
        info!(
            attempt_id = cfg.attempt_id,
            node_id = cfg.node_id,
            "attempt announced to master"
        );

        let (user_tx, user_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = ChildState::new(cfg.node_id);
        let agent = ChildAgent {
            cfg,
            ws,
            state,
            user_rx,
            events_tx,
        };
        Ok((agent, SendHandle { tx: user_tx }, events_rx))
    }

    /// Drive the attempt until the channel drops or a fatal error surfaces.
    pub async fn run(self) -> Result<(), ChildError> {
        let ChildAgent {
            cfg,
            ws,
            mut state,
            mut user_rx,
            events_tx,
        } = self;
        let (mut write, mut read) = ws.split();

        let mut ping = tokio::time::interval(cfg.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let mut batches: Vec<Vec<(aft_protocol::NodeId, String)>> = Vec::new();
            let mut frames: Vec<WireMessage> = Vec::new();
            let mut ping_due = false;

            if state.has_backlog() {
                // Self-tick: poll for new input but never wait for it.
                tokio::select! {
                    biased;
                    _ = ping.tick() => ping_due = true,
                    Some(batch) = user_rx.recv() => batches.push(batch),
                    frame = read.next() => {
                        if let Some(msg) = decode_frame(frame)? {
                            frames.push(msg);
                        }
                    }
                    _ = std::future::ready(()) => {}
                }
            } else {
                tokio::select! {
                    _ = ping.tick() => ping_due = true,
                    Some(batch) = user_rx.recv() => batches.push(batch),
                    frame = read.next() => {
                        if let Some(msg) = decode_frame(frame)? {
                            frames.push(msg);
                        }
                    }
                }
            }
            while let Ok(batch) = user_rx.try_recv() {
                batches.push(batch);
            }

            // One timestep.
            state.begin_step();
            for batch in batches {
                state.enqueue(batch);
            }
            for frame in frames {
                match frame {
                    WireMessage::MsgRecv(msg) => state.accept(msg)?,
                    WireMessage::InitialData(data) => {
                        if state.set_initial_data() {
                            debug!(node_id = cfg.node_id, "initial data installed");
                            let _ = events_tx.send(ChildEvent::InitialData(data.payload));
                        }
                    }
                    other => warn!(?other, "unexpected child-bound message kind"),
                }
            }

            if ping_due {
                send_frame(
                    &mut write,
                    &WireMessage::Ping(Ping {
                        attempt_id: cfg.attempt_id,
                    }),
                )
                .await?;
            }
            if let Some(shipment) = state.take_shipment() {
                debug!(send_id = shipment.send_id, recv_node = shipment.recv_node, "shipping");
                send_frame(&mut write, &WireMessage::MsgSend(shipment)).await?;
            }
            if let Some(delivery) = state.take_delivery() {
                let _ = events_tx.send(ChildEvent::Message(delivery));
            }
            tokio::task::yield_now().await;
        }
    }
}

fn decode_frame(
    frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Result<Option<WireMessage>, ChildError> {
    match frame {
        Some(Ok(Message::Text(text))) => Ok(Some(serde_json::from_str(&text)?)),
        Some(Ok(Message::Close(_))) | None => Err(ChildError::Disconnected),
        Some(Ok(_)) => Ok(None),
        Some(Err(e)) => Err(e.into()),
    }
}

async fn send_frame(write: &mut WsSink, msg: &WireMessage) -> Result<(), ChildError> {
    let json = serde_json::to_string(msg)?;
    write.send(Message::Text(json.into())).await?;
    Ok(())
}
