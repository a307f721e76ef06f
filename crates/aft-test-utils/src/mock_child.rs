use aft_protocol::{AttemptId, ChildAck, Ping, WireMessage};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A raw wire-level child for integration testing: speaks `WireMessage`
/// frames with none of the agent's sequencing logic, so tests can hand-roll
/// duplicates, late acks and silence.
pub struct MockChild {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
    local_addr: String,
}

impl MockChild {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let local_addr = match ws_stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.local_addr()?.to_string(),
            _ => String::new(),
        };
        let (write, read) = ws_stream.split();
        Ok(Self {
            write,
            read,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub async fn send_message(
        &mut self,
        msg: &WireMessage,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(msg)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Announce this connection as the given attempt.
    pub async fn ack(&mut self, attempt_id: AttemptId) -> Result<(), Box<dyn std::error::Error>> {
        let addr = self.local_addr.clone();
        self.send_message(&WireMessage::ChildAck(ChildAck {
            attempt_id,
            address: addr,
        }))
        .await
    }

    pub async fn ping(&mut self, attempt_id: AttemptId) -> Result<(), Box<dyn std::error::Error>> {
        self.send_message(&WireMessage::Ping(Ping { attempt_id })).await
    }

    pub async fn recv_message(&mut self) -> Result<WireMessage, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let msg: WireMessage = serde_json::from_str(&text)?;
                    return Ok(msg);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by master".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Receive with a deadline; `Ok(None)` means nothing arrived in time.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<WireMessage>, Box<dyn std::error::Error>> {
        match tokio::time::timeout(timeout, self.recv_message()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
