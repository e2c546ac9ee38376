//! Streaming channel over WebSocket (tokio-tungstenite).

use crate::connection::messages::WireMessage;
use crate::connection::{ChannelEvent, ConnectionChannel, ConnectionMode};
use crate::error::{CallError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Push-based channel: JSON text frames over a WebSocket.
#[derive(Debug)]
pub struct SocketChannel {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SocketChannel {
    /// Open a WebSocket to the voice service.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Network`] if the connection cannot be
    /// established.
    pub async fn connect(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| CallError::Config(format!("invalid socket url '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(CallError::Config(format!(
                "socket url '{url}' must use ws:// or wss://"
            )));
        }

        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| CallError::Network(format!("websocket connect: {e}")))?;
        debug!("websocket connected: {url}");
        Ok(Self { ws })
    }
}

#[async_trait]
impl ConnectionChannel for SocketChannel {
    fn mode(&self) -> ConnectionMode {
        ConnectionMode::Streaming
    }

    async fn deliver(&mut self, msg: &WireMessage) -> Result<()> {
        let json = msg.to_json()?;
        self.ws
            .send(Message::Text(json))
            .await
            .map_err(|e| CallError::Network(format!("websocket send: {e}")))
    }

    async fn next_event(&mut self) -> Result<Option<ChannelEvent>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => match WireMessage::parse(&text) {
                    Ok(msg) => return Ok(Some(ChannelEvent::Message(msg))),
                    Err(e) => {
                        // Malformed payloads never close the channel.
                        warn!("dropping malformed channel message: {e}");
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {
                    // Binary and ping/pong frames are transport noise here.
                }
                Some(Err(e)) => return Err(CallError::Network(format!("websocket read: {e}"))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_websocket_schemes() {
        let err = SocketChannel::connect("http://localhost:8787/voice-call")
            .await
            .expect_err("http scheme should be rejected");
        assert!(matches!(err, CallError::Config(_)));
    }

    #[tokio::test]
    async fn rejects_unparseable_urls() {
        let err = SocketChannel::connect("not a url")
            .await
            .expect_err("garbage should be rejected");
        assert!(matches!(err, CallError::Config(_)));
    }
}
