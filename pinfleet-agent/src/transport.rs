//! WebSocket transport for the provider link.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pinfleet_core::{FleetError, LinkChannel, LinkTransport, Result, WireMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub struct WsLinkTransport {
    url: String,
}

impl WsLinkTransport {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

#[async_trait]
impl LinkTransport for WsLinkTransport {
    async fn connect(&self, token: &str) -> Result<Box<dyn LinkChannel>> {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let url = format!("{}{}token={}", self.url, separator, token);

        let (stream, _response) = connect_async(&url)
            .await
            .map_err(|error| FleetError::Http(error.to_string()))?;

        Ok(Box::new(WsLinkChannel { stream }))
    }
}

struct WsLinkChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl LinkChannel for WsLinkChannel {
    async fn send(&mut self, message: WireMessage) -> Result<()> {
        let text = message.to_json()?;
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| FleetError::Http(error.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<WireMessage>> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(error)) => return Err(FleetError::Http(error.to_string())),
                Some(Ok(Message::Text(text))) => return WireMessage::parse(&text).map(Some),
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Transport-level ping/pong and other frames are not part
                // of the application protocol.
                Some(Ok(_)) => continue,
            }
        }
    }
}
