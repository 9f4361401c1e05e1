//! Transport seam between the connection manager and the duplex channel.
//!
//! The production implementation is [`WebSocketTransport`]; tests plug in an
//! in-memory transport (see [`crate::testing::MemoryTransport`]).

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use opchannel_core::OutboundFrame;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::config::ChannelConfig;
use super::error::ChannelError;

/// One message as the transport sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

impl WireMessage {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// Picks the message type for an encoded frame: binary when it carries an
    /// attachment, text otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidRequest`] if a frame without attachment
    /// is not valid UTF-8.
    pub fn from_frame(frame: OutboundFrame) -> Result<Self, ChannelError> {
        if frame.binary {
            return Ok(Self::Binary(Bytes::from(frame.bytes)));
        }
        String::from_utf8(frame.bytes)
            .map(Self::Text)
            .map_err(|e| ChannelError::InvalidRequest(format!("text frame is not UTF-8: {e}")))
    }
}

/// Where to connect and which headers to send with the upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl Handshake {
    /// Builds the upgrade request: tenant header plus Basic auth when configured.
    #[must_use]
    pub fn from_config(config: &ChannelConfig) -> Self {
        let mut headers = vec![(config.tenant_header.clone(), config.tenant.clone())];
        if let Some(auth) = config.basic_auth_header() {
            headers.push(("Authorization".to_string(), auth));
        }
        Self {
            url: config.endpoint_url(),
            headers,
        }
    }
}

/// Opens duplex connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Performs the upgrade and returns the two halves of the connection.
    async fn open(&self, handshake: &Handshake) -> Result<TransportParts, ChannelError>;
}

/// Write half of an open connection.
#[async_trait]
pub trait TransportSender: Send {
    async fn send(&mut self, message: WireMessage) -> Result<(), ChannelError>;
    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// Read half of an open connection. `None` means the peer closed it.
#[async_trait]
pub trait TransportReceiver: Send {
    async fn recv(&mut self) -> Option<Result<WireMessage, ChannelError>>;
}

/// Both halves of a freshly opened connection.
pub struct TransportParts {
    pub sender: Box<dyn TransportSender>,
    pub receiver: Box<dyn TransportReceiver>,
}

impl std::fmt::Debug for TransportParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportParts").finish_non_exhaustive()
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, handshake: &Handshake) -> Result<TransportParts, ChannelError> {
        let mut request = handshake.url.as_str().into_client_request()?;
        for (name, value) in &handshake.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ChannelError::InvalidConfig(format!("header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ChannelError::InvalidConfig(format!("header {name}: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, response) = connect_async(request).await?;
        debug!(url = %handshake.url, status = %response.status(), "websocket upgrade complete");

        let (sink, stream) = stream.split();
        Ok(TransportParts {
            sender: Box::new(WebSocketSender { sink }),
            receiver: Box::new(WebSocketReceiver { stream }),
        })
    }
}

struct WebSocketSender {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSender for WebSocketSender {
    async fn send(&mut self, message: WireMessage) -> Result<(), ChannelError> {
        let message = match message {
            WireMessage::Text(text) => Message::text(text),
            WireMessage::Binary(bytes) => Message::binary(bytes),
        };
        self.sink.send(message).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.sink.close().await?;
        Ok(())
    }
}

struct WebSocketReceiver {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl TransportReceiver for WebSocketReceiver {
    async fn recv(&mut self) -> Option<Result<WireMessage, ChannelError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(WireMessage::Text(text.as_str().to_owned()))),
                Ok(Message::Binary(bytes)) => return Some(Ok(WireMessage::Binary(bytes))),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "peer sent close frame");
                    return None;
                }
                // Control frames are answered by tungstenite itself.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use opchannel_core::{encode, Credentials};
    use serde_json::Map;

    use super::*;

    #[test]
    fn frame_without_attachment_is_text() {
        let frame = encode("Restart", &Map::new(), None).unwrap();
        let message = WireMessage::from_frame(frame).unwrap();
        assert_eq!(message, WireMessage::Text("RestartRequest={}".into()));
        assert_eq!(message.as_bytes(), b"RestartRequest={}");
    }

    #[test]
    fn frame_with_attachment_is_binary() {
        let frame = encode("DeployApplication", &Map::new(), Some(&b"PK\x03\x04"[..])).unwrap();
        let message = WireMessage::from_frame(frame).unwrap();
        assert!(matches!(message, WireMessage::Binary(_)));
        assert!(message.as_bytes().ends_with(b"PK\x03\x04"));
    }

    #[test]
    fn handshake_carries_tenant_and_basic_auth() {
        let config = ChannelConfig {
            tenant: "acme".into(),
            tenant_header: "Tenant".into(),
            credentials: Credentials::basic("jdoe", "password"),
            ..ChannelConfig::default()
        };
        let handshake = Handshake::from_config(&config);

        assert_eq!(handshake.url, "ws://localhost:8080/command-gateway/ui/ws");
        assert_eq!(
            handshake.headers,
            vec![
                ("Tenant".to_string(), "acme".to_string()),
                ("Authorization".to_string(), "Basic amRvZTpwYXNzd29yZA==".to_string()),
            ]
        );
    }

    #[test]
    fn handshake_without_credentials_skips_authorization() {
        let handshake = Handshake::from_config(&ChannelConfig::default());
        assert!(handshake.headers.iter().all(|(name, _)| name != "Authorization"));
    }
}
