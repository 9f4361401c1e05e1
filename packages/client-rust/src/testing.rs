//! Test doubles for the operation channel.
//!
//! [`MemoryTransport`] replaces the WebSocket with in-process channels and
//! counts handshakes and writes. [`TestServer`] is a real WebSocket endpoint
//! on a loopback port that speaks the frame protocol through a pluggable
//! responder.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use opchannel_core::payload::{OPERATION_NAME_FIELD, STATUS_FIELD, STATUS_OK};
use opchannel_core::{decode, InboundFrame, REQUEST_SUFFIX, RESPONSE_SUFFIX};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::channel::{
    ChannelConfig, ChannelError, Handshake, Transport, TransportParts, TransportReceiver, TransportSender,
    WireMessage,
};

/// Produces the raw frames sent back for one decoded request.
pub type Responder = Arc<dyn Fn(&InboundFrame) -> Vec<Vec<u8>> + Send + Sync>;

/// Builds the session message sent right after the upgrade.
#[must_use]
pub fn welcome_frame(session_id: u64) -> String {
    format!(r#"WelcomeResponse={{"sessionId":"session-{session_id}"}}"#)
}

/// Answers every `{Name}Request` with an OK `{Name}Response` that echoes
/// `resourcePath` and `operationName`.
#[must_use]
pub fn echo_ok(frame: &InboundFrame) -> Vec<Vec<u8>> {
    let Some(operation) = frame.name.strip_suffix(REQUEST_SUFFIX) else {
        return Vec::new();
    };
    let mut reply = Map::new();
    for field in ["resourcePath", OPERATION_NAME_FIELD] {
        if let Some(value) = frame.payload.get(field) {
            reply.insert(field.to_string(), value.clone());
        }
    }
    reply.insert(STATUS_FIELD.to_string(), json!(STATUS_OK));
    reply.insert("message".to_string(), json!(format!("{operation} done")));
    vec![response_frame(operation, &reply)]
}

/// Encodes `{operation}Response=<payload>`.
#[must_use]
pub fn response_frame(operation: &str, payload: &Map<String, Value>) -> Vec<u8> {
    format!("{operation}{RESPONSE_SUFFIX}={}", Value::Object(payload.clone())).into_bytes()
}

fn raw_to_wire(raw: Vec<u8>) -> WireMessage {
    match String::from_utf8(raw) {
        Ok(text) => WireMessage::Text(text),
        Err(e) => WireMessage::Binary(Bytes::from(e.into_bytes())),
    }
}

type Inbound = Option<Result<WireMessage, ChannelError>>;

#[derive(Default)]
struct MemoryState {
    handshakes: AtomicU64,
    failures_left: AtomicU64,
    fail_writes: AtomicBool,
    writes: Mutex<Vec<WireMessage>>,
    last_handshake: Mutex<Option<Handshake>>,
    peer: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
}

/// In-process transport for unit tests.
///
/// Clones share state, so a test keeps one clone for inspection and hands
/// another to the channel.
#[derive(Clone)]
pub struct MemoryTransport {
    handshake_delay: Duration,
    session_message: bool,
    responder: Option<Responder>,
    state: Arc<MemoryState>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("handshakes", &self.handshakes())
            .field("writes", &self.write_count())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// A transport that opens instantly, sends a session message and never
    /// answers requests.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handshake_delay: Duration::ZERO,
            session_message: true,
            responder: None,
            state: Arc::new(MemoryState::default()),
        }
    }

    #[must_use]
    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    /// Opens without ever sending the session message.
    #[must_use]
    pub fn without_session_message(mut self) -> Self {
        self.session_message = false;
        self
    }

    /// Rejects the next `count` handshakes with a transport error.
    #[must_use]
    pub fn failing_handshakes(self, count: u64) -> Self {
        self.state.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Answers every written request through `responder`.
    #[must_use]
    pub fn with_responder(
        mut self,
        responder: impl Fn(&InboundFrame) -> Vec<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Arc::new(responder));
        self
    }

    #[must_use]
    pub fn handshakes(&self) -> u64 {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn write_count(&self) -> usize {
        self.state.writes.lock().len()
    }

    #[must_use]
    pub fn writes(&self) -> Vec<WireMessage> {
        self.state.writes.lock().clone()
    }

    #[must_use]
    pub fn last_handshake(&self) -> Option<Handshake> {
        self.state.last_handshake.lock().clone()
    }

    /// Makes subsequent writes fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delivers a raw frame on the current connection. Returns `false` if no
    /// connection is open.
    pub fn push_inbound(&self, raw: impl Into<Vec<u8>>) -> bool {
        let peer = self.state.peer.lock();
        peer.as_ref()
            .is_some_and(|tx| tx.send(Some(Ok(raw_to_wire(raw.into())))).is_ok())
    }

    /// Simulates the peer closing the current connection.
    pub fn disconnect(&self) {
        if let Some(tx) = self.state.peer.lock().take() {
            let _ = tx.send(None);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, handshake: &Handshake) -> Result<TransportParts, ChannelError> {
        let session_id = self.state.handshakes.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.last_handshake.lock() = Some(handshake.clone());

        if !self.handshake_delay.is_zero() {
            tokio::time::sleep(self.handshake_delay).await;
        }
        let refused = self
            .state
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ChannelError::Transport("connection refused".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if self.session_message {
            let _ = tx.send(Some(Ok(WireMessage::Text(welcome_frame(session_id)))));
        }
        *self.state.peer.lock() = Some(tx.clone());

        Ok(TransportParts {
            sender: Box::new(MemorySender {
                state: Arc::clone(&self.state),
                responder: self.responder.clone(),
                peer: tx,
            }),
            receiver: Box::new(MemoryReceiver { rx }),
        })
    }
}

struct MemorySender {
    state: Arc<MemoryState>,
    responder: Option<Responder>,
    peer: mpsc::UnboundedSender<Inbound>,
}

#[async_trait]
impl TransportSender for MemorySender {
    async fn send(&mut self, message: WireMessage) -> Result<(), ChannelError> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(ChannelError::Transport("broken pipe".into()));
        }
        let reply = self
            .responder
            .as_ref()
            .and_then(|responder| decode(message.as_bytes()).ok().map(|frame| responder(&frame)));
        self.state.writes.lock().push(message);

        for raw in reply.into_iter().flatten() {
            let _ = self.peer.send(Some(Ok(raw_to_wire(raw))));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        let _ = self.peer.send(None);
        Ok(())
    }
}

struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl TransportReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Option<Result<WireMessage, ChannelError>> {
        self.rx.recv().await.flatten()
    }
}

/// Headers and path of one accepted upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordedHandshake {
    pub path: String,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
}

impl RecordedHandshake {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Loopback WebSocket server speaking the frame protocol.
#[derive(Debug)]
pub struct TestServer {
    addr: SocketAddr,
    handshakes: Arc<Mutex<Vec<RecordedHandshake>>>,
    frames: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Binds `127.0.0.1:0` and answers requests through `responder`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the listener cannot be bound.
    pub async fn start(
        responder: impl Fn(&InboundFrame) -> Vec<Vec<u8>> + Send + Sync + 'static,
    ) -> std::io::Result<Self> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], 0)), responder).await
    }

    /// Starts a server that answers every request with [`echo_ok`].
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the listener cannot be bound.
    pub async fn echo_ok() -> std::io::Result<Self> {
        Self::start(echo_ok).await
    }

    /// Binds `addr` and serves connections until [`TestServer::shutdown`].
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the listener cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        responder: impl Fn(&InboundFrame) -> Vec<Vec<u8>> + Send + Sync + 'static,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let handshakes = Arc::new(Mutex::new(Vec::new()));
        let frames = Arc::new(AtomicUsize::new(0));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::new(responder),
            Arc::clone(&handshakes),
            Arc::clone(&frames),
            shutdown_rx,
        ));
        info!(%addr, "test server listening");

        Ok(Self {
            addr,
            handshakes,
            frames,
            shutdown,
            task,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Channel configuration pointing at this server.
    #[must_use]
    pub fn config(&self) -> ChannelConfig {
        ChannelConfig {
            host: self.addr.to_string(),
            ..ChannelConfig::default()
        }
    }

    /// Every upgrade request accepted so far, in order.
    #[must_use]
    pub fn handshakes(&self) -> Vec<RecordedHandshake> {
        self.handshakes.lock().clone()
    }

    /// Number of request frames received across all connections.
    #[must_use]
    pub fn frames_received(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    /// Stops accepting and drops every open connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    responder: Responder,
    handshakes: Arc<Mutex<Vec<RecordedHandshake>>>,
    frames: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = 0_u64;
    let mut connections = Vec::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    sessions += 1;
                    connections.push(tokio::spawn(serve_connection(
                        stream,
                        peer,
                        sessions,
                        Arc::clone(&responder),
                        Arc::clone(&handshakes),
                        Arc::clone(&frames),
                    )));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
    for connection in connections {
        connection.abort();
    }
    debug!("test server stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    session_id: u64,
    responder: Responder,
    handshakes: Arc<Mutex<Vec<RecordedHandshake>>>,
    frames: Arc<AtomicUsize>,
) {
    let record = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let headers = request
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        handshakes.lock().push(RecordedHandshake {
            path: request.uri().path().to_string(),
            headers,
        });
        Ok(response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, record).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "upgrade failed");
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    if let Err(e) = sink.send(Message::text(welcome_frame(session_id))).await {
        warn!(%peer, error = %e, "failed to send session message");
        return;
    }

    while let Some(message) = stream.next().await {
        let raw: Vec<u8> = match message {
            Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
            Ok(Message::Binary(bytes)) => bytes.to_vec(),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        frames.fetch_add(1, Ordering::SeqCst);

        let frame = match decode(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%peer, error = %e, "test server dropping undecodable frame");
                continue;
            }
        };
        for reply in responder(&frame) {
            let message = match raw_to_wire(reply) {
                WireMessage::Text(text) => Message::text(text),
                WireMessage::Binary(bytes) => Message::binary(bytes),
            };
            if sink.send(message).await.is_err() {
                return;
            }
        }
    }
    debug!(%peer, "test server connection ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_ok_mirrors_correlation_fields() {
        let frame = decode(br#"RestartRequest={"resourcePath":"/p","operationName":"Restart"}"#).unwrap();
        let replies = echo_ok(&frame);
        assert_eq!(replies.len(), 1);

        let reply = decode(&replies[0]).unwrap();
        assert_eq!(reply.name, "RestartResponse");
        assert_eq!(reply.str_field("resourcePath"), Some("/p"));
        assert_eq!(reply.str_field("operationName"), Some("Restart"));
        assert_eq!(reply.str_field("status"), Some("OK"));
    }

    #[test]
    fn echo_ok_ignores_non_requests() {
        let frame = decode(br#"RestartResponse={"resourcePath":"/p"}"#).unwrap();
        assert!(echo_ok(&frame).is_empty());
    }

    #[test]
    fn recorded_header_lookup_is_case_insensitive() {
        let mut recorded = RecordedHandshake::default();
        recorded.headers.insert("tenant".into(), "acme".into());
        assert_eq!(recorded.header("Tenant"), Some("acme"));
        assert_eq!(recorded.header("Authorization"), None);
    }

    #[tokio::test]
    async fn memory_transport_replays_responder_output() {
        let transport = MemoryTransport::new().with_responder(echo_ok);
        let mut parts = transport
            .open(&Handshake::from_config(&ChannelConfig::default()))
            .await
            .unwrap();

        let welcome = parts.receiver.recv().await.unwrap().unwrap();
        assert!(welcome.as_bytes().starts_with(b"WelcomeResponse="));

        parts
            .sender
            .send(WireMessage::Text(r#"RestartRequest={"resourcePath":"/p"}"#.into()))
            .await
            .unwrap();
        let reply = parts.receiver.recv().await.unwrap().unwrap();
        assert!(reply.as_bytes().starts_with(b"RestartResponse="));
        assert_eq!(transport.write_count(), 1);
        assert_eq!(transport.handshakes(), 1);
    }
}
