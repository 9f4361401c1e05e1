//! Connection manager: owns the single duplex connection of a channel.
//!
//! State machine: Disconnected -> Connecting -> Open -> Disconnected
//!
//! Concurrent `connect()` calls collapse onto one handshake attempt whose
//! outcome is broadcast through a `watch` channel. Once open, a spawned
//! receive loop decodes every inbound message and hands it to the
//! [`CorrelationRegistry`]. Losing or closing the connection fails every
//! pending entry with [`ChannelError::ConnectionClosed`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use opchannel_core::decode;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::config::ChannelConfig;
use super::error::ChannelError;
use super::registry::CorrelationRegistry;
use super::transport::{Handshake, Transport, TransportParts, TransportReceiver, TransportSender, WireMessage};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; `connect()` starts a new handshake.
    Disconnected,
    /// A handshake is in progress; further `connect()` calls wait for it.
    Connecting,
    /// Session established; requests can be sent.
    Open,
}

type AttemptOutcome = Option<Result<(), ChannelError>>;

struct Session {
    epoch: u64,
    sender: Box<dyn TransportSender>,
    shutdown: watch::Sender<bool>,
}

struct ConnectionInner {
    config: Arc<ChannelConfig>,
    transport: Arc<dyn Transport>,
    registry: Arc<CorrelationRegistry>,
    state: ArcSwap<ConnectionState>,
    /// The in-flight handshake, if any. Checked and set under one lock.
    attempt: Mutex<Option<watch::Receiver<AttemptOutcome>>>,
    /// Write half of the open connection; the lock serializes writes.
    session: tokio::sync::Mutex<Option<Session>>,
    epoch: AtomicU64,
    handshakes: AtomicU64,
}

/// Owns the connection and its receive loop. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("handshakes", &self.handshake_attempts())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        config: Arc<ChannelConfig>,
        transport: Arc<dyn Transport>,
        registry: Arc<CorrelationRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                config,
                transport,
                registry,
                state: ArcSwap::from_pointee(ConnectionState::Disconnected),
                attempt: Mutex::new(None),
                session: tokio::sync::Mutex::new(None),
                epoch: AtomicU64::new(0),
                handshakes: AtomicU64::new(0),
            }),
        }
    }

    /// Opens the connection, or waits for the handshake already in progress.
    ///
    /// Returns immediately when the connection is already open. The first
    /// inbound message (the server's session message) is consumed here and
    /// never reaches the registry.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::HandshakeTimeout`] when the upgrade and the
    /// session message do not complete within the configured timeout, or the
    /// transport error that aborted the handshake. Every caller waiting on
    /// the same attempt observes the same error.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let mut outcome = {
            let mut attempt = self.inner.attempt.lock();
            if self.is_open() {
                return Ok(());
            }
            match attempt.as_ref() {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *attempt = Some(rx.clone());
                    self.inner.state.store(Arc::new(ConnectionState::Connecting));

                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        let result = inner.establish().await;
                        *inner.attempt.lock() = None;
                        // Ignore send errors -- every waiter may have gone away
                        let _ = tx.send(Some(result));
                    });
                    rx
                }
            }
        };

        let result = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ChannelError::ConnectionClosed)?;
        (*result).clone().unwrap_or(Err(ChannelError::ConnectionClosed))
    }

    /// Writes one message to the open connection.
    ///
    /// A failed write tears the connection down, so every pending entry
    /// (including one registered for this message) fails with
    /// [`ChannelError::ConnectionClosed`].
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotConnected`] if the connection is not open,
    /// or the transport error of the failed write.
    pub async fn send(&self, message: WireMessage) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotConnected);
        }

        let (epoch, err) = {
            let mut slot = self.inner.session.lock().await;
            let Some(session) = slot.as_mut() else {
                return Err(ChannelError::NotConnected);
            };
            match session.sender.send(message).await {
                Ok(()) => return Ok(()),
                Err(e) => (session.epoch, e),
            }
        };

        warn!(epoch, error = %err, "write failed; closing connection");
        self.inner.teardown(Some(epoch)).await;
        Err(err)
    }

    /// Closes the connection and fails every pending entry with
    /// [`ChannelError::ConnectionClosed`].
    pub async fn close(&self) {
        self.inner.teardown(None).await;
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        **self.inner.state.load()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// How many handshakes have been started over the manager's lifetime.
    #[must_use]
    pub fn handshake_attempts(&self) -> u64 {
        self.inner.handshakes.load(Ordering::SeqCst)
    }
}

impl ConnectionInner {
    async fn establish(self: &Arc<Self>) -> Result<(), ChannelError> {
        let attempt = self.handshakes.fetch_add(1, Ordering::SeqCst) + 1;
        let handshake = Handshake::from_config(&self.config);
        let timeout = self.config.handshake_timeout;
        info!(url = %handshake.url, attempt, "connecting");

        let parts = match tokio::time::timeout(timeout, self.open_session(&handshake)).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => {
                warn!(url = %handshake.url, error = %e, "handshake failed");
                self.state.store(Arc::new(ConnectionState::Disconnected));
                return Err(e);
            }
            Err(_) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(url = %handshake.url, timeout_ms, "handshake timed out");
                self.state.store(Arc::new(ConnectionState::Disconnected));
                return Err(ChannelError::HandshakeTimeout { timeout_ms });
            }
        };

        self.install(parts).await;
        Ok(())
    }

    /// Upgrades the connection and swallows the server's session message.
    async fn open_session(&self, handshake: &Handshake) -> Result<TransportParts, ChannelError> {
        let mut parts = self.transport.open(handshake).await?;
        match parts.receiver.recv().await {
            Some(Ok(message)) => {
                info!(
                    session = %String::from_utf8_lossy(message.as_bytes()),
                    "session established"
                );
                Ok(parts)
            }
            Some(Err(e)) => Err(e),
            None => Err(ChannelError::ConnectionClosed),
        }
    }

    async fn install(self: &Arc<Self>, parts: TransportParts) {
        let TransportParts { sender, receiver } = parts;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        {
            let mut slot = self.session.lock().await;
            *slot = Some(Session {
                epoch,
                sender,
                shutdown: shutdown_tx,
            });
            self.state.store(Arc::new(ConnectionState::Open));
        }

        tokio::spawn(Arc::clone(self).receive_loop(epoch, receiver, shutdown_rx));
    }

    async fn receive_loop(
        self: Arc<Self>,
        epoch: u64,
        mut receiver: Box<dyn TransportReceiver>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(epoch, "receive loop started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(epoch, "receive loop stopped");
                    return;
                }
                message = receiver.recv() => match message {
                    Some(Ok(message)) => self.handle_inbound(&message),
                    Some(Err(e)) => {
                        warn!(epoch, error = %e, "receive failed; closing connection");
                        break;
                    }
                    None => {
                        info!(epoch, "peer closed the connection");
                        break;
                    }
                },
            }
        }
        self.teardown(Some(epoch)).await;
    }

    fn handle_inbound(&self, message: &WireMessage) {
        match decode(message.as_bytes()) {
            Ok(frame) => {
                self.registry.dispatch(frame);
            }
            Err(e) => warn!(error = %e, "dropping undecodable frame"),
        }
    }

    /// Drops the session and fails all pending entries.
    ///
    /// With `Some(epoch)` only that session is torn down; a stale receive
    /// loop or writer cannot close a newer connection.
    async fn teardown(&self, epoch: Option<u64>) {
        let session = {
            let mut slot = self.session.lock().await;
            if epoch.is_some() && slot.as_ref().map(|s| s.epoch) != epoch {
                return;
            }
            let session = slot.take();
            if session.is_some() {
                self.state.store(Arc::new(ConnectionState::Disconnected));
            }
            session
        };

        if let Some(mut session) = session {
            let _ = session.shutdown.send(true);
            if let Err(e) = session.sender.close().await {
                debug!(epoch = session.epoch, error = %e, "transport close failed");
            }
        }

        let failed = self.registry.fail_all(&ChannelError::ConnectionClosed);
        info!(failed, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use opchannel_core::Credentials;

    use super::*;
    use crate::channel::callback::Callback;
    use crate::channel::registry::CorrelationKey;
    use crate::testing::MemoryTransport;

    fn manager(transport: &MemoryTransport, config: ChannelConfig) -> (ConnectionManager, Arc<CorrelationRegistry>) {
        let registry = Arc::new(CorrelationRegistry::new(config.correlation_field.clone()));
        let manager = ConnectionManager::new(
            Arc::new(config),
            Arc::new(transport.clone()),
            Arc::clone(&registry),
        );
        (manager, registry)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn connect_opens_and_swallows_session_message() {
        let transport = MemoryTransport::new();
        let (manager, registry) = manager(&transport, ChannelConfig::default());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.connect().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Open);
        assert_eq!(manager.handshake_attempts(), 1);
        assert_eq!(registry.pending_count(), 0);
        // Second call is a no-op.
        manager.connect().await.unwrap();
        assert_eq!(transport.handshakes(), 1);
    }

    #[tokio::test]
    async fn handshake_sends_tenant_and_auth_headers() {
        let transport = MemoryTransport::new();
        let config = ChannelConfig {
            tenant: "acme".into(),
            credentials: Credentials::basic("jdoe", "password"),
            ..ChannelConfig::default()
        };
        let (manager, _) = manager(&transport, config);
        manager.connect().await.unwrap();

        let handshake = transport.last_handshake().unwrap();
        assert!(handshake
            .headers
            .contains(&("Tenant".to_string(), "acme".to_string())));
        assert!(handshake
            .headers
            .contains(&("Authorization".to_string(), "Basic amRvZTpwYXNzd29yZA==".to_string())));
    }

    #[tokio::test]
    async fn concurrent_connects_collapse_to_one_handshake() {
        let transport = MemoryTransport::new().with_handshake_delay(Duration::from_millis(100));
        let (manager, _) = manager(&transport, ChannelConfig::default());

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.connect().await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(()));
        }

        assert_eq!(transport.handshakes(), 1);
        assert_eq!(manager.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn concurrent_connects_share_the_timeout() {
        let transport = MemoryTransport::new().with_handshake_delay(Duration::from_secs(5));
        let config = ChannelConfig {
            handshake_timeout: Duration::from_millis(100),
            ..ChannelConfig::default()
        };
        let (manager, _) = manager(&transport, config);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.connect().await })
            })
            .collect();
        for task in tasks {
            assert_eq!(
                task.await.unwrap(),
                Err(ChannelError::HandshakeTimeout { timeout_ms: 100 })
            );
        }

        assert_eq!(transport.handshakes(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn missing_session_message_times_out() {
        let transport = MemoryTransport::new().without_session_message();
        let config = ChannelConfig {
            handshake_timeout: Duration::from_millis(100),
            ..ChannelConfig::default()
        };
        let (manager, _) = manager(&transport, config);

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err, ChannelError::HandshakeTimeout { timeout_ms: 100 });
    }

    #[tokio::test]
    async fn failed_handshake_allows_retry() {
        let transport = MemoryTransport::new().failing_handshakes(1);
        let (manager, _) = manager(&transport, ChannelConfig::default());

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, ChannelError::Transport(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.connect().await.unwrap();
        assert_eq!(transport.handshakes(), 2);
    }

    #[tokio::test]
    async fn send_requires_open_connection() {
        let transport = MemoryTransport::new();
        let (manager, _) = manager(&transport, ChannelConfig::default());

        let err = manager.send(WireMessage::Text("PingRequest={}".into())).await;
        assert_eq!(err, Err(ChannelError::NotConnected));
        assert_eq!(transport.write_count(), 0);
    }

    #[tokio::test]
    async fn close_fails_all_pending_entries() {
        let transport = MemoryTransport::new();
        let (manager, registry) = manager(&transport, ChannelConfig::default());
        manager.connect().await.unwrap();

        let receivers: Vec<_> = (0..4)
            .map(|i| {
                let (callback, rx) = Callback::oneshot();
                registry
                    .register(CorrelationKey::for_operation("Restart", format!("/p{i}")), None, callback)
                    .unwrap();
                rx
            })
            .collect();

        manager.close().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(registry.pending_count(), 0);
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(ChannelError::ConnectionClosed));
        }
    }

    #[tokio::test]
    async fn peer_close_fails_pending_and_allows_reconnect() {
        let transport = MemoryTransport::new();
        let (manager, registry) = manager(&transport, ChannelConfig::default());
        manager.connect().await.unwrap();

        let (callback, rx) = Callback::oneshot();
        registry
            .register(CorrelationKey::for_operation("Restart", "/p"), None, callback)
            .unwrap();

        transport.disconnect();
        assert_eq!(rx.await.unwrap(), Err(ChannelError::ConnectionClosed));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.connect().await.unwrap();
        assert_eq!(transport.handshakes(), 2);
    }

    #[tokio::test]
    async fn write_failure_tears_down() {
        let transport = MemoryTransport::new();
        let (manager, registry) = manager(&transport, ChannelConfig::default());
        manager.connect().await.unwrap();

        let (callback, rx) = Callback::oneshot();
        registry
            .register(CorrelationKey::for_operation("Restart", "/p"), None, callback)
            .unwrap();

        transport.fail_writes(true);
        let err = manager
            .send(WireMessage::Text("RestartRequest={}".into()))
            .await
            .unwrap_err();

        assert!(matches!(err, ChannelError::Transport(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(rx.await.unwrap(), Err(ChannelError::ConnectionClosed));
    }

    #[tokio::test]
    async fn inbound_frames_reach_the_registry() {
        let transport = MemoryTransport::new();
        let (manager, registry) = manager(&transport, ChannelConfig::default());
        manager.connect().await.unwrap();

        let (callback, rx) = Callback::oneshot();
        registry
            .register(CorrelationKey::for_operation("Restart", "/p"), None, callback)
            .unwrap();

        // Garbage is dropped without disturbing the loop.
        assert!(transport.push_inbound("no separator here"));
        assert!(transport.push_inbound(r#"RestartResponse=[1,2]"#));
        assert!(transport.push_inbound(r#"RestartResponse={"resourcePath":"/p","status":"OK"}"#));

        let data = rx.await.unwrap().unwrap();
        assert_eq!(data.status(), Some("OK"));
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Open);
    }
}
