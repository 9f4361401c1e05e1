//! Operation invoker: the public face of the channel.
//!
//! `invoke` validates, connects, registers and writes; it never waits for the
//! response. Outcomes reach the caller's [`Callback`] from the receive loop.
//! `call` wraps the same path in a future.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use opchannel_core::payload::{
    correlation_value, first_missing, inject_credentials, normalize_keys, OPERATION_NAME_FIELD,
};
use opchannel_core::{encode, OperationPayload, PayloadError, TypedOperation, DEFAULT_OPERATION};
use serde_json::{Map, Value};
use tracing::{debug, info_span, warn, Instrument};

use super::callback::{Callback, CallbackAdapter, OperationData};
use super::config::ChannelConfig;
use super::connection::{ConnectionManager, ConnectionState};
use super::error::ChannelError;
use super::registry::{CorrelationKey, CorrelationRegistry};
use super::transport::{Transport, WebSocketTransport, WireMessage};

/// One operation to send: wire name, payload, required fields, attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    operation: String,
    payload: Map<String, Value>,
    required: Vec<String>,
    attachment: Option<Bytes>,
}

impl OperationRequest {
    /// A generic `ExecuteOperation` request carrying `payload`.
    #[must_use]
    pub fn new(payload: Map<String, Value>) -> Self {
        Self {
            operation: DEFAULT_OPERATION.to_string(),
            payload,
            required: Vec::new(),
            attachment: None,
        }
    }

    /// Overrides the wire name (without the `Request` suffix).
    #[must_use]
    pub fn named(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Adds fields that must be present and non-null, on top of the
    /// correlation field.
    #[must_use]
    pub fn require(mut self, fields: &[&str]) -> Self {
        self.required.extend(fields.iter().map(|f| (*f).to_string()));
        self
    }

    /// Appends raw bytes after the JSON; the request goes out as binary.
    #[must_use]
    pub fn with_attachment(mut self, attachment: impl Into<Bytes>) -> Self {
        self.attachment = Some(attachment.into());
        self
    }

    /// Builds a request from a typed operation.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] if the operation does not serialize to an object.
    pub fn from_typed(op: impl TypedOperation) -> Result<Self, PayloadError> {
        op.into_payload().map(Self::from)
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    #[must_use]
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    #[must_use]
    pub fn attachment(&self) -> Option<&Bytes> {
        self.attachment.as_ref()
    }
}

impl From<OperationPayload> for OperationRequest {
    fn from(op: OperationPayload) -> Self {
        Self {
            operation: op.name.to_string(),
            payload: op.payload,
            required: op.required.iter().map(|f| (*f).to_string()).collect(),
            attachment: op.attachment,
        }
    }
}

/// Correlated remote operations over one duplex connection.
///
/// Share it behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct OperationChannel {
    config: Arc<ChannelConfig>,
    connection: ConnectionManager,
    registry: Arc<CorrelationRegistry>,
    next_call_id: AtomicU64,
}

impl OperationChannel {
    /// A channel that connects over WebSocket.
    #[must_use]
    pub fn new(config: ChannelConfig) -> Self {
        Self::with_transport(config, Arc::new(WebSocketTransport))
    }

    /// A channel over a caller-supplied transport.
    #[must_use]
    pub fn with_transport(config: ChannelConfig, transport: Arc<dyn Transport>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(CorrelationRegistry::new(config.correlation_field.clone()));
        let connection = ConnectionManager::new(Arc::clone(&config), transport, Arc::clone(&registry));
        Self {
            config,
            connection,
            registry,
            next_call_id: AtomicU64::new(1),
        }
    }

    /// Opens the connection ahead of the first request.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::connect`].
    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.connection.connect().await
    }

    /// Closes the connection; every pending callback fails with
    /// [`ChannelError::ConnectionClosed`].
    pub async fn close(&self) {
        self.connection.close().await;
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Operations still waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.registry.pending_count()
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Sends one operation and returns once it is written.
    ///
    /// With a callback, every failure (including validation) is delivered
    /// through it and `Ok(())` is returned; the success or server failure
    /// arrives later from the receive loop. Without a callback the request
    /// is fire-and-forget: failures before the write are returned, nothing
    /// after it is ever observable.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::CallbackContractViolation`] when `callback`
    /// has no failure handler, before any I/O. Without a callback, returns
    /// any error raised before or during the write.
    pub async fn invoke(
        &self,
        request: OperationRequest,
        callback: Option<Callback>,
    ) -> Result<(), ChannelError> {
        if callback.as_ref().is_some_and(|cb| !cb.has_failure_handler()) {
            return Err(ChannelError::CallbackContractViolation);
        }

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let span = info_span!(
            "operation",
            call_id,
            operation = %request.operation,
            correlation = tracing::field::Empty,
        );
        self.submit(request, callback).instrument(span).await
    }

    /// Sends one operation and waits for its outcome.
    ///
    /// No timeout is applied; wrap the future in `tokio::time::timeout` to
    /// stop waiting. The entry stays registered until the server answers or
    /// the connection closes.
    ///
    /// # Errors
    ///
    /// Returns whatever the operation resolved with: validation and
    /// connection errors, [`ChannelError::ServerReportedFailure`], or
    /// [`ChannelError::ConnectionClosed`].
    pub async fn call(&self, request: OperationRequest) -> Result<OperationData, ChannelError> {
        let (callback, outcome) = Callback::oneshot();
        self.invoke(request, Some(callback)).await?;
        outcome.await.unwrap_or(Err(ChannelError::ConnectionClosed))
    }

    /// [`OperationChannel::invoke`] for a typed operation.
    ///
    /// # Errors
    ///
    /// As [`OperationChannel::invoke`]; a payload that fails to serialize is
    /// [`ChannelError::InvalidRequest`].
    pub async fn invoke_typed(
        &self,
        op: impl TypedOperation,
        callback: Option<Callback>,
    ) -> Result<(), ChannelError> {
        match OperationRequest::from_typed(op) {
            Ok(request) => self.invoke(request, callback).await,
            Err(e) => reject(callback, e.into()),
        }
    }

    /// [`OperationChannel::call`] for a typed operation.
    ///
    /// # Errors
    ///
    /// As [`OperationChannel::call`].
    pub async fn call_typed(&self, op: impl TypedOperation) -> Result<OperationData, ChannelError> {
        self.call(OperationRequest::from_typed(op)?).await
    }

    async fn submit(
        &self,
        request: OperationRequest,
        callback: Option<Callback>,
    ) -> Result<(), ChannelError> {
        let OperationRequest {
            operation,
            payload,
            required,
            attachment,
        } = request;
        let mut payload = normalize_keys(payload);

        let field = self.registry.correlation_field();
        let required: Vec<&str> = std::iter::once(field)
            .chain(required.iter().map(String::as_str))
            .collect();
        if let Some(missing) = first_missing(&payload, &required) {
            return reject(callback, ChannelError::missing(missing));
        }
        let Some(correlation) = correlation_value(&payload, field) else {
            return reject(callback, ChannelError::missing(field));
        };
        tracing::Span::current().record("correlation", correlation.as_str());

        if !self.connection.is_open() {
            if let Err(e) = self.connection.connect().await {
                return reject(callback, e);
            }
        }

        inject_credentials(&mut payload, &self.config.credentials);

        let key = CorrelationKey::for_operation(&operation, correlation);
        let registered = match callback {
            Some(callback) => {
                let expected = expected_operation(&operation, &payload);
                if let Err((err, callback)) = self.registry.register(key.clone(), expected, callback) {
                    return reject(Some(callback), err);
                }
                true
            }
            None => false,
        };

        match self.write(&operation, &payload, attachment.as_deref()).await {
            Ok(()) => {
                debug!(registered, "request sent");
                Ok(())
            }
            Err(e) if registered => {
                warn!(error = %e, "request not sent");
                // No-op when a teardown already failed the entry.
                self.registry.cancel(&key, e);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "request not sent");
                Err(e)
            }
        }
    }

    async fn write(
        &self,
        operation: &str,
        payload: &Map<String, Value>,
        attachment: Option<&[u8]>,
    ) -> Result<(), ChannelError> {
        let frame = encode(operation, payload, attachment)
            .map_err(|e| ChannelError::InvalidRequest(e.to_string()))?;
        self.connection.send(WireMessage::from_frame(frame)?).await
    }
}

/// The generic entry point must be answered for the operation it named.
fn expected_operation(operation: &str, payload: &Map<String, Value>) -> Option<String> {
    if operation != DEFAULT_OPERATION {
        return None;
    }
    payload
        .get(OPERATION_NAME_FIELD)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Reports an error raised before the request was written.
fn reject(callback: Option<Callback>, err: ChannelError) -> Result<(), ChannelError> {
    if err.is_pre_send() {
        debug!(error = %err, "request rejected");
    } else {
        warn!(error = %err, "request rejected");
    }
    match callback {
        Some(callback) => {
            CallbackAdapter::new(callback).resolve_failure(err);
            Ok(())
        }
        None => Err(err),
    }
}
