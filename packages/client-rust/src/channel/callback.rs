//! Two-case result sink populated exactly once per operation.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use opchannel_core::payload::{MESSAGE_FIELD, STATUS_FIELD};
use opchannel_core::InboundFrame;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use super::error::ChannelError;

/// Outcome delivered to a callback.
pub type OperationResult = Result<OperationData, ChannelError>;

/// Successful response data handed to `on_success`.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationData {
    /// The decoded response payload.
    pub payload: Map<String, Value>,
    /// Binary attachment that followed the JSON, if any.
    pub attachment: Option<Bytes>,
}

impl OperationData {
    /// The `status` field of the response.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.payload.get(STATUS_FIELD).and_then(Value::as_str)
    }

    /// The `message` field of the response.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.payload.get(MESSAGE_FIELD).and_then(Value::as_str)
    }
}

impl From<InboundFrame> for OperationData {
    fn from(frame: InboundFrame) -> Self {
        Self {
            payload: frame.payload,
            attachment: frame.attachment,
        }
    }
}

type SuccessHandler = Box<dyn FnOnce(OperationData) + Send>;
type FailureHandler = Box<dyn FnOnce(ChannelError) + Send>;

/// Caller-supplied success/failure handlers for one operation.
///
/// Either handler may be omitted, but any call that can fail asynchronously
/// rejects a callback without a failure handler before touching the network.
/// Handlers run on the receive-loop task and must not block.
#[derive(Default)]
pub struct Callback {
    on_success: Option<SuccessHandler>,
    on_failure: Option<FailureHandler>,
}

impl Callback {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_success(mut self, f: impl FnOnce(OperationData) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_failure(mut self, f: impl FnOnce(ChannelError) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn has_success_handler(&self) -> bool {
        self.on_success.is_some()
    }

    #[must_use]
    pub fn has_failure_handler(&self) -> bool {
        self.on_failure.is_some()
    }

    /// A callback that forwards its single outcome into a oneshot channel.
    #[must_use]
    pub fn oneshot() -> (Self, oneshot::Receiver<OperationResult>) {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let fail_tx = Arc::clone(&tx);

        let callback = Self::new()
            .on_success(move |data| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Ok(data));
                }
            })
            .on_failure(move |err| {
                if let Some(tx) = fail_tx.lock().take() {
                    let _ = tx.send(Err(err));
                }
            });
        (callback, rx)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("on_success", &self.has_success_handler())
            .field("on_failure", &self.has_failure_handler())
            .finish()
    }
}

/// Single-assignment wrapper around a [`Callback`].
///
/// The first `resolve_*` call consumes the handlers; later calls are no-ops.
#[derive(Debug)]
pub struct CallbackAdapter {
    slot: Mutex<Option<Callback>>,
}

impl CallbackAdapter {
    #[must_use]
    pub fn new(callback: Callback) -> Self {
        Self {
            slot: Mutex::new(Some(callback)),
        }
    }

    /// Resolves with `result`. Returns `false` if already resolved.
    pub fn resolve(&self, result: OperationResult) -> bool {
        // Take the handlers out so they never run under the lock.
        let Some(callback) = self.slot.lock().take() else {
            return false;
        };
        match result {
            Ok(data) => {
                if let Some(handler) = callback.on_success {
                    handler(data);
                }
            }
            Err(err) => {
                if let Some(handler) = callback.on_failure {
                    handler(err);
                }
            }
        }
        true
    }

    pub fn resolve_success(&self, data: OperationData) -> bool {
        self.resolve(Ok(data))
    }

    pub fn resolve_failure(&self, err: ChannelError) -> bool {
        self.resolve(Err(err))
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.slot.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;

    fn data(status: &str) -> OperationData {
        let Value::Object(payload) = json!({"status": status, "message": "done"}) else {
            unreachable!()
        };
        OperationData {
            payload,
            attachment: None,
        }
    }

    fn counting() -> (Callback, Arc<AtomicU32>, Arc<AtomicU32>) {
        let successes = Arc::new(AtomicU32::new(0));
        let failures = Arc::new(AtomicU32::new(0));
        let s = Arc::clone(&successes);
        let f = Arc::clone(&failures);
        let cb = Callback::new()
            .on_success(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .on_failure(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            });
        (cb, successes, failures)
    }

    #[test]
    fn handler_presence_is_queryable() {
        let cb = Callback::new().on_success(|_| {});
        assert!(cb.has_success_handler());
        assert!(!cb.has_failure_handler());
        assert_eq!(
            format!("{cb:?}"),
            "Callback { on_success: true, on_failure: false }"
        );
    }

    #[test]
    fn first_resolution_wins() {
        let (cb, successes, failures) = counting();
        let adapter = CallbackAdapter::new(cb);

        assert!(adapter.resolve_success(data("OK")));
        assert!(!adapter.resolve_failure(ChannelError::ConnectionClosed));
        assert!(!adapter.resolve_success(data("OK")));

        assert!(adapter.is_resolved());
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failure_without_handler_still_consumes() {
        let adapter = CallbackAdapter::new(Callback::new().on_success(|_| panic!("not expected")));
        assert!(adapter.resolve_failure(ChannelError::ConnectionClosed));
        assert!(!adapter.resolve_success(data("OK")));
    }

    #[test]
    fn operation_data_accessors() {
        let d = data("OK");
        assert_eq!(d.status(), Some("OK"));
        assert_eq!(d.message(), Some("done"));
    }

    #[tokio::test]
    async fn oneshot_callback_delivers_once() {
        let (cb, rx) = Callback::oneshot();
        assert!(cb.has_failure_handler());
        let adapter = CallbackAdapter::new(cb);

        adapter.resolve_failure(ChannelError::server("boom"));
        adapter.resolve_success(data("OK"));

        let outcome = rx.await.unwrap();
        assert_eq!(outcome, Err(ChannelError::server("boom")));
    }
}
