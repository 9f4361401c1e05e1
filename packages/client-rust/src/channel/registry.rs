//! Correlation registry: pending operations keyed by expected response.
//!
//! The registry is the only structure touched both by callers (register) and
//! by the receive loop (dispatch). Register, dispatch-and-remove, and
//! `fail_all` each run as a single critical section under one mutex; handlers
//! are invoked after the lock is released.

use std::collections::HashMap;
use std::time::Instant;

use opchannel_core::payload::{
    correlation_value, ERROR_MESSAGE_FIELD, MESSAGE_FIELD, OPERATION_NAME_FIELD, STATUS_FIELD, STATUS_OK,
};
use opchannel_core::{InboundFrame, RESPONSE_SUFFIX};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::callback::{Callback, CallbackAdapter, OperationData};
use super::error::ChannelError;

/// Identifies one pending operation: the response it waits for and the
/// correlation value the server must echo.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    /// Expected response name, e.g. `RestartResponse`.
    pub response: String,
    /// Echoed correlation value, e.g. the resource path.
    pub correlation: String,
}

impl CorrelationKey {
    /// Key for the response to `operation` (a name without suffix).
    #[must_use]
    pub fn for_operation(operation: &str, correlation: impl Into<String>) -> Self {
        Self {
            response: format!("{operation}{RESPONSE_SUFFIX}"),
            correlation: correlation.into(),
        }
    }
}

#[derive(Debug)]
struct PendingEntry {
    /// Registration order; earliest wins when several entries could match.
    seq: u64,
    /// For generic `ExecuteOperation` calls, the operation the response must echo.
    expected_operation: Option<String>,
    registered_at: Instant,
    adapter: CallbackAdapter,
}

#[derive(Debug, Default)]
struct Pending {
    entries: HashMap<CorrelationKey, PendingEntry>,
    next_seq: u64,
}

/// Thread-safe map of in-flight operations to their callbacks.
#[derive(Debug)]
pub struct CorrelationRegistry {
    correlation_field: String,
    pending: Mutex<Pending>,
}

impl CorrelationRegistry {
    /// Creates an empty registry reading correlation values from `correlation_field`.
    #[must_use]
    pub fn new(correlation_field: impl Into<String>) -> Self {
        Self {
            correlation_field: correlation_field.into(),
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Registers a pending operation.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::DuplicateCorrelation`] if an entry with the same
    /// key is still pending. The rejected callback is handed back untouched so
    /// the caller can decide how to report the failure.
    pub fn register(
        &self,
        key: CorrelationKey,
        expected_operation: Option<String>,
        callback: Callback,
    ) -> Result<(), (ChannelError, Callback)> {
        let mut pending = self.pending.lock();
        if pending.entries.contains_key(&key) {
            let err = ChannelError::DuplicateCorrelation {
                response: key.response,
                key: key.correlation,
            };
            return Err((err, callback));
        }
        let seq = pending.next_seq;
        pending.next_seq += 1;
        pending.entries.insert(
            key,
            PendingEntry {
                seq,
                expected_operation,
                registered_at: Instant::now(),
                adapter: CallbackAdapter::new(callback),
            },
        );
        Ok(())
    }

    /// Removes a pending entry and resolves it with `err`.
    ///
    /// Returns `false` if no entry was pending under `key` (it was already
    /// resolved, e.g. by `fail_all`).
    pub fn cancel(&self, key: &CorrelationKey, err: ChannelError) -> bool {
        let entry = self.pending.lock().entries.remove(key);
        match entry {
            Some(entry) => entry.adapter.resolve_failure(err),
            None => false,
        }
    }

    /// Routes an inbound frame to the entry it answers, if any.
    ///
    /// Returns `true` when an entry was resolved. Frames nobody waits for are
    /// dropped.
    pub fn dispatch(&self, frame: InboundFrame) -> bool {
        let correlation = correlation_value(&frame.payload, &self.correlation_field);

        if frame.is_generic_error() {
            return self.dispatch_generic_error(correlation.as_deref(), &frame);
        }

        let Some(correlation) = correlation else {
            debug!(frame = %frame.name, "dropping frame without correlation value");
            return false;
        };

        if frame.responded_operation().is_none() {
            debug!(frame = %frame.name, "dropping frame that answers no operation");
            return false;
        }

        let key = CorrelationKey {
            response: frame.name.clone(),
            correlation,
        };
        let Some(entry) = self.pending.lock().entries.remove(&key) else {
            debug!(
                frame = %key.response,
                correlation = %key.correlation,
                "no pending operation for response; dropping"
            );
            return false;
        };

        let elapsed_ms = elapsed_ms(entry.registered_at);
        let ok_status = frame.str_field(STATUS_FIELD) == Some(STATUS_OK);
        let echoed_matches = match &entry.expected_operation {
            Some(expected) => frame.str_field(OPERATION_NAME_FIELD) == Some(expected.as_str()),
            None => true,
        };

        if ok_status && echoed_matches {
            debug!(frame = %key.response, correlation = %key.correlation, elapsed_ms, "operation succeeded");
            entry.adapter.resolve_success(OperationData::from(frame))
        } else {
            let message = frame
                .str_field(MESSAGE_FIELD)
                .map_or_else(|| default_failure_message(&frame), str::to_owned);
            debug!(
                frame = %key.response,
                correlation = %key.correlation,
                elapsed_ms,
                %message,
                "operation failed"
            );
            entry.adapter.resolve_failure(ChannelError::server(message))
        }
    }

    /// Fails the earliest pending entry the error may belong to. A generic
    /// error that echoes no correlation value may belong to any entry.
    fn dispatch_generic_error(&self, correlation: Option<&str>, frame: &InboundFrame) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            let key = pending
                .entries
                .iter()
                .filter(|(key, _)| correlation.is_none_or(|c| key.correlation == c))
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(key, _)| key.clone());
            key.and_then(|key| pending.entries.remove(&key))
        };

        let correlation = correlation.unwrap_or("<none>");
        let Some(entry) = entry else {
            debug!(correlation, "generic error claimed by no pending operation");
            return false;
        };

        let message = frame
            .str_field(ERROR_MESSAGE_FIELD)
            .unwrap_or("unspecified server error")
            .to_owned();
        warn!(correlation, %message, "server returned a generic error");
        entry.adapter.resolve_failure(ChannelError::server(message))
    }

    /// Resolves every pending entry with `reason` and empties the registry.
    ///
    /// Returns how many entries were failed.
    pub fn fail_all(&self, reason: &ChannelError) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            pending.entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.adapter.resolve_failure(reason.clone());
        }
        count
    }

    /// Number of operations still waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().entries.len()
    }

    #[must_use]
    pub fn is_pending(&self, key: &CorrelationKey) -> bool {
        self.pending.lock().entries.contains_key(key)
    }

    #[must_use]
    pub fn correlation_field(&self) -> &str {
        &self.correlation_field
    }
}

fn default_failure_message(frame: &InboundFrame) -> String {
    match frame.str_field(STATUS_FIELD) {
        Some(status) => format!("{} returned status {status}", frame.name),
        None => format!("{} returned no status", frame.name),
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
