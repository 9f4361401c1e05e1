//! Wire framing for the operation channel.
//!
//! Every message on the duplex channel has the shape
//! `<OperationName>=<json><optional raw binary>`. Outbound names carry the
//! `Request` suffix; the server answers with `<OperationName>Response` or the
//! fixed `GenericErrorResponse`. A binary attachment (always a ZIP-family
//! archive) is appended directly after the JSON text and located on decode by
//! scanning for the archive's 4-byte signature.

use bytes::Bytes;
use serde_json::{Map, Value};
use tracing::trace;

/// Suffix appended to every outbound operation name.
pub const REQUEST_SUFFIX: &str = "Request";

/// Suffix the server appends to the name of the operation it answers.
pub const RESPONSE_SUFFIX: &str = "Response";

/// Name of the protocol-level error frame not tied to a known operation.
pub const GENERIC_ERROR_RESPONSE: &str = "GenericErrorResponse";

/// Operation name used when the caller does not name one.
pub const DEFAULT_OPERATION: &str = "ExecuteOperation";

/// Only this many leading bytes of the frame tail are searched for an attachment.
pub const ATTACHMENT_SCAN_LIMIT: usize = 100 * 1024;

/// Archive signatures that mark the start of a binary attachment:
/// local file header, empty archive, spanned archive.
pub const ARCHIVE_SIGNATURES: [[u8; 4]; 3] = [
    [0x50, 0x4B, 0x03, 0x04],
    [0x50, 0x4B, 0x05, 0x06],
    [0x50, 0x4B, 0x07, 0x08],
];

const SEPARATOR: u8 = b'=';

/// Errors produced while decoding an inbound frame.
///
/// None of these reach a pending operation: a frame that cannot be decoded
/// cannot be attributed to any request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: no '=' separator in {len} bytes")]
    MalformedFrame { len: usize },
    #[error("frame {name} carries an undecodable payload: {reason}")]
    InvalidPayload { name: String, reason: String },
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    /// Operation name as sent, e.g. `RestartResponse`.
    pub name: String,
    /// The JSON object preceding the attachment.
    pub payload: Map<String, Value>,
    /// Raw attachment bytes, if the frame carried one.
    pub attachment: Option<Bytes>,
}

impl InboundFrame {
    /// Returns the operation this frame answers, if it is a `{name}Response`.
    ///
    /// `GenericErrorResponse` is not an answer to an operation named
    /// `GenericError` and yields `None`.
    #[must_use]
    pub fn responded_operation(&self) -> Option<&str> {
        if self.is_generic_error() {
            return None;
        }
        self.name
            .strip_suffix(RESPONSE_SUFFIX)
            .filter(|op| !op.is_empty())
    }

    #[must_use]
    pub fn is_generic_error(&self) -> bool {
        self.name == GENERIC_ERROR_RESPONSE
    }

    /// Reads a string field from the payload.
    #[must_use]
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }
}

/// An encoded outbound message ready to hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Full wire name, e.g. `RestartRequest`.
    pub name: String,
    /// `<name>=<json>` followed by the raw attachment, if any.
    pub bytes: Vec<u8>,
    /// Whether the transport must send this as a binary message.
    pub binary: bool,
}

/// Decodes one raw inbound message.
///
/// # Errors
///
/// Returns [`FrameError::MalformedFrame`] when there is no `=` separator and
/// [`FrameError::InvalidPayload`] when the JSON slice is not a valid object.
pub fn decode(raw: &[u8]) -> Result<InboundFrame, FrameError> {
    let sep = raw
        .iter()
        .position(|&b| b == SEPARATOR)
        .ok_or(FrameError::MalformedFrame { len: raw.len() })?;

    let name = String::from_utf8_lossy(&raw[..sep]).into_owned();
    let rest = &raw[sep + 1..];

    let (json, attachment) = match find_attachment(rest) {
        Some(offset) => {
            trace!(frame = %name, offset, len = rest.len() - offset, "attachment located");
            (&rest[..offset], Some(Bytes::copy_from_slice(&rest[offset..])))
        }
        None => (rest, None),
    };

    let payload = match serde_json::from_slice::<Value>(json) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            return Err(FrameError::InvalidPayload {
                name,
                reason: format!("expected a JSON object, found {}", json_kind(&other)),
            })
        }
        Err(e) => {
            return Err(FrameError::InvalidPayload {
                name,
                reason: e.to_string(),
            })
        }
    };

    Ok(InboundFrame {
        name,
        payload,
        attachment,
    })
}

/// Encodes an outbound request as `<operation>Request=<json>[attachment]`.
///
/// # Errors
///
/// Returns an error only if the payload cannot be serialized, which cannot
/// happen for a `serde_json::Map` but is surfaced rather than unwrapped.
pub fn encode(
    operation: &str,
    payload: &Map<String, Value>,
    attachment: Option<&[u8]>,
) -> Result<OutboundFrame, serde_json::Error> {
    let name = format!("{operation}{REQUEST_SUFFIX}");
    let json = serde_json::to_vec(payload)?;

    let tail = attachment.map_or(0, <[u8]>::len);
    let mut bytes = Vec::with_capacity(name.len() + 1 + json.len() + tail);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(SEPARATOR);
    bytes.extend_from_slice(&json);
    if let Some(att) = attachment {
        bytes.extend_from_slice(att);
    }

    Ok(OutboundFrame {
        name,
        bytes,
        binary: attachment.is_some(),
    })
}

/// Finds the offset of the first archive signature within the scan window.
///
/// A signature must lie entirely inside the first [`ATTACHMENT_SCAN_LIMIT`]
/// bytes to count.
#[must_use]
pub fn find_attachment(tail: &[u8]) -> Option<usize> {
    let window = &tail[..tail.len().min(ATTACHMENT_SCAN_LIMIT)];
    window
        .windows(4)
        .position(|w| ARCHIVE_SIGNATURES.iter().any(|sig| w == sig))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
