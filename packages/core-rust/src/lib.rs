//! Wire frames, payload shaping and operation schemas for the operation channel.

pub mod frame;
pub mod operations;
pub mod payload;

pub use frame::{
    decode, encode, FrameError, InboundFrame, OutboundFrame, DEFAULT_OPERATION,
    GENERIC_ERROR_RESPONSE, REQUEST_SUFFIX, RESPONSE_SUFFIX,
};
pub use operations::{OperationPayload, TypedOperation};
pub use payload::{Credentials, PayloadError};
