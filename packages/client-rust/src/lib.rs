//! Operation channel client: correlated remote operations over one `WebSocket`.
//!
//! Requests are written as `{Name}Request=<json>` frames and matched to their
//! `{Name}Response` by an echoed correlation field. See [`OperationChannel`].

pub mod channel;
pub mod logging;
pub mod testing;

pub use channel::{
    Callback, ChannelConfig, ChannelError, ConnectionState, OperationChannel, OperationData,
    OperationRequest,
};
pub use opchannel_core::operations;
pub use opchannel_core::Credentials;
