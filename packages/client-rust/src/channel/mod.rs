//! The operation channel: configuration, connection management, correlation
//! and invocation.

pub mod callback;
pub mod config;
pub mod connection;
pub mod error;
pub mod invoker;
pub mod registry;
pub mod transport;

pub use callback::{Callback, CallbackAdapter, OperationData, OperationResult};
pub use config::ChannelConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use error::ChannelError;
pub use invoker::{OperationChannel, OperationRequest};
pub use registry::{CorrelationKey, CorrelationRegistry};
pub use transport::{
    Handshake, Transport, TransportParts, TransportReceiver, TransportSender, WebSocketTransport,
    WireMessage,
};
