//! Domain layer for wsdock-server.
//!
//! Pure types with no I/O: the server configuration, session identity, the
//! events the engine emits and the requests it accepts.
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, `TcpStream` or TLS types
//! - File I/O or environment variable reading
//! - Anything that could block or fail due to external state

pub mod config;
pub mod events;

pub use config::{ServerConfig, TlsMode};
pub use events::{
    ConnectionStatus, EngineState, InboundEvent, OutboundRequest, ReceivedMessage, SessionId,
};
