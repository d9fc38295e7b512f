//! Application layer for wsdock-server.
//!
//! Shared state the engine coordinates but that involves no sockets:
//!
//! - [`ConnectionRegistry`]: which sessions are live right now
//! - [`NotificationBus`]: fan-out of status and message notifications
//!
//! # What does NOT belong here?
//!
//! - Binding, accepting or reading sockets (that is infrastructure)
//! - Frame encoding (that is `wsdock-core`)

pub mod notification;
pub mod registry;

pub use notification::NotificationBus;
pub use registry::{ConnectionRegistry, LiveTransport};
