//! Infrastructure layer for wsdock-server.
//!
//! Everything that touches the outside world: sockets, TLS, the host's
//! network interfaces and the settings file.
//!
//! # Responsibilities
//!
//! - Binding the listener with port fallback and accepting connections
//! - Terminating TLS from a PKCS#12 bundle
//! - Answering the HTTP request and performing the WebSocket upgrade
//! - Running one task per upgraded connection
//! - Discovering the local address for the connectable URL
//! - Loading the optional TOML settings file
//!
//! # What does NOT belong here?
//!
//! - Frame parsing and the close handshake (that is `wsdock-core`)
//! - Session bookkeeping and notification fan-out (that is the application
//!   layer)
//! - Event and configuration type definitions (that is the domain layer)

pub mod address;
pub mod certificate;
pub mod connection;
pub mod engine;
pub mod negotiator;
pub mod settings;

pub use address::AddressResolver;
pub use certificate::{CertificateError, CertificateSource, TlsIdentity};
pub use connection::ConnectionHandle;
pub use engine::{EngineError, ServerEngine};
pub use negotiator::{NegotiateError, NegotiateOutcome, UpgradeNegotiator};
pub use settings::{Settings, SettingsError};
