//! wsdock-server library crate.
//!
//! An embeddable WebSocket server for applications that want peers on the
//! local network to connect to *them*: it binds a port from a candidate list,
//! optionally terminates TLS from a PKCS#12 bundle, upgrades HTTP requests on
//! one path to WebSocket, tracks live sessions by peer address and lets the
//! host application send to any session by id.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Hosting application
//!     │ start / stop / send              ▲ InboundEvent, ConnectionStatus,
//!     ▼                                  │ ReceivedMessage
//! [wsdock-server]
//!   ├── domain/           ServerConfig, SessionId, event types
//!   ├── application/      ConnectionRegistry, NotificationBus
//!   └── infrastructure/
//!         ├── engine      listener, port fallback, accept loop
//!         ├── negotiator  HTTP phase: 101 / 200 / 400 / 405
//!         ├── connection  one task per WebSocket session
//!         ├── certificate PKCS#12 → rustls
//!         ├── address     LAN address discovery
//!         └── settings    TOML settings file
//! [wsdock-core]           frame codec, aggregation, close handshake
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` only (plus `tokio::sync` channels).
//! - `infrastructure` depends on everything else plus `tokio`, `rustls` and
//!   `wsdock-core`.
//!
//! # Quick start
//!
//! ```no_run
//! use wsdock_server::domain::ServerConfig;
//! use wsdock_server::infrastructure::ServerEngine;
//!
//! # async fn run() -> Result<(), wsdock_server::infrastructure::EngineError> {
//! let engine = ServerEngine::new();
//! engine.start(ServerConfig::default()).await?;
//! println!("connect to {:?}", engine.current_url().await);
//!
//! let mut messages = engine.notifications().subscribe_messages();
//! while let Ok(msg) = messages.recv().await {
//!     engine.send_text(&msg.session_id, format!("echo: {}", msg.content));
//! }
//! engine.stop().await
//! # }
//! ```

/// Domain layer: configuration and event types (no I/O).
pub mod domain;

/// Application layer: session registry and notification fan-out.
pub mod application;

/// Infrastructure layer: sockets, TLS, HTTP upgrade, settings.
pub mod infrastructure;
