//! Server configuration types.
//!
//! [`ServerConfig`] holds every setting one server instance needs.  It is
//! built by the hosting application (or by `main.rs` from CLI flags and the
//! settings file), handed to [`crate::infrastructure::ServerEngine::start`] and
//! never mutated afterwards; a restart takes a fresh config.
//!
//! Keeping configuration as a plain struct (no global state, no environment
//! reads inside the domain) makes the engine easy to embed in tests.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Candidate ports tried in order when no others are configured.
pub const DEFAULT_PORTS: [u16; 2] = [1024, 2048];

/// Largest accepted frame (and reassembled message) payload: 2 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// The only request path that is upgraded to WebSocket.
pub const DEFAULT_UPGRADE_PATH: &str = "/websocket";

/// Listen backlog for the bound socket.
pub const DEFAULT_BACKLOG: u32 = 256;

/// Where the TLS identity comes from, if anywhere.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Plain `ws://`.
    #[default]
    None,
    /// A PKCS#12 file on disk.
    Pkcs12File { path: PathBuf, passphrase: String },
    /// PKCS#12 bytes already in memory.
    Pkcs12Bytes { bundle: Vec<u8>, passphrase: String },
    /// A bundle compiled into the host application as reversed base64 text.
    ///
    /// The reversal is cosmetic and provides no confidentiality.
    Embedded { encoded: String, passphrase: String },
}

impl TlsMode {
    /// `true` for every mode except [`TlsMode::None`].
    pub fn is_requested(&self) -> bool {
        !matches!(self, TlsMode::None)
    }
}

// Passphrases and key bundles never reach the logs.
impl fmt::Debug for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsMode::None => f.write_str("None"),
            TlsMode::Pkcs12File { path, .. } => f
                .debug_struct("Pkcs12File")
                .field("path", path)
                .field("passphrase", &"<redacted>")
                .finish(),
            TlsMode::Pkcs12Bytes { bundle, .. } => f
                .debug_struct("Pkcs12Bytes")
                .field("len", &bundle.len())
                .field("passphrase", &"<redacted>")
                .finish(),
            TlsMode::Embedded { encoded, .. } => f
                .debug_struct("Embedded")
                .field("len", &encoded.len())
                .field("passphrase", &"<redacted>")
                .finish(),
        }
    }
}

/// All runtime configuration for one server instance.
///
/// # Example
///
/// ```rust
/// use wsdock_server::domain::ServerConfig;
///
/// let cfg = ServerConfig::default();
/// assert_eq!(cfg.ports, vec![1024, 2048]);
/// assert_eq!(cfg.path, "/websocket");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind.  `None` means "the machine's LAN address", resolved
    /// at start time.
    pub host: Option<IpAddr>,

    /// Candidate ports, tried in order on "address in use".  The server never
    /// listens on a port outside this list.
    pub ports: Vec<u16>,

    /// Largest frame payload and reassembled message size, in bytes.
    pub max_frame_size: usize,

    pub tls: TlsMode,

    /// Request path upgraded to WebSocket; every other GET gets the info page.
    pub path: String,

    /// How long a connection waits to flush its final close frame.
    pub close_timeout: Duration,

    /// Upper bound on the TLS handshake plus the HTTP request head.
    pub handshake_timeout: Duration,

    pub backlog: u32,
}

impl Default for ServerConfig {
    /// | Field             | Default           |
    /// |-------------------|-------------------|
    /// | host              | resolved at start |
    /// | ports             | `[1024, 2048]`    |
    /// | max_frame_size    | 2 MiB             |
    /// | tls               | none              |
    /// | path              | `/websocket`      |
    /// | close_timeout     | 5 seconds         |
    /// | handshake_timeout | 10 seconds        |
    /// | backlog           | 256               |
    fn default() -> Self {
        Self {
            host: None,
            ports: DEFAULT_PORTS.to_vec(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            tls: TlsMode::None,
            path: DEFAULT_UPGRADE_PATH.to_string(),
            close_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl ServerConfig {
    /// Default config bound to `host` and trying `ports`.
    pub fn bound_to(host: IpAddr, ports: Vec<u16>) -> Self {
        Self {
            host: Some(host),
            ports,
            ..Self::default()
        }
    }

    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
