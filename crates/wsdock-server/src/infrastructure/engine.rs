//! ServerEngine: the embeddable server's control surface.
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//!   Idle ──start()──▶ Starting ──bind ok──▶ Listening ──stop()──▶ Stopping ──▶ Idle
//!                        │
//!                        └──bind failed──▶ Failed ──stop()──▶ Idle
//!
//!   start() while Listening = stop() then start()
//!   every start() tries the candidate ports from the first one
//! ```
//!
//! `start` and `stop` are serialised through one async mutex, so a stop can
//! never interleave with a start's port-retry loop.  Everything else
//! (`send`, `is_active`, the URL getters, subscriptions) is lock-free with
//! respect to that mutex and safe to call from any task.
//!
//! # Tasks
//!
//! One accept task per running instance, plus one task per accepted
//! connection, all tracked by a [`TaskTracker`] and cancelled through one
//! [`CancellationToken`].  `stop` waits for the accept task (which owns the
//! listener, so the port is released) and for every connection task before it
//! returns, so an immediate `start` can rebind the same port.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use wsdock_core::Message;

use crate::application::notification::DEFAULT_CHANNEL_CAPACITY;
use crate::application::NotificationBus;
use crate::domain::{EngineState, InboundEvent, OutboundRequest, ServerConfig, SessionId};

use super::address::AddressResolver;
use super::certificate::CertificateSource;
use super::connection::{serve_connection, ConnectionHub, ConnectionSettings};
use super::negotiator::{NegotiateOutcome, UpgradeNegotiator};

/// Pause after a failed `accept()` so a persistent error (e.g. out of file
/// descriptors) does not spin the accept task.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Errors reported by [`ServerEngine::start`] and [`ServerEngine::stop`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// The config listed no ports at all.
    #[error("no candidate ports configured")]
    NoCandidatePorts,

    /// Every candidate port was already in use.
    #[error("all candidate ports are in use: {ports:?}")]
    PortsExhausted { ports: Vec<u16> },

    /// Binding failed for a reason other than "address in use".
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Shutdown did not complete cleanly.  The registry is cleared anyway.
    #[error("server did not stop cleanly: {0}")]
    Stop(String),
}

/// Where a running instance is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    local_addr: SocketAddr,
    /// Address advertised in URLs; differs from `local_addr` only when bound
    /// to an unspecified address.
    advertised: SocketAddr,
    secure: bool,
    path: String,
}

impl Endpoint {
    fn base_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}", self.advertised)
    }
}

/// Resources owned by one running instance.
struct Running {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
    drain_timeout: Duration,
    local_addr: SocketAddr,
}

/// State only touched while holding the control mutex.
#[derive(Default)]
struct Control {
    running: Option<Running>,
}

struct Inner {
    hub: Arc<ConnectionHub>,
    control: Mutex<Control>,
    state: watch::Sender<EngineState>,
    endpoint: watch::Sender<Option<Endpoint>>,
}

/// An embeddable WebSocket server.  Clones share the same instance.
#[derive(Clone)]
pub struct ServerEngine {
    inner: Arc<Inner>,
}

impl fmt::Debug for ServerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEngine")
            .field("state", &*self.inner.state.borrow())
            .field("sessions", &self.inner.hub.registry.len())
            .finish_non_exhaustive()
    }
}

impl Default for ServerEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

impl ServerEngine {
    pub fn new() -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        let (endpoint, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                hub: Arc::new(ConnectionHub::new(DEFAULT_CHANNEL_CAPACITY)),
                control: Mutex::new(Control::default()),
                state,
                endpoint,
            }),
        }
    }

    /// Binds and starts accepting connections, returning the bound address.
    ///
    /// If the engine is already listening it is stopped first and restarted
    /// with `config`.  Every attempt tries the candidate ports in order from
    /// the first; "address in use" advances to the next one.
    /// A TLS identity that fails to load is logged and the server runs in
    /// plaintext instead (see [`ServerEngine::is_secure`]).
    ///
    /// # Errors
    ///
    /// - [`EngineError::NoCandidatePorts`] if `config.ports` is empty
    /// - [`EngineError::PortsExhausted`] if every candidate is in use
    /// - [`EngineError::Bind`] for any other bind failure
    pub async fn start(&self, config: ServerConfig) -> Result<SocketAddr, EngineError> {
        let mut control = self.inner.control.lock().await;

        if control.running.is_some() {
            info!("server already running; restarting with new configuration");
            if let Err(e) = self.stop_locked(&mut control).await {
                warn!("previous instance stopped uncleanly: {e}");
            }
        }

        self.set_state(EngineState::Starting);

        if config.ports.is_empty() {
            self.set_state(EngineState::Failed);
            return Err(EngineError::NoCandidatePorts);
        }
        let host = config.host.unwrap_or_else(|| AddressResolver.resolve());
        let acceptor = load_acceptor(&config);

        let (listener, bound) = match bind_candidates(host, &config.ports, config.backlog) {
            Ok(bound) => bound,
            Err(e) => {
                error!("failed to start: {e}");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                self.set_state(EngineState::Failed);
                return Err(EngineError::Bind {
                    addr: bound,
                    source,
                });
            }
        };

        let secure = acceptor.is_some();
        let advertised = if local_addr.ip().is_unspecified() {
            SocketAddr::new(AddressResolver.resolve(), local_addr.port())
        } else {
            local_addr
        };

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let context = AcceptContext {
            acceptor,
            negotiator: Arc::new(UpgradeNegotiator::new(config.path.clone())),
            hub: Arc::clone(&self.inner.hub),
            settings: ConnectionSettings {
                max_frame_size: config.max_frame_size,
                close_timeout: config.close_timeout,
            },
            handshake_timeout: config.handshake_timeout,
        };
        let accept_task = tokio::spawn(accept_loop(
            listener,
            context,
            shutdown.clone(),
            tracker.clone(),
        ));

        control.running = Some(Running {
            shutdown,
            tracker,
            accept_task,
            drain_timeout: config.close_timeout * 2 + Duration::from_secs(1),
            local_addr,
        });
        self.inner.endpoint.send_replace(Some(Endpoint {
            local_addr,
            advertised,
            secure,
            path: config.path,
        }));
        self.set_state(EngineState::Listening);
        info!(
            "listening on {local_addr} ({})",
            if secure { "TLS" } else { "plaintext" }
        );
        Ok(local_addr)
    }

    /// Stops the server: drops every connection, releases the port and waits
    /// for all connection tasks to finish.  Calling it while not running is a
    /// successful no-op.
    ///
    /// # Errors
    ///
    /// [`EngineError::Stop`] if a task panicked or connections did not drain
    /// in time.  The registry is cleared and the engine is `Idle` regardless.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut control = self.inner.control.lock().await;
        self.stop_locked(&mut control).await
    }

    /// Routes `request` to its session.  Unknown or closing sessions are
    /// ignored.
    pub fn send(&self, request: &OutboundRequest) {
        let message = match request {
            OutboundRequest::SendText { text, .. } => Message::Text(text.clone()),
            OutboundRequest::SendBinary { data, .. } => Message::Binary(data.clone()),
        };
        self.deliver(request.session_id(), message);
    }

    pub fn send_text(&self, id: &SessionId, text: impl Into<String>) {
        self.deliver(id, Message::Text(text.into()));
    }

    pub fn send_binary(&self, id: &SessionId, data: impl Into<Vec<u8>>) {
        self.deliver(id, Message::Binary(data.into()));
    }

    /// `ws://host:port/path` (or `wss://`) of the running server.
    pub async fn current_url(&self) -> Option<String> {
        self.inner
            .endpoint
            .borrow()
            .as_ref()
            .map(|ep| format!("{}{}", ep.base_url(), ep.path))
    }

    /// Like [`ServerEngine::current_url`] without the path.
    pub async fn base_url(&self) -> Option<String> {
        self.inner.endpoint.borrow().as_ref().map(Endpoint::base_url)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoint.borrow().as_ref().map(|ep| ep.local_addr)
    }

    /// `true` only while the running listener actually terminates TLS.
    pub async fn is_secure(&self) -> bool {
        self.inner
            .endpoint
            .borrow()
            .as_ref()
            .is_some_and(|ep| ep.secure)
    }

    pub async fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    /// `true` if `id` is registered and its transport is still open.
    pub fn is_active(&self, id: &SessionId) -> bool {
        self.inner.hub.registry.is_active(id)
    }

    /// Ids of every registered session, sorted.
    pub fn connected_sessions(&self) -> Vec<SessionId> {
        self.inner.hub.registry.ids()
    }

    /// Every [`InboundEvent`], including binary payloads that are not UTF-8.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.inner.hub.subscribe()
    }

    /// Status and message notifications for UI-style consumers.
    pub fn notifications(&self) -> &NotificationBus {
        &self.inner.hub.notifications
    }
}

// ── Internals ─────────────────────────────────────────────────────────────────

impl ServerEngine {
    fn set_state(&self, state: EngineState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!("engine state {previous} -> {state}");
        }
    }

    fn deliver(&self, id: &SessionId, message: Message) {
        match self.inner.hub.registry.lookup(id) {
            Some(handle) => {
                if !handle.send(message) {
                    debug!("session {id}: already closed, message dropped");
                }
            }
            None => debug!("session {id}: not connected, message dropped"),
        }
    }

    async fn stop_locked(&self, control: &mut Control) -> Result<(), EngineError> {
        let Some(running) = control.running.take() else {
            self.inner.hub.registry.clear_all();
            self.set_state(EngineState::Idle);
            debug!("stop requested while not running");
            return Ok(());
        };

        self.set_state(EngineState::Stopping);
        info!("stopping server on {}", running.local_addr);

        let evicted = self.inner.hub.registry.clear_all();
        running.shutdown.cancel();
        drop(evicted);

        let mut failure = None;
        if let Err(e) = running.accept_task.await {
            failure = Some(format!("accept task failed: {e}"));
        }
        running.tracker.close();
        if timeout(running.drain_timeout, running.tracker.wait())
            .await
            .is_err()
        {
            failure = Some(format!(
                "{} connection task(s) still running after {:?}",
                running.tracker.len(),
                running.drain_timeout
            ));
        }

        self.inner.endpoint.send_replace(None);
        self.set_state(EngineState::Idle);

        match failure {
            Some(reason) => {
                error!("stop: {reason}");
                Err(EngineError::Stop(reason))
            }
            None => {
                info!("server stopped");
                Ok(())
            }
        }
    }
}

/// Resolves the configured TLS identity, or `None` for plaintext.
fn load_acceptor(config: &ServerConfig) -> Option<TlsAcceptor> {
    let source = CertificateSource::from_mode(&config.tls)?;
    match source.resolve().and_then(|identity| identity.into_acceptor()) {
        Ok(acceptor) => Some(acceptor),
        Err(e) => {
            warn!("TLS identity unavailable, serving plaintext instead: {e}");
            None
        }
    }
}

/// Binds the first candidate port that is not in use.
fn bind_candidates(
    host: IpAddr,
    ports: &[u16],
    backlog: u32,
) -> Result<(TcpListener, SocketAddr), EngineError> {
    for &port in ports {
        let addr = SocketAddr::new(host, port);
        debug!("binding {addr}");
        match bind_listener(addr, backlog) {
            Ok(listener) => return Ok((listener, addr)),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!("{addr} is in use, trying next candidate port");
            }
            Err(source) => return Err(EngineError::Bind { addr, source }),
        }
    }
    Err(EngineError::PortsExhausted {
        ports: ports.to_vec(),
    })
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

// ── Accept path ───────────────────────────────────────────────────────────────

/// Everything a freshly accepted connection needs.
#[derive(Clone)]
struct AcceptContext {
    acceptor: Option<TlsAcceptor>,
    negotiator: Arc<UpgradeNegotiator>,
    hub: Arc<ConnectionHub>,
    settings: ConnectionSettings,
    handshake_timeout: Duration,
}

async fn accept_loop(
    listener: TcpListener,
    context: AcceptContext,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let (stream, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };
        debug!("accepted TCP connection from {peer}");
        tracker.spawn(handle_accepted(
            stream,
            peer,
            context.clone(),
            shutdown.clone(),
        ));
    }
    debug!("accept loop exited; releasing listener");
}

async fn handle_accepted(
    stream: TcpStream,
    peer: SocketAddr,
    context: AcceptContext,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("{peer}: failed to set TCP_NODELAY: {e}");
    }

    let Some(acceptor) = context.acceptor.clone() else {
        return negotiate_and_serve(stream, peer, context, shutdown).await;
    };

    let handshake = tokio::select! {
        () = shutdown.cancelled() => return,
        result = timeout(context.handshake_timeout, acceptor.accept(stream)) => result,
    };
    match handshake {
        Ok(Ok(tls)) => negotiate_and_serve(tls, peer, context, shutdown).await,
        Ok(Err(e)) => debug!("{peer}: TLS handshake failed: {e}"),
        Err(_) => debug!("{peer}: TLS handshake timed out"),
    }
}

async fn negotiate_and_serve<S>(
    mut stream: S,
    peer: SocketAddr,
    context: AcceptContext,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let negotiated = tokio::select! {
        () = shutdown.cancelled() => return,
        result = timeout(context.handshake_timeout, context.negotiator.negotiate(&mut stream)) => result,
    };

    match negotiated {
        Ok(Ok(NegotiateOutcome::Upgraded { leftover })) => {
            debug!("{peer}: upgraded to WebSocket");
            serve_connection(
                stream,
                SessionId::from(peer),
                leftover,
                context.hub,
                context.settings,
                shutdown,
            )
            .await;
        }
        Ok(Ok(NegotiateOutcome::PageServed)) => {
            info!("{peer}: served info page");
            finish_http(stream, peer).await;
        }
        Ok(Ok(NegotiateOutcome::MethodNotAllowed)) => {
            info!("{peer}: answered 405");
            finish_http(stream, peer).await;
        }
        Ok(Ok(NegotiateOutcome::BadRequest(reason))) => {
            info!("{peer}: answered 400 ({reason})");
            finish_http(stream, peer).await;
        }
        Ok(Err(e)) => debug!("{peer}: HTTP negotiation ended: {e}"),
        Err(_) => debug!("{peer}: request head not received in time"),
    }
}

async fn finish_http<S>(mut stream: S, peer: SocketAddr)
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = stream.shutdown().await {
        debug!("{peer}: shutdown after HTTP response failed: {e}");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
