//! Per-connection task: drives a [`FrameSession`] over an upgraded transport.
//!
//! Each upgraded connection gets one Tokio task running [`serve_connection`].
//! The task owns the socket and is the only writer to it, so frames for one
//! connection never interleave at the byte level.  Other parts of the engine
//! talk to it through a cloneable [`ConnectionHandle`]:
//!
//! ```text
//!   ServerEngine::send ──▶ ConnectionHandle ──mpsc──▶ ┐
//!                                                     │  select! {
//!   socket bytes ───────────────────────────────────▶ ├─   read, outbound,
//!   engine stop / eviction ──CancellationToken──────▶ ┘    cancellation }
//!                                                     │
//!                                                     └─▶ ConnectionHub::emit
//! ```
//!
//! The task registers itself in the [`ConnectionRegistry`] on entry and
//! removes itself on exit, emitting `Connected` first and exactly one
//! terminal event (`Disconnected` or `ClosedWithCode`) last.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wsdock_core::{CloseCode, CloseReason, FrameSession, Message, SessionAction};

use crate::application::{ConnectionRegistry, LiveTransport, NotificationBus};
use crate::domain::{InboundEvent, SessionId};

const READ_CHUNK: usize = 16 * 1024;

/// Messages queued for one connection's writer before further sends are
/// dropped.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

// ── Shared state ──────────────────────────────────────────────────────────────

/// State shared by the engine and every connection task.
#[derive(Debug)]
pub struct ConnectionHub {
    pub registry: ConnectionRegistry<ConnectionHandle>,
    pub notifications: NotificationBus,
    events: broadcast::Sender<InboundEvent>,
}

impl ConnectionHub {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            registry: ConnectionRegistry::new(),
            notifications: NotificationBus::new(event_capacity),
            events,
        }
    }

    /// Raw stream of every [`InboundEvent`], binary payloads included.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.events.subscribe()
    }

    /// Publishes `event` to the notification bus and the raw event stream.
    pub fn emit(&self, event: InboundEvent) {
        self.notifications.publish(&event);
        // An error only means nobody is subscribed right now.
        let _ = self.events.send(event);
    }
}

/// Timing and size limits for one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub max_frame_size: usize,
    /// Bound on writing the final close frame and shutting the socket down.
    pub close_timeout: Duration,
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap, cloneable reference to a live connection task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: SessionId,
    connection_no: u64,
    outbound: mpsc::Sender<Message>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Queues `message` for the connection's writer.  Returns `false` if the
    /// task has already finished or its queue is full; the message is dropped.
    pub fn send(&self, message: Message) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("session {}: outbound queue full, dropping message", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Asks the task to send a going-away close frame and end.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl LiveTransport for ConnectionHandle {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

// ── Connection task ───────────────────────────────────────────────────────────

/// Runs one upgraded connection to completion.
///
/// `leftover` holds frame bytes the client pipelined behind its upgrade
/// request.  `shutdown` is the engine's stop token; the connection derives
/// its own child token from it.
pub async fn serve_connection<S>(
    stream: S,
    id: SessionId,
    leftover: Vec<u8>,
    hub: Arc<ConnectionHub>,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let connection_no = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
    let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let open = Arc::new(AtomicBool::new(true));
    let cancel = shutdown.child_token();
    let handle = ConnectionHandle {
        id: id.clone(),
        connection_no,
        outbound,
        open: Arc::clone(&open),
        cancel: cancel.clone(),
    };

    if let Some(stale) = hub.registry.register(id.clone(), handle) {
        // The same peer address is still registered from an earlier socket.
        debug!("session {id}: replacing stale registration");
        stale.close();
    }
    info!("session {id}: connected");
    hub.emit(InboundEvent::Connected(id.clone()));

    let session = FrameSession::new(settings.max_frame_size);
    let terminal = drive(stream, &id, session, rx, leftover, &hub, settings, &cancel).await;

    open.store(false, Ordering::Release);
    hub.registry
        .unregister_if(&id, |h| h.connection_no == connection_no);
    info!("session {id}: closed ({terminal:?})");
    hub.emit(terminal);
}

#[allow(clippy::too_many_arguments)]
async fn drive<S>(
    stream: S,
    id: &SessionId,
    mut session: FrameSession,
    mut rx: mpsc::Receiver<Message>,
    leftover: Vec<u8>,
    hub: &ConnectionHub,
    settings: ConnectionSettings,
    cancel: &CancellationToken,
) -> InboundEvent
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; READ_CHUNK];

    session.receive(&leftover);
    let early = process_actions(&mut session, &mut writer, id, hub, settings).await;

    let terminal = match early {
        Some(terminal) => terminal,
        None => loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    break close_for_shutdown(&mut session, &mut rx, &mut writer, id, settings).await;
                }

                queued = rx.recv() => match queued {
                    Some(message) => {
                        if let Err(e) = send_message(&session, &mut writer, &message).await {
                            debug!("session {id}: write failed: {e}");
                            break InboundEvent::Disconnected(id.clone());
                        }
                    }
                    // Every handle is gone: the registry evicted this session.
                    None => {
                        break close_for_shutdown(&mut session, &mut rx, &mut writer, id, settings).await;
                    }
                },

                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("session {id}: peer closed the transport");
                        break InboundEvent::Disconnected(id.clone());
                    }
                    Ok(n) => {
                        session.receive(&buf[..n]);
                        if let Some(terminal) =
                            process_actions(&mut session, &mut writer, id, hub, settings).await
                        {
                            break terminal;
                        }
                    }
                    Err(e) => {
                        debug!("session {id}: read failed: {e}");
                        break InboundEvent::Disconnected(id.clone());
                    }
                },
            }
        },
    };

    if timeout(settings.close_timeout, writer.shutdown()).await.is_err() {
        debug!("session {id}: shutdown timed out");
    }
    terminal
}

/// Executes every action the session has ready.  Returns the terminal event
/// once the session finishes.
async fn process_actions<W>(
    session: &mut FrameSession,
    writer: &mut W,
    id: &SessionId,
    hub: &ConnectionHub,
    settings: ConnectionSettings,
) -> Option<InboundEvent>
where
    W: AsyncWrite + Unpin,
{
    while let Some(action) = session.next_action() {
        match action {
            SessionAction::Deliver(Message::Text(text)) => {
                hub.emit(InboundEvent::TextReceived {
                    id: id.clone(),
                    text,
                });
            }
            SessionAction::Deliver(Message::Binary(data)) => {
                hub.emit(InboundEvent::BinaryReceived {
                    id: id.clone(),
                    data,
                });
            }
            SessionAction::Reply(bytes) => {
                if let Err(e) = write_all_flush(writer, &bytes).await {
                    debug!("session {id}: pong write failed: {e}");
                    return Some(InboundEvent::Disconnected(id.clone()));
                }
            }
            SessionAction::Close { reply, reason } => {
                if let Some(bytes) = reply {
                    write_final(writer, &bytes, id, settings).await;
                }
                return Some(match reason {
                    CloseReason::Violation(code) => {
                        warn!("session {id}: protocol violation, closing with {code}");
                        InboundEvent::ClosedWithCode {
                            id: id.clone(),
                            code,
                        }
                    }
                    CloseReason::PeerClosed(code) => {
                        debug!("session {id}: peer closed with {code:?}");
                        InboundEvent::Disconnected(id.clone())
                    }
                    CloseReason::Acknowledged => InboundEvent::Disconnected(id.clone()),
                });
            }
        }
    }
    None
}

/// Best-effort flush of queued sends, then a going-away close frame.
async fn close_for_shutdown<W>(
    session: &mut FrameSession,
    rx: &mut mpsc::Receiver<Message>,
    writer: &mut W,
    id: &SessionId,
    settings: ConnectionSettings,
) -> InboundEvent
where
    W: AsyncWrite + Unpin,
{
    while let Ok(message) = rx.try_recv() {
        if send_message(session, writer, &message).await.is_err() {
            return InboundEvent::Disconnected(id.clone());
        }
    }
    if let Some(bytes) = session.initiate_close(CloseCode::Away, "server stopping") {
        write_final(writer, &bytes, id, settings).await;
    }
    InboundEvent::Disconnected(id.clone())
}

async fn send_message<W>(
    session: &FrameSession,
    writer: &mut W,
    message: &Message,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match session.encode_message(message) {
        Some(bytes) => write_all_flush(writer, &bytes).await,
        // A close frame is already out; late sends are dropped.
        None => Ok(()),
    }
}

async fn write_final<W>(writer: &mut W, bytes: &[u8], id: &SessionId, settings: ConnectionSettings)
where
    W: AsyncWrite + Unpin,
{
    match timeout(settings.close_timeout, write_all_flush(writer, bytes)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("session {id}: close frame write failed: {e}"),
        Err(_) => debug!("session {id}: close frame write timed out"),
    }
}

async fn write_all_flush<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

// ── Tests ─────────────────────────────────────────────────────────────────────
