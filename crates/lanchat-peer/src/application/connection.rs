//! Connection use case: one authenticated chat link to one peer.
//!
//! A [`Connection`] behaves the same whether it dialled out
//! ([`Connection::outbound`]) or wraps an accepted stream
//! ([`Connection::inbound`]).  Both constructors move straight to
//! `Preparing`; a background driver task then runs the handshake, the
//! receive loop and the outgoing queue.
//!
//! ```text
//! Idle ──► Preparing ──► Ready ──► Failed
//!             │            │         │
//!             └────────────┴─────────┴──► Cancelled   (cancel())
//! ```
//!
//! Observer callbacks are delivered on a separate dispatcher task, one at a
//! time and in transition order.  After `Cancelled` nothing more is
//! delivered.
//!
//! Once `Ready`, outgoing frames are written by their own task, so a peer
//! that is slow to read never stops us from reading.  `cancel()` queues a
//! close marker behind any pending frames; they are written before the
//! stream is shut down.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use lanchat_core::protocol::{encode_control, encode_message, Message, MessageKind, ProtocolError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::infrastructure::transport::{
    framed::MessageReader,
    secure::{self, Role, SecureChannel, SecureReader, SecureWriter},
    Connector, IncomingStream, PeerEndpoint, TransportError, TransportParameters,
};

/// Upper bound on flushing queued frames after `cancel()`.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a connection entered `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The transport failed and will not recover on its own.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The peer could not be reached right now; trying again later may work.
    #[error("peer not reachable yet: {0}")]
    TransportWaiting(String),

    /// The peer does not share our passcode.
    #[error("handshake authentication failed: {0}")]
    HandshakeAuthFailure(String),

    /// The handshake stalled.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The peer sent bytes that are not valid frames.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unreachable { .. } => ConnectionError::TransportWaiting(e.to_string()),
            TransportError::AuthenticationFailed | TransportError::UnknownIdentity => {
                ConnectionError::HandshakeAuthFailure(e.to_string())
            }
            TransportError::HandshakeTimeout(_) => ConnectionError::HandshakeTimeout,
            TransportError::Protocol(p) => ConnectionError::Protocol(p),
            other => ConnectionError::TransportFailure(other.to_string()),
        }
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Preparing,
    Ready,
    Failed(ConnectionError),
    Cancelled,
}

impl ConnectionState {
    fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Preparing)
                | (Preparing, Ready)
                | (Preparing, Failed(_))
                | (Ready, Failed(_))
                | (Idle | Preparing | Ready | Failed(_), Cancelled)
        )
    }

    /// `true` once nothing can be sent any more.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed(_) | ConnectionState::Cancelled)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => f.write_str("idle"),
            ConnectionState::Preparing => f.write_str("preparing"),
            ConnectionState::Ready => f.write_str("ready"),
            ConnectionState::Failed(e) => write!(f, "failed ({e})"),
            ConnectionState::Cancelled => f.write_str("cancelled"),
        }
    }
}

// ── Observer ──────────────────────────────────────────────────────────────────

/// Receives lifecycle and message notifications for one connection.
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionObserver: Send + Sync {
    fn connection_preparing(&self);
    fn connection_ready(&self);
    fn connection_failed(&self, error: &ConnectionError);
    fn connection_canceled(&self);
    /// A message arrived.  `payload` is `None` for control kinds.
    fn received(&self, payload: Option<String>, kind: MessageKind);
}

enum ObserverEvent {
    Preparing,
    Ready,
    Failed(ConnectionError),
    Cancelled,
    Received(Message),
}

impl ObserverEvent {
    fn for_state(state: &ConnectionState) -> Option<Self> {
        match state {
            ConnectionState::Idle => None,
            ConnectionState::Preparing => Some(ObserverEvent::Preparing),
            ConnectionState::Ready => Some(ObserverEvent::Ready),
            ConnectionState::Failed(e) => Some(ObserverEvent::Failed(e.clone())),
            ConnectionState::Cancelled => Some(ObserverEvent::Cancelled),
        }
    }
}

/// State shared by the handle, the driver and the dispatcher.
struct Shared {
    id: Uuid,
    state: Mutex<ConnectionState>,
    events: mpsc::UnboundedSender<ObserverEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies `next` if legal and queues its notification under the same
    /// lock, so notification order matches transition order.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.lock();
        if !state.can_transition_to(&next) {
            debug!("connection {}: ignoring {} -> {}", self.id, *state, next);
            return false;
        }
        info!("connection {}: {} -> {}", self.id, *state, next);
        if let Some(event) = ObserverEvent::for_state(&next) {
            let _ = self.events.send(event);
        }
        *state = next;
        true
    }

    /// Queues a received message if the connection is still `Ready`.
    fn deliver(&self, msg: Message) {
        let state = self.lock();
        if *state == ConnectionState::Ready {
            let _ = self.events.send(ObserverEvent::Received(msg));
        }
    }

    fn snapshot(&self) -> ConnectionState {
        self.lock().clone()
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

/// Handle to one chat link.
///
/// Dropping the handle cancels the connection.
pub struct Connection {
    shared: Arc<Shared>,
    name: Option<String>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Items consumed by the writer task, in submission order.
enum Outgoing {
    Frame(Vec<u8>),
    /// Flush everything queued before this, then shut the stream down.
    Close,
}

impl Connection {
    /// Dials `endpoint` and authenticates as the initiator.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn outbound(
        endpoint: PeerEndpoint,
        parameters: TransportParameters,
        connector: Arc<dyn Connector>,
        observer: Weak<dyn ConnectionObserver>,
    ) -> Self {
        let name = endpoint.service_name().map(str::to_string);
        let max_payload = parameters.max_payload;
        let establish = async move {
            let stream = connector.connect(&endpoint, &parameters).await?;
            secure::handshake(stream, Role::Initiator, &parameters).await
        };
        Self::start(name, observer, max_payload, establish)
    }

    /// Wraps an accepted stream and authenticates as the responder.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn inbound(incoming: IncomingStream, observer: Weak<dyn ConnectionObserver>) -> Self {
        let IncomingStream {
            stream,
            remote_addr,
            parameters,
        } = incoming;
        if let Some(addr) = remote_addr {
            debug!("inbound connection from {addr}");
        }
        let max_payload = parameters.max_payload;
        let establish =
            async move { secure::handshake(stream, Role::Responder, &parameters).await };
        Self::start(None, observer, max_payload, establish)
    }

    fn start<F>(
        name: Option<String>,
        observer: Weak<dyn ConnectionObserver>,
        max_payload: usize,
        establish: F,
    ) -> Self
    where
        F: Future<Output = Result<SecureChannel, TransportError>> + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            state: Mutex::new(ConnectionState::Idle),
            events: events_tx,
        });

        tokio::spawn(dispatch(observer, events_rx));
        shared.transition(ConnectionState::Preparing);
        let driver = tokio::spawn(drive(
            Arc::clone(&shared),
            establish,
            max_payload,
            outgoing_rx,
            shutdown_rx,
        ));

        Self {
            shared,
            name,
            outgoing: outgoing_tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Sends a text message.
    ///
    /// The frame is queued as one unit.  Queued frames go out once the
    /// connection is `Ready`; after `Failed` or `Cancelled` they are dropped.
    ///
    /// # Errors
    ///
    /// Only encoding can fail here ([`ProtocolError::PayloadTooLarge`]).
    /// Transmission failures arrive through the observer.
    pub fn send(&self, text: &str) -> Result<(), ProtocolError> {
        let frame = encode_message(&Message::text(text))?;
        self.enqueue(frame, MessageKind::Message);
        Ok(())
    }

    /// Sends a payload-less control signal (`Join`, `Leave` or `Cancel`).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::NotAControlKind`] for [`MessageKind::Message`].
    pub fn send_control(&self, kind: MessageKind) -> Result<(), ProtocolError> {
        let frame = encode_control(kind)?;
        self.enqueue(frame, kind);
        Ok(())
    }

    fn enqueue(&self, frame: Vec<u8>, kind: MessageKind) {
        let state = self.shared.snapshot();
        if state.is_terminal() {
            debug!("connection {}: dropping {kind:?}, state is {state}", self.shared.id);
            return;
        }
        if self.outgoing.send(Outgoing::Frame(frame)).is_err() {
            debug!("connection {}: driver gone, dropping {kind:?}", self.shared.id);
        }
    }

    /// Tears the connection down.  Idempotent.
    ///
    /// Frames sent before this call are still written, so a `Leave` or
    /// `Cancel` control signal sent just before reaches the peer.
    pub fn cancel(&self) {
        self.shared.transition(ConnectionState::Cancelled);
        let sender = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = sender {
            let _ = self.outgoing.send(Outgoing::Close);
            let _ = tx.send(());
        }
    }

    /// Waits until the background driver has stopped.  After `cancel()`
    /// this includes writing the frames queued before it.
    pub async fn wait_closed(&self) {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                debug!("connection {}: driver ended abnormally: {e}", self.shared.id);
            }
        }
    }

    /// The peer's advertised service name; `None` for address and inbound
    /// connections.
    pub fn name(&self) -> Option<String> {
        self.name.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.snapshot()
    }

    /// Identifier used in log lines.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

/// Delivers notifications to the observer one at a time.
async fn dispatch(
    observer: Weak<dyn ConnectionObserver>,
    mut events: mpsc::UnboundedReceiver<ObserverEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(target) = observer.upgrade() else {
            debug!("observer dropped; discarding notifications");
            break;
        };
        match event {
            ObserverEvent::Preparing => target.connection_preparing(),
            ObserverEvent::Ready => target.connection_ready(),
            ObserverEvent::Failed(e) => target.connection_failed(&e),
            ObserverEvent::Received(msg) => {
                let (payload, kind) = msg.into_parts();
                target.received(payload, kind);
            }
            ObserverEvent::Cancelled => {
                target.connection_canceled();
                break;
            }
        }
    }
}

/// Establishes the secure channel, then reads messages until the stream
/// ends, fails or the connection is cancelled.  Writing happens in
/// [`write_frames`].
async fn drive<F>(
    shared: Arc<Shared>,
    establish: F,
    max_payload: usize,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    mut shutdown: oneshot::Receiver<()>,
) where
    F: Future<Output = Result<SecureChannel, TransportError>> + Send + 'static,
{
    let channel = tokio::select! {
        biased;
        _ = &mut shutdown => return,
        result = establish => result,
    };

    let (reader, writer) = match channel {
        Ok(channel) => channel.into_split(),
        Err(e) => {
            warn!("connection {}: could not establish: {e}", shared.id);
            shared.transition(ConnectionState::Failed(e.into()));
            return;
        }
    };

    if !shared.transition(ConnectionState::Ready) {
        return;
    }

    let mut writer_task = tokio::spawn(write_frames(writer, outgoing));
    let mut reader = MessageReader::with_max_payload(reader, max_payload);
    let failure: ConnectionError = loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                finish_after_cancel(&shared, &mut reader, writer_task).await;
                return;
            }
            written = &mut writer_task => match written {
                // Close marker handled; the connection is already cancelled.
                Ok(Ok(())) => return,
                Ok(Err(e)) => break e.into(),
                Err(e) => break ConnectionError::TransportFailure(format!("writer task ended: {e}")),
            },
            result = reader.next_message() => match result {
                Ok(Some(msg)) => {
                    debug!("connection {}: received {:?}", shared.id, msg.kind());
                    shared.deliver(msg);
                }
                Ok(None) => break TransportError::Closed.into(),
                Err(e) => break e.into(),
            },
        }
    };

    writer_task.abort();
    warn!("connection {}: {failure}", shared.id);
    shared.transition(ConnectionState::Failed(failure));
}

/// Writes queued frames in order, one `write_sealed` per frame, until the
/// close marker arrives or every sender is gone.
async fn write_frames(
    mut writer: SecureWriter,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) -> Result<(), TransportError> {
    while let Some(item) = outgoing.recv().await {
        match item {
            Outgoing::Frame(frame) => writer.write_sealed(&frame).await?,
            Outgoing::Close => break,
        }
    }
    writer.shutdown().await
}

/// Lets the writer flush what was queued before `cancel()`.  Incoming
/// messages are still read, and dropped, so a peer blocked on writing to us
/// can drain our frames.
async fn finish_after_cancel(
    shared: &Shared,
    reader: &mut MessageReader<SecureReader>,
    mut writer_task: JoinHandle<Result<(), TransportError>>,
) {
    let flushed = tokio::time::timeout(CLOSE_GRACE, async {
        loop {
            tokio::select! {
                biased;
                written = &mut writer_task => {
                    if let Ok(Err(e)) = written {
                        debug!("connection {}: flush after cancel failed: {e}", shared.id);
                    }
                    return;
                }
                result = reader.next_message() => {
                    if !matches!(result, Ok(Some(_))) {
                        return;
                    }
                }
            }
        }
    })
    .await;

    if flushed.is_err() {
        debug!("connection {}: pending frames not flushed within {CLOSE_GRACE:?}", shared.id);
    }
    writer_task.abort();
}

// ── Tests ─────────────────────────────────────────────────────────────────────
