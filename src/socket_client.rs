//! Reconnecting client for one MOS port.
//!
//! A [`MosSocketClient`] owns the TCP connection to one port role of a peer.
//! Commands are written in submission order and tracked in a
//! [`CommandQueue`] until their reply arrives, their deadline passes or the
//! client is disposed. Commands queued while the socket is down are written
//! as soon as it comes up. Documents that match no pending command are
//! published as [`ClientEvent::RawMessage`].

use crate::command_queue::{CommandQueue, HandedOverQueue, QueuedCommand, Responder};
use crate::config::ConnectionOptions;
use crate::error::{MosError, Result};
use crate::message::{MessageId, MosMessage, ParsedMosMessage, PortType};
use crate::protocol::{self, MosParser, WireEncoding};
use crate::transport::{self, ChunkReader, DocumentWriter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Capacity of the per-client event channel.
const EVENT_CAPACITY: usize = 256;

/// Lifecycle of a socket client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal.
    Disposed,
}

/// Notifications published by a socket client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The TCP connection is up.
    Connected,
    /// An established TCP connection went down.
    Disconnected,
    /// A document that matched no pending command.
    RawMessage { message_type: String, text: String },
    /// Non-fatal problem, e.g. a failed connect attempt.
    Warning(String),
    /// Error that affected no single command, e.g. an unparseable document.
    Error(Arc<MosError>),
}

/// A command waiting for the writer.
#[derive(Debug)]
struct Outgoing {
    id: MessageId,
    xml: String,
}

/// Shared state for a socket client.
struct ClientShared {
    host: String,
    port: u16,
    port_type: PortType,
    command_timeout: Duration,
    connect_timeout: Duration,
    max_message_size: usize,
    wire_encoding: WireEncoding,
    reconnect_interval_ms: AtomicU64,
    debug: AtomicBool,
    /// Commands awaiting a reply.
    queue: Mutex<CommandQueue>,
    /// Wakes the deadline sweeper when the queue changes.
    queue_changed: Notify,
    /// Write order is the order commands enter this channel. Survives reconnects.
    outbox_tx: mpsc::UnboundedSender<Outgoing>,
    outbox_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>,
    state: watch::Sender<SocketState>,
    events: broadcast::Sender<ClientEvent>,
    sweeper_started: AtomicBool,
    disposed: AtomicBool,
    cancel: CancellationToken,
}

impl ClientShared {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn warn(&self, message: String) {
        tracing::warn!(port = %self.port_type, "{}", message);
        self.emit(ClientEvent::Warning(message));
    }

    /// Move to `state` unless the client is already disposed.
    fn set_state(&self, state: SocketState) {
        self.state.send_if_modified(|current| {
            if *current == SocketState::Disposed || *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject everything still pending with a disposed error.
    async fn reject_pending(&self) {
        let pending = self.queue.lock().await.drain();
        for command in pending {
            command.reject(MosError::Disposed);
        }
    }

    /// Keep the socket connected until disposed, reconnecting after failures.
    async fn run(self: Arc<Self>, mut outbox: mpsc::UnboundedReceiver<Outgoing>) {
        let address = self.address();
        loop {
            if self.is_disposed() {
                break;
            }
            self.set_state(SocketState::Connecting);
            tracing::debug!(port = %self.port_type, "Connecting to {}", address);

            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                attempt = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address.as_str())) => attempt,
            };

            match attempt {
                Ok(Ok(stream)) => {
                    tracing::info!(port = %self.port_type, "Connected to {}", address);
                    self.set_state(SocketState::Connected);
                    self.emit(ClientEvent::Connected);

                    let (writer, reader) = transport::split(stream, self.wire_encoding);
                    let outcome = self.serve(writer, reader, &mut outbox).await;
                    if self.is_disposed() {
                        break;
                    }

                    self.set_state(SocketState::Disconnected);
                    self.emit(ClientEvent::Disconnected);
                    match outcome {
                        Err(MosError::ConnectionClosed) => {
                            self.warn(format!("Socket {} closed by peer", address))
                        }
                        Err(e) => self.warn(format!("Socket {} failed: {}", address, e)),
                        Ok(()) => {}
                    }
                }
                Ok(Err(e)) => {
                    self.set_state(SocketState::Disconnected);
                    self.warn(format!("Failed to connect to {}: {}", address, e));
                }
                Err(_) => {
                    self.set_state(SocketState::Disconnected);
                    self.warn(format!(
                        "Connecting to {} timed out after {} ms",
                        address,
                        self.connect_timeout.as_millis()
                    ));
                }
            }

            let interval = Duration::from_millis(self.reconnect_interval_ms.load(Ordering::Relaxed));
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        if self.state.send_replace(SocketState::Disposed) == SocketState::Connected {
            self.emit(ClientEvent::Disconnected);
        }
        tracing::debug!(port = %self.port_type, "Connection task for {} stopped", address);
    }

    /// Pump one established connection until it closes or the client is disposed.
    async fn serve(
        &self,
        mut writer: DocumentWriter,
        mut reader: ChunkReader,
        outbox: &mut mpsc::UnboundedReceiver<Outgoing>,
    ) -> Result<()> {
        let mut parser = MosParser::with_max_size(self.max_message_size);

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                outgoing = outbox.recv() => {
                    let Some(outgoing) = outgoing else { break Ok(()) };
                    if !self.queue.lock().await.mark_sent(outgoing.id, Instant::now()) {
                        // Timed out or handed over while waiting in the outbox.
                        tracing::debug!(port = %self.port_type, "Skipping command {}, no longer pending", outgoing.id);
                        continue;
                    }
                    if let Err(e) = writer.write_document(&outgoing.xml).await {
                        tracing::error!(port = %self.port_type, "Send error: {}", e);
                        if let Some(command) = self.queue.lock().await.take(outgoing.id) {
                            command.reject(MosError::ConnectionClosed);
                        }
                        break Err(e);
                    }
                    if self.is_debug() {
                        tracing::debug!(port = %self.port_type, "Sent command {}", outgoing.id);
                    }
                }
                chunk = reader.read_chunk() => match chunk {
                    Ok(Some(data)) => self.handle_data(&mut parser, &data).await,
                    Ok(None) => break Err(MosError::ConnectionClosed),
                    Err(e) => {
                        tracing::error!(port = %self.port_type, "Receive error: {}", e);
                        break Err(e);
                    }
                },
            }
        };

        if let Some(fragment) = parser.finish() {
            self.warn(format!("Discarding unterminated message fragment: {}", fragment));
        }
        outcome
    }

    async fn handle_data(&self, parser: &mut MosParser, data: &[u8]) {
        if let Err(e) = parser.push(data) {
            tracing::warn!(port = %self.port_type, "Parse error: {}", e);
            self.emit(ClientEvent::Error(Arc::new(MosError::Parse(e))));
        }
        while let Some(document) = parser.next_document() {
            self.dispatch(document).await;
        }
    }

    /// Route one inbound document to its pending command, or publish it.
    async fn dispatch(&self, document: String) {
        if self.is_debug() {
            tracing::debug!(port = %self.port_type, "Received: {}", document);
        }

        let message = match protocol::decode_message(&document) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(port = %self.port_type, "Dropping unparseable message: {}", e);
                self.emit(ClientEvent::Error(Arc::new(MosError::Parse(e))));
                return;
            }
        };

        if let Some(id) = message.message_id {
            let command = self.queue.lock().await.take(id);
            if let Some(command) = command {
                if !command.resolve(Ok(message)) {
                    tracing::debug!(port = %self.port_type, "Reply {} arrived after its caller went away", id);
                }
                self.queue_changed.notify_one();
                return;
            }
        }

        self.emit(ClientEvent::RawMessage {
            message_type: message.body_tag,
            text: document,
        });
    }

    /// Reject commands as their deadlines pass.
    async fn sweep_deadlines(self: Arc<Self>) {
        loop {
            let next = self.queue.lock().await.next_deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.queue_changed.notified() => {}
                _ = sleep_until(next) => {
                    if self.is_disposed() {
                        break;
                    }
                    let expired = self.queue.lock().await.take_expired(Instant::now());
                    for command in expired {
                        tracing::warn!(port = %self.port_type, "Command {} timed out", command.message_id());
                        command.expire();
                    }
                }
            }
        }
        self.reject_pending().await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Client for one port of a MOS peer.
///
/// Cloning yields another handle to the same client. Dropping the last handle
/// closes the socket and rejects pending commands like [`dispose`](Self::dispose),
/// without the `Disconnected` event being guaranteed to precede it. Must be
/// used from within a Tokio runtime.
#[derive(Clone)]
pub struct MosSocketClient {
    shared: Arc<ClientShared>,
    /// Held by handles only, never by the client's tasks.
    _cancel_on_drop: Arc<DropGuard>,
}

impl MosSocketClient {
    /// Create a client for `host:port`. Nothing happens on the network until
    /// [`connect`](Self::connect) is called.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        port_type: PortType,
        options: &ConnectionOptions,
    ) -> Self {
        Self::with_cancel(host, port, port_type, options, CancellationToken::new())
    }

    /// Create a client whose tasks also stop when `cancel` fires.
    pub(crate) fn with_cancel(
        host: impl Into<String>,
        port: u16,
        port_type: PortType,
        options: &ConnectionOptions,
        cancel: CancellationToken,
    ) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(SocketState::Disconnected);

        Self {
            _cancel_on_drop: Arc::new(cancel.clone().drop_guard()),
            shared: Arc::new(ClientShared {
                host: host.into(),
                port,
                port_type,
                command_timeout: options.command_timeout(),
                connect_timeout: options.connect_timeout(),
                max_message_size: options.max_message_size,
                wire_encoding: options.wire_encoding,
                reconnect_interval_ms: AtomicU64::new(options.auto_reconnect_interval_ms),
                debug: AtomicBool::new(options.debug),
                queue: Mutex::new(CommandQueue::new()),
                queue_changed: Notify::new(),
                outbox_tx,
                outbox_rx: std::sync::Mutex::new(Some(outbox_rx)),
                state,
                events,
                sweeper_started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                cancel,
            }),
        }
    }

    /// Start connecting. Failed or dropped connections are retried every
    /// auto-reconnect interval until the client is disposed. Calling this
    /// again while the connection task runs does nothing.
    pub fn connect(&self) {
        if self.shared.is_disposed() {
            tracing::debug!(port = %self.shared.port_type, "connect() on a disposed client");
            return;
        }
        let outbox = self
            .shared
            .outbox_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(outbox) = outbox else {
            return;
        };
        tokio::spawn(Arc::clone(&self.shared).run(outbox));
        self.ensure_sweeper();
    }

    fn ensure_sweeper(&self) {
        if !self.shared.sweeper_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(Arc::clone(&self.shared).sweep_deadlines());
        }
    }

    /// Queue `message` and wait for its reply.
    pub async fn execute_command(&self, message: MosMessage) -> Result<ParsedMosMessage> {
        let (responder, reply) = Responder::channel();
        self.queue_command(message, responder).await;
        reply.await
    }

    /// Queue `message` for sending. The outcome (reply, timeout, disposal or a
    /// duplicate-ID error) is delivered through `responder`, exactly once.
    ///
    /// A message without an ID gets one here; a message that already carries
    /// one keeps it.
    pub async fn queue_command(&self, message: MosMessage, responder: Responder) {
        if self.shared.is_disposed() {
            responder.reject(MosError::Disposed);
            return;
        }

        let command = QueuedCommand::new(message, self.shared.command_timeout, responder);
        let id = command.message_id();
        let xml = command.message.to_xml();
        if self.shared.is_debug() {
            tracing::debug!(port = %self.shared.port_type, "Queueing command {}: {}", id, xml);
        }

        {
            let mut queue = self.shared.queue.lock().await;
            if self.shared.is_disposed() {
                command.reject(MosError::Disposed);
                return;
            }
            if let Err(command) = queue.push(command) {
                command.reject(MosError::DuplicateMessageId(id));
                return;
            }
            if self.shared.outbox_tx.send(Outgoing { id, xml }).is_err() {
                if let Some(command) = queue.take(id) {
                    command.reject(MosError::Disposed);
                }
                return;
            }
        }

        self.shared.queue_changed.notify_one();
        self.ensure_sweeper();
    }

    /// Take every pending command out of this client without resolving any.
    /// Commands not yet written are not written.
    pub async fn hand_over_queue(&self) -> HandedOverQueue {
        let snapshot = self.shared.queue.lock().await.hand_over();
        self.shared.queue_changed.notify_one();
        tracing::debug!(port = %self.shared.port_type, "Handed over {} commands", snapshot.len());
        snapshot
    }

    /// Close the socket, stop all timers and reject every pending command with
    /// [`MosError::Disposed`]. Idempotent.
    pub async fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let previous = self.shared.state.send_replace(SocketState::Disposed);
        self.shared.cancel.cancel();
        self.shared.reject_pending().await;
        if previous == SocketState::Connected {
            self.shared.emit(ClientEvent::Disconnected);
        }
        tracing::debug!(port = %self.shared.port_type, "Disposed client for {}", self.shared.address());
    }

    /// Subscribe to this client's events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SocketState> {
        self.shared.state.subscribe()
    }

    pub fn state(&self) -> SocketState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SocketState::Connected
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Number of commands awaiting a reply.
    pub async fn pending_count(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    pub fn set_debug(&self, debug: bool) {
        self.shared.debug.store(debug, Ordering::Relaxed);
    }

    /// Delay before the next reconnect attempt.
    pub fn set_auto_reconnect_interval(&self, interval: Duration) {
        self.shared
            .reconnect_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn host(&self) -> &str {
        &self.shared.host
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn port_type(&self) -> PortType {
        self.shared.port_type
    }
}

impl std::fmt::Debug for MosSocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MosSocketClient")
            .field("address", &self.shared.address())
            .field("port_type", &self.shared.port_type)
            .field("state", &self.state())
            .finish()
    }
}
