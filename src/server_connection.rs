//! Logical connection to one NCS.
//!
//! An [`NcsServerConnection`] groups the socket clients that talk to one peer,
//! keyed by port role. Commands are routed to the first client registered for
//! their role; any further clients on that role are standby. Liveness is
//! judged by a periodic heartbeat cycle rather than by raw TCP state.

use crate::command_queue::{HandedOverCommand, HandedOverQueue, Responder};
use crate::config::ConnectionOptions;
use crate::error::{MosError, Result};
use crate::heartbeat;
use crate::message::{MosMessage, ParsedMosMessage, PortType};
use crate::registry::{ClientDescription, ClientHandle, ClientRegistry};
use crate::socket_client::{ClientEvent, MosSocketClient};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

/// Notifications published by a server connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A document from the peer that answered no pending command.
    RawMessage { message_type: String, text: String },
    Warning(String),
    Error(Arc<MosError>),
    Info(String),
    /// The aggregate connected status may have changed.
    ConnectionChanged,
}

/// Aggregate liveness of a server connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connected: bool,
    /// `"Connected"`, or a diagnostic naming the first failing client.
    pub status: String,
}

impl ConnectionStatus {
    fn connected() -> Self {
        Self {
            connected: true,
            status: "Connected".to_string(),
        }
    }

    fn not_connected(status: impl Into<String>) -> Self {
        Self {
            connected: false,
            status: status.into(),
        }
    }
}

pub(crate) struct ServerInner {
    id: String,
    host: String,
    mos_id: String,
    options: ConnectionOptions,
    debug: AtomicBool,
    reconnect_interval_ms: AtomicU64,
    clients: RwLock<ClientRegistry>,
    /// Set by `connect()`, cleared by `dispose()`.
    connected: AtomicBool,
    disposed: AtomicBool,
    heartbeat_started: AtomicBool,
    /// Last connected value announced through `ConnectionChanged`.
    emitted_connected: Mutex<bool>,
    events: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Connection to one NCS over up to three port roles.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct NcsServerConnection {
    inner: Arc<ServerInner>,
}

impl NcsServerConnection {
    /// Create a connection to the NCS `id` at `host`, speaking as `mos_id`.
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        mos_id: impl Into<String>,
        options: ConnectionOptions,
    ) -> Result<Self> {
        options.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(ServerInner {
                id: id.into(),
                host: host.into(),
                mos_id: mos_id.into(),
                debug: AtomicBool::new(options.debug),
                reconnect_interval_ms: AtomicU64::new(options.auto_reconnect_interval_ms),
                options,
                clients: RwLock::new(ClientRegistry::new()),
                connected: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                heartbeat_started: AtomicBool::new(false),
                emitted_connected: Mutex::new(false),
                events,
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> Weak<ServerInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<ServerInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub(crate) fn heartbeat_period(&self) -> Duration {
        self.inner.options.heartbeat_period()
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.inner.events.send(event);
    }

    fn emit_error(&self, error: MosError) {
        self.emit(ConnectionEvent::Error(Arc::new(error)));
    }

    /// Register a socket client for `port_type` at `port` on this connection's
    /// host. A client already registered under `client_id` is disposed and
    /// replaced.
    pub async fn create_client(
        &self,
        client_id: impl Into<String>,
        port: u16,
        port_type: PortType,
        use_heartbeats: bool,
    ) -> Result<ClientHandle> {
        if self.is_disposed() {
            return Err(MosError::Disposed);
        }
        let client_id = client_id.into();

        let options = ConnectionOptions {
            debug: self.inner.debug.load(Ordering::Relaxed),
            auto_reconnect_interval_ms: self.inner.reconnect_interval_ms.load(Ordering::Relaxed),
            ..self.inner.options.clone()
        };
        let client = MosSocketClient::with_cancel(
            self.inner.host.clone(),
            port,
            port_type,
            &options,
            self.inner.cancel.child_token(),
        );
        self.forward_events(client_id.clone(), client.subscribe());

        let (handle, replaced) = {
            let mut clients = self.inner.clients.write().await;
            let replaced = clients.find(&client_id).and_then(|h| clients.remove(h));
            let handle = clients.insert(ClientDescription::new(
                client_id.clone(),
                port_type,
                client,
                use_heartbeats,
            ));
            (handle, replaced)
        };
        if let Some(old) = replaced {
            tracing::warn!(connection = %self.inner.id, "Replacing client {}", client_id);
            old.client.dispose().await;
        }
        tracing::debug!(
            connection = %self.inner.id,
            "Registered client {} on {} port {}",
            client_id,
            port_type,
            port
        );
        Ok(handle)
    }

    /// Republish a client's events on this connection.
    fn forward_events(&self, client_id: String, mut events: broadcast::Receiver<ClientEvent>) {
        let sink = self.inner.events.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                let forwarded = match event {
                    Ok(ClientEvent::RawMessage { message_type, text }) => {
                        ConnectionEvent::RawMessage { message_type, text }
                    }
                    Ok(ClientEvent::Warning(warning)) => {
                        ConnectionEvent::Warning(format!("MosSocketClient: {}", warning))
                    }
                    Ok(ClientEvent::Error(error)) => {
                        ConnectionEvent::Error(Arc::new(MosError::SocketClient(error)))
                    }
                    // Socket close is reported at once, not at the next heartbeat.
                    Ok(ClientEvent::Disconnected) => ConnectionEvent::ConnectionChanged,
                    Ok(ClientEvent::Connected) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Client {} dropped {} events", client_id, skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let _ = sink.send(forwarded);
            }
        });
    }

    /// Dispose and deregister a client. Returns `false` if no client has that ID.
    pub async fn remove_client(&self, client_id: &str) -> bool {
        let removed = {
            let mut clients = self.inner.clients.write().await;
            clients.find(client_id).and_then(|h| clients.remove(h))
        };
        match removed {
            Some(description) => {
                description.client.dispose().await;
                true
            }
            None => false,
        }
    }

    /// Connect every registered client and start the heartbeat cycle.
    pub async fn connect(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(MosError::Disposed);
        }
        {
            let clients = self.inner.clients.read().await;
            if clients.is_empty() {
                tracing::warn!(connection = %self.inner.id, "Connecting without any registered clients");
            }
            for (_, description) in clients.iter() {
                let message = format!(
                    "Connect client {} on {} on host {} ({})",
                    description.client_id,
                    description.port_type,
                    self.inner.host,
                    description.client.port()
                );
                tracing::debug!(connection = %self.inner.id, "{}", message);
                self.emit(ConnectionEvent::Info(message));
                description.client.connect();
            }
        }
        self.inner.connected.store(true, Ordering::SeqCst);

        if !self.inner.heartbeat_started.swap(true, Ordering::SeqCst) {
            heartbeat::spawn(self);
        }
        Ok(())
    }

    /// The client commands for `port_type` currently go to.
    async fn route(&self, port_type: PortType) -> Result<MosSocketClient> {
        if self.is_disposed() {
            return Err(MosError::Disposed);
        }
        let clients = self.inner.clients.read().await;
        clients
            .primary(port_type)
            .map(|d| d.client.clone())
            .ok_or(MosError::NoClients(port_type))
    }

    fn stamp(&self, message: &mut MosMessage) {
        message.mos_id = self.inner.mos_id.clone();
        message.ncs_id = self.inner.id.clone();
    }

    /// Send `message` on the client for its port role and wait for the reply.
    ///
    /// The message is stamped with this connection's `mosID` and `ncsID`.
    /// Fails at once, without any I/O, if no client is registered for the role.
    pub async fn execute_command(&self, mut message: MosMessage) -> Result<ParsedMosMessage> {
        let client = self.route(message.port).await?;
        self.stamp(&mut message);
        client.execute_command(message).await
    }

    /// Like [`execute_command`](Self::execute_command), but the outcome goes to
    /// an existing responder.
    async fn submit(&self, mut message: MosMessage, responder: Responder) {
        match self.route(message.port).await {
            Ok(client) => {
                self.stamp(&mut message);
                client.queue_command(message, responder).await;
            }
            Err(e) => {
                responder.reject(e);
            }
        }
    }

    /// Aggregate liveness. Connected iff `connect()` has been called, the
    /// connection is not disposed, every heartbeat-enabled client answered its
    /// last heartbeat and every other client has its socket up.
    pub async fn get_connected_status(&self) -> ConnectionStatus {
        if !self.inner.connected.load(Ordering::SeqCst) || self.is_disposed() {
            return ConnectionStatus::not_connected("Not connected");
        }
        let clients = self.inner.clients.read().await;
        for (_, description) in clients.iter() {
            if description.use_heartbeats && !description.heartbeat_connected {
                return ConnectionStatus::not_connected(format!(
                    "No heartbeats on port {} (client {})",
                    description.port_type, description.client_id
                ));
            }
            if !description.use_heartbeats && !description.client.is_connected() {
                return ConnectionStatus::not_connected(format!(
                    "Socket not connected on port {} (client {})",
                    description.port_type, description.client_id
                ));
            }
        }
        ConnectionStatus::connected()
    }

    pub async fn connected(&self) -> bool {
        self.get_connected_status().await.connected
    }

    /// Move every pending command of every client to `other`, which sends
    /// them again and settles the original callers.
    pub async fn hand_over_queue(&self, other: &NcsServerConnection) {
        tracing::debug!(
            connection = %self.inner.id,
            "Handing over queue to {} ({})",
            other.inner.id,
            other.inner.host
        );
        let clients: Vec<(String, MosSocketClient)> = {
            let clients = self.inner.clients.read().await;
            clients
                .iter()
                .map(|(_, d)| (d.client_id.clone(), d.client.clone()))
                .collect()
        };
        let mut queues = Vec::with_capacity(clients.len());
        for (client_id, client) in clients {
            queues.push((client_id, client.hand_over_queue().await));
        }
        other.receive_queue(queues).await;
    }

    /// Send handed-over commands again through this connection. Each original
    /// caller is settled with the new outcome. Commands from one client keep
    /// their order.
    pub async fn receive_queue(&self, queues: Vec<(String, HandedOverQueue)>) {
        for (client_id, queue) in queues {
            if !queue.is_empty() {
                tracing::debug!(
                    connection = %self.inner.id,
                    "Receiving {} commands from client {}",
                    queue.len(),
                    client_id
                );
            }
            for HandedOverCommand { message, responder } in queue {
                self.submit(message, responder).await;
            }
        }
    }

    /// Dispose every client, stop the heartbeat cycle and mark the connection
    /// disconnected. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        let clients = self.inner.clients.write().await.drain();
        for description in clients {
            description.client.dispose().await;
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        tracing::debug!(connection = %self.inner.id, "Disposed");
        self.emit(ConnectionEvent::ConnectionChanged);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Clients the heartbeat cycle probes.
    pub(crate) async fn heartbeat_targets(&self) -> Vec<(ClientHandle, PortType)> {
        let clients = self.inner.clients.read().await;
        clients
            .iter()
            .filter(|(_, d)| d.use_heartbeats)
            .map(|(handle, d)| (handle, d.port_type))
            .collect()
    }

    /// Store one cycle's heartbeat outcomes.
    pub(crate) async fn record_heartbeats(
        &self,
        outcomes: Vec<(ClientHandle, PortType, Result<ParsedMosMessage>)>,
    ) {
        let mut clients = self.inner.clients.write().await;
        for (handle, port, outcome) in outcomes {
            let alive = match outcome {
                Ok(_) => true,
                Err(e) => {
                    tracing::debug!(connection = %self.inner.id, "Heartbeat on {}: {}", port, e);
                    self.emit_error(MosError::Heartbeat {
                        port,
                        source: Box::new(e),
                    });
                    false
                }
            };
            // Removed while the heartbeat was in flight.
            if let Some(description) = clients.get_mut(handle) {
                description.heartbeat_connected = alive;
            }
        }
    }

    /// Emit `ConnectionChanged` if the aggregate status differs from the last
    /// one announced.
    pub(crate) async fn announce_status(&self) {
        let mut emitted = self.inner.emitted_connected.lock().await;
        let status = self.get_connected_status().await;
        if status.connected != *emitted {
            *emitted = status.connected;
            tracing::info!(connection = %self.inner.id, "Status: {}", status.status);
            self.emit(ConnectionEvent::ConnectionChanged);
        }
    }

    pub async fn set_debug(&self, debug: bool) {
        self.inner.debug.store(debug, Ordering::Relaxed);
        for (_, description) in self.inner.clients.read().await.iter() {
            description.client.set_debug(debug);
        }
    }

    pub async fn set_auto_reconnect_interval(&self, interval: Duration) {
        self.inner
            .reconnect_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
        for (_, description) in self.inner.clients.read().await.iter() {
            description.client.set_auto_reconnect_interval(interval);
        }
    }

    pub async fn enable_heartbeats(&self) {
        self.set_heartbeats(true).await;
    }

    pub async fn disable_heartbeats(&self) {
        self.set_heartbeats(false).await;
    }

    async fn set_heartbeats(&self, enabled: bool) {
        for (_, description) in self.inner.clients.write().await.iter_mut() {
            description.use_heartbeats = enabled;
        }
    }

    /// Whether any client takes part in the heartbeat cycle.
    pub async fn is_heartbeat_enabled(&self) -> bool {
        self.inner
            .clients
            .read()
            .await
            .iter()
            .any(|(_, d)| d.use_heartbeats)
    }

    /// Clients registered for `port_type`, primary first.
    pub async fn port_clients(&self, port_type: PortType) -> Vec<MosSocketClient> {
        self.inner
            .clients
            .read()
            .await
            .by_port(port_type)
            .map(|d| d.client.clone())
            .collect()
    }

    pub async fn lower_port_clients(&self) -> Vec<MosSocketClient> {
        self.port_clients(PortType::Lower).await
    }

    pub async fn upper_port_clients(&self) -> Vec<MosSocketClient> {
        self.port_clients(PortType::Upper).await
    }

    pub async fn query_port_clients(&self) -> Vec<MosSocketClient> {
        self.port_clients(PortType::Query).await
    }

    /// ID of the NCS this connection talks to.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// ID this side speaks as.
    pub fn mos_id(&self) -> &str {
        &self.inner.mos_id
    }

    /// Command timeout applied to every client.
    pub fn timeout(&self) -> Duration {
        self.inner.options.command_timeout()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }
}

impl std::fmt::Debug for NcsServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NcsServerConnection")
            .field("id", &self.inner.id)
            .field("host", &self.inner.host)
            .field("mos_id", &self.inner.mos_id)
            .finish()
    }
}
