//! Client registry of a server connection.

use crate::message::PortType;
use crate::socket_client::MosSocketClient;

/// Stable handle to a registered client. Handles are never reused, so a
/// handle taken before a removal can never address a different client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(usize);

/// A registered socket client and its heartbeat bookkeeping.
#[derive(Debug)]
pub struct ClientDescription {
    pub client_id: String,
    pub port_type: PortType,
    pub client: MosSocketClient,
    /// Whether the heartbeat cycle probes this client.
    pub use_heartbeats: bool,
    /// Outcome of the most recent heartbeat.
    pub heartbeat_connected: bool,
}

impl ClientDescription {
    pub fn new(
        client_id: impl Into<String>,
        port_type: PortType,
        client: MosSocketClient,
        use_heartbeats: bool,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            port_type,
            client,
            use_heartbeats,
            heartbeat_connected: false,
        }
    }
}

/// Registered clients in registration order.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    slots: Vec<Option<ClientDescription>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, description: ClientDescription) -> ClientHandle {
        self.slots.push(Some(description));
        ClientHandle(self.slots.len() - 1)
    }

    pub fn get(&self, handle: ClientHandle) -> Option<&ClientDescription> {
        self.slots.get(handle.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, handle: ClientHandle) -> Option<&mut ClientDescription> {
        self.slots.get_mut(handle.0).and_then(Option::as_mut)
    }

    /// Find a client by its ID.
    pub fn find(&self, client_id: &str) -> Option<ClientHandle> {
        self.iter()
            .find(|(_, d)| d.client_id == client_id)
            .map(|(handle, _)| handle)
    }

    pub fn remove(&mut self, handle: ClientHandle) -> Option<ClientDescription> {
        self.slots.get_mut(handle.0).and_then(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientHandle, &ClientDescription)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|d| (ClientHandle(i), d)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ClientHandle, &mut ClientDescription)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|d| (ClientHandle(i), d)))
    }

    /// Clients of one port role, in registration order.
    pub fn by_port(&self, port_type: PortType) -> impl Iterator<Item = &ClientDescription> {
        self.iter()
            .map(|(_, d)| d)
            .filter(move |d| d.port_type == port_type)
    }

    /// The client commands for `port_type` are routed to: the first one registered.
    pub fn primary(&self, port_type: PortType) -> Option<&ClientDescription> {
        self.by_port(port_type).next()
    }

    /// Remove every client.
    pub fn drain(&mut self) -> Vec<ClientDescription> {
        self.slots.drain(..).flatten().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
