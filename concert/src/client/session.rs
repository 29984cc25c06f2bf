//! Client side of a joined session.
//!
//! ```text
//!                connect()                JoinSessionResult::Success
//! Disconnected ───────────► Connecting ─────────────────────────────► Connected
//!      ▲                        │  │ resend DiscoverAndJoin                │
//!      │                        │  └─ every session_tick_frequency         │
//!      │   Rejected / attempts exhausted / disconnect()                    │
//!      ├────────────────────────┘                                          │
//!      │         disconnect() / server timed out / server closed           │
//!      └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Suspension is a counter orthogonal to the status. It only gates the
//! session tick observers.
//!
//! Status and roster notifications are collected while a call is running and
//! delivered to observers when it returns.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::ClientSessionSettings;
use crate::transport::{LocalEndpoint, ObserverId, RemoteConnectionChange};
use crate::types::EndpointId;

use super::messages::{
    ClientInfo, ClientListUpdatedEvent, DiscoverAndJoinSessionEvent, JoinSessionResult,
    JoinSessionResultEvent, LeaveSessionEvent, SessionClientInfo, SessionInfo,
};

/// Connection status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected. Initial state.
    Disconnected,
    /// Join requested, waiting for the server.
    Connecting,
    /// Joined.
    Connected,
}

/// Change to one participant of the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Joined the session.
    Connected,
    /// Left the session.
    Disconnected,
    /// Description changed.
    Updated,
}

/// Why a session returned to [`ConnectionStatus::Disconnected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// [`ClientSession::disconnect`] was called.
    Requested,
    /// The server refused the join.
    Rejected(String),
    /// The server timed out or closed.
    ServerLost,
    /// `max_connection_attempts` join requests went unanswered.
    AttemptsExhausted,
}

/// Free-form per-client storage for application handlers.
#[derive(Debug, Clone, Default)]
pub struct Scratchpad {
    values: BTreeMap<String, serde_json::Value>,
}

impl Scratchpad {
    /// Store `value` under `key`, replacing any previous value.
    pub fn set<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        self.values.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Read the value under `key`, if present and of type `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Remove the value under `key`.
    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    /// Whether `key` is set.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A participant of the session and its scratchpad.
#[derive(Debug, Clone)]
pub struct SessionClient {
    /// Participant as listed by the server.
    pub client: SessionClientInfo,
    /// Storage owned by this side for that participant.
    pub scratchpad: Scratchpad,
}

enum Inbound {
    JoinResult(JoinSessionResultEvent),
    ClientList(ClientListUpdatedEvent),
    ServerLost(RemoteConnectionChange),
}

enum Notification {
    Connection(ConnectionStatus),
    Client(ClientStatus, SessionClientInfo),
}

type ConnectionObserver = Box<dyn FnMut(ConnectionStatus) + Send>;
type ClientObserver = Box<dyn FnMut(ClientStatus, &SessionClientInfo) + Send>;
type TickObserver = Box<dyn FnMut(Duration) + Send>;

#[derive(Default)]
struct Observers {
    next_id: ObserverId,
    connection: Vec<(ObserverId, ConnectionObserver)>,
    client: Vec<(ObserverId, ClientObserver)>,
    tick: Vec<(ObserverId, TickObserver)>,
}

impl Observers {
    fn next_id(&mut self) -> ObserverId {
        self.next_id += 1;
        self.next_id
    }
}

/// The client side of one session.
pub struct ClientSession {
    info: SessionInfo,
    client_info: ClientInfo,
    settings: ClientSessionSettings,
    endpoint: LocalEndpoint,

    status: ConnectionStatus,
    disconnect_reason: Option<DisconnectReason>,
    suspended_count: u32,
    connection_attempts: u32,
    last_connection_request: Duration,

    session_clients: BTreeMap<EndpointId, SessionClient>,
    scratchpad: Scratchpad,

    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    server_observer: ObserverId,
    notifications: Vec<Notification>,
    observers: Observers,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("session", &self.info.session_name)
            .field("status", &self.status)
            .field("clients", &self.session_clients.len())
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Create a disconnected session that will talk through `endpoint`.
    pub fn new(
        info: SessionInfo,
        client_info: ClientInfo,
        settings: ClientSessionSettings,
        endpoint: LocalEndpoint,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let server_id = info.session_endpoint_id;

        let tx = inbound_tx.clone();
        endpoint.register_event_handler::<JoinSessionResultEvent, _>(move |context, event| {
            if context.sender.id == server_id {
                let _ = tx.send(Inbound::JoinResult(event));
            }
        });
        let tx = inbound_tx.clone();
        endpoint.register_event_handler::<ClientListUpdatedEvent, _>(move |context, event| {
            if context.sender.id == server_id {
                let _ = tx.send(Inbound::ClientList(event));
            }
        });
        let server_observer =
            endpoint.on_remote_endpoint_connection_changed(move |context, change| {
                if context.id == server_id && change != RemoteConnectionChange::Discovered {
                    let _ = inbound_tx.send(Inbound::ServerLost(change));
                }
            });

        Self {
            info,
            client_info,
            settings,
            endpoint,
            status: ConnectionStatus::Disconnected,
            disconnect_reason: None,
            suspended_count: 0,
            connection_attempts: 0,
            last_connection_request: Duration::ZERO,
            session_clients: BTreeMap::new(),
            scratchpad: Scratchpad::default(),
            inbound_rx,
            server_observer,
            notifications: Vec::new(),
            observers: Observers::default(),
        }
    }

    /// Where this session lives.
    pub fn session_info(&self) -> &SessionInfo {
        &self.info
    }

    /// How this client presents itself.
    pub fn client_info(&self) -> &ClientInfo {
        &self.client_info
    }

    /// Endpoint the session talks through.
    pub fn endpoint(&self) -> &LocalEndpoint {
        &self.endpoint
    }

    /// Id of this client within the session.
    pub fn session_client_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Why the session last became disconnected.
    pub fn disconnect_reason(&self) -> Option<&DisconnectReason> {
        self.disconnect_reason.as_ref()
    }

    /// Join requests sent since the last [`connect`](Self::connect).
    pub fn connection_attempts(&self) -> u32 {
        self.connection_attempts
    }

    /// Start joining. No-op unless disconnected.
    pub fn connect(&mut self) {
        if self.status != ConnectionStatus::Disconnected {
            return;
        }
        tracing::info!(
            session = %self.info.session_name,
            server = %self.info.server_name,
            "connecting to session"
        );
        self.connection_attempts = 0;
        self.disconnect_reason = None;
        self.set_status(ConnectionStatus::Connecting);
        self.send_connection_request();
        self.flush_notifications();
    }

    /// Leave the session. No-op when already disconnected.
    pub fn disconnect(&mut self) {
        if self.status == ConnectionStatus::Disconnected {
            return;
        }
        if self.status == ConnectionStatus::Connected {
            let leave = LeaveSessionEvent {
                session_endpoint_id: self.info.session_endpoint_id,
            };
            if let Err(e) = self.endpoint.send_event(&leave, self.info.session_endpoint_id, false) {
                tracing::warn!(error = %e, "failed to send leave notification");
            }
        }
        self.enter_disconnected(DisconnectReason::Requested);
        self.flush_notifications();
    }

    /// Increment the suspension count.
    pub fn suspend(&mut self) {
        self.suspended_count += 1;
    }

    /// Decrement the suspension count.
    pub fn resume(&mut self) {
        debug_assert!(self.suspended_count > 0, "resume without suspend");
        self.suspended_count = self.suspended_count.saturating_sub(1);
    }

    /// Connected with a non-zero suspension count.
    pub fn is_suspended(&self) -> bool {
        self.status == ConnectionStatus::Connected && self.suspended_count > 0
    }

    /// Participants other than this client.
    pub fn session_clients(&self) -> Vec<SessionClientInfo> {
        self.session_clients.values().map(|c| c.client.clone()).collect()
    }

    /// Ids of the participants other than this client.
    pub fn session_client_ids(&self) -> Vec<EndpointId> {
        self.session_clients.keys().copied().collect()
    }

    /// One participant.
    pub fn session_client(&self, id: EndpointId) -> Option<&SessionClient> {
        self.session_clients.get(&id)
    }

    /// This client's own scratchpad.
    pub fn scratchpad(&mut self) -> &mut Scratchpad {
        &mut self.scratchpad
    }

    /// Scratchpad of a participant.
    pub fn client_scratchpad(&mut self, id: EndpointId) -> Option<&mut Scratchpad> {
        self.session_clients.get_mut(&id).map(|c| &mut c.scratchpad)
    }

    /// Observe connection status changes.
    pub fn on_connection_changed<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(ConnectionStatus) + Send + 'static,
    {
        let id = self.observers.next_id();
        self.observers.connection.push((id, Box::new(observer)));
        id
    }

    /// Observe participants joining, leaving or changing.
    pub fn on_client_changed<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(ClientStatus, &SessionClientInfo) + Send + 'static,
    {
        let id = self.observers.next_id();
        self.observers.client.push((id, Box::new(observer)));
        id
    }

    /// Called on every tick while connected and not suspended, with the
    /// endpoint clock reading.
    pub fn on_session_tick<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(Duration) + Send + 'static,
    {
        let id = self.observers.next_id();
        self.observers.tick.push((id, Box::new(observer)));
        id
    }

    /// Remove any observer registered on this session.
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        let observers = &mut self.observers;
        let before = observers.connection.len() + observers.client.len() + observers.tick.len();
        observers.connection.retain(|(observer_id, _)| *observer_id != id);
        observers.client.retain(|(observer_id, _)| *observer_id != id);
        observers.tick.retain(|(observer_id, _)| *observer_id != id);
        before != observers.connection.len() + observers.client.len() + observers.tick.len()
    }

    /// Drive the endpoint and the connection state machine.
    pub fn tick(&mut self) {
        self.endpoint.tick();

        while let Ok(inbound) = self.inbound_rx.try_recv() {
            match inbound {
                Inbound::JoinResult(event) => self.handle_join_result(event),
                Inbound::ClientList(event) => {
                    if self.status == ConnectionStatus::Connected {
                        self.update_session_clients(event.session_clients);
                    }
                }
                Inbound::ServerLost(change) => {
                    if self.status != ConnectionStatus::Disconnected {
                        tracing::warn!(
                            session = %self.info.session_name,
                            ?change,
                            "session server lost"
                        );
                        self.enter_disconnected(DisconnectReason::ServerLost);
                    }
                }
            }
        }

        let now = self.endpoint.now();
        match self.status {
            ConnectionStatus::Connecting => {
                let since_request = now.saturating_sub(self.last_connection_request);
                if since_request >= self.settings.session_tick_frequency {
                    let exhausted = self
                        .settings
                        .max_connection_attempts
                        .map_or(false, |max| self.connection_attempts >= max);
                    if exhausted {
                        tracing::warn!(
                            session = %self.info.session_name,
                            attempts = self.connection_attempts,
                            "giving up on session connection"
                        );
                        self.enter_disconnected(DisconnectReason::AttemptsExhausted);
                    } else {
                        self.send_connection_request();
                    }
                }
            }
            ConnectionStatus::Connected => {
                if !self.is_suspended() {
                    for (_, observer) in &mut self.observers.tick {
                        observer(now);
                    }
                }
            }
            ConnectionStatus::Disconnected => {}
        }

        self.flush_notifications();
    }

    fn send_connection_request(&mut self) {
        self.connection_attempts += 1;
        self.last_connection_request = self.endpoint.now();
        tracing::debug!(
            session = %self.info.session_name,
            attempt = self.connection_attempts,
            "sending session connection request"
        );
        self.endpoint.publish_discovery();
        let request = DiscoverAndJoinSessionEvent {
            session_endpoint_id: self.info.session_endpoint_id,
            client_info: self.client_info.clone(),
        };
        if let Err(e) = self.endpoint.publish_event(&request) {
            tracing::warn!(error = %e, "failed to publish session connection request");
        }
    }

    fn handle_join_result(&mut self, event: JoinSessionResultEvent) {
        if self.status != ConnectionStatus::Connecting {
            return;
        }
        match event.result {
            JoinSessionResult::Success => {
                tracing::info!(session = %self.info.session_name, "joined session");
                self.set_status(ConnectionStatus::Connected);
                self.update_session_clients(event.session_clients);
            }
            JoinSessionResult::Rejected => {
                tracing::warn!(
                    session = %self.info.session_name,
                    reason = %event.reason,
                    "session join rejected"
                );
                self.enter_disconnected(DisconnectReason::Rejected(event.reason));
            }
        }
    }

    /// Replace the roster with `clients`, raising one notification per
    /// participant that joined, left or changed.
    fn update_session_clients(&mut self, clients: Vec<SessionClientInfo>) {
        let own_id = self.endpoint.id();
        let listed: BTreeMap<EndpointId, SessionClientInfo> = clients
            .into_iter()
            .filter(|client| client.endpoint_id != own_id)
            .map(|client| (client.endpoint_id, client))
            .collect();

        let removed: Vec<EndpointId> = self
            .session_clients
            .keys()
            .filter(|id| !listed.contains_key(id))
            .copied()
            .collect();
        for id in removed {
            if let Some(client) = self.session_clients.remove(&id) {
                self.notifications
                    .push(Notification::Client(ClientStatus::Disconnected, client.client));
            }
        }

        for (id, client) in listed {
            match self.session_clients.get_mut(&id) {
                Some(existing) => {
                    if existing.client != client {
                        existing.client = client.clone();
                        self.notifications
                            .push(Notification::Client(ClientStatus::Updated, client));
                    }
                }
                None => {
                    self.session_clients.insert(
                        id,
                        SessionClient {
                            client: client.clone(),
                            scratchpad: Scratchpad::default(),
                        },
                    );
                    self.notifications
                        .push(Notification::Client(ClientStatus::Connected, client));
                }
            }
        }
    }

    fn enter_disconnected(&mut self, reason: DisconnectReason) {
        for (_, client) in std::mem::take(&mut self.session_clients) {
            self.notifications
                .push(Notification::Client(ClientStatus::Disconnected, client.client));
        }
        self.disconnect_reason = Some(reason);
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            self.status = status;
            self.notifications.push(Notification::Connection(status));
        }
    }

    fn flush_notifications(&mut self) {
        for notification in std::mem::take(&mut self.notifications) {
            match notification {
                Notification::Connection(status) => {
                    for (_, observer) in &mut self.observers.connection {
                        observer(status);
                    }
                }
                Notification::Client(status, client) => {
                    for (_, observer) in &mut self.observers.client {
                        observer(status, &client);
                    }
                }
            }
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.endpoint.remove_connection_observer(self.server_observer);
        self.endpoint.unregister_event_handler::<JoinSessionResultEvent>();
        self.endpoint.unregister_event_handler::<ClientListUpdatedEvent>();
    }
}
