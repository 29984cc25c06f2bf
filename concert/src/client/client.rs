//! The client: server discovery, admin requests, the joined session and the
//! connection workflows that tie them together.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::ClientSettings;
use crate::error::ClientError;
use crate::transport::{
    LocalEndpoint, RemoteConnectionChange, ResponseFuture, SharedEndpointProvider,
};
use crate::types::EndpointId;

use super::auto_connect::{AutoConnectStep, AutoConnection};
use super::messages::{
    ClientInfo, CreateSessionRequest, DiscoverServersEvent, FindSessionRequest,
    ServerDiscoveredEvent, SessionInfo,
};
use super::pending::{BoxedConnectionTask, ConnectionFuture, PendingConnection};
use super::session::{ClientSession, ConnectionStatus};
use super::tasks::{CreateOrJoinSessionTask, DiscoverServerTask};

/// A server found through discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownServer {
    /// Admin endpoint of the server.
    pub admin_endpoint_id: EndpointId,
    /// Name the server announced.
    pub server_name: String,
    /// Last time the server answered discovery.
    pub last_seen: Duration,
}

enum ServerNotice {
    Discovered(EndpointId, ServerDiscoveredEvent),
    Lost(EndpointId),
}

/// Everything connection tasks operate on.
///
/// Split from [`Client`] so the pending connection can borrow it while the
/// client owns both.
pub struct ClientCore {
    settings: ClientSettings,
    client_info: ClientInfo,
    provider: SharedEndpointProvider,
    admin: LocalEndpoint,
    servers_rx: mpsc::UnboundedReceiver<ServerNotice>,
    known_servers: HashMap<EndpointId, KnownServer>,
    discovery_count: u32,
    last_discovery: Option<Duration>,
    session: Option<ClientSession>,
}

impl ClientCore {
    fn new(settings: ClientSettings, provider: SharedEndpointProvider) -> Self {
        let client_info = ClientInfo {
            display_name: settings.display_name.clone(),
            device_name: settings.device_name.clone(),
        };
        let admin = provider.create_local_endpoint(
            &format!("{} admin", settings.display_name),
            settings.endpoint.clone(),
        );
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        let tx = servers_tx.clone();
        admin.register_event_handler::<ServerDiscoveredEvent, _>(move |context, event| {
            let _ = tx.send(ServerNotice::Discovered(context.sender.id, event));
        });
        admin.on_remote_endpoint_connection_changed(move |context, change| {
            if change != RemoteConnectionChange::Discovered {
                let _ = servers_tx.send(ServerNotice::Lost(context.id));
            }
        });

        Self {
            settings,
            client_info,
            provider,
            admin,
            servers_rx,
            known_servers: HashMap::new(),
            discovery_count: 0,
            last_discovery: None,
            session: None,
        }
    }

    /// Client settings.
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// How this client presents itself.
    pub fn client_info(&self) -> &ClientInfo {
        &self.client_info
    }

    /// Endpoint used for server discovery and admin requests.
    pub fn admin_endpoint(&self) -> &LocalEndpoint {
        &self.admin
    }

    /// Current clock reading.
    pub fn now(&self) -> Duration {
        self.provider.time().now()
    }

    /// Start (or keep) broadcasting server discovery.
    pub fn start_discovery(&mut self) {
        self.discovery_count += 1;
        if self.discovery_count == 1 {
            tracing::debug!("server discovery started");
            self.last_discovery = None;
            self.broadcast_discovery();
        }
    }

    /// Release one [`start_discovery`](Self::start_discovery).
    pub fn stop_discovery(&mut self) {
        debug_assert!(self.discovery_count > 0, "unbalanced stop_discovery");
        self.discovery_count = self.discovery_count.saturating_sub(1);
        if self.discovery_count == 0 {
            tracing::debug!("server discovery stopped");
        }
    }

    /// Whether discovery is currently broadcasting.
    pub fn is_discovery_enabled(&self) -> bool {
        self.discovery_count > 0
    }

    /// Servers heard from within the server timeout.
    pub fn known_servers(&self) -> Vec<KnownServer> {
        let mut servers: Vec<KnownServer> = self.known_servers.values().cloned().collect();
        servers.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        servers
    }

    /// A known server by name.
    pub fn find_server(&self, server_name: &str) -> Option<KnownServer> {
        self.known_servers
            .values()
            .find(|server| server.server_name == server_name)
            .cloned()
    }

    /// Ask a known server for a session.
    pub fn find_session(
        &self,
        server: EndpointId,
        session_name: &str,
    ) -> Result<ResponseFuture, ClientError> {
        self.require_server(server)?;
        let request = FindSessionRequest {
            session_name: session_name.to_string(),
            client_info: self.client_info.clone(),
        };
        Ok(self.admin.send_request(&request, server)?)
    }

    /// Ask a known server to create a session.
    pub fn create_session(
        &self,
        server: EndpointId,
        session_name: &str,
    ) -> Result<ResponseFuture, ClientError> {
        self.require_server(server)?;
        let request = CreateSessionRequest {
            session_name: session_name.to_string(),
            client_info: self.client_info.clone(),
        };
        Ok(self.admin.send_request(&request, server)?)
    }

    fn require_server(&self, server: EndpointId) -> Result<(), ClientError> {
        if self.known_servers.contains_key(&server) {
            Ok(())
        } else {
            Err(ClientError::UnknownServer(server))
        }
    }

    /// Leave the current session, if any, and start joining `info`.
    pub fn join_session(&mut self, info: SessionInfo) {
        self.disconnect_session();
        let endpoint = self.provider.create_local_endpoint(
            &format!("{} session", self.settings.display_name),
            self.settings.endpoint.clone(),
        );
        let mut session = ClientSession::new(
            info,
            self.client_info.clone(),
            self.settings.session.clone(),
            endpoint,
        );
        session.connect();
        self.session = Some(session);
    }

    /// Leave and drop the current session. Returns whether there was one.
    pub fn disconnect_session(&mut self) -> bool {
        match self.session.take() {
            Some(mut session) => {
                session.disconnect();
                true
            }
            None => false,
        }
    }

    /// The current session.
    pub fn session(&self) -> Option<&ClientSession> {
        self.session.as_ref()
    }

    /// The current session, mutably.
    pub fn session_mut(&mut self) -> Option<&mut ClientSession> {
        self.session.as_mut()
    }

    /// Status of the current session; `Disconnected` without one.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.session
            .as_ref()
            .map_or(ConnectionStatus::Disconnected, ClientSession::status)
    }

    fn broadcast_discovery(&mut self) {
        self.last_discovery = Some(self.now());
        self.admin.publish_discovery();
        if let Err(e) = self.admin.publish_event(&DiscoverServersEvent { required_server: None }) {
            tracing::warn!(error = %e, "failed to publish server discovery");
        }
    }

    fn tick(&mut self) {
        self.admin.tick();
        let now = self.now();

        while let Ok(notice) = self.servers_rx.try_recv() {
            match notice {
                ServerNotice::Discovered(admin_endpoint_id, event) => {
                    let server = self
                        .known_servers
                        .entry(admin_endpoint_id)
                        .or_insert_with(|| {
                            tracing::info!(server = %event.server_name, "server discovered");
                            KnownServer {
                                admin_endpoint_id,
                                server_name: event.server_name.clone(),
                                last_seen: now,
                            }
                        });
                    server.server_name = event.server_name;
                    server.last_seen = now;
                }
                ServerNotice::Lost(admin_endpoint_id) => {
                    if let Some(server) = self.known_servers.remove(&admin_endpoint_id) {
                        tracing::info!(server = %server.server_name, "server went away");
                    }
                }
            }
        }

        let server_timeout = self.settings.server_timeout;
        self.known_servers.retain(|_, server| {
            let alive = now.saturating_sub(server.last_seen) < server_timeout;
            if !alive {
                tracing::info!(server = %server.server_name, "server timed out");
            }
            alive
        });

        if self.is_discovery_enabled()
            && self
                .last_discovery
                .map_or(true, |last| now.saturating_sub(last) >= self.settings.discovery_period)
        {
            self.broadcast_discovery();
        }

        if let Some(session) = self.session.as_mut() {
            session.tick();
        }
    }
}

/// A client of session servers.
pub struct Client {
    core: ClientCore,
    pending: Option<PendingConnection<ClientCore>>,
    auto_connect: Option<AutoConnection>,
}

impl Client {
    /// Create a client whose endpoints come from `provider`.
    ///
    /// Starts auto-connect when the settings ask for it.
    pub fn new(settings: ClientSettings, provider: SharedEndpointProvider) -> Self {
        let auto_connect = settings.auto_connect;
        let mut client = Self {
            core: ClientCore::new(settings, provider),
            pending: None,
            auto_connect: None,
        };
        if auto_connect {
            if let Err(e) = client.start_auto_connect() {
                tracing::warn!(error = %e, "auto-connect not started");
            }
        }
        client
    }

    /// Shared state the connection tasks work on.
    pub fn core(&self) -> &ClientCore {
        &self.core
    }

    /// Mutable access to the shared state.
    pub fn core_mut(&mut self) -> &mut ClientCore {
        &mut self.core
    }

    /// Client settings.
    pub fn settings(&self) -> &ClientSettings {
        self.core.settings()
    }

    /// Start (or keep) broadcasting server discovery.
    pub fn start_discovery(&mut self) {
        self.core.start_discovery();
    }

    /// Release one [`start_discovery`](Self::start_discovery).
    pub fn stop_discovery(&mut self) {
        self.core.stop_discovery();
    }

    /// Servers heard from within the server timeout.
    pub fn known_servers(&self) -> Vec<KnownServer> {
        self.core.known_servers()
    }

    /// The current session.
    pub fn session(&self) -> Option<&ClientSession> {
        self.core.session()
    }

    /// The current session, mutably.
    pub fn session_mut(&mut self) -> Option<&mut ClientSession> {
        self.core.session_mut()
    }

    /// Status of the current session.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.core.connection_status()
    }

    /// Suspend the current session.
    pub fn suspend_session(&mut self) -> Result<(), ClientError> {
        self.core.session_mut().ok_or(ClientError::NoSession)?.suspend();
        Ok(())
    }

    /// Resume the current session.
    pub fn resume_session(&mut self) -> Result<(), ClientError> {
        self.core.session_mut().ok_or(ClientError::NoSession)?.resume();
        Ok(())
    }

    /// Whether a connection workflow is running.
    pub fn has_pending_connection(&self) -> bool {
        self.pending.is_some()
    }

    /// Run `tasks` as the client's connection workflow.
    ///
    /// A workflow already running is aborted first.
    pub fn execute_connection_tasks(
        &mut self,
        tasks: Vec<BoxedConnectionTask<ClientCore>>,
    ) -> ConnectionFuture {
        if let Some(previous) = self.pending.take() {
            tracing::debug!("replacing pending connection");
            previous.abort(&mut self.core);
        }
        let (pending, future) = PendingConnection::execute(tasks, &mut self.core);
        if !pending.is_finished() {
            self.pending = Some(pending);
        }
        future
    }

    /// Discover `server_name`, then find or create `session_name` on it and
    /// join.
    pub fn create_or_join_session(
        &mut self,
        server_name: &str,
        session_name: &str,
    ) -> ConnectionFuture {
        self.create_or_join_session_after(Vec::new(), server_name, session_name)
    }

    /// Like [`create_or_join_session`](Self::create_or_join_session), running
    /// `pre_tasks` first.
    pub fn create_or_join_session_after(
        &mut self,
        pre_tasks: Vec<BoxedConnectionTask<ClientCore>>,
        server_name: &str,
        session_name: &str,
    ) -> ConnectionFuture {
        let mut tasks = pre_tasks;
        tasks.push(Box::new(DiscoverServerTask::new(server_name)));
        tasks.push(Box::new(CreateOrJoinSessionTask::new(server_name, session_name)));
        self.execute_connection_tasks(tasks)
    }

    /// Join the default session from the settings.
    pub fn create_or_join_default_session(&mut self) -> Result<ConnectionFuture, ClientError> {
        let (server, session) = self.default_session()?;
        Ok(self.create_or_join_session(&server, &session))
    }

    /// Ask the running workflow to cancel.
    pub fn cancel_pending_connection(&mut self) {
        if let Some(pending) = self.pending.as_mut() {
            pending.cancel();
        }
    }

    /// Leave the current session. Returns whether there was one.
    pub fn disconnect_session(&mut self) -> bool {
        self.core.disconnect_session()
    }

    /// Keep trying to join the default session until connected.
    pub fn start_auto_connect(&mut self) -> Result<(), ClientError> {
        self.default_session()?;
        if self.auto_connect.is_none() {
            tracing::info!(
                server = %self.core.settings.default_server_name,
                session = %self.core.settings.default_session_name,
                "auto-connect started"
            );
            let poll_interval = self.core.settings.auto_connect_poll_interval;
            self.auto_connect = Some(AutoConnection::new(poll_interval));
        }
        Ok(())
    }

    /// Stop auto-connect. A workflow it started keeps running.
    pub fn stop_auto_connect(&mut self) {
        if self.auto_connect.take().is_some() {
            tracing::info!("auto-connect stopped");
        }
    }

    /// Whether auto-connect is active.
    pub fn is_auto_connect_enabled(&self) -> bool {
        self.auto_connect.is_some()
    }

    fn default_session(&self) -> Result<(String, String), ClientError> {
        let settings = &self.core.settings;
        if settings.default_server_name.is_empty() || settings.default_session_name.is_empty() {
            return Err(ClientError::NoDefaultSession);
        }
        Ok((settings.default_server_name.clone(), settings.default_session_name.clone()))
    }

    /// Drive endpoints, discovery, the session, the pending connection and
    /// auto-connect.
    pub fn tick(&mut self) {
        self.core.tick();

        if let Some(mut pending) = self.pending.take() {
            if !pending.tick(&mut self.core) {
                self.pending = Some(pending);
            }
        }

        self.tick_auto_connect();
    }

    fn tick_auto_connect(&mut self) {
        let now = self.core.now();
        let busy = self.pending.is_some()
            || self.core.connection_status() != ConnectionStatus::Disconnected;
        let keep_after_rejection = self.core.settings.auto_connect;
        let Some(auto) = self.auto_connect.as_mut() else {
            return;
        };
        match auto.poll(now, busy, keep_after_rejection) {
            AutoConnectStep::Wait => {}
            AutoConnectStep::GiveUp => {
                self.auto_connect = None;
            }
            AutoConnectStep::Attempt => {
                let Ok((server, session)) = self.default_session() else {
                    self.auto_connect = None;
                    return;
                };
                let future = self.create_or_join_session(&server, &session);
                if let Some(auto) = self.auto_connect.as_mut() {
                    auto.attempt_started(now, future);
                }
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort(&mut self.core);
        }
        self.core.disconnect_session();
    }
}
