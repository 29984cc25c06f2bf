//! Shared fixtures for integration tests: an in-process network and a
//! scripted session server.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use concert::client::{
    ClientInfo, ClientListUpdatedEvent, CreateSessionRequest, DiscoverAndJoinSessionEvent,
    DiscoverServersEvent, FindSessionRequest, JoinSessionResult, JoinSessionResultEvent,
    LeaveSessionEvent, ServerDiscoveredEvent, SessionClientInfo, SessionInfo, SessionInfoResponse,
};
use concert::transport::{MessageKind, SharedEndpointProvider};
use concert::{
    EndpointId, EndpointProvider, EndpointSettings, LocalEndpoint, ManualTimeProvider, MemoryBusHub,
    MemoryEndpointProvider, RemoteConnectionChange,
};

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A memory bus, a manual clock and a provider creating endpoints on both.
pub struct TestNet {
    pub hub: MemoryBusHub,
    pub time: ManualTimeProvider,
    pub provider: SharedEndpointProvider,
}

impl TestNet {
    pub fn new() -> Self {
        init_tracing();
        let hub = MemoryBusHub::new();
        let time = ManualTimeProvider::new();
        let provider: SharedEndpointProvider =
            Arc::new(MemoryEndpointProvider::new(hub.clone(), Arc::new(time.clone())));
        Self { hub, time, provider }
    }

    pub fn endpoint(&self, name: &str) -> LocalEndpoint {
        self.provider.create_local_endpoint(name, EndpointSettings::default())
    }

    pub fn endpoint_with(&self, name: &str, settings: EndpointSettings) -> LocalEndpoint {
        self.provider.create_local_endpoint(name, settings)
    }

    pub fn advance(&self, delta: Duration) {
        self.time.advance(delta);
    }

    /// Count deliveries of one message kind without dropping them.
    pub fn count_kind(&self, kind: MessageKind) -> Arc<AtomicU64> {
        let counter = Arc::new(AtomicU64::new(0));
        let sink = counter.clone();
        self.hub.set_drop_filter(move |delivery| {
            if delivery.message.kind() == kind {
                sink.fetch_add(1, Ordering::SeqCst);
            }
            false
        });
        counter
    }
}

/// Discover `b` from `a` and run the handshake to completion on both sides.
pub fn connect_pair(a: &LocalEndpoint, b: &LocalEndpoint) {
    a.publish_discovery();
    b.tick();
    a.tick();
    b.tick();
    assert!(a.has_reliable_channel(b.id()), "a has no channel to b");
    assert!(b.has_reliable_channel(a.id()), "b has no channel to a");
}

#[derive(Default)]
struct ServerState {
    sessions: HashMap<String, SessionInfo>,
    allow_create: bool,
    reject_reason: Option<String>,
    roster: Vec<SessionClientInfo>,
    discover_requests: Vec<EndpointId>,
    join_requests: Vec<(EndpointId, ClientInfo)>,
    leaving: Vec<EndpointId>,
}

/// Session server answering discovery, session lookups and joins.
///
/// Hosts every session on one session endpoint.
pub struct FakeServer {
    pub name: String,
    pub admin: LocalEndpoint,
    pub session_endpoint: LocalEndpoint,
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new(net: &TestNet, name: &str) -> Self {
        let admin = net.endpoint(&format!("{name} admin"));
        let session_endpoint = net.endpoint(&format!("{name} sessions"));
        let state = Arc::new(Mutex::new(ServerState {
            allow_create: true,
            ..ServerState::default()
        }));

        let s = state.clone();
        admin.subscribe_event_handler::<DiscoverServersEvent, _>(move |context, _event| {
            s.lock().expect("server state").discover_requests.push(context.sender.id);
        });

        let s = state.clone();
        admin.register_request_handler::<FindSessionRequest, _>(move |_, request, promise| {
            let state = s.lock().expect("server state");
            let session = state.sessions.get(&request.session_name).cloned();
            drop(state);
            let reason = match session {
                Some(_) => String::new(),
                None => "no such session".to_string(),
            };
            promise.send_ok(&SessionInfoResponse { session, reason });
        });

        let s = state.clone();
        let admin_id = admin.id();
        let server_name = name.to_string();
        let session_endpoint_id = session_endpoint.id();
        admin.register_request_handler::<CreateSessionRequest, _>(move |_, request, promise| {
            let mut state = s.lock().expect("server state");
            if !state.allow_create {
                promise.send_ok(&SessionInfoResponse {
                    session: None,
                    reason: "session creation refused".to_string(),
                });
                return;
            }
            let info = SessionInfo {
                server_admin_endpoint_id: admin_id,
                server_name: server_name.clone(),
                session_name: request.session_name.clone(),
                session_endpoint_id,
            };
            state.sessions.insert(request.session_name, info.clone());
            promise.send_ok(&SessionInfoResponse {
                session: Some(info),
                reason: String::new(),
            });
        });

        let s = state.clone();
        session_endpoint.subscribe_event_handler::<DiscoverAndJoinSessionEvent, _>(
            move |context, event| {
                if event.session_endpoint_id == session_endpoint_id {
                    s.lock()
                        .expect("server state")
                        .join_requests
                        .push((context.sender.id, event.client_info));
                }
            },
        );

        let s = state.clone();
        session_endpoint.register_event_handler::<LeaveSessionEvent, _>(move |context, _event| {
            s.lock().expect("server state").leaving.push(context.sender.id);
        });

        let s = state.clone();
        session_endpoint.on_remote_endpoint_connection_changed(move |context, change| {
            if change != RemoteConnectionChange::Discovered {
                s.lock().expect("server state").leaving.push(context.id);
            }
        });

        Self {
            name: name.to_string(),
            admin,
            session_endpoint,
            state,
        }
    }

    /// Register a session without going through a create request.
    pub fn host_session(&self, session_name: &str) -> SessionInfo {
        let info = SessionInfo {
            server_admin_endpoint_id: self.admin.id(),
            server_name: self.name.clone(),
            session_name: session_name.to_string(),
            session_endpoint_id: self.session_endpoint.id(),
        };
        self.state
            .lock()
            .expect("server state")
            .sessions
            .insert(session_name.to_string(), info.clone());
        info
    }

    /// Refuse create requests.
    pub fn refuse_creation(&self) {
        self.state.lock().expect("server state").allow_create = false;
    }

    /// Reject every join with `reason`.
    pub fn reject_joins(&self, reason: &str) {
        self.state.lock().expect("server state").reject_reason = Some(reason.to_string());
    }

    /// Add participants that exist only in the roster.
    pub fn add_phantom_clients(&self, count: usize) -> Vec<SessionClientInfo> {
        let mut state = self.state.lock().expect("server state");
        let phantoms: Vec<SessionClientInfo> = (0..count)
            .map(|i| SessionClientInfo {
                endpoint_id: EndpointId::random(),
                info: ClientInfo {
                    display_name: format!("phantom {i}"),
                    device_name: "nowhere".to_string(),
                },
            })
            .collect();
        state.roster.extend(phantoms.iter().cloned());
        phantoms
    }

    pub fn roster(&self) -> Vec<SessionClientInfo> {
        self.state.lock().expect("server state").roster.clone()
    }

    pub fn tick(&self) {
        self.admin.tick();
        let discover_requests =
            std::mem::take(&mut self.state.lock().expect("server state").discover_requests);
        for client in discover_requests {
            let answer = ServerDiscoveredEvent {
                server_name: self.name.clone(),
            };
            let _ = self.admin.send_event(&answer, client, false);
        }

        self.session_endpoint.tick();
        let (joins, leaving, reject_reason) = {
            let mut state = self.state.lock().expect("server state");
            (
                std::mem::take(&mut state.join_requests),
                std::mem::take(&mut state.leaving),
                state.reject_reason.clone(),
            )
        };

        for (client, info) in joins {
            if let Some(reason) = &reject_reason {
                self.send_join_result(client, JoinSessionResult::Rejected, reason, Vec::new());
                continue;
            }
            let roster = {
                let mut state = self.state.lock().expect("server state");
                if !state.roster.iter().any(|c| c.endpoint_id == client) {
                    state.roster.push(SessionClientInfo {
                        endpoint_id: client,
                        info,
                    });
                }
                state.roster.clone()
            };
            self.send_join_result(client, JoinSessionResult::Success, "", roster.clone());
            self.broadcast_roster(&roster, Some(client));
        }

        if !leaving.is_empty() {
            let roster = {
                let mut state = self.state.lock().expect("server state");
                let before = state.roster.len();
                state.roster.retain(|c| !leaving.contains(&c.endpoint_id));
                (state.roster.len() != before).then(|| state.roster.clone())
            };
            if let Some(roster) = roster {
                self.broadcast_roster(&roster, None);
            }
        }
    }

    fn send_join_result(
        &self,
        client: EndpointId,
        result: JoinSessionResult,
        reason: &str,
        session_clients: Vec<SessionClientInfo>,
    ) {
        let event = JoinSessionResultEvent {
            session_endpoint_id: self.session_endpoint.id(),
            result,
            reason: reason.to_string(),
            session_clients,
        };
        let _ = self.session_endpoint.send_event(&event, client, true);
    }

    fn broadcast_roster(&self, roster: &[SessionClientInfo], except: Option<EndpointId>) {
        let event = ClientListUpdatedEvent {
            session_clients: roster.to_vec(),
        };
        for client in roster {
            if Some(client.endpoint_id) == except
                || !self.session_endpoint.has_remote_endpoint(client.endpoint_id)
            {
                continue;
            }
            let _ = self.session_endpoint.send_event(&event, client.endpoint_id, true);
        }
    }
}
