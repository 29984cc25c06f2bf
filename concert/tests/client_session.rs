//! Client sessions joining a scripted server.

mod common;

use std::sync::{Arc, Mutex};

use common::{FakeServer, TestNet};
use concert::client::{
    ClientInfo, ClientSession, ClientStatus, ConnectionStatus, DisconnectReason, SessionInfo,
};
use concert::{ClientSessionSettings, EndpointId};

type StatusLog = Arc<Mutex<Vec<ConnectionStatus>>>;
type ClientLog = Arc<Mutex<Vec<(ClientStatus, EndpointId)>>>;

fn join(net: &TestNet, info: SessionInfo, name: &str) -> (ClientSession, StatusLog, ClientLog) {
    let endpoint = net.endpoint(&format!("{name} session"));
    let client_info = ClientInfo {
        display_name: name.to_string(),
        device_name: "test".to_string(),
    };
    let mut session = ClientSession::new(
        info,
        client_info,
        ClientSessionSettings::default(),
        endpoint,
    );

    let statuses: StatusLog = Arc::default();
    let sink = statuses.clone();
    session.on_connection_changed(move |status| sink.lock().expect("statuses").push(status));

    let clients: ClientLog = Arc::default();
    let sink = clients.clone();
    session.on_client_changed(move |status, client| {
        sink.lock().expect("clients").push((status, client.endpoint_id));
    });

    session.connect();
    (session, statuses, clients)
}

fn pump(server: &FakeServer, sessions: &mut [&mut ClientSession], rounds: usize) {
    for _ in 0..rounds {
        server.tick();
        for session in sessions.iter_mut() {
            session.tick();
        }
    }
}

fn count(log: &ClientLog, status: ClientStatus) -> usize {
    log.lock().expect("clients").iter().filter(|(s, _)| *s == status).count()
}

#[test]
fn test_join_then_disconnect_notifies_every_participant() {
    let net = TestNet::new();
    let server = FakeServer::new(&net, "srv");
    let info = server.host_session("main");
    let phantoms = server.add_phantom_clients(3);

    let (mut session, statuses, clients) = join(&net, info, "alice");
    pump(&server, &mut [&mut session], 4);

    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert_eq!(
        *statuses.lock().expect("statuses"),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
    );
    let mut listed = session.session_client_ids();
    listed.sort();
    let mut expected: Vec<EndpointId> = phantoms.iter().map(|c| c.endpoint_id).collect();
    expected.sort();
    assert_eq!(listed, expected, "roster excludes this client");
    assert_eq!(count(&clients, ClientStatus::Connected), 3);

    statuses.lock().expect("statuses").clear();
    clients.lock().expect("clients").clear();
    session.disconnect();

    assert_eq!(count(&clients, ClientStatus::Disconnected), 3);
    assert_eq!(clients.lock().expect("clients").len(), 3);
    assert_eq!(*statuses.lock().expect("statuses"), vec![ConnectionStatus::Disconnected]);
    assert_eq!(session.disconnect_reason(), Some(&DisconnectReason::Requested));
    assert!(session.session_clients().is_empty());

    // Disconnecting twice is a no-op.
    session.disconnect();
    assert_eq!(statuses.lock().expect("statuses").len(), 1);
}

#[test]
fn test_roster_follows_other_participants() {
    let net = TestNet::new();
    let server = FakeServer::new(&net, "srv");
    let info = server.host_session("main");

    let (mut alice, _, alice_clients) = join(&net, info.clone(), "alice");
    pump(&server, &mut [&mut alice], 4);
    assert_eq!(alice.status(), ConnectionStatus::Connected);
    assert!(alice.session_clients().is_empty());

    let (mut bob, _, _) = join(&net, info, "bob");
    pump(&server, &mut [&mut alice, &mut bob], 4);
    assert_eq!(bob.status(), ConnectionStatus::Connected);
    assert_eq!(bob.session_client_ids(), vec![alice.session_client_id()]);
    assert_eq!(alice.session_client_ids(), vec![bob.session_client_id()]);
    assert_eq!(
        *alice_clients.lock().expect("clients"),
        vec![(ClientStatus::Connected, bob.session_client_id())]
    );

    bob.disconnect();
    pump(&server, &mut [&mut alice, &mut bob], 2);
    assert!(alice.session_clients().is_empty());
    assert_eq!(count(&alice_clients, ClientStatus::Disconnected), 1);
    assert_eq!(server.roster().len(), 1);
}

#[test]
fn test_rejected_join() {
    let net = TestNet::new();
    let server = FakeServer::new(&net, "srv");
    let info = server.host_session("main");
    server.reject_joins("session is full");

    let (mut session, statuses, _) = join(&net, info, "alice");
    pump(&server, &mut [&mut session], 4);

    assert_eq!(session.status(), ConnectionStatus::Disconnected);
    assert_eq!(
        session.disconnect_reason(),
        Some(&DisconnectReason::Rejected("session is full".to_string()))
    );
    assert_eq!(
        *statuses.lock().expect("statuses"),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Disconnected]
    );
}

#[test]
fn test_server_shutdown_disconnects_session() {
    let net = TestNet::new();
    let server = FakeServer::new(&net, "srv");
    let info = server.host_session("main");
    server.add_phantom_clients(2);

    let (mut session, _, clients) = join(&net, info, "alice");
    pump(&server, &mut [&mut session], 4);
    assert_eq!(session.status(), ConnectionStatus::Connected);

    drop(server);
    session.tick();

    assert_eq!(session.status(), ConnectionStatus::Disconnected);
    assert_eq!(session.disconnect_reason(), Some(&DisconnectReason::ServerLost));
    assert_eq!(count(&clients, ClientStatus::Disconnected), 2);
}

#[test]
fn test_session_tick_observers_respect_suspension() {
    let net = TestNet::new();
    let server = FakeServer::new(&net, "srv");
    let info = server.host_session("main");

    let (mut session, _, _) = join(&net, info, "alice");
    let ticks = Arc::new(Mutex::new(0u32));
    let sink = ticks.clone();
    session.on_session_tick(move |_now| *sink.lock().expect("ticks") += 1);

    pump(&server, &mut [&mut session], 4);
    let connected_ticks = *ticks.lock().expect("ticks");
    assert!(connected_ticks > 0, "ticks while connected");

    session.suspend();
    assert!(session.is_suspended());
    session.tick();
    assert_eq!(*ticks.lock().expect("ticks"), connected_ticks);

    session.resume();
    session.tick();
    assert_eq!(*ticks.lock().expect("ticks"), connected_ticks + 1);
}
