//! Admin and session messages exchanged between clients and servers.

use serde::{Deserialize, Serialize};

use crate::codec::CustomMessage;
use crate::types::EndpointId;

/// Description of a client, shown to other session participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Name shown to other participants.
    pub display_name: String,
    /// Machine the client runs on.
    pub device_name: String,
}

/// A session participant as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClientInfo {
    /// Session endpoint of the participant.
    pub endpoint_id: EndpointId,
    /// Participant description.
    pub info: ClientInfo,
}

/// Where a session lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Admin endpoint of the hosting server.
    pub server_admin_endpoint_id: EndpointId,
    /// Name of the hosting server.
    pub server_name: String,
    /// Name of the session.
    pub session_name: String,
    /// Endpoint the server runs the session on.
    pub session_endpoint_id: EndpointId,
}

/// Published by clients looking for servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverServersEvent {
    /// Only this server should answer, if set.
    pub required_server: Option<String>,
}

impl CustomMessage for DiscoverServersEvent {
    const TYPE_NAME: &'static str = "concert.DiscoverServersEvent";
}

/// Sent by a server to a client's admin endpoint in answer to discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDiscoveredEvent {
    /// Name of the server.
    pub server_name: String,
}

impl CustomMessage for ServerDiscoveredEvent {
    const TYPE_NAME: &'static str = "concert.ServerDiscoveredEvent";
}

/// Ask a server for an existing session by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindSessionRequest {
    /// Session to look up.
    pub session_name: String,
    /// Requesting client.
    pub client_info: ClientInfo,
}

impl CustomMessage for FindSessionRequest {
    const TYPE_NAME: &'static str = "concert.FindSessionRequest";
}

/// Ask a server to create a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Session to create.
    pub session_name: String,
    /// Requesting client.
    pub client_info: ClientInfo,
}

impl CustomMessage for CreateSessionRequest {
    const TYPE_NAME: &'static str = "concert.CreateSessionRequest";
}

/// Answer to [`FindSessionRequest`] and [`CreateSessionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfoResponse {
    /// The session, or `None` when not found or not created.
    pub session: Option<SessionInfo>,
    /// Why there is no session.
    pub reason: String,
}

impl CustomMessage for SessionInfoResponse {
    const TYPE_NAME: &'static str = "concert.SessionInfoResponse";
}

/// Published by a client session asking to join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverAndJoinSessionEvent {
    /// Session endpoint the client wants to join.
    pub session_endpoint_id: EndpointId,
    /// The joining client.
    pub client_info: ClientInfo,
}

impl CustomMessage for DiscoverAndJoinSessionEvent {
    const TYPE_NAME: &'static str = "concert.DiscoverAndJoinSessionEvent";
}

/// Outcome of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinSessionResult {
    /// Joined; the roster is attached.
    Success,
    /// The server refused the client.
    Rejected,
}

/// Sent by a session server to a client that asked to join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSessionResultEvent {
    /// Session endpoint answering.
    pub session_endpoint_id: EndpointId,
    /// Outcome.
    pub result: JoinSessionResult,
    /// Rejection reason.
    pub reason: String,
    /// Current participants, including the joining client.
    pub session_clients: Vec<SessionClientInfo>,
}

impl CustomMessage for JoinSessionResultEvent {
    const TYPE_NAME: &'static str = "concert.JoinSessionResultEvent";
}

/// Authoritative participant list, sent whenever it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientListUpdatedEvent {
    /// Every participant.
    pub session_clients: Vec<SessionClientInfo>,
}

impl CustomMessage for ClientListUpdatedEvent {
    const TYPE_NAME: &'static str = "concert.ClientListUpdatedEvent";
}

/// Sent by a client leaving a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveSessionEvent {
    /// Session endpoint being left.
    pub session_endpoint_id: EndpointId,
}

impl CustomMessage for LeaveSessionEvent {
    const TYPE_NAME: &'static str = "concert.LeaveSessionEvent";
}
