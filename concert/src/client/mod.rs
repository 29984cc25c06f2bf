//! Session clients built on top of the endpoint layer.
//!
//! - [`messages`]: admin and session wire messages
//! - [`session`]: the client side of one joined session
//! - [`pending`]: sequencing of multi-step connection workflows
//! - [`tasks`]: the discovery and join steps
//! - [`client`]: discovery, the joined session and auto-connect

#[allow(clippy::module_inception)]
pub mod client;
pub mod auto_connect;
pub mod messages;
pub mod pending;
pub mod session;
pub mod tasks;

pub use auto_connect::AutoConnection;
pub use client::{Client, ClientCore, KnownServer};
pub use messages::{
    ClientInfo, ClientListUpdatedEvent, CreateSessionRequest, DiscoverAndJoinSessionEvent,
    DiscoverServersEvent, FindSessionRequest, JoinSessionResult, JoinSessionResultEvent,
    LeaveSessionEvent, ServerDiscoveredEvent, SessionClientInfo, SessionInfo, SessionInfoResponse,
};
pub use pending::{
    BoxedConnectionTask, ConnectionFuture, ConnectionOutcome, ConnectionResultCode, ConnectionTask,
    PendingConnection, TaskStatus,
};
pub use session::{
    ClientSession, ClientStatus, ConnectionStatus, DisconnectReason, Scratchpad, SessionClient,
};
pub use tasks::{CreateOrJoinSessionTask, DiscoverServerTask};
