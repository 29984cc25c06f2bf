//! # Concert
//!
//! Reliable point-to-point endpoint messaging over an unreliable pub/sub
//! message bus, and the session client built on top of it.
//!
//! This crate provides:
//! - **Endpoints**: [`LocalEndpoint`] discovers peers, negotiates one
//!   reliable channel per peer, and delivers events and requests in order,
//!   exactly once, with acknowledgments and resends
//! - **Responses**: every send returns a [`ResponseFuture`]; request handlers
//!   answer through a [`ResponsePromise`]
//! - **Sessions**: [`ClientSession`] joins a server-hosted session and keeps
//!   the participant roster
//! - **Client**: [`Client`] discovers servers and runs create-or-join
//!   workflows, optionally retrying on its own
//!
//! Nothing runs in the background: the owner drives every layer by calling
//! `tick`. An endpoint can optionally run its keep-alives on a tokio task.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Session clients: discovery, sessions and connection workflows.
pub mod client;

/// Payload serialization.
pub mod codec;

/// Endpoint, session and client settings.
pub mod config;

/// Error types for endpoint and client operations.
pub mod error;

/// Time provider abstraction.
pub mod time;

/// Reliable endpoint messaging.
pub mod transport;

/// Identifiers and addresses.
pub mod types;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use codec::{CodecError, CustomMessage, JsonCodec, MessageCodec};
pub use config::{ClientSessionSettings, ClientSettings, EndpointSettings};
pub use error::{ClientError, EndpointError, EndpointResult};
pub use time::{ManualTimeProvider, SharedTime, SystemTimeProvider, TimeProvider};
pub use types::{BusAddress, ChannelId, EndpointContext, EndpointId, MessageId, Uid};

pub use transport::{
    EndpointProvider, KeepAliveHandle, LocalEndpoint, MemoryBusHub, MemoryEndpointProvider,
    MessageBus, MessageContext, RemoteConnectionChange, RemoteEndpoint, Response, ResponseCode,
    ResponseFuture, ResponsePromise, SharedBus, SharedEndpointProvider,
};

pub use client::{
    Client, ClientInfo, ClientSession, ClientStatus, ConnectionFuture, ConnectionOutcome,
    ConnectionResultCode, ConnectionStatus, ConnectionTask, DisconnectReason, PendingConnection,
    SessionClientInfo, SessionInfo, TaskStatus,
};
