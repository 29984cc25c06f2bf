//! Error types for the endpoint and client layers.
//!
//! Request/response failures are not errors here: they travel as a
//! [`ResponseCode`](crate::ResponseCode) inside a resolved
//! [`Response`](crate::Response). These enums cover the operations that fail
//! synchronously.

use crate::codec::CodecError;
use crate::types::EndpointId;

/// Errors raised by [`LocalEndpoint`](crate::LocalEndpoint) operations.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// Payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The endpoint has been closed and no longer owns a bus connection.
    #[error("endpoint closed")]
    Closed,

    /// The keep-alive task needs a running tokio runtime.
    #[error("no tokio runtime available to spawn the keep-alive task")]
    NoRuntime,

    /// The keep-alive task is already running for this endpoint.
    #[error("keep-alive task already running")]
    KeepAliveRunning,
}

/// Errors raised by [`Client`](crate::Client) operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Endpoint-level failure.
    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    /// Settings document could not be parsed.
    #[error("invalid settings: {0}")]
    InvalidSettings(#[from] serde_json::Error),

    /// No server with the given admin endpoint is known.
    #[error("unknown server: {0}")]
    UnknownServer(EndpointId),

    /// Operation needs a session but the client is not in one.
    #[error("no active session")]
    NoSession,

    /// Auto-connect needs a default server and session name.
    #[error("no default server or session configured")]
    NoDefaultSession,
}

/// Result type for endpoint operations.
pub type EndpointResult<T> = Result<T, EndpointError>;
