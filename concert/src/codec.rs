//! Pluggable payload serialization.
//!
//! Application payloads travel as `(type_name, bytes)` pairs. The
//! [`MessageCodec`] trait turns serde types into those bytes; [`JsonCodec`]
//! is the default.
//!
//! # Example
//!
//! ```rust
//! use concert::{CustomMessage, JsonCodec, MessageCodec};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Chat {
//!     text: String,
//! }
//!
//! impl CustomMessage for Chat {
//!     const TYPE_NAME: &'static str = "demo.Chat";
//! }
//!
//! let bytes = JsonCodec.encode(&Chat { text: "hi".into() }).unwrap();
//! let decoded: Chat = JsonCodec.decode(&bytes).unwrap();
//! assert_eq!(decoded.text, "hi");
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Error type for codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Failed to decode bytes to a message.
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The payload carries a different type than the one requested.
    #[error("payload type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Type name the caller asked for.
        expected: String,
        /// Type name carried by the payload.
        found: String,
    },
}

/// Pluggable message serialization format.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Encode a serializable message to bytes.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable message.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

/// A serde type that can travel as an application event, request or response.
///
/// `TYPE_NAME` is the dispatch key: handlers are registered against it and
/// published events use it as their bus topic.
pub trait CustomMessage: Serialize + DeserializeOwned + Send + 'static {
    /// Stable name identifying this payload type on the wire.
    const TYPE_NAME: &'static str;
}
