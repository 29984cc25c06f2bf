//! Message envelope and the protocol message kinds.
//!
//! Every message carries a [`MessageHeader`] with enough metadata to be
//! ordered within its channel, matched back to its sender, de-duplicated and
//! correlated as a request/response pair. The body is a closed sum type of
//! the protocol kinds; application data rides in [`CustomPayload`].
//!
//! # Channel assignment
//!
//! ```text
//! Message::new        message_id + sender_id assigned, channel = UNRELIABLE
//!       │
//!       ▼
//! RemoteEndpoint::queue_message_to_send
//!                     channel = peer's reliable channel, order index = next
//! ```
//!
//! The reliable channel is only known once the destination is resolved, so
//! construction never assigns it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, CustomMessage, JsonCodec, MessageCodec};
use crate::transport::response::ResponseCode;
use crate::types::{ChannelId, EndpointContext, EndpointId, MessageId};

/// Bus topic used by endpoint discovery announcements.
pub const DISCOVERY_TOPIC: &str = "concert.EndpointDiscovery";

/// Common header of every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Unique per message.
    pub message_id: MessageId,
    /// Endpoint that created the message.
    pub sender_id: EndpointId,
    /// Intended recipient; `None` for published messages.
    pub destination_id: Option<EndpointId>,
    /// Reliable channel, or [`ChannelId::UNRELIABLE`].
    pub channel_id: ChannelId,
    /// Position within the channel. Meaningless on the unreliable channel.
    pub order_index: u32,
    /// Sender clock reading at construction.
    pub created_at: Duration,
}

/// Application payload: a type tag plus its serialized bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomPayload {
    /// Dispatch key, see [`CustomMessage::TYPE_NAME`].
    pub type_name: String,
    /// Codec-encoded value.
    pub bytes: Vec<u8>,
}

impl CustomPayload {
    /// Encode a typed message with the default codec.
    pub fn encode<T: CustomMessage>(value: &T) -> Result<Self, CodecError> {
        Self::encode_with(&JsonCodec, value)
    }

    /// Encode a typed message with an explicit codec.
    pub fn encode_with<C: MessageCodec, T: CustomMessage>(
        codec: &C,
        value: &T,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            type_name: T::TYPE_NAME.to_string(),
            bytes: codec.encode(value)?,
        })
    }

    /// Decode into a typed message with the default codec.
    pub fn decode<T: CustomMessage>(&self) -> Result<T, CodecError> {
        self.decode_with(&JsonCodec)
    }

    /// Decode into a typed message with an explicit codec.
    pub fn decode_with<C: MessageCodec, T: CustomMessage>(
        &self,
        codec: &C,
    ) -> Result<T, CodecError> {
        if self.type_name != T::TYPE_NAME {
            return Err(CodecError::TypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                found: self.type_name.clone(),
            });
        }
        codec.decode(&self.bytes)
    }

    /// Whether this payload carries `T`.
    pub fn is<T: CustomMessage>(&self) -> bool {
        self.type_name == T::TYPE_NAME
    }
}

/// Announcement that an endpoint exists at the sender's bus address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryData {
    /// The announcing endpoint.
    pub endpoint: EndpointContext,
}

/// Step of the reliable-channel handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeState {
    /// Proposes the sender's channel and expects a `Success` answer.
    Negotiate,
    /// Confirms a `Negotiate`, echoing the responder's own channel.
    Success,
}

/// Reliable-channel handshake payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeData {
    /// Step of the exchange.
    pub state: HandshakeState,
    /// The sending endpoint.
    pub endpoint: EndpointContext,
    /// Channel the sender uses for reliable messages to the recipient.
    pub reliable_channel_id: ChannelId,
    /// First order index the recipient should expect on that channel.
    pub next_message_index: u32,
    /// Silence the recipient may tolerate before evicting the sender.
    pub endpoint_timeout: Duration,
}

/// Acknowledgment of a reliable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckData {
    /// Message being acknowledged.
    pub source_message_id: MessageId,
    /// Channel the acknowledged message arrived on.
    pub channel_id: ChannelId,
    /// Order index of the acknowledged message.
    pub order_index: u32,
    /// Clock reading of the acknowledging side when the ack was queued.
    pub sent_at: Duration,
}

/// Response to a custom request, correlated by the request's message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    /// Message id of the request being answered.
    pub request_message_id: MessageId,
    /// Outcome of the request.
    pub code: ResponseCode,
    /// Human readable failure reason; empty on success.
    pub reason: String,
    /// Application response, if any.
    pub payload: Option<CustomPayload>,
}

/// Body of a message: one of the protocol kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Endpoint announcement.
    Discovery(DiscoveryData),
    /// Reliable-channel handshake.
    Handshake(HandshakeData),
    /// Acknowledgment of a reliable message.
    Ack(AckData),
    /// Heartbeat resetting the recipient's liveness clock.
    KeepAlive,
    /// The sender is going away (or evicted the recipient).
    EndpointClosed,
    /// Fire-and-forget application event.
    Event(CustomPayload),
    /// Application request expecting a [`MessageBody::Response`].
    Request(CustomPayload),
    /// Answer to a request.
    Response(ResponseData),
}

/// Discriminant of [`MessageBody`], used in logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// [`MessageBody::Discovery`]
    Discovery,
    /// [`MessageBody::Handshake`]
    Handshake,
    /// [`MessageBody::Ack`]
    Ack,
    /// [`MessageBody::KeepAlive`]
    KeepAlive,
    /// [`MessageBody::EndpointClosed`]
    EndpointClosed,
    /// [`MessageBody::Event`]
    Event,
    /// [`MessageBody::Request`]
    Request,
    /// [`MessageBody::Response`]
    Response,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl MessageBody {
    /// Discriminant of this body.
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Discovery(_) => MessageKind::Discovery,
            MessageBody::Handshake(_) => MessageKind::Handshake,
            MessageBody::Ack(_) => MessageKind::Ack,
            MessageBody::KeepAlive => MessageKind::KeepAlive,
            MessageBody::EndpointClosed => MessageKind::EndpointClosed,
            MessageBody::Event(_) => MessageKind::Event,
            MessageBody::Request(_) => MessageKind::Request,
            MessageBody::Response(_) => MessageKind::Response,
        }
    }
}

/// A message as it travels on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Common metadata.
    pub header: MessageHeader,
    /// Protocol kind and payload.
    pub body: MessageBody,
}

impl Message {
    /// Build a message for sending.
    ///
    /// Assigns a fresh message id and the sender id. The channel stays
    /// unreliable and the order index zero until a remote endpoint queues it.
    pub fn new(
        sender_id: EndpointId,
        destination_id: Option<EndpointId>,
        body: MessageBody,
        created_at: Duration,
    ) -> Self {
        Self {
            header: MessageHeader {
                message_id: MessageId::random(),
                sender_id,
                destination_id,
                channel_id: ChannelId::UNRELIABLE,
                order_index: 0,
                created_at,
            },
            body,
        }
    }

    /// Message id shorthand.
    pub fn id(&self) -> MessageId {
        self.header.message_id
    }

    /// Sender id shorthand.
    pub fn sender_id(&self) -> EndpointId {
        self.header.sender_id
    }

    /// Protocol kind shorthand.
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Whether the message travels on a reliable channel.
    pub fn is_reliable(&self) -> bool {
        self.header.channel_id.is_reliable()
    }

    /// Whether the message was published rather than addressed.
    pub fn is_published(&self) -> bool {
        self.header.destination_id.is_none()
    }

    /// Bus topic for publishing, if this kind can be published.
    pub fn topic(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Discovery(_) => Some(DISCOVERY_TOPIC),
            MessageBody::Event(payload) => Some(&payload.type_name),
            _ => None,
        }
    }
}
