//! The message bus the endpoint layer runs on.
//!
//! The bus is an external collaborator: it moves opaque [`Message`]s, either
//! published to every subscriber of a topic or sent to one address. It gives
//! no ordering guarantee across reconnects and no acknowledgments; the
//! endpoint layer builds those on top.

use std::sync::Arc;

use crate::transport::message::Message;
use crate::types::BusAddress;

/// A message delivered by the bus, with the address it came from.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// The delivered message.
    pub message: Message,
    /// Bus address of the sending endpoint.
    pub sender_address: BusAddress,
}

/// Catch-all callback invoked by the bus for every inbound message.
///
/// Called from whatever thread the bus delivers on; implementations must
/// only enqueue.
pub type InboundHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Publish/send primitives of the underlying bus.
pub trait MessageBus: Send + Sync {
    /// Address of this bus connection.
    fn address(&self) -> BusAddress;

    /// Fire-and-forget broadcast to every subscriber of the message topic.
    fn publish(&self, message: Message);

    /// Point-to-point send.
    ///
    /// `reliable` asks the bus for at-least-once delivery. It is orthogonal
    /// to the endpoint layer's own reliable channels.
    fn send(&self, message: Message, destination: &BusAddress, reliable: bool);

    /// Start receiving published messages for `topic`.
    fn subscribe(&self, topic: &str);

    /// Stop receiving published messages for `topic`.
    fn unsubscribe(&self, topic: &str);

    /// Install (or clear) the inbound callback.
    fn set_inbound_handler(&self, handler: Option<InboundHandler>);

    /// A peer address became known to an endpoint on this connection.
    fn register_peer(&self, _address: &BusAddress) {}

    /// A peer address is no longer used by any endpoint on this connection.
    fn unregister_peer(&self, _address: &BusAddress) {}
}

/// Shared handle to a bus connection.
pub type SharedBus = Arc<dyn MessageBus>;
