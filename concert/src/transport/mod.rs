//! Reliable endpoint messaging over an unreliable message bus.
//!
//! - [`message`]: envelope and protocol message kinds
//! - [`remote`]: per-peer channel, ordering and acknowledgment state
//! - [`local`]: endpoint owning the remotes and driving the tick
//! - [`response`]: futures and promises for events and requests
//! - [`bus`] / [`memory`]: bus abstraction and the in-process bus
//! - [`provider`]: endpoint factories

pub mod bus;
pub mod keep_alive;
pub mod local;
pub mod memory;
pub mod message;
pub mod provider;
pub mod remote;
pub mod response;

pub use bus::{InboundHandler, InboundMessage, MessageBus, SharedBus};
pub use keep_alive::KeepAliveHandle;
pub use local::{LocalEndpoint, MessageContext, ObserverId, RemoteConnectionChange};
pub use memory::{Delivery, MemoryBusHub, MemoryBusNode};
pub use message::{
    AckData, CustomPayload, DiscoveryData, HandshakeData, HandshakeState, Message, MessageBody,
    MessageHeader, MessageKind, ResponseData, DISCOVERY_TOPIC,
};
pub use provider::{EndpointProvider, MemoryEndpointProvider, SharedEndpointProvider};
pub use remote::{ReceiveOutcome, RemoteEndpoint, FIRST_MESSAGE_INDEX};
pub use response::{Response, ResponseCode, ResponseFuture, ResponsePromise};
