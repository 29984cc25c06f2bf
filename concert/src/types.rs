//! Core identifier types for endpoint addressing.
//!
//! - [`Uid`]: 128-bit unique identifier
//! - [`EndpointId`] / [`MessageId`]: typed wrappers around [`Uid`]
//! - [`ChannelId`]: reliable channel sequence space (0 is unreliable)
//! - [`EndpointContext`]: id + friendly name of an endpoint
//! - [`BusAddress`]: opaque address of an endpoint on the message bus

use std::fmt;

use serde::{Deserialize, Serialize};

/// 128-bit unique identifier.
///
/// # Examples
///
/// ```
/// use concert::Uid;
///
/// let uid = Uid::new(0x123, 0x456);
/// assert!(uid.is_valid());
/// assert!(!Uid::default().is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Uid {
    /// First 64 bits.
    pub first: u64,
    /// Second 64 bits.
    pub second: u64,
}

impl Uid {
    /// Create a new Uid with explicit values.
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    /// Create a random Uid.
    pub fn random() -> Self {
        Self {
            first: rand::random(),
            second: rand::random(),
        }
    }

    /// Check if Uid is valid (non-zero).
    pub const fn is_valid(&self) -> bool {
        self.first != 0 || self.second != 0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}

/// Identifier of an endpoint (local or remote). Stable for the endpoint's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct EndpointId(pub Uid);

impl EndpointId {
    /// Generate a fresh endpoint id.
    pub fn random() -> Self {
        Self(Uid::random())
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a single message, assigned when the send is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct MessageId(pub Uid);

impl MessageId {
    /// Generate a fresh message id.
    pub fn random() -> Self {
        Self(Uid::random())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Reliable channel identifier.
///
/// [`ChannelId::UNRELIABLE`] marks messages that carry no ordering or
/// acknowledgment tracking. Any other value names a per-peer sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ChannelId(pub u16);

impl ChannelId {
    /// Sentinel for unordered, unacknowledged messages.
    pub const UNRELIABLE: ChannelId = ChannelId(0);

    /// Whether this is a real reliable channel.
    pub const fn is_reliable(&self) -> bool {
        self.0 != Self::UNRELIABLE.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of an endpoint on the bus: unique id plus a human readable name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointContext {
    /// Unique, immutable endpoint id.
    pub id: EndpointId,
    /// Friendly name used in logs.
    pub friendly_name: String,
}

impl EndpointContext {
    /// Create a context with a freshly generated id.
    pub fn new(friendly_name: impl Into<String>) -> Self {
        Self {
            id: EndpointId::random(),
            friendly_name: friendly_name.into(),
        }
    }
}

impl fmt::Display for EndpointContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.friendly_name, self.id)
    }
}

/// Address of an endpoint on the underlying message bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusAddress(pub String);

impl BusAddress {
    /// Create an address from any string-like value.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
