//! In-process message bus.
//!
//! [`MemoryBusHub`] connects any number of [`MemoryBusNode`]s living in the
//! same process. Delivery is synchronous: a publish or send invokes the
//! recipients' inbound handlers before returning, unless the hub is paused.
//!
//! # Fault injection
//!
//! - [`pause`](MemoryBusHub::pause) holds every delivery; held deliveries can
//!   be inspected, reordered, duplicated or dropped and then handed back with
//!   [`deliver`](MemoryBusHub::deliver) or [`release_held`](MemoryBusHub::release_held).
//! - [`set_drop_filter`](MemoryBusHub::set_drop_filter) silently loses every
//!   delivery the filter matches.
//! - [`disconnect`](MemoryBusHub::disconnect) makes a node unreachable, as if
//!   its process died.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::transport::bus::{InboundHandler, InboundMessage, MessageBus};
use crate::transport::message::Message;
use crate::types::BusAddress;

/// One message in flight between two nodes.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Sending node.
    pub from: BusAddress,
    /// Receiving node.
    pub to: BusAddress,
    /// The message.
    pub message: Message,
}

type DropFilter = Arc<dyn Fn(&Delivery) -> bool + Send + Sync>;

#[derive(Default)]
struct NodeState {
    handler: Option<InboundHandler>,
    topics: HashSet<String>,
}

#[derive(Default)]
struct HubState {
    nodes: HashMap<BusAddress, NodeState>,
    next_node: u64,
    paused: bool,
    held: Vec<Delivery>,
    drop_filter: Option<DropFilter>,
    delivered: u64,
    dropped: u64,
}

/// Hub connecting in-process bus nodes. Clones share the same hub.
#[derive(Clone, Default)]
pub struct MemoryBusHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryBusHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().expect("Failed to lock memory bus hub")
    }

    /// Attach a new node. `name` only shapes the generated address.
    pub fn connect(&self, name: &str) -> MemoryBusNode {
        let address = {
            let mut state = self.lock();
            state.next_node += 1;
            let address = BusAddress::new(format!("mem://{}/{}", name, state.next_node));
            state.nodes.insert(address.clone(), NodeState::default());
            address
        };
        tracing::debug!(address = %address, "memory bus node connected");
        MemoryBusNode {
            hub: self.clone(),
            address,
        }
    }

    /// Remove a node; deliveries to it are lost from now on.
    pub fn disconnect(&self, address: &BusAddress) {
        if self.lock().nodes.remove(address).is_some() {
            tracing::debug!(address = %address, "memory bus node disconnected");
        }
    }

    /// Hold deliveries instead of dispatching them.
    pub fn pause(&self) {
        self.lock().paused = true;
    }

    /// Dispatch deliveries again. Already held deliveries stay held.
    pub fn resume(&self) {
        self.lock().paused = false;
    }

    /// Number of held deliveries.
    pub fn held_count(&self) -> usize {
        self.lock().held.len()
    }

    /// Take every held delivery, in the order they were made.
    pub fn take_held(&self) -> Vec<Delivery> {
        std::mem::take(&mut self.lock().held)
    }

    /// Resume and dispatch every held delivery in order.
    pub fn release_held(&self) {
        let held = {
            let mut state = self.lock();
            state.paused = false;
            std::mem::take(&mut state.held)
        };
        for delivery in held {
            self.deliver(delivery);
        }
    }

    /// Lose every delivery for which `filter` returns true.
    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: Fn(&Delivery) -> bool + Send + Sync + 'static,
    {
        self.lock().drop_filter = Some(Arc::new(filter));
    }

    /// Stop losing deliveries.
    pub fn clear_drop_filter(&self) {
        self.lock().drop_filter = None;
    }

    /// Total deliveries dispatched to a handler.
    pub fn delivered_count(&self) -> u64 {
        self.lock().delivered
    }

    /// Total deliveries lost to the drop filter or a missing node.
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    /// Dispatch one delivery now, bypassing pause but not the drop filter.
    pub fn deliver(&self, delivery: Delivery) {
        let handler = {
            let mut state = self.lock();
            if let Some(filter) = state.drop_filter.clone() {
                if filter(&delivery) {
                    state.dropped += 1;
                    tracing::trace!(to = %delivery.to, "memory bus dropped delivery");
                    return;
                }
            }
            match state.nodes.get(&delivery.to).and_then(|n| n.handler.clone()) {
                Some(handler) => {
                    state.delivered += 1;
                    handler
                }
                None => {
                    state.dropped += 1;
                    return;
                }
            }
        };
        handler(InboundMessage {
            message: delivery.message,
            sender_address: delivery.from,
        });
    }

    fn route(&self, deliveries: Vec<Delivery>) {
        {
            let mut state = self.lock();
            if state.paused {
                state.held.extend(deliveries);
                return;
            }
        }
        for delivery in deliveries {
            self.deliver(delivery);
        }
    }
}

/// A node's connection to a [`MemoryBusHub`]. Dropping it disconnects.
pub struct MemoryBusNode {
    hub: MemoryBusHub,
    address: BusAddress,
}

impl MemoryBusNode {
    /// The hub this node belongs to.
    pub fn hub(&self) -> &MemoryBusHub {
        &self.hub
    }
}

impl MessageBus for MemoryBusNode {
    fn address(&self) -> BusAddress {
        self.address.clone()
    }

    fn publish(&self, message: Message) {
        let Some(topic) = message.topic().map(str::to_owned) else {
            tracing::warn!(kind = %message.kind(), "message kind cannot be published");
            return;
        };
        let targets: Vec<BusAddress> = self
            .hub
            .lock()
            .nodes
            .iter()
            .filter(|(address, node)| **address != self.address && node.topics.contains(&topic))
            .map(|(address, _)| address.clone())
            .collect();
        let deliveries = targets
            .into_iter()
            .map(|to| Delivery {
                from: self.address.clone(),
                to,
                message: message.clone(),
            })
            .collect();
        self.hub.route(deliveries);
    }

    fn send(&self, message: Message, destination: &BusAddress, _reliable: bool) {
        self.hub.route(vec![Delivery {
            from: self.address.clone(),
            to: destination.clone(),
            message,
        }]);
    }

    fn subscribe(&self, topic: &str) {
        if let Some(node) = self.hub.lock().nodes.get_mut(&self.address) {
            node.topics.insert(topic.to_string());
        }
    }

    fn unsubscribe(&self, topic: &str) {
        if let Some(node) = self.hub.lock().nodes.get_mut(&self.address) {
            node.topics.remove(topic);
        }
    }

    fn set_inbound_handler(&self, handler: Option<InboundHandler>) {
        if let Some(node) = self.hub.lock().nodes.get_mut(&self.address) {
            node.handler = handler;
        }
    }
}

impl Drop for MemoryBusNode {
    fn drop(&mut self) {
        self.hub.disconnect(&self.address);
    }
}
