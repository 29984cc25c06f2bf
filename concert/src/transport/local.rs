//! The local endpoint: owner of every remote endpoint and driver of the
//! protocol tick.
//!
//! # Threading
//!
//! Inbound bus messages are only enqueued by the bus callback. All protocol
//! work happens in [`LocalEndpoint::tick`], which must be driven from one
//! thread. The only other thread of activity is the optional keep-alive task
//! ([`LocalEndpoint::start_keep_alive`]), which touches nothing but the
//! remote endpoint map, under its lock.
//!
//! # Tick
//!
//! 1. drain inbound messages and dispatch ready ones to handlers
//! 2. evict remote endpoints silent for their whole timeout
//! 3. purge de-duplication records older than the purge delay
//! 4. send queued acknowledgments
//! 5. resend pending reliable messages flagged after a handshake
//! 6. send keep-alives, unless the keep-alive task is running
//! 7. send responses fulfilled by request handlers
//!
//! Connection changes raised during the tick are delivered to observers
//! after step 7.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::codec::CustomMessage;
use crate::config::EndpointSettings;
use crate::error::{EndpointError, EndpointResult};
use crate::time::SharedTime;
use crate::transport::bus::{InboundHandler, InboundMessage, SharedBus};
use crate::transport::keep_alive::{keep_alive_task, KeepAliveHandle};
use crate::transport::message::{
    CustomPayload, DiscoveryData, HandshakeData, Message, MessageBody, ResponseData,
    DISCOVERY_TOPIC,
};
use crate::transport::remote::RemoteEndpoint;
use crate::transport::response::{OutgoingResponse, Response, ResponseFuture, ResponsePromise};
use crate::types::{BusAddress, ChannelId, EndpointContext, EndpointId, MessageId};

/// Handle returned by observer registration.
pub type ObserverId = u64;

/// Change in the connection to a remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteConnectionChange {
    /// First message from a new peer.
    Discovered,
    /// The peer was silent for its whole timeout and was evicted.
    TimedOut,
    /// The peer announced it is going away.
    ClosedRemotely,
}

/// Metadata passed to event and request handlers.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Sending endpoint.
    pub sender: EndpointContext,
    /// Id of the message being handled.
    pub message_id: MessageId,
    /// Sender clock reading when the message was created.
    pub created_at: Duration,
    /// Whether the message was published rather than addressed.
    pub published: bool,
}

type EventHandler = Arc<dyn Fn(&MessageContext, &CustomPayload) + Send + Sync>;
type RequestHandler = Arc<dyn Fn(&MessageContext, &CustomPayload, ResponsePromise) + Send + Sync>;
type ConnectionObserver = Arc<dyn Fn(&EndpointContext, RemoteConnectionChange) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    events: HashMap<&'static str, EventHandler>,
    requests: HashMap<&'static str, RequestHandler>,
}

#[derive(Default)]
struct Observers {
    next_id: ObserverId,
    connection: Vec<(ObserverId, ConnectionObserver)>,
}

struct RemoteMap {
    remotes: HashMap<EndpointId, RemoteEndpoint>,
    next_channel: u16,
}

/// Hand out reliable channels in sequence, never the unreliable one.
fn allocate_channel(next_channel: &mut u16) -> ChannelId {
    let channel = ChannelId(*next_channel);
    *next_channel = next_channel.wrapping_add(1);
    if *next_channel == ChannelId::UNRELIABLE.0 {
        *next_channel = 1;
    }
    channel
}

/// Bus operations collected under the remote map lock and performed after
/// releasing it.
#[derive(Default)]
struct Outbox {
    sends: Vec<(Message, BusAddress)>,
    register: Vec<BusAddress>,
    unregister: Vec<BusAddress>,
}

pub(crate) struct EndpointInner {
    context: EndpointContext,
    settings: EndpointSettings,
    time: SharedTime,
    bus: Mutex<Option<SharedBus>>,
    remotes: Mutex<RemoteMap>,
    handlers: Mutex<Handlers>,
    observers: Mutex<Observers>,
    pending_changes: Mutex<Vec<(EndpointContext, RemoteConnectionChange)>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    responses_tx: mpsc::UnboundedSender<OutgoingResponse>,
    responses_rx: Mutex<mpsc::UnboundedReceiver<OutgoingResponse>>,
    dispatching: AtomicBool,
    keep_alive_running: Arc<AtomicBool>,
}

/// Resets the dispatch flag, including on unwind out of a handler.
struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// An endpoint on the message bus.
///
/// Cheap to clone; clones share the same endpoint. The endpoint is closed
/// when the last clone is dropped.
#[derive(Clone)]
pub struct LocalEndpoint {
    inner: Arc<EndpointInner>,
}

impl std::fmt::Debug for LocalEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEndpoint")
            .field("context", &self.inner.context)
            .finish_non_exhaustive()
    }
}

impl LocalEndpoint {
    /// Create an endpoint on `bus` and start listening.
    ///
    /// The endpoint subscribes to discovery announcements but does not
    /// announce itself; call [`publish_discovery`](Self::publish_discovery).
    pub fn new(
        friendly_name: impl Into<String>,
        settings: EndpointSettings,
        bus: SharedBus,
        time: SharedTime,
    ) -> Self {
        let context = EndpointContext::new(friendly_name);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();

        let handler: InboundHandler = Arc::new(move |inbound: InboundMessage| {
            if inbound_tx.send(inbound).is_err() {
                tracing::trace!("inbound message after endpoint shutdown");
            }
        });
        bus.set_inbound_handler(Some(handler));
        bus.subscribe(DISCOVERY_TOPIC);

        tracing::debug!(endpoint = %context, address = %bus.address(), "local endpoint created");

        Self {
            inner: Arc::new(EndpointInner {
                context,
                settings,
                time,
                bus: Mutex::new(Some(bus)),
                remotes: Mutex::new(RemoteMap {
                    remotes: HashMap::new(),
                    next_channel: 1,
                }),
                handlers: Mutex::new(Handlers::default()),
                observers: Mutex::new(Observers::default()),
                pending_changes: Mutex::new(Vec::new()),
                inbound_rx: Mutex::new(inbound_rx),
                responses_tx,
                responses_rx: Mutex::new(responses_rx),
                dispatching: AtomicBool::new(false),
                keep_alive_running: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Identity of this endpoint.
    pub fn context(&self) -> &EndpointContext {
        &self.inner.context
    }

    /// Id of this endpoint.
    pub fn id(&self) -> EndpointId {
        self.inner.context.id
    }

    /// Settings this endpoint runs with.
    pub fn settings(&self) -> &EndpointSettings {
        &self.inner.settings
    }

    /// Current reading of the endpoint clock.
    pub fn now(&self) -> Duration {
        self.inner.time.now()
    }

    /// Bus address, or `None` once closed.
    pub fn address(&self) -> Option<BusAddress> {
        self.inner.bus().map(|bus| bus.address())
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.bus().is_none()
    }

    /// Number of known remote endpoints.
    pub fn remote_endpoint_count(&self) -> usize {
        self.inner.lock_remotes().remotes.len()
    }

    /// Ids of all known remote endpoints.
    pub fn remote_endpoint_ids(&self) -> Vec<EndpointId> {
        self.inner.lock_remotes().remotes.keys().copied().collect()
    }

    /// Whether `id` is a known remote endpoint.
    pub fn has_remote_endpoint(&self, id: EndpointId) -> bool {
        self.inner.lock_remotes().remotes.contains_key(&id)
    }

    /// Whether the handshake with `id` has completed on this side.
    pub fn has_reliable_channel(&self, id: EndpointId) -> bool {
        self.with_remote_endpoint(id, RemoteEndpoint::has_reliable_channel)
            .unwrap_or(false)
    }

    /// Inspect a remote endpoint under the map lock.
    pub fn with_remote_endpoint<T>(
        &self,
        id: EndpointId,
        f: impl FnOnce(&RemoteEndpoint) -> T,
    ) -> Option<T> {
        self.inner.lock_remotes().remotes.get(&id).map(f)
    }

    /// Announce this endpoint to every endpoint subscribed to discovery.
    pub fn publish_discovery(&self) {
        let Some(bus) = self.inner.bus() else {
            return;
        };
        let message = Message::new(
            self.id(),
            None,
            MessageBody::Discovery(DiscoveryData {
                endpoint: self.inner.context.clone(),
            }),
            self.now(),
        );
        log_traffic("publish", &message);
        bus.publish(message);
    }

    /// Register a handler for events of type `E`.
    ///
    /// Replaces any handler already registered for `E`. Events that fail to
    /// decode are logged and dropped.
    pub fn register_event_handler<E, F>(&self, handler: F)
    where
        E: CustomMessage,
        F: Fn(&MessageContext, E) + Send + Sync + 'static,
    {
        let erased: EventHandler = Arc::new(move |context, payload| match payload.decode::<E>() {
            Ok(event) => handler(context, event),
            Err(e) => {
                tracing::warn!(error = %e, type_name = E::TYPE_NAME, "failed to decode event")
            }
        });
        self.inner.lock_handlers().events.insert(E::TYPE_NAME, erased);
    }

    /// Register a handler for `E` and subscribe to published `E` events.
    pub fn subscribe_event_handler<E, F>(&self, handler: F)
    where
        E: CustomMessage,
        F: Fn(&MessageContext, E) + Send + Sync + 'static,
    {
        self.register_event_handler(handler);
        if let Some(bus) = self.inner.bus() {
            bus.subscribe(E::TYPE_NAME);
        }
    }

    /// Remove the handler for `E`, and its bus subscription if any.
    pub fn unregister_event_handler<E: CustomMessage>(&self) {
        self.inner.lock_handlers().events.remove(E::TYPE_NAME);
        if let Some(bus) = self.inner.bus() {
            bus.unsubscribe(E::TYPE_NAME);
        }
    }

    /// Register a handler for requests of type `R`.
    ///
    /// The handler answers through the [`ResponsePromise`], now or later.
    /// Requests that fail to decode are answered with `Failed`.
    pub fn register_request_handler<R, F>(&self, handler: F)
    where
        R: CustomMessage,
        F: Fn(&MessageContext, R, ResponsePromise) + Send + Sync + 'static,
    {
        let erased: RequestHandler =
            Arc::new(move |context, payload, promise| match payload.decode::<R>() {
                Ok(request) => handler(context, request, promise),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        type_name = R::TYPE_NAME,
                        "failed to decode request"
                    );
                    promise.send_error(e.to_string());
                }
            });
        self.inner.lock_handlers().requests.insert(R::TYPE_NAME, erased);
    }

    /// Remove the handler for `R`. Later requests get `UnknownRequest`.
    pub fn unregister_request_handler<R: CustomMessage>(&self) {
        self.inner.lock_handlers().requests.remove(R::TYPE_NAME);
    }

    /// Observe connection changes of remote endpoints.
    ///
    /// Observers run at the end of the tick that raised the change.
    pub fn on_remote_endpoint_connection_changed<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&EndpointContext, RemoteConnectionChange) + Send + Sync + 'static,
    {
        let mut observers = self.inner.lock_observers();
        observers.next_id += 1;
        let id = observers.next_id;
        observers.connection.push((id, Arc::new(observer)));
        id
    }

    /// Remove a connection observer. Returns whether it was registered.
    pub fn remove_connection_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.inner.lock_observers();
        let before = observers.connection.len();
        observers.connection.retain(|(observer_id, _)| *observer_id != id);
        observers.connection.len() != before
    }

    /// Send an event to one endpoint.
    ///
    /// Reliable events are ordered and acknowledged; the future resolves on
    /// acknowledgment. Unreliable events resolve as soon as they are handed
    /// to the bus. An unknown destination resolves `TimedOut` immediately.
    pub fn send_event<E: CustomMessage>(
        &self,
        event: &E,
        destination: EndpointId,
        reliable: bool,
    ) -> EndpointResult<ResponseFuture> {
        let payload = CustomPayload::encode(event)?;
        Ok(self.inner.send(MessageBody::Event(payload), destination, reliable))
    }

    /// Publish an event to every endpoint subscribed to `E`.
    pub fn publish_event<E: CustomMessage>(&self, event: &E) -> EndpointResult<()> {
        let payload = CustomPayload::encode(event)?;
        let bus = self.inner.bus().ok_or(EndpointError::Closed)?;
        let message = Message::new(self.id(), None, MessageBody::Event(payload), self.now());
        log_traffic("publish", &message);
        bus.publish(message);
        Ok(())
    }

    /// Send a request to one endpoint. Requests are always reliable.
    ///
    /// The future resolves with the handler's response, `UnknownRequest`
    /// when the peer has no handler, or `TimedOut` when the peer is unknown,
    /// evicted or closed.
    pub fn send_request<R: CustomMessage>(
        &self,
        request: &R,
        destination: EndpointId,
    ) -> EndpointResult<ResponseFuture> {
        let payload = CustomPayload::encode(request)?;
        Ok(self.inner.send(MessageBody::Request(payload), destination, true))
    }

    /// Run one protocol tick.
    ///
    /// # Panics
    ///
    /// When called re-entrantly from a message handler.
    pub fn tick(&self) {
        self.inner.tick();
    }

    /// Send keep-alives (and handshake retries) that are due.
    pub fn send_keep_alives(&self) {
        self.inner.send_keep_alives(self.now());
    }

    /// Whether the keep-alive task is running.
    pub fn is_keep_alive_running(&self) -> bool {
        self.inner.keep_alive_running.load(Ordering::SeqCst)
    }

    /// Spawn the keep-alive task on the current tokio runtime.
    ///
    /// While it runs, the tick no longer sends keep-alives itself. The task
    /// stops when the returned handle is stopped or dropped, or when the
    /// endpoint is closed.
    pub fn start_keep_alive(&self) -> EndpointResult<KeepAliveHandle> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EndpointError::NoRuntime)?;
        if self.inner.keep_alive_running.swap(true, Ordering::SeqCst) {
            return Err(EndpointError::KeepAliveRunning);
        }
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        runtime.spawn(keep_alive_task(
            Arc::downgrade(&self.inner),
            self.inner.settings.keep_alive_interval,
            self.inner.keep_alive_running.clone(),
            shutdown_rx,
        ));
        tracing::debug!(endpoint = %self.inner.context, "keep-alive task started");
        Ok(KeepAliveHandle::new(
            shutdown_tx,
            self.inner.keep_alive_running.clone(),
        ))
    }

    /// Close the endpoint.
    ///
    /// Notifies every remote endpoint, resolves every pending send with
    /// `TimedOut` and releases the bus. Later sends resolve `TimedOut`.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl EndpointInner {
    fn lock_remotes(&self) -> MutexGuard<'_, RemoteMap> {
        self.remotes.lock().expect("Failed to lock remote endpoints")
    }

    fn lock_handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().expect("Failed to lock handlers")
    }

    fn lock_observers(&self) -> MutexGuard<'_, Observers> {
        self.observers.lock().expect("Failed to lock observers")
    }

    fn bus(&self) -> Option<SharedBus> {
        self.bus.lock().expect("Failed to lock bus").clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.bus().is_none()
    }

    pub(crate) fn now(&self) -> Duration {
        self.time.now()
    }

    fn raise(&self, context: EndpointContext, change: RemoteConnectionChange) {
        self.pending_changes
            .lock()
            .expect("Failed to lock connection changes")
            .push((context, change));
    }

    fn message_to(&self, remote: &RemoteEndpoint, body: MessageBody, now: Duration) -> Message {
        Message::new(self.context.id, Some(remote.context().id), body, now)
    }

    fn flush(&self, outbox: Outbox) {
        let Some(bus) = self.bus() else {
            tracing::trace!(endpoint = %self.context, "no bus; dropping outgoing messages");
            return;
        };
        for address in &outbox.register {
            bus.register_peer(address);
        }
        for (message, address) in outbox.sends {
            log_traffic("send", &message);
            let reliable = message.is_reliable();
            bus.send(message, &address, reliable);
        }
        for address in &outbox.unregister {
            bus.unregister_peer(address);
        }
    }

    /// Get the remote for `context`, creating it on first contact.
    fn remote_entry<'a>(
        &self,
        map: &'a mut RemoteMap,
        context: &EndpointContext,
        address: &BusAddress,
        now: Duration,
        outbox: &mut Outbox,
    ) -> (&'a mut RemoteEndpoint, bool) {
        let RemoteMap {
            remotes,
            next_channel,
        } = map;
        let (remote, created) = match remotes.entry(context.id) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => {
                let channel = allocate_channel(next_channel);
                let mut remote = RemoteEndpoint::new(
                    context.clone(),
                    address.clone(),
                    channel,
                    self.settings.remote_endpoint_timeout,
                    now,
                );
                remote.set_registered(true);
                outbox.register.push(address.clone());
                tracing::info!(
                    endpoint = %self.context,
                    remote = %context,
                    channel = %channel,
                    "remote endpoint discovered"
                );
                self.raise(context.clone(), RemoteConnectionChange::Discovered);
                (entry.insert(remote), true)
            }
        };
        remote.record_received(now);
        remote.set_address(address.clone());
        (remote, created)
    }

    pub(crate) fn send(
        &self,
        body: MessageBody,
        destination: EndpointId,
        reliable: bool,
    ) -> ResponseFuture {
        let now = self.now();
        let mut outbox = Outbox::default();
        let future = {
            let mut map = self.lock_remotes();
            let Some(remote) = map.remotes.get_mut(&destination) else {
                tracing::debug!(
                    endpoint = %self.context,
                    destination = %destination,
                    "send to unknown endpoint timed out"
                );
                return ResponseFuture::resolved(Response::timed_out());
            };
            let mut message = self.message_to(remote, body, now);
            if reliable {
                let future = remote.queue_message_to_send(&mut message);
                if remote.has_reliable_channel() {
                    remote.record_sent(now);
                    outbox.sends.push((message, remote.address().clone()));
                }
                future
            } else {
                remote.record_sent(now);
                outbox.sends.push((message, remote.address().clone()));
                ResponseFuture::resolved(Response::success(None))
            }
        };
        self.flush(outbox);
        future
    }

    fn tick(&self) {
        let now = self.now();
        self.process_inbound(now);
        self.evict_timed_out(now);
        self.purge_received(now);
        self.send_acknowledgments(now);
        self.resend_pending(now);
        if !self.keep_alive_running.load(Ordering::SeqCst) {
            self.send_keep_alives(now);
        }
        self.send_promised_responses();
        self.flush_connection_changes();
    }

    fn process_inbound(&self, now: Duration) {
        assert!(
            !self.dispatching.swap(true, Ordering::SeqCst),
            "re-entrant inbound message processing on endpoint {}",
            self.context
        );
        let _guard = DispatchGuard(&self.dispatching);
        loop {
            let next = self
                .inbound_rx
                .lock()
                .expect("Failed to lock inbound queue")
                .try_recv();
            match next {
                Ok(inbound) => self.handle_inbound(inbound, now),
                Err(_) => break,
            }
        }
    }

    fn handle_inbound(&self, inbound: InboundMessage, now: Duration) {
        let InboundMessage {
            message,
            sender_address,
        } = inbound;
        if message.sender_id() == self.context.id {
            return;
        }
        if let Some(destination) = message.header.destination_id {
            if destination != self.context.id {
                tracing::debug!(
                    endpoint = %self.context,
                    destination = %destination,
                    "discarding message addressed to another endpoint"
                );
                return;
            }
        }
        log_traffic("receive", &message);

        match &message.body {
            MessageBody::Discovery(data) => {
                self.handle_discovery(&data.endpoint, &sender_address, now)
            }
            MessageBody::Handshake(data) => self.handle_handshake(data, &sender_address, now),
            _ => self.handle_peer_message(message, &sender_address, now),
        }
    }

    fn handle_discovery(&self, context: &EndpointContext, address: &BusAddress, now: Duration) {
        let mut outbox = Outbox::default();
        {
            let mut map = self.lock_remotes();
            let (remote, created) = self.remote_entry(&mut map, context, address, now, &mut outbox);
            if created {
                let timeout = self.settings.remote_endpoint_timeout;
                let negotiate = remote.negotiate(&self.context, timeout, now);
                remote.record_sent(now);
                let message = self.message_to(remote, MessageBody::Handshake(negotiate), now);
                outbox.sends.push((message, address.clone()));
            }
        }
        self.flush(outbox);
    }

    fn handle_handshake(&self, handshake: &HandshakeData, address: &BusAddress, now: Duration) {
        let mut outbox = Outbox::default();
        {
            let mut map = self.lock_remotes();
            let (remote, _) =
                self.remote_entry(&mut map, &handshake.endpoint, address, now, &mut outbox);
            let timeout = self.settings.remote_endpoint_timeout;
            let answer = remote.handle_reliable_handshake(handshake, &self.context, timeout);
            if let Some(answer) = answer {
                remote.record_sent(now);
                let message = self.message_to(remote, MessageBody::Handshake(answer), now);
                outbox.sends.push((message, address.clone()));
            }
        }
        self.flush(outbox);
        // Adopting a channel can release messages that arrived ahead of it.
        self.dispatch_ready(handshake.endpoint.id, now);
    }

    fn handle_peer_message(&self, message: Message, address: &BusAddress, now: Duration) {
        let sender = message.sender_id();
        let mut outbox = Outbox::default();
        {
            let mut map = self.lock_remotes();
            let Some(remote) = map.remotes.get_mut(&sender) else {
                tracing::debug!(
                    endpoint = %self.context,
                    sender = %sender,
                    kind = %message.kind(),
                    "discarding message from unknown endpoint"
                );
                return;
            };
            remote.record_received(now);
            remote.set_address(address.clone());

            match &message.body {
                MessageBody::Ack(ack) => {
                    if !remote.handle_acknowledgement(ack) {
                        tracing::trace!(
                            message_id = %ack.source_message_id,
                            "ack for unknown message"
                        );
                    }
                }
                MessageBody::KeepAlive => {}
                MessageBody::EndpointClosed => {
                    if let Some(mut remote) = map.remotes.remove(&sender) {
                        tracing::info!(
                            endpoint = %self.context,
                            remote = %remote.context(),
                            "remote endpoint closed"
                        );
                        remote.fail_all_pending();
                        if remote.is_registered() {
                            outbox.unregister.push(remote.address().clone());
                        }
                        self.raise(
                            remote.context().clone(),
                            RemoteConnectionChange::ClosedRemotely,
                        );
                    }
                }
                MessageBody::Event(_) | MessageBody::Request(_) | MessageBody::Response(_) => {
                    remote.queue_message_to_receive(message, now);
                }
                MessageBody::Discovery(_) | MessageBody::Handshake(_) => {}
            }
        }
        self.flush(outbox);
        self.dispatch_ready(sender, now);
    }

    /// Dispatch every message the remote has ready, in order.
    fn dispatch_ready(&self, sender: EndpointId, now: Duration) {
        loop {
            let next = {
                let mut map = self.lock_remotes();
                map.remotes.get_mut(&sender).and_then(|remote| {
                    let context = remote.context().clone();
                    remote
                        .get_next_message_to_receive(now)
                        .map(|message| (context, message))
                })
            };
            let Some((sender_context, message)) = next else {
                break;
            };
            self.dispatch(sender_context, message);
        }
    }

    fn dispatch(&self, sender: EndpointContext, message: Message) {
        let context = MessageContext {
            sender,
            message_id: message.id(),
            created_at: message.header.created_at,
            published: message.is_published(),
        };
        match message.body {
            MessageBody::Event(payload) => {
                let handler = self.lock_handlers().events.get(payload.type_name.as_str()).cloned();
                match handler {
                    Some(handler) => handler(&context, &payload),
                    None => tracing::debug!(
                        endpoint = %self.context,
                        type_name = %payload.type_name,
                        "no handler for event"
                    ),
                }
            }
            MessageBody::Request(payload) => {
                let promise = ResponsePromise::new(
                    context.message_id,
                    context.sender.id,
                    self.responses_tx.clone(),
                );
                let handler = self
                    .lock_handlers()
                    .requests
                    .get(payload.type_name.as_str())
                    .cloned();
                match handler {
                    Some(handler) => handler(&context, &payload, promise),
                    None => {
                        tracing::debug!(
                            endpoint = %self.context,
                            type_name = %payload.type_name,
                            "no handler for request"
                        );
                        promise.send(Response::unknown_request(&payload.type_name));
                    }
                }
            }
            MessageBody::Response(data) => self.handle_response(context.sender.id, data),
            _ => {}
        }
    }

    fn handle_response(&self, sender: EndpointId, data: ResponseData) {
        let request_id = data.request_message_id;
        let handled = self
            .lock_remotes()
            .remotes
            .get_mut(&sender)
            .map_or(false, |remote| remote.handle_response(data));
        if !handled {
            tracing::debug!(request = %request_id, "response to unknown request");
        }
    }

    fn evict_timed_out(&self, now: Duration) {
        let mut outbox = Outbox::default();
        let mut evicted = Vec::new();
        {
            let mut map = self.lock_remotes();
            let timed_out: Vec<EndpointId> = map
                .remotes
                .iter()
                .filter(|(_, remote)| remote.is_timed_out(now))
                .map(|(id, _)| *id)
                .collect();
            for id in timed_out {
                if let Some(remote) = map.remotes.remove(&id) {
                    tracing::warn!(
                        endpoint = %self.context,
                        remote = %remote.context(),
                        "remote endpoint timed out"
                    );
                    let closed = self.message_to(&remote, MessageBody::EndpointClosed, now);
                    outbox.sends.push((closed, remote.address().clone()));
                    if remote.is_registered() {
                        outbox.unregister.push(remote.address().clone());
                    }
                    self.raise(remote.context().clone(), RemoteConnectionChange::TimedOut);
                    evicted.push(remote);
                }
            }
        }
        self.flush(outbox);
        for mut remote in evicted {
            remote.fail_all_pending();
        }
    }

    fn purge_received(&self, now: Duration) {
        let purge_span = self.settings.purge_processed_message_delay;
        for remote in self.lock_remotes().remotes.values_mut() {
            remote.purge_old_received_messages(now, purge_span);
        }
    }

    fn send_acknowledgments(&self, now: Duration) {
        let mut outbox = Outbox::default();
        for remote in self.lock_remotes().remotes.values_mut() {
            while let Some(ack) = remote.next_acknowledgment_to_send() {
                let message = self.message_to(remote, MessageBody::Ack(ack), now);
                outbox.sends.push((message, remote.address().clone()));
                remote.record_sent(now);
            }
        }
        self.flush(outbox);
    }

    fn resend_pending(&self, now: Duration) {
        let mut outbox = Outbox::default();
        for remote in self.lock_remotes().remotes.values_mut() {
            if !remote.has_reliable_channel() {
                continue;
            }
            let messages = remote.take_messages_to_resend();
            if messages.is_empty() {
                continue;
            }
            tracing::debug!(
                remote = %remote.context(),
                count = messages.len(),
                "resending pending messages"
            );
            remote.record_sent(now);
            for message in messages {
                outbox.sends.push((message, remote.address().clone()));
            }
        }
        self.flush(outbox);
    }

    pub(crate) fn send_keep_alives(&self, now: Duration) {
        let interval = self.settings.keep_alive_interval;
        let retry = self.settings.handshake_retry_interval;
        let timeout = self.settings.remote_endpoint_timeout;
        let mut outbox = Outbox::default();
        for remote in self.lock_remotes().remotes.values_mut() {
            let body = if remote.needs_handshake(now, retry) {
                MessageBody::Handshake(remote.negotiate(&self.context, timeout, now))
            } else if remote.has_reliable_channel() && remote.needs_keep_alive(now, interval) {
                MessageBody::KeepAlive
            } else {
                continue;
            };
            let message = self.message_to(remote, body, now);
            outbox.sends.push((message, remote.address().clone()));
            remote.record_sent(now);
        }
        self.flush(outbox);
    }

    fn send_promised_responses(&self) {
        loop {
            let next = self
                .responses_rx
                .lock()
                .expect("Failed to lock response queue")
                .try_recv();
            let Ok(outgoing) = next else {
                break;
            };
            // Responses are acknowledged like events; the future is not needed.
            let _ = self.send(MessageBody::Response(outgoing.data), outgoing.destination, true);
        }
    }

    fn flush_connection_changes(&self) {
        let changes = std::mem::take(
            &mut *self
                .pending_changes
                .lock()
                .expect("Failed to lock connection changes"),
        );
        if changes.is_empty() {
            return;
        }
        let observers: Vec<ConnectionObserver> = self
            .lock_observers()
            .connection
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for (context, change) in changes {
            for observer in &observers {
                observer(&context, change);
            }
        }
    }

    fn close(&self) {
        let Some(bus) = self.bus.lock().expect("Failed to lock bus").take() else {
            return;
        };
        let now = self.now();
        let remotes: Vec<RemoteEndpoint> =
            self.lock_remotes().remotes.drain().map(|(_, r)| r).collect();
        for mut remote in remotes {
            let closed = self.message_to(&remote, MessageBody::EndpointClosed, now);
            log_traffic("send", &closed);
            bus.send(closed, remote.address(), false);
            if remote.is_registered() {
                bus.unregister_peer(remote.address());
            }
            remote.fail_all_pending();
        }
        bus.set_inbound_handler(None);
        bus.unsubscribe(DISCOVERY_TOPIC);
        for type_name in self.lock_handlers().events.keys() {
            bus.unsubscribe(type_name);
        }
        tracing::debug!(endpoint = %self.context, "local endpoint closed");
    }
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        self.close();
    }
}

fn log_traffic(direction: &'static str, message: &Message) {
    tracing::trace!(
        target: "concert::traffic",
        direction,
        kind = %message.kind(),
        message_id = %message.id(),
        sender = %message.sender_id(),
        channel = %message.header.channel_id,
        order_index = message.header.order_index,
        "traffic"
    );
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::time::ManualTimeProvider;
    use crate::transport::memory::MemoryBusHub;
    use crate::transport::response::ResponseCode;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    impl CustomMessage for Note {
        const TYPE_NAME: &'static str = "test.Note";
    }

    fn endpoint(hub: &MemoryBusHub, name: &str, time: &ManualTimeProvider) -> LocalEndpoint {
        LocalEndpoint::new(
            name,
            EndpointSettings::default(),
            Arc::new(hub.connect(name)),
            Arc::new(time.clone()),
        )
    }

    #[test]
    fn test_unknown_destination_times_out_immediately() {
        let hub = MemoryBusHub::new();
        let time = ManualTimeProvider::new();
        let local = endpoint(&hub, "local", &time);

        let mut future = local
            .send_event(&Note { text: "hi".into() }, EndpointId::random(), true)
            .expect("encode");
        assert_eq!(future.try_response().map(|r| r.code), Some(ResponseCode::TimedOut));
        assert_eq!(local.remote_endpoint_count(), 0);
    }

    #[test]
    fn test_discovery_creates_remote_and_handshake() {
        let hub = MemoryBusHub::new();
        let time = ManualTimeProvider::new();
        let a = endpoint(&hub, "a", &time);
        let b = endpoint(&hub, "b", &time);

        let discovered = Arc::new(Mutex::new(Vec::new()));
        let sink = discovered.clone();
        b.on_remote_endpoint_connection_changed(move |context, change| {
            sink.lock().expect("events").push((context.id, change));
        });

        a.publish_discovery();
        b.tick();
        assert!(b.has_remote_endpoint(a.id()));
        assert_eq!(
            *discovered.lock().expect("events"),
            vec![(a.id(), RemoteConnectionChange::Discovered)]
        );

        a.tick();
        assert!(a.has_reliable_channel(b.id()));
        b.tick();
        assert!(b.has_reliable_channel(a.id()));
    }

    #[test]
    fn test_unknown_sender_is_discarded() {
        let hub = MemoryBusHub::new();
        let time = ManualTimeProvider::new();
        let a = endpoint(&hub, "a", &time);
        let b = endpoint(&hub, "b", &time);

        let received = Arc::new(AtomicBool::new(false));
        let flag = received.clone();
        b.subscribe_event_handler::<Note, _>(move |_, _| flag.store(true, Ordering::SeqCst));

        a.publish_event(&Note { text: "hello".into() }).expect("publish");
        b.tick();
        assert!(!received.load(Ordering::SeqCst));
        assert_eq!(b.remote_endpoint_count(), 0);
    }

    #[test]
    fn test_close_notifies_peers() {
        let hub = MemoryBusHub::new();
        let time = ManualTimeProvider::new();
        let a = endpoint(&hub, "a", &time);
        let b = endpoint(&hub, "b", &time);
        a.publish_discovery();
        b.tick();
        a.tick();

        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        a.on_remote_endpoint_connection_changed(move |_, change| {
            sink.lock().expect("changes").push(change);
        });

        b.close();
        assert!(b.is_closed());
        a.tick();
        assert!(!a.has_remote_endpoint(b.id()));
        assert_eq!(
            *changes.lock().expect("changes"),
            vec![RemoteConnectionChange::ClosedRemotely]
        );
    }

    #[test]
    fn test_remove_connection_observer() {
        let hub = MemoryBusHub::new();
        let time = ManualTimeProvider::new();
        let a = endpoint(&hub, "a", &time);
        let id = a.on_remote_endpoint_connection_changed(|_, _| {});
        assert!(a.remove_connection_observer(id));
        assert!(!a.remove_connection_observer(id));
    }

    #[test]
    #[should_panic(expected = "re-entrant")]
    fn test_reentrant_tick_panics() {
        let hub = MemoryBusHub::new();
        let time = ManualTimeProvider::new();
        let a = endpoint(&hub, "a", &time);
        let b = endpoint(&hub, "b", &time);
        a.publish_discovery();
        b.tick();
        a.tick();
        b.tick();

        let inner = b.clone();
        b.register_event_handler::<Note, _>(move |_, _| inner.tick());
        let _ = a.send_event(&Note { text: "boom".into() }, b.id(), false);
        b.tick();
    }

    #[test]
    fn test_keep_alive_requires_runtime() {
        let hub = MemoryBusHub::new();
        let time = ManualTimeProvider::new();
        let a = endpoint(&hub, "a", &time);
        assert!(matches!(a.start_keep_alive(), Err(EndpointError::NoRuntime)));
    }
}
