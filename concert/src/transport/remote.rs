//! Per-peer reliable delivery state.
//!
//! A [`RemoteEndpoint`] is owned by exactly one [`LocalEndpoint`](crate::LocalEndpoint)
//! and tracks everything needed to talk reliably to one peer:
//!
//! ```text
//!            outbound                                  inbound
//!  queue_message_to_send                      queue_message_to_receive
//!     │ channel + order index                    │ de-dup (id, order index)
//!     ▼                                          ├──────────────┐
//!  pending_send (send order)                 in order      out of order
//!     │ Ack: event/response done                 │              │
//!     │ Ack: request → Acknowledged              ▼              ▼
//!     │ Response: request done           ready_to_receive ◄── (channel, index)
//!     ▼                                          │   drain contiguous
//!  resolved ResponseFuture            get_next_message_to_receive
//! ```
//!
//! Reliable messages are only accepted in order on the channel learned from
//! the peer's handshake. Messages arriving on a channel we have not
//! negotiated yet are buffered without acknowledgment. When the handshake
//! adopts their channel they are acknowledged and drained in order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use crate::transport::message::{
    AckData, HandshakeData, HandshakeState, Message, MessageBody, ResponseData,
};
use crate::transport::response::{complete, response_channel, Completion, Response, ResponseFuture};
use crate::types::{BusAddress, ChannelId, EndpointContext, MessageId};

/// First order index used on every reliable channel.
pub const FIRST_MESSAGE_INDEX: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingState {
    /// Not yet acknowledged; resent after a handshake.
    Pending,
    /// Request acknowledged, waiting for its response.
    Acknowledged,
}

#[derive(Debug)]
struct PendingMessage {
    message: Message,
    state: PendingState,
    completion: Option<Completion>,
}

/// Outcome of [`RemoteEndpoint::queue_message_to_receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Ready to process.
    Ready,
    /// Buffered until its predecessors arrive.
    Buffered,
    /// Already seen; discarded.
    Duplicate,
}

/// One peer known to a local endpoint.
#[derive(Debug)]
pub struct RemoteEndpoint {
    context: EndpointContext,
    address: BusAddress,
    registered: bool,

    reliable_channel_id_to_send: ChannelId,
    reliable_channel_id_to_receive: ChannelId,
    next_message_index_to_send: u32,
    next_message_index_to_receive: u32,

    last_sent_time: Duration,
    last_received_time: Duration,
    last_handshake_time: Option<Duration>,
    endpoint_timeout: Duration,
    pending_resend: bool,

    pending_send: VecDeque<PendingMessage>,
    pending_acks: VecDeque<AckData>,
    ready_to_receive: VecDeque<Message>,
    out_of_order: BTreeMap<(ChannelId, u32), Message>,
    recently_received: HashMap<MessageId, Duration>,
}

impl RemoteEndpoint {
    /// Create the state for a newly discovered peer.
    ///
    /// `reliable_channel_id_to_send` is the channel this side uses for
    /// reliable messages to the peer. `endpoint_timeout` applies until the
    /// peer's handshake advertises its own value.
    pub fn new(
        context: EndpointContext,
        address: BusAddress,
        reliable_channel_id_to_send: ChannelId,
        endpoint_timeout: Duration,
        now: Duration,
    ) -> Self {
        debug_assert!(reliable_channel_id_to_send.is_reliable());
        Self {
            context,
            address,
            registered: false,
            reliable_channel_id_to_send,
            reliable_channel_id_to_receive: ChannelId::UNRELIABLE,
            next_message_index_to_send: FIRST_MESSAGE_INDEX,
            next_message_index_to_receive: FIRST_MESSAGE_INDEX,
            last_sent_time: now,
            last_received_time: now,
            last_handshake_time: None,
            endpoint_timeout,
            pending_resend: false,
            pending_send: VecDeque::new(),
            pending_acks: VecDeque::new(),
            ready_to_receive: VecDeque::new(),
            out_of_order: BTreeMap::new(),
            recently_received: HashMap::new(),
        }
    }

    /// Identity of the peer.
    pub fn context(&self) -> &EndpointContext {
        &self.context
    }

    /// Bus address the peer was last heard from.
    pub fn address(&self) -> &BusAddress {
        &self.address
    }

    pub(crate) fn set_address(&mut self, address: BusAddress) {
        self.address = address;
    }

    /// Whether the peer address is registered with the bus.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub(crate) fn set_registered(&mut self, registered: bool) {
        self.registered = registered;
    }

    /// Channel used for reliable messages sent to the peer.
    pub fn reliable_channel_id_to_send(&self) -> ChannelId {
        self.reliable_channel_id_to_send
    }

    /// Channel negotiated for reliable messages from the peer.
    pub fn reliable_channel_id_to_receive(&self) -> ChannelId {
        self.reliable_channel_id_to_receive
    }

    /// Order index the next queued reliable message will get.
    pub fn next_message_index_to_send(&self) -> u32 {
        self.next_message_index_to_send
    }

    /// Order index expected next from the peer.
    pub fn next_message_index_to_receive(&self) -> u32 {
        self.next_message_index_to_receive
    }

    /// Last time anything was sent to the peer.
    pub fn last_sent_time(&self) -> Duration {
        self.last_sent_time
    }

    /// Last time anything was received from the peer.
    pub fn last_received_time(&self) -> Duration {
        self.last_received_time
    }

    /// Silence tolerated before the peer is evicted.
    pub fn endpoint_timeout(&self) -> Duration {
        self.endpoint_timeout
    }

    /// True once the peer's handshake assigned a channel to receive on.
    pub fn has_reliable_channel(&self) -> bool {
        self.reliable_channel_id_to_receive.is_reliable()
    }

    /// Whether pending messages must be resent on the next tick.
    pub fn is_pending_resend(&self) -> bool {
        self.pending_resend
    }

    /// Reliable messages sent and not yet completed.
    pub fn pending_send_count(&self) -> usize {
        self.pending_send.len()
    }

    /// Messages ready for dispatch.
    pub fn ready_to_receive_count(&self) -> usize {
        self.ready_to_receive.len()
    }

    /// Messages buffered out of order.
    pub fn out_of_order_count(&self) -> usize {
        self.out_of_order.len()
    }

    /// Message ids remembered for de-duplication.
    pub fn recently_received_count(&self) -> usize {
        self.recently_received.len()
    }

    pub(crate) fn record_sent(&mut self, now: Duration) {
        self.last_sent_time = now;
    }

    pub(crate) fn record_received(&mut self, now: Duration) {
        self.last_received_time = self.last_received_time.max(now);
    }

    /// Queue a reliable message for the peer.
    ///
    /// Assigns the channel and the next order index. Nothing is sent here;
    /// the owner flushes the message once [`has_reliable_channel`](Self::has_reliable_channel)
    /// holds, and resends it after every handshake until it is acknowledged.
    pub fn queue_message_to_send(&mut self, message: &mut Message) -> ResponseFuture {
        message.header.channel_id = self.reliable_channel_id_to_send;
        message.header.order_index = self.next_message_index_to_send;
        self.next_message_index_to_send = self.next_message_index_to_send.wrapping_add(1);

        let (completion, future) = response_channel();
        self.pending_send.push_back(PendingMessage {
            message: message.clone(),
            state: PendingState::Pending,
            completion: Some(completion),
        });
        future
    }

    /// Order index the peer should expect first on our channel.
    fn advertised_next_index(&self) -> u32 {
        self.pending_send
            .iter()
            .find(|p| p.state == PendingState::Pending)
            .map(|p| p.message.header.order_index)
            .unwrap_or(self.next_message_index_to_send)
    }

    /// Build a `Negotiate` handshake proposing our channel.
    pub fn negotiate(
        &mut self,
        local: &EndpointContext,
        local_timeout: Duration,
        now: Duration,
    ) -> HandshakeData {
        self.last_handshake_time = Some(now);
        HandshakeData {
            state: HandshakeState::Negotiate,
            endpoint: local.clone(),
            reliable_channel_id: self.reliable_channel_id_to_send,
            next_message_index: self.advertised_next_index(),
            endpoint_timeout: local_timeout,
        }
    }

    /// Whether a `Negotiate` should be (re)sent.
    pub fn needs_handshake(&self, now: Duration, retry_interval: Duration) -> bool {
        !self.has_reliable_channel()
            && self
                .last_handshake_time
                .map_or(true, |t| now.saturating_sub(t) >= retry_interval)
    }

    /// Process a handshake from the peer.
    ///
    /// Records the peer's timeout and, the first time a channel is seen,
    /// adopts it together with its starting order index. Buffered messages
    /// that now line up become ready. Returns the `Success` answer to send
    /// when `handshake` is a `Negotiate`. Replaying the same handshake leaves
    /// the channel untouched and yields the same answer.
    pub fn handle_reliable_handshake(
        &mut self,
        handshake: &HandshakeData,
        local: &EndpointContext,
        local_timeout: Duration,
    ) -> Option<HandshakeData> {
        self.endpoint_timeout = handshake.endpoint_timeout;

        if handshake.reliable_channel_id.is_reliable()
            && handshake.reliable_channel_id != self.reliable_channel_id_to_receive
        {
            let channel = handshake.reliable_channel_id;
            let next = handshake.next_message_index;
            tracing::debug!(
                endpoint = %self.context,
                channel = %channel,
                next_index = next,
                "reliable channel negotiated"
            );
            self.reliable_channel_id_to_receive = channel;
            self.next_message_index_to_receive = next;
            self.out_of_order.retain(|(buffered_channel, index), _| {
                *buffered_channel == channel && *index >= next
            });
            // Kept messages arrived before the channel was known and were never acked.
            let sent_at = self.last_received_time;
            let acks: Vec<AckData> = self
                .out_of_order
                .iter()
                .map(|(&(channel_id, order_index), message)| AckData {
                    source_message_id: message.id(),
                    channel_id,
                    order_index,
                    sent_at,
                })
                .collect();
            self.pending_acks.extend(acks);
            self.drain_contiguous();
        }
        self.pending_resend = true;

        match handshake.state {
            HandshakeState::Negotiate => Some(HandshakeData {
                state: HandshakeState::Success,
                endpoint: local.clone(),
                reliable_channel_id: self.reliable_channel_id_to_send,
                next_message_index: self.advertised_next_index(),
                endpoint_timeout: local_timeout,
            }),
            HandshakeState::Success => None,
        }
    }

    fn drain_contiguous(&mut self) {
        let channel = self.reliable_channel_id_to_receive;
        while let Some(message) = self
            .out_of_order
            .remove(&(channel, self.next_message_index_to_receive))
        {
            self.recently_received.insert(message.id(), self.last_received_time);
            self.ready_to_receive.push_back(message);
            self.next_message_index_to_receive = self.next_message_index_to_receive.wrapping_add(1);
        }
    }

    /// Queue an acknowledgment for the next tick.
    pub fn queue_acknowledgment_to_send(&mut self, ack: AckData) {
        self.pending_acks.push_back(ack);
    }

    /// Take the oldest queued acknowledgment.
    pub fn next_acknowledgment_to_send(&mut self) -> Option<AckData> {
        self.pending_acks.pop_front()
    }

    /// Classify an inbound message.
    ///
    /// Reliable messages on the negotiated channel are acknowledged, even
    /// when they turn out to be duplicates, so a sender that missed the
    /// first ack stops resending.
    pub fn queue_message_to_receive(&mut self, message: Message, now: Duration) -> ReceiveOutcome {
        let id = message.id();
        let channel = message.header.channel_id;
        let index = message.header.order_index;
        let on_negotiated_channel =
            channel.is_reliable() && channel == self.reliable_channel_id_to_receive;

        if on_negotiated_channel {
            self.queue_acknowledgment_to_send(AckData {
                source_message_id: id,
                channel_id: channel,
                order_index: index,
                sent_at: now,
            });
        }

        if self.recently_received.contains_key(&id) {
            tracing::trace!(endpoint = %self.context, message_id = %id, "duplicate message id");
            return ReceiveOutcome::Duplicate;
        }

        if !channel.is_reliable() {
            self.recently_received.insert(id, now);
            self.ready_to_receive.push_back(message);
            return ReceiveOutcome::Ready;
        }

        if on_negotiated_channel && index < self.next_message_index_to_receive {
            tracing::trace!(endpoint = %self.context, index, "stale order index");
            return ReceiveOutcome::Duplicate;
        }

        if on_negotiated_channel && index == self.next_message_index_to_receive {
            self.recently_received.insert(id, now);
            self.ready_to_receive.push_back(message);
            self.next_message_index_to_receive = self.next_message_index_to_receive.wrapping_add(1);
            self.drain_contiguous();
            return ReceiveOutcome::Ready;
        }

        let key = (channel, index);
        if self.out_of_order.contains_key(&key) {
            return ReceiveOutcome::Duplicate;
        }
        self.out_of_order.insert(key, message);
        ReceiveOutcome::Buffered
    }

    /// Pop the oldest message ready for dispatch.
    pub fn get_next_message_to_receive(&mut self, now: Duration) -> Option<Message> {
        let message = self.ready_to_receive.pop_front()?;
        self.recently_received.insert(message.id(), now);
        Some(message)
    }

    /// Forget processed message ids older than `purge_span`.
    pub fn purge_old_received_messages(&mut self, now: Duration, purge_span: Duration) {
        self.recently_received
            .retain(|_, received| now.saturating_sub(*received) < purge_span);
    }

    /// Process an acknowledgment.
    ///
    /// Events and responses are complete once acknowledged. Requests stay
    /// pending until their response, but are no longer resent.
    pub fn handle_acknowledgement(&mut self, ack: &AckData) -> bool {
        let Some(position) = self
            .pending_send
            .iter()
            .position(|p| p.message.id() == ack.source_message_id)
        else {
            return false;
        };

        if matches!(self.pending_send[position].message.body, MessageBody::Request(_)) {
            self.pending_send[position].state = PendingState::Acknowledged;
        } else if let Some(pending) = self.pending_send.remove(position) {
            if let Some(completion) = pending.completion {
                complete(completion, Response::success(None));
            }
        }
        true
    }

    /// Complete a pending request with its response.
    pub fn handle_response(&mut self, response: ResponseData) -> bool {
        let Some(position) = self
            .pending_send
            .iter()
            .position(|p| p.message.id() == response.request_message_id)
        else {
            return false;
        };
        if let Some(pending) = self.pending_send.remove(position) {
            if let Some(completion) = pending.completion {
                complete(completion, Response::from(response));
            }
        }
        true
    }

    /// Messages to resend after a handshake; empty unless flagged.
    pub fn take_messages_to_resend(&mut self) -> Vec<Message> {
        if !std::mem::take(&mut self.pending_resend) {
            return Vec::new();
        }
        self.pending_send
            .iter()
            .filter(|p| p.state == PendingState::Pending)
            .map(|p| p.message.clone())
            .collect()
    }

    /// Whether the peer has been silent for its whole timeout span.
    pub fn is_timed_out(&self, now: Duration) -> bool {
        self.last_received_time
            .checked_add(self.endpoint_timeout)
            .map_or(false, |deadline| deadline <= now)
    }

    /// Whether a keep-alive is due.
    pub fn needs_keep_alive(&self, now: Duration, interval: Duration) -> bool {
        now.saturating_sub(self.last_sent_time) >= interval
    }

    /// Resolve every pending outbound future with `TimedOut`.
    pub fn fail_all_pending(&mut self) {
        for pending in self.pending_send.drain(..) {
            if let Some(completion) = pending.completion {
                complete(completion, Response::timed_out());
            }
        }
    }
}

impl Drop for RemoteEndpoint {
    fn drop(&mut self) {
        self.fail_all_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message::CustomPayload;
    use crate::transport::response::ResponseCode;
    use crate::types::EndpointId;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn remote() -> RemoteEndpoint {
        RemoteEndpoint::new(
            EndpointContext::new("peer"),
            BusAddress::new("mem://peer/1"),
            ChannelId(7),
            TIMEOUT,
            Duration::ZERO,
        )
    }

    fn handshake(state: HandshakeState, channel: u16, next: u32) -> HandshakeData {
        HandshakeData {
            state,
            endpoint: EndpointContext::new("other"),
            reliable_channel_id: ChannelId(channel),
            next_message_index: next,
            endpoint_timeout: Duration::from_secs(3),
        }
    }

    fn event(channel: u16, index: u32) -> Message {
        let mut message = Message::new(
            EndpointId::random(),
            Some(EndpointId::random()),
            MessageBody::Event(CustomPayload {
                type_name: "test.Event".to_string(),
                bytes: index.to_be_bytes().to_vec(),
            }),
            Duration::ZERO,
        );
        message.header.channel_id = ChannelId(channel);
        message.header.order_index = index;
        message
    }

    fn request() -> Message {
        Message::new(
            EndpointId::random(),
            Some(EndpointId::random()),
            MessageBody::Request(CustomPayload {
                type_name: "test.Request".to_string(),
                bytes: Vec::new(),
            }),
            Duration::ZERO,
        )
    }

    #[test]
    fn test_queue_to_send_assigns_channel_and_index() {
        let mut remote = remote();
        let mut first = request();
        let mut second = request();
        let _f1 = remote.queue_message_to_send(&mut first);
        let _f2 = remote.queue_message_to_send(&mut second);
        assert_eq!(first.header.channel_id, ChannelId(7));
        assert_eq!(first.header.order_index, 1);
        assert_eq!(second.header.order_index, 2);
        assert_eq!(remote.pending_send_count(), 2);
    }

    #[test]
    fn test_negotiate_is_answered_idempotently() {
        let mut remote = remote();
        let local = EndpointContext::new("local");
        let negotiate = handshake(HandshakeState::Negotiate, 3, 1);

        let first = remote.handle_reliable_handshake(&negotiate, &local, TIMEOUT);
        let second = remote.handle_reliable_handshake(&negotiate, &local, TIMEOUT);

        assert_eq!(first, second);
        let answer = first.expect("negotiate is answered");
        assert_eq!(answer.state, HandshakeState::Success);
        assert_eq!(answer.reliable_channel_id, ChannelId(7));
        assert_eq!(remote.reliable_channel_id_to_receive(), ChannelId(3));
        assert_eq!(remote.endpoint_timeout(), Duration::from_secs(3));
        assert!(remote.has_reliable_channel());
    }

    #[test]
    fn test_success_is_not_answered() {
        let mut remote = remote();
        let local = EndpointContext::new("local");
        assert!(remote
            .handle_reliable_handshake(&handshake(HandshakeState::Success, 3, 1), &local, TIMEOUT)
            .is_none());
        assert!(remote.is_pending_resend());
    }

    #[test]
    fn test_out_of_order_is_buffered_then_drained() {
        let mut remote = remote();
        let local = EndpointContext::new("local");
        remote.handle_reliable_handshake(
            &handshake(HandshakeState::Success, 3, 1),
            &local,
            TIMEOUT,
        );

        assert_eq!(
            remote.queue_message_to_receive(event(3, 2), Duration::ZERO),
            ReceiveOutcome::Buffered
        );
        assert_eq!(
            remote.queue_message_to_receive(event(3, 3), Duration::ZERO),
            ReceiveOutcome::Buffered
        );
        assert_eq!(remote.ready_to_receive_count(), 0);
        assert_eq!(
            remote.queue_message_to_receive(event(3, 1), Duration::ZERO),
            ReceiveOutcome::Ready
        );

        let indices: Vec<u32> =
            std::iter::from_fn(|| remote.get_next_message_to_receive(Duration::ZERO))
                .map(|m| m.header.order_index)
                .collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(remote.next_message_index_to_receive(), 4);
    }

    #[test]
    fn test_messages_before_handshake_wait_for_channel() {
        let mut remote = remote();
        let local = EndpointContext::new("local");

        assert_eq!(
            remote.queue_message_to_receive(event(3, 1), Duration::ZERO),
            ReceiveOutcome::Buffered
        );
        assert!(remote.next_acknowledgment_to_send().is_none(), "not acked before handshake");

        remote.handle_reliable_handshake(
            &handshake(HandshakeState::Negotiate, 3, 1),
            &local,
            TIMEOUT,
        );
        assert_eq!(remote.ready_to_receive_count(), 1);
        let ack = remote.next_acknowledgment_to_send().expect("acked once the channel is adopted");
        assert_eq!((ack.channel_id, ack.order_index), (ChannelId(3), 1));
        assert!(remote.next_acknowledgment_to_send().is_none());
    }

    #[test]
    fn test_adopted_messages_are_acked_once() {
        let mut remote = remote();
        let local = EndpointContext::new("local");
        remote.queue_message_to_receive(event(3, 2), Duration::ZERO);
        remote.queue_message_to_receive(event(3, 3), Duration::ZERO);

        remote.handle_reliable_handshake(
            &handshake(HandshakeState::Success, 3, 1),
            &local,
            TIMEOUT,
        );
        assert_eq!(remote.ready_to_receive_count(), 0, "index 1 still missing");

        assert_eq!(
            remote.queue_message_to_receive(event(3, 1), Duration::ZERO),
            ReceiveOutcome::Ready
        );
        assert_eq!(remote.ready_to_receive_count(), 3);
        let mut acked = Vec::new();
        while let Some(ack) = remote.next_acknowledgment_to_send() {
            acked.push(ack.order_index);
        }
        acked.sort_unstable();
        assert_eq!(acked, vec![1, 2, 3]);
    }

    #[test]
    fn test_stale_index_is_duplicate_but_acked() {
        let mut remote = remote();
        let local = EndpointContext::new("local");
        remote.handle_reliable_handshake(
            &handshake(HandshakeState::Success, 3, 1),
            &local,
            TIMEOUT,
        );

        let message = event(3, 1);
        assert_eq!(
            remote.queue_message_to_receive(message.clone(), Duration::ZERO),
            ReceiveOutcome::Ready
        );
        assert_eq!(
            remote.queue_message_to_receive(message, Duration::ZERO),
            ReceiveOutcome::Duplicate
        );
        assert!(remote.next_acknowledgment_to_send().is_some());
        assert!(remote.next_acknowledgment_to_send().is_some());
        assert!(remote.next_acknowledgment_to_send().is_none());
    }

    #[test]
    fn test_ack_completes_event_but_not_request() {
        let mut remote = remote();
        let mut event_message = event(0, 0);
        let mut request_message = request();
        let mut event_future = remote.queue_message_to_send(&mut event_message);
        let mut request_future = remote.queue_message_to_send(&mut request_message);

        let ack = |message: &Message| AckData {
            source_message_id: message.id(),
            channel_id: message.header.channel_id,
            order_index: message.header.order_index,
            sent_at: Duration::ZERO,
        };
        assert!(remote.handle_acknowledgement(&ack(&event_message)));
        assert!(remote.handle_acknowledgement(&ack(&request_message)));

        assert_eq!(event_future.try_response().map(|r| r.code), Some(ResponseCode::Success));
        assert!(request_future.try_response().is_none());
        assert_eq!(remote.pending_send_count(), 1);

        remote.pending_resend = true;
        assert!(remote.take_messages_to_resend().is_empty(), "acknowledged request is not resent");

        assert!(remote.handle_response(ResponseData {
            request_message_id: request_message.id(),
            code: ResponseCode::Failed,
            reason: "nope".to_string(),
            payload: None,
        }));
        let response = request_future.try_response().expect("resolved");
        assert_eq!(response.code, ResponseCode::Failed);
        assert_eq!(remote.pending_send_count(), 0);
    }

    #[test]
    fn test_advertised_index_skips_acknowledged() {
        let mut remote = remote();
        let local = EndpointContext::new("local");
        let mut first = event(0, 0);
        let mut second = event(0, 0);
        let _f1 = remote.queue_message_to_send(&mut first);
        let _f2 = remote.queue_message_to_send(&mut second);
        remote.handle_acknowledgement(&AckData {
            source_message_id: first.id(),
            channel_id: first.header.channel_id,
            order_index: first.header.order_index,
            sent_at: Duration::ZERO,
        });
        let negotiate = remote.negotiate(&local, TIMEOUT, Duration::ZERO);
        assert_eq!(negotiate.next_message_index, 2);
    }

    #[test]
    fn test_timeout_and_fail_pending() {
        let mut remote = remote();
        let mut message = request();
        let mut future = remote.queue_message_to_send(&mut message);

        assert!(!remote.is_timed_out(TIMEOUT - Duration::from_millis(1)));
        assert!(remote.is_timed_out(TIMEOUT));

        remote.fail_all_pending();
        assert_eq!(future.try_response().map(|r| r.code), Some(ResponseCode::TimedOut));
    }

    #[test]
    fn test_huge_advertised_timeout_never_expires() {
        let mut remote = remote();
        let local = EndpointContext::new("local");
        let mut forever = handshake(HandshakeState::Negotiate, 3, 1);
        forever.endpoint_timeout = Duration::MAX;
        remote.record_received(Duration::from_secs(1));
        remote.handle_reliable_handshake(&forever, &local, TIMEOUT);

        assert_eq!(remote.endpoint_timeout(), Duration::MAX);
        assert!(!remote.is_timed_out(Duration::MAX));
    }

    #[test]
    fn test_handshake_retry_interval() {
        let mut remote = remote();
        let local = EndpointContext::new("local");
        let retry = Duration::from_secs(1);
        assert!(remote.needs_handshake(Duration::ZERO, retry));
        remote.negotiate(&local, TIMEOUT, Duration::ZERO);
        assert!(!remote.needs_handshake(Duration::from_millis(999), retry));
        assert!(remote.needs_handshake(retry, retry));
    }
}
