//! Request/response results, futures and promises.
//!
//! A sender gets a [`ResponseFuture`] for every event or request it queues.
//! The future resolves from the endpoint tick: with `Success` when the peer
//! acknowledges an event or answers a request, or with `TimedOut` when the
//! destination is unknown, evicted, closed, or the endpoint itself went away.
//!
//! A request handler gets a [`ResponsePromise`]. Fulfilling it queues the
//! response for the next tick. Dropping it unfulfilled answers the requester
//! with `Failed`, so a forgotten promise never leaves the requester hanging.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::codec::{CodecError, CustomMessage};
use crate::transport::message::{CustomPayload, ResponseData};
use crate::types::{EndpointId, MessageId};

/// Outcome code of a request or reliable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    /// Delivered (event) or answered successfully (request).
    Success,
    /// The handler reported a failure.
    Failed,
    /// No answer: unknown destination, evicted or closed peer.
    TimedOut,
    /// The recipient has no handler registered for the request type.
    UnknownRequest,
}

/// Resolved result of a send.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Outcome code.
    pub code: ResponseCode,
    /// Failure reason; empty on success.
    pub reason: String,
    /// Application response payload, if the handler produced one.
    pub payload: Option<CustomPayload>,
}

impl Response {
    /// Successful response with an optional payload.
    pub fn success(payload: Option<CustomPayload>) -> Self {
        Self {
            code: ResponseCode::Success,
            reason: String::new(),
            payload,
        }
    }

    /// Failed response with a reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Failed,
            reason: reason.into(),
            payload: None,
        }
    }

    /// Timed-out response.
    pub fn timed_out() -> Self {
        Self {
            code: ResponseCode::TimedOut,
            reason: "timed out".to_string(),
            payload: None,
        }
    }

    /// Response for a request type without a registered handler.
    pub fn unknown_request(type_name: &str) -> Self {
        Self {
            code: ResponseCode::UnknownRequest,
            reason: format!("no handler registered for request {type_name}"),
            payload: None,
        }
    }

    /// Whether the code is [`ResponseCode::Success`].
    pub fn is_success(&self) -> bool {
        self.code == ResponseCode::Success
    }

    /// Decode the payload as `T`.
    pub fn decode<T: CustomMessage>(&self) -> Result<T, CodecError> {
        match &self.payload {
            Some(payload) => payload.decode(),
            None => Err(CodecError::TypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                found: "<none>".to_string(),
            }),
        }
    }

    pub(crate) fn into_data(self, request_message_id: MessageId) -> ResponseData {
        ResponseData {
            request_message_id,
            code: self.code,
            reason: self.reason,
            payload: self.payload,
        }
    }
}

impl From<ResponseData> for Response {
    fn from(data: ResponseData) -> Self {
        Self {
            code: data.code,
            reason: data.reason,
            payload: data.payload,
        }
    }
}

/// Sender half resolving a [`ResponseFuture`].
pub(crate) type Completion = oneshot::Sender<Response>;

/// Create a linked completion/future pair.
pub(crate) fn response_channel() -> (Completion, ResponseFuture) {
    let (tx, rx) = oneshot::channel();
    (tx, ResponseFuture { rx, taken: false })
}

/// Resolve a completion, ignoring a dropped future.
pub(crate) fn complete(completion: Completion, response: Response) {
    if completion.send(response).is_err() {
        tracing::trace!("response future dropped before completion");
    }
}

/// Future resolving to the [`Response`] of an event or request.
///
/// Resolves to `TimedOut` if the sending side is dropped without answering.
/// Can be awaited, or polled from a tick loop with [`try_response`](Self::try_response).
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Response>,
    taken: bool,
}

impl ResponseFuture {
    /// A future that is already resolved.
    pub fn resolved(response: Response) -> Self {
        let (tx, future) = response_channel();
        complete(tx, response);
        future
    }

    /// Take the response if it is available, without blocking.
    ///
    /// Returns the response at most once; later calls return `None`.
    pub fn try_response(&mut self) -> Option<Response> {
        if self.taken {
            return None;
        }
        let response = match self.rx.try_recv() {
            Ok(response) => response,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Response::timed_out(),
        };
        self.taken = true;
        Some(response)
    }
}

impl Future for ResponseFuture {
    type Output = Response;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Response::timed_out()))
    }
}

/// A response produced by a handler, waiting for the tick to send it.
#[derive(Debug)]
pub(crate) struct OutgoingResponse {
    pub(crate) destination: EndpointId,
    pub(crate) data: ResponseData,
}

/// Promise handed to request handlers.
///
/// Must be fulfilled with [`send`](Self::send), [`send_ok`](Self::send_ok) or
/// [`send_error`](Self::send_error). May be stored and fulfilled later; the
/// response leaves on the first tick after fulfillment.
#[derive(Debug)]
pub struct ResponsePromise {
    request_message_id: MessageId,
    requester: EndpointId,
    sink: mpsc::UnboundedSender<OutgoingResponse>,
    fulfilled: bool,
}

impl ResponsePromise {
    pub(crate) fn new(
        request_message_id: MessageId,
        requester: EndpointId,
        sink: mpsc::UnboundedSender<OutgoingResponse>,
    ) -> Self {
        Self {
            request_message_id,
            requester,
            sink,
            fulfilled: false,
        }
    }

    /// Endpoint that issued the request.
    pub fn requester(&self) -> EndpointId {
        self.requester
    }

    /// Message id of the request being answered.
    pub fn request_message_id(&self) -> MessageId {
        self.request_message_id
    }

    /// Answer with an explicit response.
    pub fn send(mut self, response: Response) {
        self.deliver(response);
    }

    /// Answer successfully with a typed payload.
    pub fn send_ok<T: CustomMessage>(mut self, value: &T) {
        let response = match CustomPayload::encode(value) {
            Ok(payload) => Response::success(Some(payload)),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize response");
                Response::failed(e.to_string())
            }
        };
        self.deliver(response);
    }

    /// Answer with a failure.
    pub fn send_error(mut self, reason: impl Into<String>) {
        self.deliver(Response::failed(reason));
    }

    fn deliver(&mut self, response: Response) {
        if self.fulfilled {
            return;
        }
        self.fulfilled = true;
        let outgoing = OutgoingResponse {
            destination: self.requester,
            data: response.into_data(self.request_message_id),
        };
        if self.sink.send(outgoing).is_err() {
            tracing::debug!(
                request = %self.request_message_id,
                "endpoint gone before response could be queued"
            );
        }
    }
}

impl Drop for ResponsePromise {
    fn drop(&mut self) {
        if !self.fulfilled {
            tracing::warn!(
                request = %self.request_message_id,
                "request handler dropped the response promise without answering"
            );
            self.deliver(Response::failed("request handler dropped the response promise"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Answer {
        value: i32,
    }

    impl CustomMessage for Answer {
        const TYPE_NAME: &'static str = "test.Answer";
    }

    #[test]
    fn test_try_response_pending_then_ready_once() {
        let (tx, mut future) = response_channel();
        assert!(future.try_response().is_none());
        complete(tx, Response::success(None));
        assert_eq!(future.try_response(), Some(Response::success(None)));
        assert!(future.try_response().is_none());
    }

    #[test]
    fn test_dropped_completion_times_out() {
        let (tx, mut future) = response_channel();
        drop(tx);
        let response = future.try_response().expect("resolved");
        assert_eq!(response.code, ResponseCode::TimedOut);
    }

    #[tokio::test]
    async fn test_await_resolved_future() {
        let response = ResponseFuture::resolved(Response::failed("nope")).await;
        assert_eq!(response.code, ResponseCode::Failed);
        assert_eq!(response.reason, "nope");
    }

    #[test]
    fn test_promise_send_ok() {
        let (sink, mut rx) = mpsc::unbounded_channel();
        let requester = EndpointId::random();
        let request_id = MessageId::random();
        let promise = ResponsePromise::new(request_id, requester, sink);
        promise.send_ok(&Answer { value: 42 });

        let outgoing = rx.try_recv().expect("queued response");
        assert_eq!(outgoing.destination, requester);
        assert_eq!(outgoing.data.request_message_id, request_id);
        let response = Response::from(outgoing.data);
        assert_eq!(response.decode::<Answer>().expect("decode"), Answer { value: 42 });
        assert!(rx.try_recv().is_err(), "exactly one response per promise");
    }

    #[test]
    fn test_dropped_promise_sends_failure() {
        let (sink, mut rx) = mpsc::unbounded_channel();
        let promise = ResponsePromise::new(MessageId::random(), EndpointId::random(), sink);
        drop(promise);

        let outgoing = rx.try_recv().expect("queued response");
        assert_eq!(outgoing.data.code, ResponseCode::Failed);
    }

    #[test]
    fn test_decode_without_payload() {
        assert!(matches!(
            Response::success(None).decode::<Answer>(),
            Err(CodecError::TypeMismatch { .. })
        ));
    }
}
