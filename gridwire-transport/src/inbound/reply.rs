//! ReplyPromise: handler-side promise for answering a request.
//!
//! Every inbound request hands the application handler a `ReplyPromise`. The
//! handler must fulfil it with a response; if the promise is dropped without
//! one, a [`FailureKind::BrokenPromise`] failure is sent instead, so a caller
//! never waits for its timeout because a handler forgot to answer.
//!
//! One-way messages get a detached promise that sends nothing.

use crate::response::{FailureKind, RemoteFailure, Response};

/// Sender function, injected by the transport.
type ReplySender<V> = Box<dyn FnOnce(Response<V>)>;

/// Promise for sending the response to one request.
pub struct ReplyPromise<V> {
    sender: Option<ReplySender<V>>,
}

impl<V> ReplyPromise<V> {
    /// Create a promise that delivers its response through `sender`.
    pub fn new<F>(sender: F) -> Self
    where
        F: FnOnce(Response<V>) + 'static,
    {
        Self {
            sender: Some(Box::new(sender)),
        }
    }

    /// A promise for a one-way message; responses are discarded.
    pub fn detached() -> Self {
        Self { sender: None }
    }

    /// Whether the originator waits for this response.
    pub fn is_expected(&self) -> bool {
        self.sender.is_some()
    }

    /// Send `response`.
    ///
    /// Consumes the promise, preventing double-send.
    pub fn send(mut self, response: Response<V>) {
        if let Some(sender) = self.sender.take() {
            sender(response);
        }
    }

    /// Send a successful response carrying `value`.
    pub fn send_value(self, value: V) {
        self.send(Response::Success(Some(value)));
    }

    /// Send an execution failure.
    pub fn send_error(self, message: impl Into<String>) {
        self.send(Response::Exception(RemoteFailure::execution(message)));
    }
}

impl<V> Drop for ReplyPromise<V> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            tracing::warn!("reply promise dropped without a response, sending broken promise");
            sender(Response::Exception(RemoteFailure {
                kind: FailureKind::BrokenPromise,
                message: "handler dropped the reply without answering".to_string(),
            }));
        }
    }
}
