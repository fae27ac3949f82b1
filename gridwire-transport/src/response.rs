//! Responses exchanged between members, and the commands that produce them.

use std::fmt::Debug;
use std::rc::Rc;
use std::time::Duration;

use gridwire_core::Address;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::order::DeliverOrder;

/// A command that can be executed on a remote member.
///
/// Commands are marshalled as a whole; the transport only inspects them
/// through this trait.
pub trait ReplicableCommand: Serialize + DeserializeOwned + Debug + 'static {
    /// The value carried by a successful response.
    type Value: Serialize + DeserializeOwned + Clone + Debug + 'static;

    /// Commands that never block may run directly on the delivery path,
    /// bypassing per-sender and total ordering chains.
    fn is_non_blocking(&self) -> bool {
        false
    }

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Why a remote member could not produce a normal response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The application handler returned an error.
    Execution,
    /// The request could not be decoded on the receiver.
    Decode,
    /// The response could not be encoded on the responder.
    Marshalling,
    /// The handler dropped its reply without answering.
    BrokenPromise,
}

/// A failure reported by a remote member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Human readable description.
    pub message: String,
}

impl RemoteFailure {
    /// An application-level failure.
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Execution,
            message: message.into(),
        }
    }

    /// Convert into the caller-visible error, attributed to `sender`.
    pub fn into_error(self, sender: &Address) -> TransportError {
        match self.kind {
            FailureKind::Decode => TransportError::ProtocolDecode {
                message: format!("{}: {}", sender, self.message),
            },
            FailureKind::Execution | FailureKind::Marshalling | FailureKind::BrokenPromise => {
                TransportError::RemoteExecutionFailed {
                    sender: sender.clone(),
                    message: self.message,
                    suppressed: Vec::new(),
                }
            }
        }
    }
}

/// A response from one member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response<V> {
    /// The command succeeded.
    Success(Option<V>),
    /// The command ran but its precondition did not hold.
    Unsuccessful(Option<V>),
    /// The responder could not decide, typically during a topology change.
    Unsure,
    /// The target left the cluster, or is not running.
    NotFound,
    /// The responder failed.
    Exception(RemoteFailure),
}

impl<V> Response<V> {
    /// A successful response carrying `value`.
    pub fn success(value: V) -> Self {
        Response::Success(Some(value))
    }

    /// Whether this is a [`Response::Success`].
    pub fn is_successful(&self) -> bool {
        matches!(self, Response::Success(_))
    }

    /// Whether the responder actually executed the command.
    pub fn is_valid(&self) -> bool {
        matches!(self, Response::Success(_) | Response::Unsuccessful(_))
    }

    /// The carried value, if any.
    pub fn value(&self) -> Option<&V> {
        match self {
            Response::Success(v) | Response::Unsuccessful(v) => v.as_ref(),
            _ => None,
        }
    }

    /// Consume the response, returning the carried value.
    pub fn into_value(self) -> Option<V> {
        match self {
            Response::Success(v) | Response::Unsuccessful(v) => v,
            _ => None,
        }
    }
}

/// How a caller of [`invoke_remotely`](crate::GroupTransport::invoke_remotely)
/// waits for answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Wait for every target; a leaver fails the call.
    Synchronous,
    /// Wait for every target; leavers are recorded as `NotFound`.
    SynchronousIgnoreLeavers,
    /// Stop at the first successful response.
    WaitForValidResponse,
    /// Fire and forget.
    Asynchronous,
}

impl ResponseMode {
    /// Whether the caller waits for responses.
    pub fn is_synchronous(self) -> bool {
        self != ResponseMode::Asynchronous
    }
}

/// Decides whether a response counts for a filtered call.
pub type ResponseFilter<V> = Rc<dyn Fn(&Address, &Response<V>) -> bool>;

/// Per-call options of [`invoke_remotely_with`](crate::GroupTransport::invoke_remotely_with).
pub struct RpcOptions<V> {
    /// How the caller waits for answers.
    pub mode: ResponseMode,
    /// Deadline of the call.
    pub timeout: Duration,
    /// Delivery order of the command. [`DeliverOrder::Total`] also reaches
    /// the sender.
    pub order: DeliverOrder,
    /// Responses the call keeps.
    ///
    /// With [`ResponseMode::WaitForValidResponse`] the first accepted
    /// response completes the call; in the synchronous modes every target is
    /// waited for and only accepted responses are returned. Defaults to
    /// successful responses when waiting for a valid one, and to everything
    /// otherwise.
    pub filter: Option<ResponseFilter<V>>,
}

impl<V> RpcOptions<V> {
    /// Options with per-sender delivery and no filter.
    pub fn new(mode: ResponseMode, timeout: Duration) -> Self {
        Self {
            mode,
            timeout,
            order: DeliverOrder::PerSender,
            filter: None,
        }
    }

    /// Set the delivery order.
    pub fn with_order(mut self, order: DeliverOrder) -> Self {
        self.order = order;
        self
    }

    /// Keep only the responses `filter` accepts.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Address, &Response<V>) -> bool + 'static,
    {
        self.filter = Some(Rc::new(filter));
        self
    }
}

impl<V> Clone for RpcOptions<V> {
    fn clone(&self) -> Self {
        Self {
            mode: self.mode,
            timeout: self.timeout,
            order: self.order,
            filter: self.filter.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use gridwire_core::UID;

    use super::*;

    #[test]
    fn test_response_value_accessors() {
        let ok: Response<u32> = Response::success(3);
        assert!(ok.is_successful());
        assert!(ok.is_valid());
        assert_eq!(ok.value(), Some(&3));

        let rejected: Response<u32> = Response::Unsuccessful(Some(1));
        assert!(!rejected.is_successful());
        assert!(rejected.is_valid());
        assert_eq!(rejected.into_value(), Some(1));

        let gone: Response<u32> = Response::NotFound;
        assert!(!gone.is_valid());
        assert_eq!(gone.value(), None);
    }

    #[test]
    fn test_remote_failure_conversion() {
        let sender = Address::new(UID::new(0, 2), "b");

        let err = RemoteFailure::execution("disk full").into_error(&sender);
        assert_eq!(
            err,
            TransportError::RemoteExecutionFailed {
                sender: sender.clone(),
                message: "disk full".into(),
                suppressed: vec![],
            }
        );

        let decode = RemoteFailure {
            kind: FailureKind::Decode,
            message: "bad json".into(),
        };
        assert!(matches!(
            decode.into_error(&sender),
            TransportError::ProtocolDecode { .. }
        ));
    }

    #[test]
    fn test_response_serde() {
        let resp: Response<String> = Response::Exception(RemoteFailure::execution("x"));
        let json = serde_json::to_vec(&resp).expect("encode");
        let back: Response<String> = serde_json::from_slice(&json).expect("decode");
        assert_eq!(resp, back);
    }
}
