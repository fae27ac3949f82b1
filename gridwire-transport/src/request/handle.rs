//! Caller-side future of a remote call.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::{NO_REQUEST_ID, RequestId};
use crate::error::TransportError;

enum HandleState<O> {
    Pending(oneshot::Receiver<Result<O, TransportError>>),
    Ready(Option<Result<O, TransportError>>),
}

/// Future that resolves once the request it belongs to completes.
///
/// Calls that need no remote answer get an already-resolved handle.
pub struct ReplyHandle<O> {
    request_id: RequestId,
    state: HandleState<O>,
}

// The output is moved out of the receiver, never pinned in place.
impl<O> Unpin for ReplyHandle<O> {}

impl<O> ReplyHandle<O> {
    pub(crate) fn pending(
        request_id: RequestId,
        rx: oneshot::Receiver<Result<O, TransportError>>,
    ) -> Self {
        Self {
            request_id,
            state: HandleState::Pending(rx),
        }
    }

    /// A handle that is already resolved.
    pub fn ready(result: Result<O, TransportError>) -> Self {
        Self {
            request_id: NO_REQUEST_ID,
            state: HandleState::Ready(Some(result)),
        }
    }

    /// Id of the request, or [`NO_REQUEST_ID`] for a resolved handle.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl<O> Future for ReplyHandle<O> {
    type Output = Result<O, TransportError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            HandleState::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                // the request was dropped without completing: only on shutdown
                Poll::Ready(Err(_)) => Poll::Ready(Err(TransportError::LifecycleStopping)),
                Poll::Pending => Poll::Pending,
            },
            HandleState::Ready(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or(Err(TransportError::LifecycleStopping)),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_handle() {
        let handle = ReplyHandle::ready(Ok(5u32));
        assert_eq!(handle.request_id(), NO_REQUEST_ID);
        assert_eq!(handle.await, Ok(5));
    }

    #[tokio::test]
    async fn test_dropped_sender_reports_stopping() {
        let (tx, rx) = oneshot::channel::<Result<u32, TransportError>>();
        let handle = ReplyHandle::pending(3, rx);
        drop(tx);
        assert_eq!(handle.await, Err(TransportError::LifecycleStopping));
    }
}
