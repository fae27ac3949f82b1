//! Exactly-once completion of a request.

use std::cell::{Cell, RefCell};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{ReplyHandle, RequestId, RequestState};
use crate::error::TransportError;

/// Completion state shared by every request variant.
///
/// Uses `Cell` for the state flag (single-threaded execution). The oneshot
/// sender is consumed by the first completion; later attempts observe a
/// non-pending state and return `false`.
pub(crate) struct Completion<O> {
    request_id: RequestId,
    state: Cell<RequestState>,
    sender: RefCell<Option<oneshot::Sender<Result<O, TransportError>>>>,
    timers: RefCell<Vec<JoinHandle<()>>>,
    listener: RefCell<Option<Box<dyn FnOnce(RequestId)>>>,
}

impl<O> Completion<O> {
    pub(crate) fn new(request_id: RequestId) -> (Self, ReplyHandle<O>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            request_id,
            state: Cell::new(RequestState::Pending),
            sender: RefCell::new(Some(tx)),
            timers: RefCell::new(Vec::new()),
            listener: RefCell::new(None),
        };
        (completion, ReplyHandle::pending(request_id, rx))
    }

    pub(crate) fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub(crate) fn state(&self) -> RequestState {
        self.state.get()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.get() != RequestState::Pending
    }

    /// Complete with `result`, moving to `state`.
    ///
    /// Returns `false` if the request was already done.
    pub(crate) fn complete(&self, result: Result<O, TransportError>, state: RequestState) -> bool {
        if self.is_done() {
            return false;
        }
        self.state.set(state);

        let sender = self.sender.borrow_mut().take();
        if let Some(tx) = sender {
            if tx.send(result).is_err() {
                tracing::trace!(request_id = self.request_id, "caller dropped reply handle");
            }
        }

        let timers: Vec<JoinHandle<()>> = self.timers.borrow_mut().drain(..).collect();
        for timer in timers {
            timer.abort();
        }

        let listener = self.listener.borrow_mut().take();
        if let Some(listener) = listener {
            listener(self.request_id);
        }
        true
    }

    /// Track a timer that must not outlive the request.
    pub(crate) fn add_timer(&self, timer: JoinHandle<()>) {
        if self.is_done() {
            timer.abort();
        } else {
            self.timers.borrow_mut().push(timer);
        }
    }

    pub(crate) fn set_listener(&self, listener: Box<dyn FnOnce(RequestId)>) {
        if self.is_done() {
            listener(self.request_id);
        } else {
            *self.listener.borrow_mut() = Some(listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[tokio::test]
    async fn test_completes_exactly_once() {
        let (completion, handle) = Completion::<u32>::new(4);
        let removed = Rc::new(Cell::new(0));
        let counter = removed.clone();
        completion.set_listener(Box::new(move |id| {
            assert_eq!(id, 4);
            counter.set(counter.get() + 1);
        }));

        assert!(completion.complete(Ok(1), RequestState::Completed));
        assert!(!completion.complete(Ok(2), RequestState::Completed));
        assert!(!completion.complete(
            Err(TransportError::LifecycleStopping),
            RequestState::Cancelled
        ));

        assert_eq!(handle.await, Ok(1));
        assert_eq!(completion.state(), RequestState::Completed);
        assert_eq!(removed.get(), 1);
    }

    #[test]
    fn test_listener_runs_immediately_when_done() {
        let (completion, _handle) = Completion::<u32>::new(9);
        completion.complete(Err(TransportError::LifecycleStopping), RequestState::Cancelled);

        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        completion.set_listener(Box::new(move |_| flag.set(true)));
        assert!(ran.get());
    }
}
