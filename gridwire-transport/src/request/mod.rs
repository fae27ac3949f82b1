//! Request correlation.
//!
//! Every remote call that expects an answer is represented by a [`Request`]
//! registered in the [`RequestRepository`] under a unique [`RequestId`].
//! Responses, view changes, site failures, timeouts and shutdown all drive the
//! request through the [`PendingRequest`] capability set; whichever reaches a
//! verdict first completes it, and every later signal is a no-op.
//!
//! ```text
//! invoke ──► Request::new ──► RequestRepository::add_request ──► send
//!                                          │
//!   on_response / on_new_view / on_timeout / cancel
//!                                          │
//!                            Completion::complete (once)
//!                             ├─► ReplyHandle resolves
//!                             ├─► timers aborted
//!                             └─► removed from repository
//! ```

mod completion;
mod handle;
mod invocation;
mod repository;
mod staggered;

pub use handle::ReplyHandle;
pub use invocation::Request;
pub use repository::RequestRepository;
pub use staggered::SendFn;

use std::collections::HashSet;

use gridwire_core::Address;

use crate::error::TransportError;
use crate::response::Response;

/// Correlation id of a request, unique per transport instance.
pub type RequestId = u64;

/// Request id carried by one-way messages.
pub const NO_REQUEST_ID: RequestId = 0;

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for responses.
    Pending,
    /// Completed with a result or a failure.
    Completed,
    /// The deadline elapsed.
    TimedOut,
    /// Cancelled, usually because the transport is stopping.
    Cancelled,
}

/// Signals a registered request reacts to.
///
/// Implementations must be idempotent after completion: a request that is
/// already done ignores every further signal.
pub trait PendingRequest<V> {
    /// Correlation id.
    fn request_id(&self) -> RequestId;

    /// A response arrived from `sender`.
    fn on_response(&self, sender: &Address, response: Response<V>);

    /// A new view was installed. Returns whether the request is now done.
    fn on_new_view(&self, members: &HashSet<Address>) -> bool;

    /// The deadline elapsed.
    fn on_timeout(&self);

    /// Complete the request with `error`.
    fn cancel(&self, error: TransportError);

    /// A remote site became unreachable.
    fn on_site_unreachable(&self, site: &str);

    /// Whether the request has completed.
    fn is_done(&self) -> bool;

    /// Register the callback run once the request completes.
    ///
    /// Runs immediately if the request is already done.
    fn set_completion_listener(&self, listener: Box<dyn FnOnce(RequestId)>);
}
