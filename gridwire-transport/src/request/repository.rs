//! Registry of pending requests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use gridwire_core::Address;
use tracing::trace;

use super::{NO_REQUEST_ID, PendingRequest, RequestId};
use crate::error::TransportError;

type RequestMap<V> = RefCell<HashMap<RequestId, Rc<dyn PendingRequest<V>>>>;

/// Correlation table from request id to pending request.
///
/// A request deregisters itself when it completes, through a weak handle to
/// the table, so every completion path (response, view change, timeout,
/// cancellation) removes it exactly once. Broadcast signals iterate over a
/// snapshot, so completions may deregister while the broadcast is running.
pub struct RequestRepository<V> {
    requests: Rc<RequestMap<V>>,
    next_id: Cell<RequestId>,
    running: Cell<bool>,
}

impl<V: 'static> Default for RequestRepository<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: 'static> RequestRepository<V> {
    /// Create an empty, running repository.
    pub fn new() -> Self {
        Self {
            requests: Rc::new(RefCell::new(HashMap::new())),
            next_id: Cell::new(NO_REQUEST_ID + 1),
            running: Cell::new(true),
        }
    }

    /// Allocate a fresh request id. Never returns [`NO_REQUEST_ID`].
    pub fn new_request_id(&self) -> RequestId {
        let id = self.next_id.get();
        let mut next = id.wrapping_add(1);
        if next == NO_REQUEST_ID {
            next += 1;
        }
        self.next_id.set(next);
        id
    }

    /// Whether new requests are accepted.
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Accept or refuse new requests.
    pub fn set_running(&self, running: bool) {
        self.running.set(running);
    }

    /// Register `request`.
    ///
    /// A stopped repository cancels the request with
    /// [`TransportError::LifecycleStopping`] instead and returns `false`.
    pub fn add_request(&self, request: Rc<dyn PendingRequest<V>>) -> bool {
        if !self.running.get() {
            request.cancel(TransportError::LifecycleStopping);
            return false;
        }
        let request_id = request.request_id();
        self.requests
            .borrow_mut()
            .insert(request_id, request.clone());

        let table = Rc::downgrade(&self.requests);
        request.set_completion_listener(Box::new(move |id| {
            if let Some(table) = table.upgrade() {
                table.borrow_mut().remove(&id);
            }
        }));
        trace!(request_id, "request registered");
        true
    }

    /// Look up a pending request.
    pub fn get(&self, request_id: RequestId) -> Option<Rc<dyn PendingRequest<V>>> {
        self.requests.borrow().get(&request_id).cloned()
    }

    /// Remove a request without completing it.
    pub fn remove(&self, request_id: RequestId) -> Option<Rc<dyn PendingRequest<V>>> {
        self.requests.borrow_mut().remove(&request_id)
    }

    /// Run `f` for every pending request.
    pub fn for_each(&self, mut f: impl FnMut(&Rc<dyn PendingRequest<V>>)) {
        let snapshot: Vec<Rc<dyn PendingRequest<V>>> =
            self.requests.borrow().values().cloned().collect();
        for request in &snapshot {
            f(request);
        }
    }

    /// Tell every pending request about a new membership.
    pub fn view_changed(&self, members: &HashSet<Address>) {
        self.for_each(|request| {
            request.on_new_view(members);
        });
    }

    /// Tell every pending request that `site` is unreachable.
    pub fn site_unreachable(&self, site: &str) {
        self.for_each(|request| request.on_site_unreachable(site));
    }

    /// Stop accepting requests and cancel every pending one with `error`.
    pub fn cancel_all(&self, error: TransportError) {
        self.running.set(false);
        self.for_each(|request| request.cancel(error.clone()));
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.requests.borrow().len()
    }

    /// Whether no request is pending.
    pub fn is_empty(&self) -> bool {
        self.requests.borrow().is_empty()
    }
}
