//! Cluster membership views.
//!
//! The current view is an immutable [`ClusterView`] behind an `Rc` that is
//! swapped on every installation. Readers take a snapshot and never observe a
//! half-updated view.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use gridwire_core::{Address, UID};
use tokio::sync::oneshot;

use crate::error::TransportError;

/// View id before any view has been installed.
pub const INITIAL_VIEW_ID: u64 = 0;

/// View id of the terminal view installed when the transport stops.
pub const FINAL_VIEW_ID: u64 = u64::MAX;

/// An immutable membership snapshot.
#[derive(Debug, Clone)]
pub struct ClusterView {
    view_id: u64,
    members: Vec<Address>,
    member_set: HashSet<Address>,
}

impl ClusterView {
    /// Build a view; the first member is the coordinator.
    pub fn new(view_id: u64, members: Vec<Address>) -> Self {
        let member_set = members.iter().cloned().collect();
        Self {
            view_id,
            members,
            member_set,
        }
    }

    /// The empty view in place before the first installation.
    pub fn initial() -> Self {
        Self::new(INITIAL_VIEW_ID, Vec::new())
    }

    fn terminal() -> Self {
        Self::new(FINAL_VIEW_ID, Vec::new())
    }

    /// Monotonically increasing view id.
    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    /// Members in substrate order.
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    /// Members as a set, for membership tests.
    pub fn member_set(&self) -> &HashSet<Address> {
        &self.member_set
    }

    /// Whether `address` is a member of this view.
    pub fn contains(&self, address: &Address) -> bool {
        self.member_set.contains(address)
    }

    /// The coordinator, if the view has members.
    pub fn coordinator(&self) -> Option<&Address> {
        self.members.first()
    }

    /// Whether `address` coordinates this view.
    pub fn is_coordinator(&self, address: &Address) -> bool {
        self.coordinator() == Some(address)
    }

    /// Whether this view is at least as recent as `view_id`.
    pub fn is_view_id_at_least(&self, view_id: u64) -> bool {
        self.view_id >= view_id
    }

    /// Whether this is the terminal view of a stopped transport.
    pub fn is_stopped(&self) -> bool {
        self.view_id == FINAL_VIEW_ID
    }
}

/// A membership change as reported by the substrate.
#[derive(Debug, Clone)]
pub struct ViewEvent {
    /// Id of the new view.
    pub view_id: u64,
    /// Members of the new view.
    pub members: Vec<Address>,
    /// Partitions that merged into this view, if it resulted from a merge.
    pub merge_subgroups: Option<Vec<Vec<Address>>>,
}

impl ViewEvent {
    /// A regular view change.
    pub fn new(view_id: u64, members: Vec<Address>) -> Self {
        Self {
            view_id,
            members,
            merge_subgroups: None,
        }
    }

    /// A view produced by merging partitions.
    pub fn merged(view_id: u64, members: Vec<Address>, subgroups: Vec<Vec<Address>>) -> Self {
        Self {
            view_id,
            members,
            merge_subgroups: Some(subgroups),
        }
    }
}

/// Notification delivered to [`MembershipListener`]s after a view is installed.
#[derive(Debug, Clone)]
pub struct ViewChangedEvent {
    /// Id of the installed view.
    pub view_id: u64,
    /// Members before the change.
    pub old_members: Vec<Address>,
    /// Members after the change.
    pub new_members: Vec<Address>,
    /// The local member.
    pub local_address: Option<Address>,
}

impl ViewChangedEvent {
    /// Members present in the new view only.
    pub fn joiners(&self) -> Vec<Address> {
        let old: HashSet<&Address> = self.old_members.iter().collect();
        self.new_members
            .iter()
            .filter(|a| !old.contains(a))
            .cloned()
            .collect()
    }

    /// Members present in the old view only.
    pub fn leavers(&self) -> Vec<Address> {
        let new: HashSet<&Address> = self.new_members.iter().collect();
        self.old_members
            .iter()
            .filter(|a| !new.contains(a))
            .cloned()
            .collect()
    }
}

/// Observer of membership and site changes.
///
/// Callbacks run on the delivery path and must not block.
pub trait MembershipListener {
    /// A new view was installed.
    fn view_changed(&self, event: &ViewChangedEvent);

    /// A view resulting from a partition merge was installed.
    ///
    /// Defaults to a regular view change.
    fn merged(&self, event: &ViewChangedEvent, subgroups: &[Vec<Address>]) {
        let _ = subgroups;
        self.view_changed(event);
    }

    /// Cross-site connectivity changed.
    fn sites_changed(&self, joined: &[String], left: &[String]) {
        let _ = (joined, left);
    }
}

struct ViewWaiter {
    view_id: u64,
    tx: oneshot::Sender<Result<Rc<ClusterView>, TransportError>>,
}

/// Holder of the current view, with waiters for future views.
pub struct ViewTracker {
    current: RefCell<Rc<ClusterView>>,
    waiters: RefCell<Vec<ViewWaiter>>,
}

impl Default for ViewTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewTracker {
    /// Create a tracker holding the initial empty view.
    pub fn new() -> Self {
        Self {
            current: RefCell::new(Rc::new(ClusterView::initial())),
            waiters: RefCell::new(Vec::new()),
        }
    }

    /// Snapshot of the current view.
    pub fn current(&self) -> Rc<ClusterView> {
        self.current.borrow().clone()
    }

    /// Install `view` if it is newer than the current one.
    ///
    /// Returns the replaced view, or `None` when the view is stale or the
    /// tracker is stopped.
    pub fn install(&self, view: ClusterView) -> Option<Rc<ClusterView>> {
        let installed = Rc::new(view);
        let previous = {
            let mut current = self.current.borrow_mut();
            if current.is_stopped() || installed.view_id <= current.view_id {
                return None;
            }
            std::mem::replace(&mut *current, installed.clone())
        };

        let ready: Vec<ViewWaiter> = {
            let mut waiters = self.waiters.borrow_mut();
            let (ready, pending) = waiters
                .drain(..)
                .partition(|w| installed.is_view_id_at_least(w.view_id));
            *waiters = pending;
            ready
        };
        for waiter in ready {
            let _ = waiter.tx.send(Ok(installed.clone()));
        }
        Some(previous)
    }

    /// Install the terminal view and fail every waiter.
    pub fn stop(&self) {
        *self.current.borrow_mut() = Rc::new(ClusterView::terminal());
        let waiters: Vec<ViewWaiter> = self.waiters.borrow_mut().drain(..).collect();
        for waiter in waiters {
            let _ = waiter.tx.send(Err(TransportError::LifecycleStopping));
        }
    }

    /// Wait until a view with at least `view_id` is installed.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::LifecycleStopping`] if the tracker is, or
    /// becomes, stopped.
    pub async fn wait_for_view(&self, view_id: u64) -> Result<Rc<ClusterView>, TransportError> {
        let rx = {
            let current = self.current();
            if current.is_stopped() {
                return Err(TransportError::LifecycleStopping);
            }
            if current.is_view_id_at_least(view_id) {
                return Ok(current);
            }
            let (tx, rx) = oneshot::channel();
            self.waiters.borrow_mut().push(ViewWaiter { view_id, tx });
            rx
        };
        rx.await.unwrap_or(Err(TransportError::LifecycleStopping))
    }

    /// Number of callers waiting for a future view.
    pub fn waiter_count(&self) -> usize {
        self.waiters.borrow().len()
    }
}

/// Maps bare sender identities to the addresses from the view.
///
/// Message headers carry only enough to identify a member; the cached view
/// address also carries topology. Entries for members that left are pruned
/// on every view change.
#[derive(Default)]
pub struct AddressCache {
    entries: RefCell<HashMap<UID, Address>>,
}

impl AddressCache {
    /// Replace the cache content with the members of a new view.
    pub fn refresh(&self, members: &[Address]) {
        let mut entries = self.entries.borrow_mut();
        let live: HashSet<UID> = members.iter().map(Address::uid).collect();
        entries.retain(|uid, _| live.contains(uid));
        for member in members {
            entries.insert(member.uid(), member.clone());
        }
    }

    /// The canonical address for `sender`, or `sender` itself if unknown.
    pub fn canonical(&self, sender: Address) -> Address {
        self.entries
            .borrow()
            .get(&sender.uid())
            .cloned()
            .unwrap_or(sender)
    }

    /// Number of cached addresses.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}
