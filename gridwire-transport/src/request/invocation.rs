//! The request variants.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::{Rc, Weak};
use std::time::Duration;

use gridwire_core::{Address, Providers, TaskProvider, TimeProvider};
use tracing::{debug, trace, warn};

use super::completion::Completion;
use super::staggered::{SendFn, StaggerState};
use super::{PendingRequest, ReplyHandle, RequestId, RequestState};
use crate::collector::{ResponseCollector, Responses};
use crate::error::TransportError;
use crate::response::Response;

/// Variant-specific state.
pub(super) enum RequestKind<V> {
    /// One target; completes on its response or its departure.
    SingleTarget { target: Address },
    /// Several targets answering into one collector.
    MultiTarget { responses: Responses<V> },
    /// Candidates contacted one at a time.
    Staggered(StaggerState<V>),
    /// The site master of a remote site; views do not apply.
    SingleSite { site: String },
}

// Variant tag, so no borrow of the kind is held while handling a response.
enum Route {
    Single(Address),
    Multi,
    Staggered,
    Site,
}

/// A registered remote call.
///
/// One struct covers every variant; the variant only changes how signals are
/// interpreted. The collector owns the aggregation policy, the request owns
/// the lifecycle.
pub struct Request<P: Providers, V, C: ResponseCollector<V>> {
    pub(super) completion: Completion<C::Output>,
    pub(super) collector: RefCell<C>,
    pub(super) kind: RefCell<RequestKind<V>>,
    pub(super) providers: P,
    pub(super) weak_self: Weak<Self>,
}

impl<P, V, C> Request<P, V, C>
where
    P: Providers,
    V: Clone + 'static,
    C: ResponseCollector<V> + 'static,
{
    fn build(
        providers: P,
        request_id: RequestId,
        collector: C,
        kind: RequestKind<V>,
    ) -> (Rc<Self>, ReplyHandle<C::Output>) {
        let (completion, handle) = Completion::new(request_id);
        let request = Rc::new_cyclic(|weak_self| Self {
            completion,
            collector: RefCell::new(collector),
            kind: RefCell::new(kind),
            providers,
            weak_self: weak_self.clone(),
        });
        (request, handle)
    }

    /// A request waiting for one target.
    pub fn single_target(
        providers: P,
        request_id: RequestId,
        target: Address,
        collector: C,
    ) -> (Rc<Self>, ReplyHandle<C::Output>) {
        Self::build(
            providers,
            request_id,
            collector,
            RequestKind::SingleTarget { target },
        )
    }

    /// A request waiting for every target in `targets`.
    ///
    /// With no targets the collector is finished right away.
    pub fn multi_target(
        providers: P,
        request_id: RequestId,
        targets: Vec<Address>,
        collector: C,
    ) -> (Rc<Self>, ReplyHandle<C::Output>) {
        let empty = targets.is_empty();
        let (request, handle) = Self::build(
            providers,
            request_id,
            collector,
            RequestKind::MultiTarget {
                responses: Responses::new(targets),
            },
        );
        if empty {
            request.finish();
        }
        (request, handle)
    }

    /// A request to the site master of `site`.
    pub fn single_site(
        providers: P,
        request_id: RequestId,
        site: impl Into<String>,
        collector: C,
    ) -> (Rc<Self>, ReplyHandle<C::Output>) {
        Self::build(
            providers,
            request_id,
            collector,
            RequestKind::SingleSite { site: site.into() },
        )
    }

    /// A request that contacts `targets` one at a time.
    ///
    /// Nothing is sent until [`start`](Self::start) is called, which must
    /// happen after the request is registered.
    pub fn staggered(
        providers: P,
        request_id: RequestId,
        targets: Vec<Address>,
        collector: C,
        send: SendFn,
        timeout: Duration,
        min_stagger_delay: Duration,
    ) -> (Rc<Self>, ReplyHandle<C::Output>) {
        let deadline = providers.time().now() + timeout;
        let empty = targets.is_empty();
        let state = StaggerState::new(Responses::new(targets), send, deadline, min_stagger_delay);
        let (request, handle) =
            Self::build(providers, request_id, collector, RequestKind::Staggered(state));
        if empty {
            request.finish();
        }
        (request, handle)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        self.completion.state()
    }

    /// Schedule the timeout of this request.
    ///
    /// The timer is aborted when the request completes first.
    pub fn set_timeout(&self, timeout: Duration) {
        if self.completion.is_done() {
            return;
        }
        let weak = self.weak_self.clone();
        let time = self.providers.time().clone();
        let timer = self.providers.task().spawn_task("request_timeout", async move {
            time.sleep(timeout).await;
            if let Some(request) = weak.upgrade() {
                request.on_timeout();
            }
        });
        self.completion.add_timer(timer);
    }

    pub(super) fn complete(&self, result: Result<C::Output, TransportError>) -> bool {
        let state = match &result {
            Err(TransportError::RequestTimedOut { .. }) => RequestState::TimedOut,
            _ => RequestState::Completed,
        };
        self.complete_with(result, state)
    }

    fn complete_with(
        &self,
        result: Result<C::Output, TransportError>,
        state: RequestState,
    ) -> bool {
        let done = self.completion.complete(result, state);
        if done {
            if let RequestKind::Staggered(stagger) = &mut *self.kind.borrow_mut() {
                stagger.cancel_timer();
            }
            trace!(request_id = self.completion.request_id(), ?state, "request done");
        }
        done
    }

    pub(super) fn finish(&self) {
        let result = self.collector.borrow_mut().finish();
        self.complete(result);
    }

    /// Feed one response to the collector and act on its verdict.
    ///
    /// Returns `true` if the collector wants more responses.
    pub(super) fn collect(
        &self,
        sender: &Address,
        response: Response<V>,
        all_answered: bool,
    ) -> bool {
        let verdict = self.collector.borrow_mut().add_response(sender, response);
        match verdict {
            Ok(Some(output)) => {
                self.complete(Ok(output));
                false
            }
            Err(err) => {
                self.complete(Err(err));
                false
            }
            Ok(None) if all_answered => {
                self.finish();
                false
            }
            Ok(None) => true,
        }
    }

    fn single_target_response(&self, target: &Address, sender: &Address, response: Response<V>) {
        if sender != target {
            warn!(
                request_id = self.completion.request_id(),
                sender = %sender,
                target = %target,
                "ignoring response from unexpected sender"
            );
            return;
        }
        self.collect(sender, response, true);
    }

    fn multi_target_response(&self, sender: &Address, response: Response<V>) {
        let all_answered = {
            let mut kind = self.kind.borrow_mut();
            let RequestKind::MultiTarget { responses } = &mut *kind else {
                return;
            };
            let Some(index) = responses.index_of(sender) else {
                warn!(
                    request_id = self.completion.request_id(),
                    sender = %sender,
                    "ignoring response from a non-target"
                );
                return;
            };
            if !responses.set_if_absent(index, response.clone()) {
                let err = TransportError::DoubleDelivery {
                    request_id: self.completion.request_id(),
                    sender: sender.clone(),
                };
                warn!(error = %err, "rejecting duplicate response");
                return;
            }
            responses.is_complete()
        };
        self.collect(sender, response, all_answered);
    }

    fn timed_out_targets(&self) -> Vec<Address> {
        match &*self.kind.borrow() {
            RequestKind::SingleTarget { target } => vec![target.clone()],
            RequestKind::MultiTarget { responses } => responses.missing_targets(),
            RequestKind::Staggered(stagger) => stagger.responses.missing_targets(),
            RequestKind::SingleSite { .. } => Vec::new(),
        }
    }
}

impl<P, V, C> PendingRequest<V> for Request<P, V, C>
where
    P: Providers,
    V: Clone + 'static,
    C: ResponseCollector<V> + 'static,
{
    fn request_id(&self) -> RequestId {
        self.completion.request_id()
    }

    fn on_response(&self, sender: &Address, response: Response<V>) {
        if self.completion.is_done() {
            trace!(
                request_id = self.completion.request_id(),
                sender = %sender,
                "response after completion"
            );
            return;
        }

        let route = match &*self.kind.borrow() {
            RequestKind::SingleTarget { target } => Route::Single(target.clone()),
            RequestKind::MultiTarget { .. } => Route::Multi,
            RequestKind::Staggered(_) => Route::Staggered,
            RequestKind::SingleSite { .. } => Route::Site,
        };
        match route {
            Route::Single(target) => self.single_target_response(&target, sender, response),
            Route::Multi => self.multi_target_response(sender, response),
            Route::Staggered => self.staggered_response(sender, response),
            Route::Site => {
                self.collect(sender, response, true);
            }
        }
    }

    fn on_new_view(&self, members: &HashSet<Address>) -> bool {
        if self.completion.is_done() {
            return true;
        }

        let leavers: Vec<Address> = match &*self.kind.borrow() {
            RequestKind::SingleTarget { target } => {
                if members.contains(target) {
                    Vec::new()
                } else {
                    vec![target.clone()]
                }
            }
            RequestKind::MultiTarget { responses } => responses
                .missing_targets()
                .into_iter()
                .filter(|t| !members.contains(t))
                .collect(),
            RequestKind::Staggered(stagger) => stagger
                .responses
                .missing_targets()
                .into_iter()
                .filter(|t| !members.contains(t))
                .collect(),
            RequestKind::SingleSite { .. } => Vec::new(),
        };

        for leaver in leavers {
            if self.completion.is_done() {
                break;
            }
            debug!(
                request_id = self.completion.request_id(),
                target = %leaver,
                "target left the view"
            );
            self.on_response(&leaver, Response::NotFound);
        }
        self.completion.is_done()
    }

    fn on_timeout(&self) {
        if self.completion.is_done() {
            return;
        }
        let missing = self.timed_out_targets();
        debug!(
            request_id = self.completion.request_id(),
            missing = missing.len(),
            "request timed out"
        );
        self.complete(Err(TransportError::RequestTimedOut {
            request_id: self.completion.request_id(),
            missing,
        }));
    }

    fn cancel(&self, error: TransportError) {
        self.complete_with(Err(error), RequestState::Cancelled);
    }

    fn on_site_unreachable(&self, site: &str) {
        let unreachable = matches!(
            &*self.kind.borrow(),
            RequestKind::SingleSite { site: target } if target == site
        );
        if unreachable {
            self.complete(Err(TransportError::SiteUnreachable {
                site: site.to_string(),
            }));
        }
    }

    fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    fn set_completion_listener(&self, listener: Box<dyn FnOnce(RequestId)>) {
        self.completion.set_listener(listener);
    }
}
