//! Staggered requests.
//!
//! Candidates are contacted one at a time. After each send a stagger timer
//! races the replies; when it fires the next candidate is contacted without
//! abandoning the previous ones, so any in-flight candidate can still produce
//! the winning reply. An unacceptable reply moves on to the next candidate
//! immediately. The first acceptable reply completes the request and cancels
//! the stagger timer together with the deadline.
//!
//! The per-step delay is the remaining deadline divided among the candidates
//! still in play, clamped to `[min_stagger_delay, remaining]`.

use std::rc::Rc;
use std::time::Duration;

use gridwire_core::{Address, Providers, TaskProvider, TimeProvider};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::invocation::{Request, RequestKind};
use crate::collector::{ResponseCollector, Responses};
use crate::error::TransportError;
use crate::response::Response;

/// Sends the request to one candidate.
pub type SendFn = Rc<dyn Fn(&Address) -> Result<(), TransportError>>;

pub(crate) struct StaggerState<V> {
    pub(super) responses: Responses<V>,
    cursor: usize,
    deadline: Duration,
    min_delay: Duration,
    send: SendFn,
    timer: Option<JoinHandle<()>>,
}

impl<V> StaggerState<V> {
    pub(super) fn new(
        responses: Responses<V>,
        send: SendFn,
        deadline: Duration,
        min_delay: Duration,
    ) -> Self {
        Self {
            responses,
            cursor: 0,
            deadline,
            min_delay,
            send,
            timer: None,
        }
    }

    pub(super) fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Candidates not contacted yet, skipping those that already answered.
    fn unsent(&self) -> usize {
        (self.cursor..self.responses.targets().len())
            .filter(|i| !self.responses.is_filled(*i))
            .count()
    }

    fn next_target(&mut self) -> Option<Address> {
        let total = self.responses.targets().len();
        while self.cursor < total && self.responses.is_filled(self.cursor) {
            self.cursor += 1;
        }
        let target = self.responses.targets().get(self.cursor).cloned();
        if target.is_some() {
            self.cursor += 1;
        }
        target
    }
}

/// Delay until the next candidate is contacted.
pub(crate) fn stagger_delay(remaining: Duration, in_play: usize, min_delay: Duration) -> Duration {
    let share = remaining / in_play.max(1) as u32;
    share.max(min_delay).min(remaining)
}

impl<P, V, C> Request<P, V, C>
where
    P: Providers,
    V: Clone + 'static,
    C: ResponseCollector<V> + 'static,
{
    /// Contact the first candidate.
    pub fn start(&self) {
        self.send_next();
    }

    /// Number of candidates contacted so far.
    pub fn contacted(&self) -> usize {
        match &*self.kind.borrow() {
            RequestKind::Staggered(stagger) => stagger.cursor,
            _ => 0,
        }
    }

    fn send_next(&self) {
        if self.completion.is_done() {
            return;
        }
        let next = {
            let mut kind = self.kind.borrow_mut();
            let RequestKind::Staggered(stagger) = &mut *kind else {
                return;
            };
            stagger.cancel_timer();
            stagger
                .next_target()
                .map(|target| (target, stagger.send.clone()))
        };
        let Some((target, send)) = next else {
            trace!(
                request_id = self.completion.request_id(),
                "all candidates contacted, waiting for replies"
            );
            return;
        };

        trace!(request_id = self.completion.request_id(), target = %target, "staggered send");
        match send(&target) {
            Ok(()) => self.schedule_stagger(),
            Err(err) => {
                debug!(
                    request_id = self.completion.request_id(),
                    target = %target,
                    error = %err,
                    "staggered send failed, treating target as gone"
                );
                self.staggered_response(&target, Response::NotFound);
            }
        }
    }

    fn schedule_stagger(&self) {
        if self.completion.is_done() {
            return;
        }
        let now = self.providers.time().now();
        let mut kind = self.kind.borrow_mut();
        let RequestKind::Staggered(stagger) = &mut *kind else {
            return;
        };
        let unsent = stagger.unsent();
        let remaining = stagger.deadline.saturating_sub(now);
        if unsent == 0 || remaining.is_zero() {
            return;
        }

        // the candidate just contacted still counts as in play
        let delay = stagger_delay(remaining, unsent + 1, stagger.min_delay);
        let weak = self.weak_self.clone();
        let time = self.providers.time().clone();
        let timer = self.providers.task().spawn_task("stagger", async move {
            time.sleep(delay).await;
            if let Some(request) = weak.upgrade() {
                request.send_next();
            }
        });
        stagger.timer = Some(timer);
    }

    pub(super) fn staggered_response(&self, sender: &Address, response: Response<V>) {
        let (was_contacted, all_answered) = {
            let mut kind = self.kind.borrow_mut();
            let RequestKind::Staggered(stagger) = &mut *kind else {
                return;
            };
            let Some(index) = stagger.responses.index_of(sender) else {
                warn!(
                    request_id = self.completion.request_id(),
                    sender = %sender,
                    "ignoring response from a non-candidate"
                );
                return;
            };
            if !stagger.responses.set_if_absent(index, response.clone()) {
                let err = TransportError::DoubleDelivery {
                    request_id: self.completion.request_id(),
                    sender: sender.clone(),
                };
                warn!(error = %err, "rejecting duplicate response");
                return;
            }
            (index < stagger.cursor, stagger.responses.is_complete())
        };

        let wants_more = self.collect(sender, response, all_answered);
        if wants_more && was_contacted {
            self.send_next();
        }
    }
}
