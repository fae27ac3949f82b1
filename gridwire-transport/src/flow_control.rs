//! Credit-based flow control.
//!
//! Every destination, plus a shared multicast pool, holds a credit balance in
//! bytes. A send consumes credits; receivers hand credits back through
//! [`CreditMap::replenish`]. When credits run out, sends are queued in FIFO
//! order and released by replenishment.
//!
//! Checking and consuming credits never blocks. Whether the *caller* waits for
//! a deferred send depends on its [`ExecutionContext`]: delivery paths must
//! never block, so they just leave the send queued; application callers get a
//! permit they can await.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use gridwire_core::{Address, Providers, TaskProvider};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Whether the current caller may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    /// Delivery or timer path: deferred sends are left queued.
    NonBlocking,
    /// Application path: deferred sends can be awaited.
    Blocking,
}

/// Credit account a send is charged to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CreditKey {
    /// The pool shared by broadcasts and multi-destination sends.
    Multicast,
    /// One destination member.
    Unicast(Address),
}

/// Outcome of [`CreditMap::send`].
#[derive(Debug)]
pub enum SendPermit {
    /// Credits were available and the send ran.
    Sent,
    /// The send is queued until credits arrive.
    Deferred(Option<oneshot::Receiver<()>>),
}

impl SendPermit {
    /// Whether the send already ran.
    pub fn is_sent(&self) -> bool {
        matches!(self, SendPermit::Sent)
    }

    /// Wait until a deferred send has run.
    ///
    /// Returns `false` if it was discarded, because the destination left or
    /// the map was cleared. Permits from non-blocking callers resolve
    /// immediately.
    pub async fn wait(self) -> bool {
        match self {
            SendPermit::Sent | SendPermit::Deferred(None) => true,
            SendPermit::Deferred(Some(rx)) => rx.await.is_ok(),
        }
    }
}

struct DeferredSend {
    bytes: u64,
    send: Box<dyn FnOnce()>,
    done: Option<oneshot::Sender<()>>,
}

struct Account {
    credits: u64,
    queue: VecDeque<DeferredSend>,
    draining: bool,
}

type Accounts = RefCell<HashMap<CreditKey, Account>>;

/// Credit balances per destination.
pub struct CreditMap<P: Providers> {
    providers: P,
    max_credits: u64,
    accounts: Rc<Accounts>,
}

impl<P: Providers> CreditMap<P> {
    /// Create a map where every account starts with `max_credits`.
    pub fn new(providers: P, max_credits: u64) -> Self {
        Self {
            providers,
            max_credits,
            accounts: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    fn account<'a>(
        &self,
        accounts: &'a mut HashMap<CreditKey, Account>,
        key: CreditKey,
    ) -> &'a mut Account {
        accounts.entry(key).or_insert_with(|| Account {
            credits: self.max_credits,
            queue: VecDeque::new(),
            draining: false,
        })
    }

    // a message larger than the whole window still goes out once it is full
    fn cost(&self, bytes: u64) -> u64 {
        bytes.min(self.max_credits)
    }

    /// Consume credits for `bytes` if available. Never blocks.
    ///
    /// Fails while earlier sends are queued on the same account, so
    /// successful decrements never overtake deferred sends.
    pub fn try_decrement(&self, key: CreditKey, bytes: u64) -> bool {
        let cost = self.cost(bytes);
        let mut accounts = self.accounts.borrow_mut();
        let account = self.account(&mut accounts, key);
        if account.queue.is_empty() && account.credits >= cost {
            account.credits -= cost;
            true
        } else {
            false
        }
    }

    /// Run `send` now if credits allow, otherwise queue it.
    pub fn send<F>(
        &self,
        context: ExecutionContext,
        key: CreditKey,
        bytes: u64,
        send: F,
    ) -> SendPermit
    where
        F: FnOnce() + 'static,
    {
        if self.try_decrement(key.clone(), bytes) {
            send();
            return SendPermit::Sent;
        }

        let (done, permit) = match context {
            ExecutionContext::Blocking => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), SendPermit::Deferred(Some(rx)))
            }
            ExecutionContext::NonBlocking => (None, SendPermit::Deferred(None)),
        };
        trace!(?key, bytes, ?context, "deferring send until credits arrive");
        let cost = self.cost(bytes);
        let mut accounts = self.accounts.borrow_mut();
        self.account(&mut accounts, key).queue.push_back(DeferredSend {
            bytes: cost,
            send: Box::new(send),
            done,
        });
        permit
    }

    /// Return `bytes` credits to `key` and release queued sends.
    ///
    /// Queued sends run on a spawned task, never on the caller's stack.
    pub fn replenish(&self, key: CreditKey, bytes: u64) {
        {
            let mut accounts = self.accounts.borrow_mut();
            let account = self.account(&mut accounts, key.clone());
            account.credits = account.credits.saturating_add(bytes).min(self.max_credits);
            if account.queue.is_empty() || account.draining {
                return;
            }
            account.draining = true;
        }

        let accounts = self.accounts.clone();
        self.providers.task().spawn_task("credit_drain", async move {
            drain(&accounts, &key);
        });
    }

    /// Drop the accounts of members outside `members`, discarding their
    /// queued sends.
    pub fn retain_members(&self, members: &HashSet<Address>) {
        let mut accounts = self.accounts.borrow_mut();
        accounts.retain(|key, account| match key {
            CreditKey::Multicast => true,
            CreditKey::Unicast(address) => {
                let keep = members.contains(address);
                if !keep && !account.queue.is_empty() {
                    debug!(
                        destination = %address,
                        discarded = account.queue.len(),
                        "discarding sends queued for a departed member"
                    );
                }
                keep
            }
        });
    }

    /// Discard every account and queued send.
    pub fn clear(&self) {
        self.accounts.borrow_mut().clear();
    }

    /// Credits currently available on `key`.
    pub fn available(&self, key: &CreditKey) -> u64 {
        self.accounts
            .borrow()
            .get(key)
            .map_or(self.max_credits, |a| a.credits)
    }

    /// Number of sends queued on `key`.
    pub fn deferred(&self, key: &CreditKey) -> usize {
        self.accounts.borrow().get(key).map_or(0, |a| a.queue.len())
    }
}

fn drain(accounts: &Accounts, key: &CreditKey) {
    loop {
        let ready = {
            let mut map = accounts.borrow_mut();
            let Some(account) = map.get_mut(key) else {
                return;
            };
            match account.queue.front() {
                Some(next) if account.credits >= next.bytes => {
                    account.credits -= next.bytes;
                    account.queue.pop_front()
                }
                _ => {
                    account.draining = false;
                    return;
                }
            }
        };
        if let Some(deferred) = ready {
            (deferred.send)();
            if let Some(done) = deferred.done {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use gridwire_core::{TokioProviders, UID};

    use super::*;

    fn addr(n: u64) -> Address {
        Address::new(UID::new(0, n), format!("n{n}"))
    }

    fn unicast(n: u64) -> CreditKey {
        CreditKey::Unicast(addr(n))
    }

    fn push(log: &Rc<RefCell<Vec<u32>>>, value: u32) -> impl FnOnce() + 'static {
        let log = log.clone();
        move || log.borrow_mut().push(value)
    }

    #[test]
    fn test_try_decrement_never_overdraws() {
        let credits = CreditMap::new(TokioProviders::new(), 100);
        assert!(credits.try_decrement(unicast(1), 60));
        assert!(!credits.try_decrement(unicast(1), 60));
        assert!(credits.try_decrement(unicast(1), 40));
        assert_eq!(credits.available(&unicast(1)), 0);
        assert_eq!(credits.available(&unicast(2)), 100);
    }

    #[tokio::test]
    async fn test_deferred_sends_drain_in_fifo_order() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let credits = CreditMap::new(TokioProviders::new(), 100);
                let log = Rc::new(RefCell::new(Vec::new()));
                let key = CreditKey::Multicast;

                assert!(
                    credits
                        .send(ExecutionContext::NonBlocking, key.clone(), 80, push(&log, 1))
                        .is_sent()
                );
                for value in 2..=4 {
                    let permit = credits.send(
                        ExecutionContext::NonBlocking,
                        key.clone(),
                        40,
                        push(&log, value),
                    );
                    assert!(!permit.is_sent());
                }
                // fits the balance but must not overtake the queue
                assert!(!credits.try_decrement(key.clone(), 10));
                assert_eq!(credits.deferred(&key), 3);

                // 20 left + 30 covers one queued send only
                credits.replenish(key.clone(), 30);
                assert_eq!(*log.borrow(), vec![1], "drain runs on a spawned task");
                tokio::task::yield_now().await;
                assert_eq!(*log.borrow(), vec![1, 2]);

                credits.replenish(key.clone(), 100);
                tokio::task::yield_now().await;
                assert_eq!(*log.borrow(), vec![1, 2, 3, 4]);
                assert_eq!(credits.deferred(&key), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_blocking_permit_resolves_after_replenish() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let credits = Rc::new(CreditMap::new(TokioProviders::new(), 10));
                let log = Rc::new(RefCell::new(Vec::new()));
                credits.send(ExecutionContext::Blocking, unicast(1), 10, push(&log, 1));

                let permit = credits.send(ExecutionContext::Blocking, unicast(1), 5, push(&log, 2));
                let replenisher = credits.clone();
                tokio::task::spawn_local(async move {
                    tokio::task::yield_now().await;
                    replenisher.replenish(unicast(1), 5);
                });

                assert!(permit.wait().await);
                assert_eq!(*log.borrow(), vec![1, 2]);
            })
            .await;
    }

    #[tokio::test]
    async fn test_departed_member_discards_queue() {
        let credits = CreditMap::new(TokioProviders::new(), 10);
        let log = Rc::new(RefCell::new(Vec::new()));
        credits.send(ExecutionContext::Blocking, unicast(1), 10, push(&log, 1));
        let permit = credits.send(ExecutionContext::Blocking, unicast(1), 10, push(&log, 2));

        credits.retain_members(&[addr(2)].into_iter().collect());
        assert!(!permit.wait().await);
        assert_eq!(*log.borrow(), vec![1]);
        assert_eq!(credits.available(&unicast(1)), 10);
    }

    #[test]
    fn test_replenish_caps_at_max() {
        let credits = CreditMap::new(TokioProviders::new(), 50);
        assert!(credits.try_decrement(unicast(1), 20));
        credits.replenish(unicast(1), 500);
        assert_eq!(credits.available(&unicast(1)), 50);
    }
}
