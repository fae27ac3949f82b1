//! Ordered execution of inbound work.
//!
//! Work for the same chain key runs strictly one after the other, in
//! submission order; different keys run concurrently. A chain exists only
//! while it has work: the task draining it removes the key once its queue is
//! empty, so idle senders cost nothing.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use gridwire_core::{Address, Providers, TaskProvider};

use crate::order::DeliverOrder;

/// A unit of inbound work.
pub type LocalJob = Pin<Box<dyn Future<Output = ()>>>;

/// Serialization domain of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChainKey {
    /// The transport-wide chain for totally ordered deliveries.
    Total,
    /// The chain of one sender.
    Sender(Address),
}

type Chains = RefCell<HashMap<ChainKey, VecDeque<LocalJob>>>;

/// Runs inbound jobs according to their delivery order.
pub struct OrderedExecutor<P: Providers> {
    providers: P,
    chains: Rc<Chains>,
}

impl<P: Providers> OrderedExecutor<P> {
    /// Create an executor spawning through `providers`.
    pub fn new(providers: P) -> Self {
        Self {
            providers,
            chains: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Run `job` for a message from `sender` delivered with `order`.
    ///
    /// `None` ordered jobs run immediately and concurrently with everything
    /// else; `PerSender` jobs queue behind earlier jobs from the same sender;
    /// `Total` jobs queue behind every earlier totally ordered job.
    pub fn execute(&self, order: DeliverOrder, sender: &Address, job: LocalJob) {
        match order {
            DeliverOrder::None => {
                self.providers.task().spawn_task("inbound", job);
            }
            DeliverOrder::PerSender => self.enqueue(ChainKey::Sender(sender.clone()), job),
            DeliverOrder::Total => self.enqueue(ChainKey::Total, job),
        }
    }

    fn enqueue(&self, key: ChainKey, job: LocalJob) {
        {
            let mut chains = self.chains.borrow_mut();
            if let Some(queue) = chains.get_mut(&key) {
                queue.push_back(job);
                return;
            }
            chains.insert(key.clone(), VecDeque::new());
        }

        let chains = self.chains.clone();
        self.providers.task().spawn_task("inbound_chain", async move {
            let mut next = Some(job);
            while let Some(job) = next.take() {
                job.await;
                let mut map = chains.borrow_mut();
                next = map.get_mut(&key).and_then(VecDeque::pop_front);
                if next.is_none() {
                    map.remove(&key);
                }
            }
        });
    }

    /// Number of chains with queued or running work.
    pub fn active_chains(&self) -> usize {
        self.chains.borrow().len()
    }
}
