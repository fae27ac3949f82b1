//! Inbound request handling.

mod ordered;
mod reply;

pub use ordered::{ChainKey, LocalJob, OrderedExecutor};
pub use reply::ReplyPromise;

use async_trait::async_trait;
use gridwire_core::Address;

use crate::order::DeliverOrder;
use crate::response::ReplicableCommand;

/// Application entry point for commands received from other members.
///
/// The handler answers through `reply`. For one-way messages the promise is
/// detached and the answer is discarded. Execution follows `order`: handlers
/// for the same sender (or for every totally ordered message) never overlap.
#[async_trait(?Send)]
pub trait InboundInvocationHandler<C: ReplicableCommand>: 'static {
    /// Execute `command` received from `origin`.
    async fn handle(
        &self,
        origin: Address,
        command: C,
        reply: ReplyPromise<C::Value>,
        order: DeliverOrder,
    );
}
