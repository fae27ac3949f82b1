//! Response aggregation policies.
//!
//! A request feeds every response it receives to its collector. The collector
//! decides when the call is complete and what the caller gets back:
//!
//! - `Ok(Some(output))` from [`ResponseCollector::add_response`] completes the
//!   call immediately.
//! - `Ok(None)` waits for more responses; once every target has answered the
//!   request calls [`ResponseCollector::finish`].
//! - `Err(..)` completes the call with that error.

mod filter;
mod first_valid;
mod map;
mod responses;
mod single;

pub use filter::FilterMapResponseCollector;
pub use first_valid::FirstValidResponseCollector;
pub use map::MapResponseCollector;
pub use responses::Responses;
pub use single::{SingleResponseCollector, SingletonMapResponseCollector};

use gridwire_core::Address;

use crate::error::TransportError;
use crate::response::Response;

/// Aggregates the responses of one request into a single outcome.
///
/// Collectors are only ever driven by their owning request, one response at a
/// time, and see at most one response per target.
pub trait ResponseCollector<V> {
    /// What the caller receives.
    type Output: 'static;

    /// Record one response.
    ///
    /// # Errors
    ///
    /// Returning an error completes the call with it.
    fn add_response(
        &mut self,
        sender: &Address,
        response: Response<V>,
    ) -> Result<Option<Self::Output>, TransportError>;

    /// Produce the outcome once no more responses will arrive.
    ///
    /// Also called directly when a call has no remote targets.
    fn finish(&mut self) -> Result<Self::Output, TransportError>;
}
