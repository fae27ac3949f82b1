use std::collections::HashMap;

use gridwire_core::Address;

use super::ResponseCollector;
use crate::error::TransportError;
use crate::response::Response;

/// Collects responses accepted by a predicate.
///
/// Without `wait_for_all`, the first accepted response completes the call.
/// Rejected responses are dropped. Exceptions are deferred like in
/// [`MapResponseCollector`](super::MapResponseCollector), so a single failing
/// target does not hide an acceptable answer from another one.
pub struct FilterMapResponseCollector<V, F> {
    filter: F,
    wait_for_all: bool,
    accepted: HashMap<Address, Response<V>>,
    failure: Option<TransportError>,
}

impl<V, F> FilterMapResponseCollector<V, F>
where
    F: FnMut(&Address, &Response<V>) -> bool,
{
    /// A collector keeping the responses `filter` accepts.
    pub fn new(filter: F, wait_for_all: bool, expected: usize) -> Self {
        Self {
            filter,
            wait_for_all,
            accepted: HashMap::with_capacity(expected),
            failure: None,
        }
    }

    /// Whether the call still needs responses from the remaining targets.
    pub fn need_more_responses(&self) -> bool {
        self.wait_for_all || self.accepted.is_empty()
    }
}

impl<V, F> ResponseCollector<V> for FilterMapResponseCollector<V, F>
where
    V: 'static,
    F: FnMut(&Address, &Response<V>) -> bool,
{
    type Output = HashMap<Address, Response<V>>;

    fn add_response(
        &mut self,
        sender: &Address,
        response: Response<V>,
    ) -> Result<Option<Self::Output>, TransportError> {
        if let Response::Exception(failure) = response {
            let err = failure.into_error(sender);
            match &mut self.failure {
                Some(first) => first.add_suppressed(err),
                None => self.failure = Some(err),
            }
            return Ok(None);
        }

        if (self.filter)(sender, &response) {
            self.accepted.insert(sender.clone(), response);
            if !self.need_more_responses() {
                return Ok(Some(std::mem::take(&mut self.accepted)));
            }
        }
        Ok(None)
    }

    fn finish(&mut self) -> Result<Self::Output, TransportError> {
        match self.failure.take() {
            Some(err) if self.accepted.is_empty() => Err(err),
            _ => Ok(std::mem::take(&mut self.accepted)),
        }
    }
}

#[cfg(test)]
mod tests {
    use gridwire_core::UID;

    use super::*;
    use crate::response::RemoteFailure;

    fn addr(n: u64) -> Address {
        Address::new(UID::new(0, n), format!("n{n}"))
    }

    #[test]
    fn test_first_acceptable_completes() {
        let mut collector = FilterMapResponseCollector::new(
            |_: &Address, r: &Response<u32>| r.is_successful(),
            false,
            3,
        );

        assert_eq!(collector.add_response(&addr(1), Response::Unsure), Ok(None));
        assert!(collector.need_more_responses());

        let map = collector
            .add_response(&addr(2), Response::success(9))
            .expect("ok")
            .expect("complete");
        assert_eq!(map.len(), 1);
        assert_eq!(map[&addr(2)], Response::success(9));
    }

    #[test]
    fn test_wait_for_all_keeps_collecting() {
        let mut collector =
            FilterMapResponseCollector::new(|_: &Address, r: &Response<u32>| r.is_valid(), true, 2);

        assert_eq!(collector.add_response(&addr(1), Response::success(1)), Ok(None));
        assert!(collector.need_more_responses());
        assert_eq!(collector.add_response(&addr(2), Response::NotFound), Ok(None));

        let map = collector.finish().expect("map");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_exception_raised_only_without_accepted_responses() {
        let mut collector = FilterMapResponseCollector::new(
            |_: &Address, r: &Response<u32>| r.is_successful(),
            true,
            2,
        );
        collector
            .add_response(&addr(1), Response::Exception(RemoteFailure::execution("x")))
            .expect("deferred");
        assert!(collector.finish().is_err());

        let mut collector = FilterMapResponseCollector::new(
            |_: &Address, r: &Response<u32>| r.is_successful(),
            true,
            2,
        );
        collector
            .add_response(&addr(1), Response::Exception(RemoteFailure::execution("x")))
            .expect("deferred");
        collector
            .add_response(&addr(2), Response::success(1))
            .expect("ok");
        assert_eq!(collector.finish().expect("map").len(), 1);
    }
}
