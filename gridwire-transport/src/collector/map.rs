use std::collections::HashMap;

use gridwire_core::Address;

use super::ResponseCollector;
use crate::error::TransportError;
use crate::response::Response;

/// Collects one response per target into a map.
///
/// Failures do not complete the call early: the first one is kept and raised
/// by [`finish`](ResponseCollector::finish) once every target answered, later
/// ones are attached to it as suppressed causes.
pub struct MapResponseCollector<V> {
    ignore_leavers: bool,
    responses: HashMap<Address, Response<V>>,
    failure: Option<TransportError>,
}

impl<V> MapResponseCollector<V> {
    /// A collector sized for `expected` targets.
    ///
    /// With `ignore_leavers`, targets that left are recorded as `NotFound`;
    /// otherwise a leaver fails the call.
    pub fn new(ignore_leavers: bool, expected: usize) -> Self {
        Self {
            ignore_leavers,
            responses: HashMap::with_capacity(expected),
            failure: None,
        }
    }

    fn record_failure(&mut self, err: TransportError) {
        match &mut self.failure {
            Some(first) => first.add_suppressed(err),
            None => self.failure = Some(err),
        }
    }
}

impl<V: 'static> ResponseCollector<V> for MapResponseCollector<V> {
    type Output = HashMap<Address, Response<V>>;

    fn add_response(
        &mut self,
        sender: &Address,
        response: Response<V>,
    ) -> Result<Option<Self::Output>, TransportError> {
        match response {
            Response::Exception(failure) => self.record_failure(failure.into_error(sender)),
            Response::NotFound if !self.ignore_leavers => {
                self.record_failure(TransportError::MemberSuspected {
                    address: sender.clone(),
                })
            }
            other => {
                self.responses.insert(sender.clone(), other);
            }
        }
        Ok(None)
    }

    fn finish(&mut self) -> Result<Self::Output, TransportError> {
        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(std::mem::take(&mut self.responses)),
        }
    }
}
