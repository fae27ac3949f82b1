use gridwire_core::Address;

use super::ResponseCollector;
use crate::error::TransportError;
use crate::response::Response;

/// Completes on the first successful response.
///
/// Used by staggered reads: a non-successful answer makes the request move on
/// to the next target. If no target succeeds, the last non-successful answer
/// is returned, or the first exception if every target failed.
pub struct FirstValidResponseCollector<V> {
    fallback: Option<Response<V>>,
    failure: Option<TransportError>,
}

impl<V> Default for FirstValidResponseCollector<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> FirstValidResponseCollector<V> {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self {
            fallback: None,
            failure: None,
        }
    }
}

impl<V: 'static> ResponseCollector<V> for FirstValidResponseCollector<V> {
    type Output = Response<V>;

    fn add_response(
        &mut self,
        sender: &Address,
        response: Response<V>,
    ) -> Result<Option<Response<V>>, TransportError> {
        match response {
            Response::Success(_) => Ok(Some(response)),
            Response::Exception(failure) => {
                if self.failure.is_none() {
                    self.failure = Some(failure.into_error(sender));
                }
                Ok(None)
            }
            other => {
                self.fallback = Some(other);
                Ok(None)
            }
        }
    }

    fn finish(&mut self) -> Result<Response<V>, TransportError> {
        if let Some(fallback) = self.fallback.take() {
            return Ok(fallback);
        }
        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(Response::NotFound),
        }
    }
}
