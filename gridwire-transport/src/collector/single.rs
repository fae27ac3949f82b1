use std::collections::HashMap;
use std::marker::PhantomData;

use gridwire_core::Address;

use super::ResponseCollector;
use crate::error::TransportError;
use crate::response::Response;

/// Collector for calls with exactly one target.
///
/// Completes on the first response. A `NotFound` fails the call with
/// [`TransportError::MemberSuspected`] unless leavers are ignored, in which
/// case the `NotFound` itself is returned.
pub struct SingleResponseCollector<V> {
    ignore_leavers: bool,
    _value: PhantomData<V>,
}

impl<V> SingleResponseCollector<V> {
    /// A collector that fails when the target left.
    pub fn valid_only() -> Self {
        Self {
            ignore_leavers: false,
            _value: PhantomData,
        }
    }

    /// A collector that reports a leaver as `NotFound`.
    pub fn ignore_leavers() -> Self {
        Self {
            ignore_leavers: true,
            _value: PhantomData,
        }
    }
}

impl<V: 'static> ResponseCollector<V> for SingleResponseCollector<V> {
    type Output = Response<V>;

    fn add_response(
        &mut self,
        sender: &Address,
        response: Response<V>,
    ) -> Result<Option<Response<V>>, TransportError> {
        match response {
            Response::Exception(failure) => Err(failure.into_error(sender)),
            Response::NotFound if !self.ignore_leavers => Err(TransportError::MemberSuspected {
                address: sender.clone(),
            }),
            other => Ok(Some(other)),
        }
    }

    /// With no remote target there is nothing to report.
    fn finish(&mut self) -> Result<Response<V>, TransportError> {
        Ok(Response::Success(None))
    }
}

/// Single-target collector that keys its one response by sender.
pub struct SingletonMapResponseCollector<V> {
    ignore_leavers: bool,
    _value: PhantomData<V>,
}

impl<V> SingletonMapResponseCollector<V> {
    /// A collector that fails when the target left.
    pub fn valid_only() -> Self {
        Self {
            ignore_leavers: false,
            _value: PhantomData,
        }
    }

    /// A collector that records a leaver as `NotFound`.
    pub fn ignore_leavers() -> Self {
        Self {
            ignore_leavers: true,
            _value: PhantomData,
        }
    }
}

impl<V: 'static> ResponseCollector<V> for SingletonMapResponseCollector<V> {
    type Output = HashMap<Address, Response<V>>;

    fn add_response(
        &mut self,
        sender: &Address,
        response: Response<V>,
    ) -> Result<Option<Self::Output>, TransportError> {
        match response {
            Response::Exception(failure) => Err(failure.into_error(sender)),
            Response::NotFound if !self.ignore_leavers => Err(TransportError::MemberSuspected {
                address: sender.clone(),
            }),
            other => Ok(Some(HashMap::from([(sender.clone(), other)]))),
        }
    }

    fn finish(&mut self) -> Result<Self::Output, TransportError> {
        Ok(HashMap::new())
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
    fn test_single_completes_on_first_response() {
        let mut collector = SingleResponseCollector::<u32>::valid_only();
        let out = collector
            .add_response(&addr(1), Response::success(4))
            .expect("ok");
        assert_eq!(out, Some(Response::success(4)));
    }

    #[test]
    fn test_single_leaver_handling() {
        let mut strict = SingleResponseCollector::<u32>::valid_only();
        assert_eq!(
            strict.add_response(&addr(2), Response::NotFound),
            Err(TransportError::MemberSuspected { address: addr(2) })
        );

        let mut lenient = SingleResponseCollector::<u32>::ignore_leavers();
        assert_eq!(
            lenient.add_response(&addr(2), Response::NotFound),
            Ok(Some(Response::NotFound))
        );
    }

    #[test]
    fn test_single_exception_is_raised() {
        let mut collector = SingleResponseCollector::<u32>::ignore_leavers();
        let err = collector
            .add_response(&addr(3), Response::Exception(RemoteFailure::execution("boom")))
            .expect_err("exception");
        assert!(matches!(err, TransportError::RemoteExecutionFailed { .. }));
    }

    #[test]
    fn test_singleton_map_keys_by_sender() {
        let mut collector = SingletonMapResponseCollector::<u32>::valid_only();
        let map = collector
            .add_response(&addr(5), Response::success(1))
            .expect("ok")
            .expect("complete");
        assert_eq!(map.get(&addr(5)), Some(&Response::success(1)));
        assert!(collector.finish().expect("finish").is_empty());
    }
}
