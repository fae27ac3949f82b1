//! Pluggable marshalling of commands and responses.
//!
//! The transport never looks inside application objects: it hands them to a
//! [`Marshaller`] and moves the resulting bytes. [`JsonMarshaller`] is the
//! default and is convenient for debugging.
//!
//! # Example
//!
//! ```rust
//! use gridwire_core::{JsonMarshaller, Marshaller};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Put {
//!     key: String,
//!     value: u32,
//! }
//!
//! let marshaller = JsonMarshaller;
//! let put = Put { key: "k".to_string(), value: 7 };
//!
//! let bytes = marshaller.encode(&put).unwrap();
//! let decoded: Put = marshaller.decode(&bytes).unwrap();
//! assert_eq!(put, decoded);
//! ```

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for marshalling operations.
#[derive(Debug)]
pub enum MarshalError {
    /// Failed to encode an object to bytes.
    Encode(Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to an object.
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalError::Encode(e) => write!(f, "encode error: {}", e),
            MarshalError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for MarshalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MarshalError::Encode(e) => Some(e.as_ref()),
            MarshalError::Decode(e) => Some(e.as_ref()),
        }
    }
}

/// Encoding capability for application objects.
///
/// Both directions are fallible. The transport recovers from a failure to
/// encode a response by sending an encoded error payload instead, so a remote
/// caller always gets an answer.
pub trait Marshaller: Clone + 'static {
    /// Encode a serializable object to bytes.
    ///
    /// # Errors
    ///
    /// Returns `MarshalError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, MarshalError>;

    /// Decode bytes to an object.
    ///
    /// # Errors
    ///
    /// Returns `MarshalError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, MarshalError>;
}

/// JSON marshaller using serde_json.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, MarshalError> {
        serde_json::to_vec(value).map_err(|e| MarshalError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, MarshalError> {
        serde_json::from_slice(buf).map_err(|e| MarshalError::Decode(Box::new(e)))
    }
}
