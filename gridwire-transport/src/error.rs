//! Error types for the gridwire transport.

use gridwire_core::{Address, MarshalError};

use crate::request::RequestId;
use crate::wire::WireError;

/// Caller-visible failures of a remote invocation.
///
/// Every error is raised through the handle of the call it belongs to, exactly
/// once. Errors are `Clone` so that one stop or site-down signal can fail
/// many pending requests.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// The target left the view or is unreachable.
    ///
    /// Recoverable by retrying at a higher layer, usually against a new view.
    #[error("member {address} left the cluster or is suspected")]
    MemberSuspected {
        /// The member that was lost.
        address: Address,
    },

    /// The deadline elapsed before enough responses arrived.
    #[error("request {request_id} timed out waiting for {}", describe_targets(.missing))]
    RequestTimedOut {
        /// The request that timed out.
        request_id: RequestId,
        /// Targets that had not answered.
        missing: Vec<Address>,
    },

    /// The local transport is shutting down.
    #[error("transport is stopping")]
    LifecycleStopping,

    /// The application handler on a peer raised an error.
    #[error("remote execution failed on {sender}: {message}")]
    RemoteExecutionFailed {
        /// The peer that executed the command.
        sender: Address,
        /// Description of the remote failure.
        message: String,
        /// Failures reported by other targets of the same call.
        suppressed: Vec<TransportError>,
    },

    /// A frame or payload could not be decoded.
    #[error("protocol decode error: {message}")]
    ProtocolDecode {
        /// Details about the decode failure.
        message: String,
    },

    /// The same sender answered one request twice.
    #[error("{sender} answered request {request_id} more than once")]
    DoubleDelivery {
        /// The request that received the duplicate.
        request_id: RequestId,
        /// The sender of the duplicate.
        sender: Address,
    },

    /// A cross-site backup target is unreachable.
    #[error("site {site} is unreachable")]
    SiteUnreachable {
        /// The site name.
        site: String,
    },

    /// A command could not be marshalled for sending.
    #[error("marshalling failed: {message}")]
    Marshalling {
        /// Details about the marshalling failure.
        message: String,
    },

    /// The group channel rejected a send.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// The first failure of a multi-target call, raised together with the
    /// failures of other targets.
    #[error("{primary} ({} more failures suppressed)", .suppressed.len())]
    WithSuppressed {
        /// The failure that completed the call.
        primary: Box<TransportError>,
        /// Failures reported by other targets of the same call.
        suppressed: Vec<TransportError>,
    },
}

impl TransportError {
    /// Attach a secondary failure from another target of the same call.
    ///
    /// Remote execution failures keep secondary causes in place; any other
    /// failure is wrapped in [`TransportError::WithSuppressed`].
    pub fn add_suppressed(&mut self, other: TransportError) {
        match self {
            TransportError::RemoteExecutionFailed { suppressed, .. }
            | TransportError::WithSuppressed { suppressed, .. } => suppressed.push(other),
            _ => {
                let primary = std::mem::replace(self, TransportError::LifecycleStopping);
                *self = TransportError::WithSuppressed {
                    primary: Box::new(primary),
                    suppressed: vec![other],
                };
            }
        }
    }

    /// The failure that completed the call, without its suppressed causes.
    pub fn primary(&self) -> &TransportError {
        match self {
            TransportError::WithSuppressed { primary, .. } => primary.as_ref(),
            _ => self,
        }
    }

    /// Failures of other targets attached to this one.
    pub fn suppressed(&self) -> &[TransportError] {
        match self {
            TransportError::RemoteExecutionFailed { suppressed, .. }
            | TransportError::WithSuppressed { suppressed, .. } => suppressed.as_slice(),
            _ => &[],
        }
    }

    /// Whether a retry against a newer view could succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.primary(),
            TransportError::MemberSuspected { .. }
                | TransportError::RequestTimedOut { .. }
                | TransportError::SiteUnreachable { .. }
        )
    }
}

fn describe_targets(targets: &[Address]) -> String {
    if targets.is_empty() {
        return "a valid response".to_string();
    }
    let names: Vec<String> = targets.iter().map(|a| a.to_string()).collect();
    format!("responses from [{}]", names.join(", "))
}

impl From<WireError> for TransportError {
    fn from(err: WireError) -> Self {
        TransportError::ProtocolDecode {
            message: err.to_string(),
        }
    }
}

impl From<MarshalError> for TransportError {
    fn from(err: MarshalError) -> Self {
        match err {
            MarshalError::Encode(_) => TransportError::Marshalling {
                message: err.to_string(),
            },
            MarshalError::Decode(_) => TransportError::ProtocolDecode {
                message: err.to_string(),
            },
        }
    }
}

/// Errors reported by the group-communication substrate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The channel is closed.
    #[error("channel closed")]
    Closed,

    /// The destination is not reachable through this channel.
    #[error("destination {0} unreachable")]
    Unreachable(String),

    /// Any other substrate failure.
    #[error("{0}")]
    Other(String),
}
