//! # Gridwire Transport
//!
//! Request/response clustering transport for an in-memory data grid.
//!
//! The transport runs on top of a group-communication substrate that owns
//! membership, failure detection and reliable delivery. It adds:
//! - **Views**: Monotonic membership snapshots with waiters
//! - **Requests**: Correlation of asynchronous replies, with timeouts and
//!   membership-driven early completion
//! - **Collectors**: Pluggable policies folding per-target responses
//! - **Dispatch**: Unicast, anycast, broadcast and staggered calls with
//!   delivery-order flags, plus cross-site backups
//! - **Inbound ordering**: Per-sender and total order execution chains
//! - **Flow control**: Credit accounting with deferred sends
//! - **Bundling**: Per-destination batching of small frames

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use gridwire_core::{
    Address, JsonMarshaller, MarshalError, Marshaller, Providers, TaskProvider, TimeProvider,
    TokioProviders, TopologyCoordinates, UID,
};

// =============================================================================
// Modules
// =============================================================================

/// Error types for transport operations.
pub mod error;

/// Configuration structures.
pub mod config;

/// Delivery order and message flags.
pub mod order;

/// Frame wire format with CRC32C checksums.
pub mod wire;

/// Responses and the command abstraction.
pub mod response;

/// Seam to the group-communication substrate.
pub mod channel;

/// Cluster views and membership tracking.
pub mod view;

/// Response aggregation policies.
pub mod collector;

/// Request lifecycle and repository.
pub mod request;

/// Inbound command execution.
pub mod inbound;

/// Credit-based flow control.
pub mod flow_control;

/// Outbound bundling.
pub mod bundler;

/// The dispatch core.
pub mod transport;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Error exports
pub use error::{ChannelError, TransportError};

// Configuration exports
pub use config::{BundlerConfig, FlowControlConfig, TransportConfig};

// Ordering and wire exports
pub use order::{DeliverOrder, MessageFlags};
pub use wire::{Frame, FrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE, WireError};

// Response exports
pub use response::{
    FailureKind, RemoteFailure, ReplicableCommand, Response, ResponseFilter, ResponseMode,
    RpcOptions,
};

// Membership exports
pub use channel::GroupChannel;
pub use view::{ClusterView, MembershipListener, ViewChangedEvent, ViewEvent};

// Collector exports
pub use collector::{
    FilterMapResponseCollector, FirstValidResponseCollector, MapResponseCollector,
    ResponseCollector, SingleResponseCollector, SingletonMapResponseCollector,
};

// Request exports
pub use request::{NO_REQUEST_ID, ReplyHandle, RequestId, RequestState};

// Inbound exports
pub use inbound::{InboundInvocationHandler, ReplyPromise};

// Transport exports
pub use transport::{BackupOutcome, BackupResponse, GroupTransport, XSiteBackup};
