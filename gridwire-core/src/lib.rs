//! # gridwire-core
//!
//! Core abstractions shared by the gridwire clustering transport.
//!
//! This crate provides the runtime-independent pieces the transport is built
//! on:
//!
//! - **Provider traits**: Abstractions for time and task spawning, so the
//!   transport can run on a real Tokio runtime or under a controlled clock
//! - **Node identity**: [`Address`], [`UID`] and [`TopologyCoordinates`]
//! - **Marshaller**: Pluggable encoding of commands and responses
//!
//! ## Provider Traits
//!
//! - [`TimeProvider`]: Sleep and clock queries
//! - [`TaskProvider`]: Task spawning for single-threaded environments
//! - [`Providers`]: Bundle of both, to keep type parameters short
//!
//! ## Node Identity
//!
//! An [`Address`] identifies one cluster member for the lifetime of its
//! membership. Equality is defined by its [`UID`] alone; the optional
//! [`TopologyCoordinates`] are informational and used by locality-aware
//! policies.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod address;
mod codec;
mod providers;
mod task;
mod time;

// Marshaller exports
pub use codec::{JsonMarshaller, MarshalError, Marshaller};

// Provider exports
pub use providers::{Providers, TokioProviders};
pub use task::{TaskProvider, TokioTaskProvider};
pub use time::{TimeProvider, TokioTimeProvider};

// Identity exports
pub use address::{Address, TopologyCoordinates, UID};
