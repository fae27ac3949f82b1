//! Provider bundle trait for simplified type parameters.
//!
//! Without bundling, every transport component would carry separate time and
//! task type parameters:
//!
//! ```text
//! struct RequestRepository<T, TP>
//! where
//!     T: TimeProvider + Clone + 'static,
//!     TP: TaskProvider + Clone + 'static,
//! ```
//!
//! With bundling, this simplifies to `struct RequestRepository<P: Providers>`.

use crate::{TaskProvider, TimeProvider, TokioTaskProvider, TokioTimeProvider};

/// Bundle of the provider types for a runtime environment.
pub trait Providers: Clone + 'static {
    /// Time provider type for sleep and clock queries.
    type Time: TimeProvider + Clone + 'static;

    /// Task provider type for spawning local tasks.
    type Task: TaskProvider + Clone + 'static;

    /// Get the time provider instance.
    fn time(&self) -> &Self::Time;

    /// Get the task provider instance.
    fn task(&self) -> &Self::Task;
}

/// Production providers using the Tokio runtime.
#[derive(Clone, Default)]
pub struct TokioProviders {
    time: TokioTimeProvider,
    task: TokioTaskProvider,
}

impl TokioProviders {
    /// Create a new production providers bundle.
    pub fn new() -> Self {
        Self {
            time: TokioTimeProvider::new(),
            task: TokioTaskProvider,
        }
    }
}

impl Providers for TokioProviders {
    type Time = TokioTimeProvider;
    type Task = TokioTaskProvider;

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn task(&self) -> &Self::Task {
        &self.task
    }
}
