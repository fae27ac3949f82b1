//! Configuration structures for transport behavior.

use std::time::Duration;

/// Configuration for the transport, supplied at construction.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Default timeout used by calls that do not pass their own.
    pub remote_timeout: Duration,

    /// Lower bound for the delay between two staggered sends.
    ///
    /// Dividing a short remaining deadline by the number of candidates can
    /// otherwise degenerate into back-to-back sends.
    pub min_stagger_delay: Duration,

    /// Outbound message bundling.
    pub bundler: BundlerConfig,

    /// Credit-based flow control.
    pub flow_control: FlowControlConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(15),
            min_stagger_delay: Duration::from_millis(10),
            bundler: BundlerConfig::default(),
            flow_control: FlowControlConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Override the default remote call timeout.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Override the minimum stagger delay.
    pub fn with_min_stagger_delay(mut self, delay: Duration) -> Self {
        self.min_stagger_delay = delay;
        self
    }

    /// Replace the bundler configuration.
    pub fn with_bundler(mut self, bundler: BundlerConfig) -> Self {
        self.bundler = bundler;
        self
    }

    /// Replace the flow control configuration.
    pub fn with_flow_control(mut self, flow_control: FlowControlConfig) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Create a configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self {
            remote_timeout: Duration::from_secs(2),
            min_stagger_delay: Duration::from_millis(1),
            bundler: BundlerConfig {
                enabled: true,
                max_bundle_size: 16 * 1024,
            },
            flow_control: FlowControlConfig {
                enabled: true,
                max_credits: 2 * 1024 * 1024,
            },
        }
    }

    /// Create a configuration for high-latency WAN networking.
    pub fn wan_network() -> Self {
        Self {
            remote_timeout: Duration::from_secs(60),
            min_stagger_delay: Duration::from_millis(50),
            bundler: BundlerConfig {
                enabled: true,
                max_bundle_size: 64 * 1024,
            },
            flow_control: FlowControlConfig {
                enabled: true,
                max_credits: 8 * 1024 * 1024,
            },
        }
    }
}

/// Configuration of the per-destination outbound bundler.
#[derive(Clone, Debug)]
pub struct BundlerConfig {
    /// Whether small messages are batched at all.
    pub enabled: bool,

    /// Maximum accumulated bytes per destination before producers must
    /// hand the bundle off for serialization.
    pub max_bundle_size: usize,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_bundle_size: 64 * 1024,
        }
    }
}

/// Configuration of credit-based flow control.
#[derive(Clone, Debug)]
pub struct FlowControlConfig {
    /// Whether sends are metered against credits at all.
    pub enabled: bool,

    /// Credits (bytes) each destination, and the multicast pool, starts with.
    /// Replenishment never raises an account above this value.
    pub max_credits: u64,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_credits: 4 * 1024 * 1024,
        }
    }
}
