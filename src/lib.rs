//! # Swarmstats
//!
//! Statistics-collection and reporting backbone for a distributed
//! load-testing master: worker nodes generate synthetic traffic and stream
//! per-request timing/outcome data to the master over an RPC link; this crate
//! merges those per-node statistics into global per-endpoint and "Total"
//! rows, deduplicates worker exceptions, and memoizes the computed report so
//! a polled dashboard stays cheap under load.
//!
//! ## Architecture Overview
//!
//! The crate is organized into several key modules:
//!
//! - `transport`: wire envelope, message codec and the two interchangeable
//!   transport backends behind one trait, selected once at startup
//! - `registry`: authoritative record of connected worker nodes and the
//!   latest snapshot each has reported
//! - `stats`: per-endpoint counters and the cross-node merge, including the
//!   frequency-weighted approximate median and percentile distribution
//! - `exceptions`: deduplication of worker exception reports
//! - `cache`: single-flight snapshot cache with a load-sensitive TTL
//! - `master`: coordination component wiring inbound messages to the above
//! - `runner`: read-only view of the external run-state machine
//!
//! The HTTP presentation layer, CLI bootstrap, and load generation live
//! outside this crate; it only consumes a [`runner::RunnerView`] and produces
//! plain serializable report structures.
//!
//! ## Accuracy trade-off
//!
//! The cross-node median and percentiles are approximate by design: each
//! node's reported value counts as one representative sample weighted by that
//! node's request count, so merging stays bounded in memory no matter how
//! many requests the run produced. Request, failure, and byte counts are
//! always exact sums.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use swarmstats::{
//!     master::Master,
//!     runner::{RunState, StaticRunner},
//!     transport::{select_transport, TransportConfig},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     swarmstats::logging::init();
//!
//!     let (transport, backend) = select_transport();
//!     tracing::info!("Selected {:?} transport backend", backend);
//!
//!     let runner = Arc::new(StaticRunner::new(RunState::Running, 100));
//!     let mut master = Master::new(transport, runner);
//!     master.bind(&TransportConfig::default()).await?;
//!
//!     // ... drive master.run() while the dashboard polls master.report()
//!     let cached = master.report(Duration::from_secs(2)).await?;
//!     println!("fail ratio: {}", cached.report.fail_ratio);
//!     Ok(())
//! }
//! ```

/// Single-flight snapshot cache with a load-sensitive TTL
///
/// Bounds the cost of repeated aggregation under concurrent dashboard
/// polling: at most one recomputation runs at a time and its result is
/// served until the dynamically computed TTL elapses.
pub mod cache;

/// Exception deduplication keyed by (message, traceback)
pub mod exceptions;

/// Colorized tracing output for embedding processes
pub mod logging;

/// Master-side coordination of registry, aggregation, cache and transport
pub mod master;

/// Node registry: connected workers and their latest snapshots
///
/// Snapshot replacement is atomic per node, so the aggregator never sees a
/// torn snapshot even while reports keep arriving.
pub mod registry;

/// Read-only runner collaborator (run state and user count)
pub mod runner;

/// Per-endpoint statistics and the cross-node aggregation engine
///
/// Home of the frequency-weighted median merge and the percentile
/// distribution computation.
pub mod stats;

/// Wire envelope, codec, and the interchangeable transport backends
pub mod transport;

// Re-export key types for convenient library usage

/// Coordination component of the master process
pub use master::Master;

/// Core registry types
pub use registry::{NodeHealth, NodeRegistry, NodeSnapshot, RegistryError};

/// Report structures consumed by the presentation layer
pub use stats::{AggregateReport, EndpointKey, EndpointStats, StatsAggregator, StatsRow};

/// Transport abstractions and selection
pub use transport::{
    select_transport, BackendKind, Message, MessageKind, Transport, TransportConfig,
    TransportError,
};

/// The current version of the crate, from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Base time-to-live of a cached aggregate report.
    ///
    /// Two seconds keeps an idle dashboard fresh while still collapsing
    /// bursts of concurrent polls into one computation. Under load the
    /// effective TTL grows; see [`crate::cache::default_ttl_policy`].
    pub const CACHE_TIME: Duration = Duration::from_secs(2);

    /// Default master RPC port.
    pub const PORT: u16 = 5557;

    /// Default bound on a single transport send.
    pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);
}
