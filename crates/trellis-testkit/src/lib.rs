//! Trellis Testing Infrastructure
//!
//! Deterministic, single-threaded harnesses for exercising the collective
//! engines without a real network:
//!
//! - [`SimNetwork`]: one shared FIFO of in-flight messages with per-daemon
//!   failure and selective delivery
//! - [`StaticDirectory`]: a job table mapping ranks to hosting daemons
//! - [`SimEffects`]: the effect bundle one simulated daemon runs against
//! - [`SimCluster`]: a radix tree of daemons, each with its own engine, that
//!   can be stepped message by message and can lose daemons mid-flight

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
//!
//! # Usage
//!
//! ```rust,no_run
//! use trellis_testkit::*;
//! use trellis_core::Tag;
//!
//! let mut cluster = SimCluster::new(7, 2);
//! cluster.xcast(DaemonId(3), Tag::user(1), b"hello".to_vec()).unwrap();
//! cluster.run_until_idle();
//! assert_eq!(cluster.deliveries(DaemonId(6), Tag::user(1)), vec![b"hello".to_vec()]);
//! ```

pub mod cluster;
pub mod directory;
pub mod effects;
pub mod network;

pub use cluster::{Outcome, SimCluster, SimNode};
pub use directory::StaticDirectory;
pub use effects::{NodeRecord, SimEffects, DAEMON_JOB};
pub use network::{Envelope, SimNetwork};

pub use trellis_core::{DaemonId, JobId, ProcId};

/// Install a `tracing` subscriber for test output, filtered by `RUST_LOG`.
/// Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
