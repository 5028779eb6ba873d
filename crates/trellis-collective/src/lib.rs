#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]
//! # Trellis Collective
//!
//! Collective operations of the daemon control plane:
//!
//! - **xcast**: reliable, ordered broadcast down the spanning tree with ack
//!   rounds and recovery from topology changes
//! - **fence**: allgather rollup over an explicit participant set, released
//!   to every participant through xcast
//! - **group**: construct/destruct of named process groups, context-id
//!   assignment and the leaderless bootstrap mode
//!
//! ## Design Principles
//!
//! - **One context value**: a [`CollectiveEngine`] holds all state of one
//!   daemon and is passed by reference into every entry point
//! - **Effects at the seams**: transport, topology, directory and local
//!   consumers are reached through `trellis_core` effect traits
//! - **Arena trackers**: at most one tracker per signature, keyed by a
//!   content hash
//! - **Explicit reconciliation**: topology changes arrive through
//!   [`CollectiveEngine::on_topology_change`], never as a side effect of I/O

pub mod compression;
pub mod config;
pub mod engine;
pub mod errors;
pub mod fence;
pub mod group;
pub mod prelude;
pub mod runtime;
pub mod signature;
pub mod tracker;
pub mod wire;
pub mod xcast;

pub use config::{CollectiveConfig, CompressionConfig};
pub use engine::{CollectiveEngine, CollectiveStats};
pub use errors::{CollectiveError, CollectiveResult};
pub use fence::FenceOptions;
pub use group::{GroupDirective, GroupOutcome, GroupRecord, GroupRequest};
pub use runtime::{CollectiveHandle, CollectiveRuntime, Pending, RuntimeEvent};
pub use signature::{FenceSignature, GroupOp, GroupSignature, XcastSignature};
pub use tracker::Completion;
pub use xcast::XcastProgress;
