//! Trellis Core
//!
//! Foundation types shared by every Trellis crate: process and daemon
//! identifiers, the unified error type, wire status codes, the effect traits
//! through which the collective engine reaches its external collaborators
//! (transport, topology provider, job directory, local consumers), and the
//! radix spanning-tree model used to compute parent/children views.
//!
//! Nothing in this crate performs I/O. Embeddings supply effect handlers; the
//! simulation harness in `trellis-testkit` supplies in-memory ones.

pub mod config;
pub mod effects;
pub mod errors;
pub mod identifiers;
pub mod serialization;
pub mod status;
pub mod tree;

pub use config::TrellisConfig;
pub use effects::{
    CollectiveEffects, DeliveryEffects, DirectoryEffects, EndpointInfo, InfoEntry,
    LifecycleEffects, LookupError, Tag, TopologyChange, TopologyEffects, TransportEffects,
};
pub use errors::{Result, TrellisError};
pub use identifiers::{DaemonId, JobId, ProcId, Rank};
pub use status::Status;
pub use tree::{RadixTree, TopologyView};
