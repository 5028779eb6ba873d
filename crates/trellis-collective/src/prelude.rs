//! Trellis collective prelude.
//!
//! Curated re-exports for daemons embedding the collective engine.

pub use crate::{
    CollectiveConfig, CollectiveEngine, CollectiveError, CollectiveHandle, CollectiveResult,
    CollectiveRuntime, FenceOptions, FenceSignature, GroupDirective, GroupOp, GroupOutcome,
    GroupRequest, Pending,
};
pub use trellis_core::{CollectiveEffects, DaemonId, JobId, ProcId, Rank, Status, Tag};
