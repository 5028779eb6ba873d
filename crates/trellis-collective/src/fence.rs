//! Fence: allgather rollup over an explicit participant set
//!
//! Every participating daemon sends its own contribution to itself on the
//! FENCE tag. A daemon waits for one report per participating child subtree
//! plus its own, then forwards the combined bucket to its parent. The root
//! broadcasts the final bucket on FENCE_RELEASE, which resolves each
//! participant's completion and discards its tracker.
//!
//! Buckets concatenate in post-order: child subtrees left to right, then the
//! daemon's own data. With root 0 over children {1, 2} and 3 under 1, the
//! released bucket of one-byte contributions `{i}` is `[3, 1, 2, 0]`.

use crate::errors::{CollectiveError, CollectiveResult};
use crate::signature::{FenceSignature, SignatureKey};
use crate::tracker::{resolve, resolve_daemons, Completion, Contributor, Participation, TrackerArena};
use crate::wire::{self, FenceInfo, FenceMessage, FenceReleaseMessage, WireMessage};
use crate::xcast::XcastEngine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use trellis_core::{CollectiveEffects, DaemonId, Status, Tag, TopologyChange};

/// Caller options for one fence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FenceOptions {
    /// Requested timeout in seconds
    pub timeout: Option<u32>,
    /// Outcome of the caller's local part of the collective
    pub local_status: Status,
}

/// Fence counters exposed through `CollectiveStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FenceCounters {
    /// Local contributions accepted
    pub started: u64,
    /// Releases applied on this daemon
    pub released: u64,
    /// Repeated reports from the same contributor, ignored
    pub duplicate_reports: u64,
}

#[derive(Debug)]
struct FenceTracker {
    signature: FenceSignature,
    participation: Participation,
    contributions: BTreeMap<Contributor, Vec<u8>>,
    info: FenceInfo,
    completions: Vec<Completion<Vec<u8>>>,
    /// Bucket already sent upward (or broadcast by the root)
    rolled_up: bool,
}

impl FenceTracker {
    fn reported(&self) -> usize {
        self.contributions.len()
    }

    fn bucket(&self) -> Vec<u8> {
        self.contributions.values().flatten().copied().collect()
    }
}

/// Fence state of one daemon
#[derive(Debug, Default)]
pub struct FenceEngine {
    trackers: TrackerArena<FenceTracker>,
    counters: FenceCounters,
}

impl FenceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> FenceCounters {
        self.counters
    }

    /// Number of fences in progress
    pub fn active(&self) -> usize {
        self.trackers.len()
    }

    /// Whether a tracker exists for `signature`
    pub fn is_tracking(&self, signature: &FenceSignature) -> bool {
        self.trackers.contains(&signature.key())
    }

    fn tracker<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        signature: &FenceSignature,
    ) -> CollectiveResult<&mut FenceTracker> {
        let key = signature.key();
        if !self.trackers.contains(&key) {
            let daemons = resolve_daemons(effects, &signature.procs)?;
            let participation = Participation::compute(effects, daemons);
            tracing::debug!(
                %signature,
                daemons = participation.daemons.len(),
                expected = participation.expected(),
                "new fence tracker"
            );
            self.trackers.insert(
                key,
                FenceTracker {
                    signature: signature.clone(),
                    participation,
                    contributions: BTreeMap::new(),
                    info: FenceInfo::default(),
                    completions: Vec::new(),
                    rolled_up: false,
                },
            );
        }
        self.trackers
            .get_mut(&key)
            .ok_or_else(|| CollectiveError::not_found(format!("fence tracker {key}")))
    }

    /// Contribute `data` to the fence named by `signature`
    pub fn fence<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        signature: FenceSignature,
        options: FenceOptions,
        data: Vec<u8>,
        completion: Completion<Vec<u8>>,
    ) -> CollectiveResult<()> {
        let tracker = self.tracker(effects, &signature)?;
        tracker.completions.push(completion);

        let message = WireMessage::Fence(FenceMessage {
            signature,
            info: FenceInfo {
                timeout: options.timeout,
                status: options.local_status,
            },
            data,
        });
        effects.send(effects.local_daemon(), Tag::FENCE, wire::encode(message)?)?;
        self.counters.started += 1;
        Ok(())
    }

    /// Handle a contribution from this daemon or a child subtree
    pub fn recv<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        xcast: &mut XcastEngine,
        from: DaemonId,
        message: FenceMessage,
    ) -> CollectiveResult<()> {
        let key = message.signature.key();
        let contributor = Contributor::of(effects, from);
        let tracker = self.tracker(effects, &message.signature)?;

        if tracker.contributions.contains_key(&contributor) {
            tracing::error!(
                signature = %message.signature,
                ?contributor,
                "duplicate fence contribution ignored"
            );
            self.counters.duplicate_reports += 1;
            return Ok(());
        }
        tracker.info.timeout = tracker.info.timeout.max(message.info.timeout);
        tracker.info.status = tracker.info.status.merge(message.info.status);
        tracker.contributions.insert(contributor, message.data);
        tracing::trace!(
            signature = %tracker.signature,
            reported = tracker.reported(),
            expected = tracker.participation.expected(),
            "fence contribution"
        );

        self.try_roll_up(effects, xcast, &key)
    }

    fn try_roll_up<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        xcast: &mut XcastEngine,
        key: &SignatureKey,
    ) -> CollectiveResult<()> {
        let Some(tracker) = self.trackers.get_mut(key) else {
            return Ok(());
        };
        if tracker.rolled_up || tracker.reported() < tracker.participation.expected() {
            return Ok(());
        }
        tracker.rolled_up = true;

        if effects.is_root() {
            tracing::debug!(signature = %tracker.signature, status = %tracker.info.status, "fence complete, releasing");
            let release = WireMessage::FenceRelease(FenceReleaseMessage {
                signature: tracker.signature.clone(),
                status: tracker.info.status,
                data: tracker.bucket(),
            });
            xcast.broadcast(effects, Tag::FENCE_RELEASE, wire::encode(release)?)
        } else {
            let parent = effects.current_parent().ok_or_else(|| {
                CollectiveError::routing("non-root daemon has no parent to roll a fence up to")
            })?;
            let rollup = WireMessage::Fence(FenceMessage {
                signature: tracker.signature.clone(),
                info: tracker.info,
                data: tracker.bucket(),
            });
            effects.send(parent, Tag::FENCE, wire::encode(rollup)?)?;
            Ok(())
        }
    }

    /// Resolve every local caller of a released fence
    pub fn release(&mut self, message: FenceReleaseMessage) {
        let Some(tracker) = self.trackers.remove(&message.signature.key()) else {
            tracing::debug!(signature = %message.signature, "fence release for a fence we are not in");
            return;
        };
        let result = CollectiveError::check(message.status).map(|()| message.data);
        for completion in tracker.completions {
            resolve(completion, result.clone());
        }
        self.counters.released += 1;
    }

    /// Recompute expectations after a topology change and complete any fence
    /// the new tree no longer waits on. A daemon with a new parent sends its
    /// bucket again; the old parent may have died holding it.
    pub fn on_topology_change<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        xcast: &mut XcastEngine,
        change: &TopologyChange,
    ) {
        let resend = change.parent_changed && !effects.is_root();
        for tracker in self.trackers.values_mut() {
            tracker.participation.refresh(effects);
            if resend && tracker.rolled_up {
                tracing::debug!(signature = %tracker.signature, "parent changed, rolling fence up again");
                tracker.rolled_up = false;
            }
        }
        for key in self.trackers.keys() {
            if let Err(err) = self.try_roll_up(effects, xcast, &key) {
                tracing::warn!(error = %err, "fence rollup after topology change failed");
            }
        }
    }
}
