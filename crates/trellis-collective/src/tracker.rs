//! Tracker arena and contributor accounting shared by fence and group
//!
//! Trackers are owned by an arena keyed by [`SignatureKey`]; at most one
//! tracker exists per signature. Contributions are attributed to the child
//! slot they arrived through so rollups concatenate in a fixed post-order:
//! child subtrees left to right, then this daemon's own data.

use crate::errors::{CollectiveError, CollectiveResult};
use crate::signature::SignatureKey;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::oneshot;
use trellis_core::{CollectiveEffects, DaemonId, LookupError, ProcId, TopologyEffects};

/// One-shot completion handle resolved when a collective is released
pub type Completion<T> = oneshot::Sender<CollectiveResult<T>>;

/// Resolve a completion; a caller that stopped waiting is not an error
pub(crate) fn resolve<T>(completion: Completion<T>, result: CollectiveResult<T>) {
    if completion.send(result).is_err() {
        tracing::debug!("collective caller dropped its completion handle");
    }
}

/// Map of live trackers keyed by signature
#[derive(Debug)]
pub struct TrackerArena<T> {
    trackers: HashMap<SignatureKey, T>,
}

impl<T> Default for TrackerArena<T> {
    fn default() -> Self {
        Self {
            trackers: HashMap::new(),
        }
    }
}

impl<T> TrackerArena<T> {
    /// Tracker for `key`
    pub fn get(&self, key: &SignatureKey) -> Option<&T> {
        self.trackers.get(key)
    }

    /// Mutable tracker for `key`
    pub fn get_mut(&mut self, key: &SignatureKey) -> Option<&mut T> {
        self.trackers.get_mut(key)
    }

    /// Whether a tracker exists for `key`
    pub fn contains(&self, key: &SignatureKey) -> bool {
        self.trackers.contains_key(key)
    }

    /// Insert a tracker and hand back a reference to it
    pub fn insert(&mut self, key: SignatureKey, tracker: T) -> &mut T {
        self.trackers.entry(key).or_insert(tracker)
    }

    /// Remove and return the tracker for `key`
    pub fn remove(&mut self, key: &SignatureKey) -> Option<T> {
        self.trackers.remove(key)
    }

    /// Keys of every live tracker
    pub fn keys(&self) -> Vec<SignatureKey> {
        self.trackers.keys().copied().collect()
    }

    /// Number of live trackers
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    /// Whether no tracker is live
    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Iterate over every tracker mutably
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.trackers.values_mut()
    }
}

/// Source of one contribution, in rollup order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Contributor {
    /// A child subtree, by slot
    Child(usize),
    /// A daemon outside the local subtree (direct reports)
    Daemon(DaemonId),
    /// This daemon
    Local,
}

impl Contributor {
    /// Attribute a message from `from` to a contributor
    pub fn of<E: TopologyEffects>(effects: &E, from: DaemonId) -> Self {
        if from == effects.local_daemon() {
            Contributor::Local
        } else if let Some(slot) = effects.child_slot_for(from) {
            Contributor::Child(slot)
        } else {
            Contributor::Daemon(from)
        }
    }
}

/// Daemons taking part in a rollup and how many reports this daemon awaits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Participation {
    /// De-duplicated participating daemons
    pub daemons: Vec<DaemonId>,
    /// Child slots whose subtree holds a participant
    pub child_slots: BTreeSet<usize>,
    /// Whether this daemon participates itself
    pub local: bool,
}

impl Participation {
    /// Work out which child subtrees will report for `daemons`
    pub fn compute<E: TopologyEffects>(effects: &E, daemons: Vec<DaemonId>) -> Self {
        let me = effects.local_daemon();
        let mut child_slots = BTreeSet::new();
        let mut local = false;
        for daemon in &daemons {
            if *daemon == me {
                local = true;
            } else if let Some(slot) = effects.child_slot_for(*daemon) {
                child_slots.insert(slot);
            }
        }
        Self {
            daemons,
            child_slots,
            local,
        }
    }

    /// Recompute against the current tree
    pub fn refresh<E: TopologyEffects>(&mut self, effects: &E) {
        let living: BTreeSet<DaemonId> = effects.daemons().into_iter().collect();
        let daemons: Vec<DaemonId> = self
            .daemons
            .iter()
            .copied()
            .filter(|daemon| living.contains(daemon))
            .collect();
        *self = Self::compute(effects, daemons);
    }

    /// Reports this daemon waits for
    pub fn expected(&self) -> usize {
        self.child_slots.len() + usize::from(self.local)
    }
}

/// Resolve the daemons hosting `procs`.
///
/// A signature whose first process belongs to the daemon job involves every
/// daemon. A job without a process map yet resolves to the root alone when
/// asked on the root, and fails anywhere else.
pub fn resolve_daemons<E: CollectiveEffects>(
    effects: &E,
    procs: &[ProcId],
) -> CollectiveResult<Vec<DaemonId>> {
    let first = procs
        .first()
        .ok_or_else(|| CollectiveError::not_found("collective names no processes"))?;
    if first.job == effects.daemon_job() {
        return Ok(effects.daemons());
    }

    let mut daemons = BTreeSet::new();
    for proc in procs {
        match effects.daemons_hosting(proc) {
            Ok(hosts) => daemons.extend(hosts),
            Err(LookupError::NoMap(job)) if effects.is_root() => {
                tracing::warn!(%job, "no process map yet; root resolves the collective to itself");
                return Ok(vec![effects.local_daemon()]);
            }
            Err(err) => return Err(CollectiveError::not_found(err.to_string())),
        }
    }
    Ok(daemons.into_iter().collect())
}
