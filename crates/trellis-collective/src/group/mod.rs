//! Group construct/destruct
//!
//! # Rollup mode
//!
//! Callers name the members. Each participating daemon collects group info
//! and endpoint data from its subtree exactly like a fence and forwards it to
//! its parent. The root finalises the membership, assigns a context id when
//! asked and broadcasts the result on GROUP_RELEASE.
//!
//! # Bootstrap mode
//!
//! Membership is not known in advance. Leaders report their processes with
//! the expected number of leaders; followers report only the processes they
//! add. Every report goes straight to the root, which completes once all
//! leaders have reported and follower reports cover every added process.
//!
//! # Release
//!
//! Every daemon installs released data, records or forgets the group and
//! resolves its local callers, even when the operation failed.

pub mod membership;

use crate::errors::{CollectiveError, CollectiveResult};
use crate::signature::{group_key, GroupOp, GroupSignature, SignatureKey};
use crate::tracker::{resolve, resolve_daemons, Completion, Contributor, Participation, TrackerArena};
use crate::wire::{self, GroupBody, GroupMessage, GroupReleaseBody, GroupReleaseMessage, WireMessage};
use crate::xcast::XcastEngine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use trellis_core::{
    CollectiveEffects, DaemonId, EndpointInfo, InfoEntry, ProcId, Status, Tag, TopologyChange,
    TrellisError,
};

/// Caller directive attached to a group request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupDirective {
    /// Timeout in seconds
    Timeout(u32),
    /// Outcome of the caller's local part of the operation
    LocalStatus(Status),
    /// Ask the root for a context id
    AssignContextId(bool),
    /// Bootstrap mode with this many leaders
    Bootstrap(usize),
    /// Processes joining besides the named members
    AddMembers(Vec<ProcId>),
    /// Group-level key/value data
    GroupInfo(InfoEntry),
    /// Endpoint data published by one process
    Endpoint(EndpointInfo),
    /// Required order of the final membership
    FinalOrder(Vec<ProcId>),
}

/// A local construct or destruct request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRequest {
    /// Construct or destruct
    pub op: GroupOp,
    /// Name shared by every participant
    pub group_id: String,
    /// Named members; empty for a bootstrap follower
    pub members: Vec<ProcId>,
    /// Caller directives, applied in order
    pub directives: Vec<GroupDirective>,
}

impl GroupRequest {
    pub fn construct(group_id: impl Into<String>, members: Vec<ProcId>) -> Self {
        Self {
            op: GroupOp::Construct,
            group_id: group_id.into(),
            members,
            directives: Vec::new(),
        }
    }

    pub fn destruct(group_id: impl Into<String>, members: Vec<ProcId>) -> Self {
        Self {
            op: GroupOp::Destruct,
            group_id: group_id.into(),
            members,
            directives: Vec::new(),
        }
    }

    /// Add a directive
    pub fn with(mut self, directive: GroupDirective) -> Self {
        self.directives.push(directive);
        self
    }

    /// Split into the signature and the wire message this daemon contributes
    fn into_message(self) -> GroupMessage {
        let mut signature = GroupSignature::new(self.op, self.group_id);
        signature.follower = self.members.is_empty();
        membership::merge_members(&mut signature.members, &self.members);

        let mut status = Status::Success;
        let mut timeout = None;
        let mut info = Vec::new();
        let mut endpoints = Vec::new();
        for directive in self.directives {
            match directive {
                GroupDirective::Timeout(secs) => timeout = Some(secs),
                GroupDirective::LocalStatus(local) => status = status.merge(local),
                GroupDirective::AssignContextId(assign) => signature.assign_context_id = assign,
                GroupDirective::Bootstrap(leaders) => signature.bootstrap = leaders,
                GroupDirective::AddMembers(procs) => {
                    membership::merge_members(&mut signature.add_members, &procs);
                }
                GroupDirective::GroupInfo(entry) => info.push(entry),
                GroupDirective::Endpoint(endpoint) => endpoints.push(endpoint),
                GroupDirective::FinalOrder(order) => signature.final_order = Some(order),
            }
        }
        if signature.follower {
            // Followers never claim to be leaders.
            signature.bootstrap = 0;
        }

        let body = match signature.op {
            GroupOp::Construct => GroupBody::Construct { info, endpoints },
            GroupOp::Destruct => GroupBody::Destruct,
        };
        GroupMessage {
            signature,
            status,
            timeout,
            body,
        }
    }
}

/// What local callers receive once a group operation is released
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupOutcome {
    /// Group the operation applied to
    pub group_id: String,
    /// Construct or destruct
    pub op: GroupOp,
    /// Context id assigned by the root, if one was requested
    pub context_id: Option<u64>,
    /// Final membership; empty for a destruct
    pub membership: Vec<ProcId>,
    /// Group-level data from every participant
    pub info: Vec<InfoEntry>,
    /// Endpoint data from every participant
    pub endpoints: Vec<EndpointInfo>,
}

/// A constructed group known to this daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    /// Released membership
    pub membership: Vec<ProcId>,
    /// Context id, if one was assigned
    pub context_id: Option<u64>,
}

/// Group counters exposed through `CollectiveStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCounters {
    /// Local requests accepted
    pub started: u64,
    /// Releases applied on this daemon
    pub released: u64,
    /// Root only: context ids handed out
    pub context_ids_assigned: u64,
    /// Requests that disagreed with an in-flight tracker
    pub merge_conflicts: u64,
    /// Constructs rejected for an unusable final order
    pub bad_orders: u64,
    /// Repeated reports from the same contributor, ignored
    pub duplicate_reports: u64,
}

#[derive(Debug)]
struct GroupTracker {
    signature: GroupSignature,
    participation: Participation,
    reports: BTreeSet<Contributor>,
    bootstrap: bool,
    leaders_expected: usize,
    leaders_reported: usize,
    /// Added processes covered by follower reports
    followers_covered: BTreeSet<ProcId>,
    status: Status,
    timeout: Option<u32>,
    info: Vec<InfoEntry>,
    endpoints: Vec<EndpointInfo>,
    completions: Vec<Completion<GroupOutcome>>,
    rolled_up: bool,
}

impl GroupTracker {
    fn new(signature: GroupSignature, participation: Participation) -> Self {
        let bootstrap = signature.is_bootstrap();
        Self {
            leaders_expected: signature.bootstrap,
            signature,
            participation,
            reports: BTreeSet::new(),
            bootstrap,
            leaders_reported: 0,
            followers_covered: BTreeSet::new(),
            status: Status::Success,
            timeout: None,
            info: Vec::new(),
            endpoints: Vec::new(),
            completions: Vec::new(),
            rolled_up: false,
        }
    }

    fn followers_expected(&self) -> usize {
        self.signature.add_members.len()
    }

    fn followers_reported(&self) -> usize {
        self.signature
            .add_members
            .iter()
            .filter(|proc| self.followers_covered.contains(*proc))
            .count()
    }

    /// Fold a later request for the same group and operation into this one
    fn absorb(&mut self, incoming: &GroupSignature) -> CollectiveResult<()> {
        if incoming.bootstrap > 0 {
            if self.leaders_expected > 0 && self.leaders_expected != incoming.bootstrap {
                return Err(CollectiveError::conflict(format!(
                    "bootstrap leader count {} disagrees with {}",
                    incoming.bootstrap, self.leaders_expected
                )));
            }
            // A follower may have created the tracker without the count.
            self.leaders_expected = incoming.bootstrap;
            self.signature.bootstrap = incoming.bootstrap;
            self.bootstrap = true;
            membership::merge_members(&mut self.signature.members, &incoming.members);
        } else if incoming.follower {
            self.bootstrap = true;
        }

        membership::merge_members(&mut self.signature.add_members, &incoming.add_members);

        if let Some(order) = &incoming.final_order {
            match &self.signature.final_order {
                Some(cached) if cached != order => {
                    return Err(CollectiveError::conflict(
                        "final order differs from the one already supplied",
                    ));
                }
                Some(_) => {}
                None => self.signature.final_order = Some(order.clone()),
            }
        }

        self.signature.assign_context_id |= incoming.assign_context_id;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        if self.bootstrap {
            self.leaders_expected > 0
                && self.leaders_reported >= self.leaders_expected
                && self.followers_reported() == self.followers_expected()
        } else {
            self.reports.len() >= self.participation.expected()
        }
    }
}

/// Group state of one daemon
#[derive(Debug)]
pub struct GroupEngine {
    trackers: TrackerArena<GroupTracker>,
    groups: BTreeMap<String, GroupRecord>,
    /// Root only: next context id to hand out, counting down
    next_context_id: Option<u64>,
    counters: GroupCounters,
}

impl GroupEngine {
    pub fn new(initial_context_id: u64) -> Self {
        Self {
            trackers: TrackerArena::default(),
            groups: BTreeMap::new(),
            next_context_id: Some(initial_context_id),
            counters: GroupCounters::default(),
        }
    }

    pub fn counters(&self) -> GroupCounters {
        self.counters
    }

    /// Constructed group known under `group_id`
    pub fn lookup(&self, group_id: &str) -> Option<&GroupRecord> {
        self.groups.get(group_id)
    }

    /// Whether an operation on `group_id` is in progress here
    pub fn is_tracking(&self, op: GroupOp, group_id: &str) -> bool {
        self.trackers.contains(&group_key(op, group_id))
    }

    /// Bootstrap progress of an in-flight construct: (leaders reported,
    /// leaders expected, followers reported, followers expected)
    pub fn bootstrap_progress(&self, group_id: &str) -> Option<(usize, usize, usize, usize)> {
        self.trackers
            .get(&group_key(GroupOp::Construct, group_id))
            .filter(|tracker| tracker.bootstrap)
            .map(|tracker| {
                (
                    tracker.leaders_reported,
                    tracker.leaders_expected,
                    tracker.followers_reported(),
                    tracker.followers_expected(),
                )
            })
    }

    /// Find or create the tracker for `signature`, merging it into an
    /// existing one. A merge conflict fails the operation for every caller.
    fn tracker<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        signature: &GroupSignature,
    ) -> CollectiveResult<&mut GroupTracker> {
        let key = signature.key();
        if let Some(tracker) = self.trackers.get_mut(&key) {
            if let Err(err) = tracker.absorb(signature) {
                tracing::error!(group = %signature.group_id, error = %err, "group request conflicts with tracker");
                self.counters.merge_conflicts += 1;
                tracker.status = tracker.status.merge(err.status());
            }
        } else {
            let participation = if signature.is_bootstrap() {
                Participation::default()
            } else {
                let daemons = resolve_daemons(effects, &signature.members)?;
                Participation::compute(effects, daemons)
            };
            tracing::debug!(
                group = %signature.group_id,
                op = %signature.op,
                bootstrap = signature.is_bootstrap(),
                expected = participation.expected(),
                "new group tracker"
            );
            self.trackers
                .insert(key, GroupTracker::new(signature.clone(), participation));
        }
        self.trackers
            .get_mut(&key)
            .ok_or_else(|| CollectiveError::not_found(format!("group tracker {key}")))
    }

    // ========================================================================
    // Local entry point
    // ========================================================================

    /// Contribute this daemon's part of a group operation
    pub fn group<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        request: GroupRequest,
        completion: Completion<GroupOutcome>,
    ) -> CollectiveResult<()> {
        if request.group_id.is_empty() {
            return Err(TrellisError::invalid("group id must not be empty").into());
        }
        if request.op == GroupOp::Destruct && request.members.is_empty() {
            return Err(TrellisError::invalid("destruct must name the group members").into());
        }
        let message = request.into_message();
        let tracker = self.tracker(effects, &message.signature)?;
        tracker.completions.push(completion);

        // Bootstrap reports bypass the tree.
        let dest = if message.signature.is_bootstrap() {
            effects.root()
        } else {
            effects.local_daemon()
        };
        tracing::debug!(group = %message.signature.group_id, op = %message.signature.op, %dest, "group contribution");
        effects.send(dest, Tag::GROUP, wire::encode(WireMessage::Group(message))?)?;
        self.counters.started += 1;
        Ok(())
    }

    // ========================================================================
    // GROUP receive
    // ========================================================================

    /// Handle a contribution from this daemon, a child subtree or (in
    /// bootstrap mode) any daemon
    pub fn recv<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        xcast: &mut XcastEngine,
        from: DaemonId,
        message: GroupMessage,
    ) -> CollectiveResult<()> {
        let key = message.signature.key();
        let contributor = Contributor::of(effects, from);
        let tracker = self.tracker(effects, &message.signature)?;

        let signature = &message.signature;
        let rollup = signature.bootstrap == 0 && !signature.follower;
        if rollup && tracker.reports.contains(&contributor) {
            tracing::error!(group = %signature.group_id, ?contributor, "duplicate group contribution ignored");
            self.counters.duplicate_reports += 1;
            return Ok(());
        }

        tracker.status = tracker.status.merge(message.status);
        tracker.timeout = tracker.timeout.max(message.timeout);
        if let GroupBody::Construct { info, endpoints } = message.body {
            tracker.info.extend(info);
            tracker.endpoints.extend(endpoints);
        }

        if signature.bootstrap > 0 {
            tracker.leaders_reported += 1;
        } else if signature.follower {
            tracker
                .followers_covered
                .extend(signature.add_members.iter().cloned());
        } else {
            tracker.reports.insert(contributor);
        }
        tracing::trace!(
            group = %signature.group_id,
            leaders = tracker.leaders_reported,
            followers = tracker.followers_reported(),
            reported = tracker.reports.len(),
            "group report"
        );

        self.try_complete(effects, xcast, &key)
    }

    fn try_complete<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        xcast: &mut XcastEngine,
        key: &SignatureKey,
    ) -> CollectiveResult<()> {
        let Some(tracker) = self.trackers.get_mut(key) else {
            return Ok(());
        };
        if tracker.rolled_up || !tracker.is_complete() {
            return Ok(());
        }
        tracker.rolled_up = true;

        if !effects.is_root() {
            if tracker.bootstrap {
                return Err(CollectiveError::routing(format!(
                    "bootstrap group {} completed away from the root",
                    tracker.signature.group_id
                )));
            }
            let parent = effects.current_parent().ok_or_else(|| {
                CollectiveError::routing("non-root daemon has no parent to roll a group up to")
            })?;
            let body = match tracker.signature.op {
                GroupOp::Construct => GroupBody::Construct {
                    info: tracker.info.clone(),
                    endpoints: tracker.endpoints.clone(),
                },
                GroupOp::Destruct => GroupBody::Destruct,
            };
            let rollup = WireMessage::Group(GroupMessage {
                signature: tracker.signature.clone(),
                status: tracker.status,
                timeout: tracker.timeout,
                body,
            });
            effects.send(parent, Tag::GROUP, wire::encode(rollup)?)?;
            return Ok(());
        }

        let release = self.finalize(key)?;
        xcast.broadcast(effects, Tag::GROUP_RELEASE, wire::encode(release)?)
    }

    /// Root: settle membership, order and context id for a complete tracker
    fn finalize(&mut self, key: &SignatureKey) -> CollectiveResult<WireMessage> {
        let tracker = self
            .trackers
            .get_mut(key)
            .ok_or_else(|| CollectiveError::not_found(format!("group tracker {key}")))?;
        let mut signature = tracker.signature.clone();
        let mut status = tracker.status;

        let body = match signature.op {
            GroupOp::Destruct => GroupReleaseBody::Destruct,
            GroupOp::Construct => {
                let mut membership = Vec::new();
                if status.is_success() {
                    match membership::finalize(
                        &signature.members,
                        &signature.add_members,
                        signature.final_order.as_deref(),
                    ) {
                        Ok(settled) => membership = settled,
                        Err(err) => {
                            tracing::error!(group = %signature.group_id, error = %err, "group construct rejected");
                            self.counters.bad_orders += 1;
                            status = err.status();
                        }
                    }
                }
                if status.is_success() && signature.assign_context_id {
                    match self.next_context_id {
                        Some(id) => {
                            signature.context_id = Some(id);
                            self.next_context_id = id.checked_sub(1).filter(|next| *next > 0);
                            self.counters.context_ids_assigned += 1;
                        }
                        None => status = CollectiveError::Exhausted.status(),
                    }
                }
                signature.final_order = None;

                if status.is_success() {
                    GroupReleaseBody::Construct {
                        membership,
                        info: tracker.info.clone(),
                        endpoints: tracker.endpoints.clone(),
                    }
                } else {
                    GroupReleaseBody::Construct {
                        membership: Vec::new(),
                        info: Vec::new(),
                        endpoints: Vec::new(),
                    }
                }
            }
        };

        tracing::debug!(group = %signature.group_id, op = %signature.op, %status, context_id = ?signature.context_id, "group complete, releasing");
        Ok(WireMessage::GroupRelease(GroupReleaseMessage {
            signature,
            status,
            body,
        }))
    }

    // ========================================================================
    // GROUP_RELEASE
    // ========================================================================

    /// Apply a released group operation and resolve local callers
    pub fn release<E: CollectiveEffects>(&mut self, effects: &E, message: GroupReleaseMessage) {
        let GroupReleaseMessage {
            signature,
            status,
            body,
        } = message;
        let group_id = signature.group_id.clone();
        let tracker = self.trackers.remove(&signature.key());

        let result = match body {
            GroupReleaseBody::Destruct => {
                if self.groups.remove(&group_id).is_some() {
                    tracing::debug!(group = %group_id, "group dissolved");
                }
                effects.remove_group_info(&group_id);
                CollectiveError::check(status).map(|()| GroupOutcome {
                    group_id: group_id.clone(),
                    op: GroupOp::Destruct,
                    context_id: None,
                    membership: Vec::new(),
                    info: Vec::new(),
                    endpoints: Vec::new(),
                })
            }
            GroupReleaseBody::Construct {
                membership,
                info,
                endpoints,
            } => CollectiveError::check(status).map(|()| {
                effects.install_group_info(&group_id, &info, &endpoints);
                self.groups.insert(
                    group_id.clone(),
                    GroupRecord {
                        membership: membership.clone(),
                        context_id: signature.context_id,
                    },
                );
                GroupOutcome {
                    group_id: group_id.clone(),
                    op: GroupOp::Construct,
                    context_id: signature.context_id,
                    membership,
                    info,
                    endpoints,
                }
            }),
        };

        if let Some(tracker) = tracker {
            for completion in tracker.completions {
                resolve(completion, result.clone());
            }
        }
        self.counters.released += 1;
    }

    /// Recompute expectations after a topology change. Rollups already sent
    /// to a parent that has since been replaced are sent again.
    pub fn on_topology_change<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        xcast: &mut XcastEngine,
        change: &TopologyChange,
    ) {
        let resend = change.parent_changed && !effects.is_root();
        for tracker in self.trackers.values_mut() {
            if tracker.bootstrap {
                continue;
            }
            tracker.participation.refresh(effects);
            if resend && tracker.rolled_up {
                tracing::debug!(group = %tracker.signature.group_id, "parent changed, rolling group up again");
                tracker.rolled_up = false;
            }
        }
        for key in self.trackers.keys() {
            if let Err(err) = self.try_complete(effects, xcast, &key) {
                tracing::warn!(error = %err, "group rollup after topology change failed");
            }
        }
    }
}
