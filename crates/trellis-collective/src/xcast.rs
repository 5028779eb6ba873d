//! Reliable tree broadcast ("xcast")
//!
//! An xcast starts on any daemon, travels point-to-point to the root, which
//! assigns it the next global op id, and is then forwarded parent to child
//! down the spanning tree. Each daemon delivers it locally exactly once and
//! acknowledges to its parent once its whole subtree has acknowledged.
//!
//! ## Ack rounds
//!
//! A parent hands each child the `ack_id_down` of the op; a child answers
//! with exactly that id. Topology changes bump the round so that acks from a
//! removed child or an old parent can be recognised as stale and dropped.
//!
//! ## Ordering
//!
//! Ops complete at every daemon in strictly increasing global id order:
//! only the lowest active op may complete, and `op_id_completed` advances by
//! one per completion.
//!
//! ## Faults
//!
//! [`XcastEngine::on_topology_change`] reconciles in-flight ops with the new
//! tree: unconfirmed ops are re-sent to the root, ack ids are invalidated or
//! re-issued, new children receive the op and unchanged children re-ack.

use crate::compression::{self, Compressor, Payload};
use crate::errors::{CollectiveError, CollectiveResult};
use crate::signature::{AckId, XcastSignature};
use crate::wire::{self, AckKind, XcastAckMessage, XcastMessage, WireMessage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use trellis_core::{CollectiveEffects, DaemonId, Tag, TopologyChange};

/// Payload handed back to the engine for a tag it consumes itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Tag the payload was broadcast on
    pub tag: Tag,
    /// Uncompressed payload
    pub payload: Vec<u8>,
}

/// Counters exposed through `CollectiveStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XcastCounters {
    /// Broadcasts started on this daemon
    pub initiated: u64,
    /// Ops handed to a local consumer
    pub delivered: u64,
    /// Ops acknowledged by the whole subtree
    pub completed: u64,
    /// Messages from a daemon that is no longer parent or child
    pub stale_dropped: u64,
    /// Resends of an op already numbered or completed
    pub duplicates: u64,
    /// Messages contradicting local op state
    pub protocol_violations: u64,
    /// Completions that skipped a global id
    pub ordering_faults: u64,
}

/// Snapshot of broadcast progress on one daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XcastProgress {
    /// Highest global id completed by this daemon's subtree
    pub op_id_completed: u64,
    /// `op_id_completed` when this daemon was last promoted
    pub op_id_completed_at_promotion: u64,
    /// Global ids still awaiting acks
    pub active: Vec<u64>,
    /// Local ids of own broadcasts not yet numbered by the root
    pub pending: Vec<u64>,
}

#[derive(Debug, Clone)]
struct XcastOp {
    signature: XcastSignature,
    ack_id_up: AckId,
    ack_id_down: AckId,
    expected: usize,
    /// Child slots that acknowledged in the current round
    acked: BTreeSet<usize>,
    processed: bool,
    replay_pending: bool,
    tag: Tag,
    payload: Payload,
}

impl XcastOp {
    fn new(signature: XcastSignature, tag: Tag, payload: Payload, ack_id_down: AckId) -> Self {
        Self {
            signature,
            ack_id_up: AckId::INVALID,
            ack_id_down,
            expected: 0,
            acked: BTreeSet::new(),
            processed: false,
            replay_pending: false,
            tag,
            payload,
        }
    }

    fn reported(&self) -> usize {
        self.acked.len()
    }

    fn is_ready(&self) -> bool {
        self.processed && !self.replay_pending && self.reported() >= self.expected
    }

    fn message(&self, ack_id: AckId) -> WireMessage {
        WireMessage::Xcast(XcastMessage {
            signature: self.signature,
            ack_id,
            tag: self.tag,
            payload: self.payload.clone(),
        })
    }
}

/// Local ids of one initiator the root has already numbered
#[derive(Debug, Default)]
struct OriginLedger {
    floor: u64,
    above: BTreeSet<u64>,
}

impl OriginLedger {
    /// Record `local_id`; false if it was numbered before
    fn insert(&mut self, local_id: u64) -> bool {
        if local_id <= self.floor || !self.above.insert(local_id) {
            return false;
        }
        while self.above.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
        true
    }
}

enum Located {
    Pending(u64),
    Active(u64),
    Absent,
    Conflict(String),
}

/// Broadcast state of one daemon
#[derive(Debug)]
pub struct XcastEngine {
    compressor: Compressor,
    next_local_id: u64,
    next_global_id: u64,
    next_ack_id: u32,
    /// Ops this daemon started that the root has not numbered yet
    pending: BTreeMap<u64, XcastOp>,
    /// Numbered ops in flight, by global id
    active: BTreeMap<u64, XcastOp>,
    /// (initiator, local id) of every active op
    origins: HashMap<(DaemonId, u64), u64>,
    /// Root only: which local ids each initiator has had numbered
    numbered: HashMap<DaemonId, OriginLedger>,
    op_id_completed: u64,
    op_id_completed_at_promotion: u64,
    counters: XcastCounters,
}

impl XcastEngine {
    pub fn new(compressor: Compressor) -> Self {
        Self {
            compressor,
            next_local_id: 1,
            next_global_id: 1,
            next_ack_id: 0,
            pending: BTreeMap::new(),
            active: BTreeMap::new(),
            origins: HashMap::new(),
            numbered: HashMap::new(),
            op_id_completed: 0,
            op_id_completed_at_promotion: 0,
            counters: XcastCounters::default(),
        }
    }

    pub fn counters(&self) -> XcastCounters {
        self.counters
    }

    pub fn progress(&self) -> XcastProgress {
        XcastProgress {
            op_id_completed: self.op_id_completed,
            op_id_completed_at_promotion: self.op_id_completed_at_promotion,
            active: self.active.keys().copied().collect(),
            pending: self.pending.keys().copied().collect(),
        }
    }

    fn fresh_ack_id(&mut self) -> AckId {
        let id = AckId(self.next_ack_id);
        self.next_ack_id = self.next_ack_id.wrapping_add(1);
        if !AckId(self.next_ack_id).is_valid() {
            self.next_ack_id = 0;
        }
        id
    }

    // ========================================================================
    // Initiation
    // ========================================================================

    /// Start a broadcast of `payload` to every daemon's `tag` consumer
    pub fn broadcast<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        tag: Tag,
        payload: Vec<u8>,
    ) -> CollectiveResult<()> {
        let local_id = self.next_local_id;
        self.next_local_id += 1;
        let signature = XcastSignature {
            global_id: 0,
            initiator: effects.local_daemon(),
            local_id,
        };
        let ack_id_down = self.fresh_ack_id();
        let op = XcastOp::new(signature, tag, self.compressor.pack(payload), ack_id_down);
        let bytes = wire::encode(op.message(AckId::INVALID))?;

        tracing::debug!(%signature, %tag, "starting xcast");
        self.pending.insert(local_id, op);
        if let Err(err) = effects.send(effects.root(), Tag::XCAST, bytes) {
            self.pending.remove(&local_id);
            return Err(err.into());
        }
        self.counters.initiated += 1;
        Ok(())
    }

    // ========================================================================
    // XCAST receive
    // ========================================================================

    /// Handle an inbound XCAST message. Payloads for tags the engine consumes
    /// itself (fence and group releases) are returned; every other tag is
    /// handed to `DeliveryEffects` directly.
    pub fn recv<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        from: DaemonId,
        message: XcastMessage,
    ) -> CollectiveResult<Vec<Delivery>> {
        let signature = message.signature;
        if effects.is_root() {
            if signature.is_assigned() {
                return Err(CollectiveError::routing(format!(
                    "root received {signature} which already carries a global id"
                )));
            }
            return self.recv_at_root(effects, message);
        }

        if effects.current_parent() != Some(from) {
            tracing::debug!(%signature, %from, "dropping xcast from a daemon that is not our parent");
            self.counters.stale_dropped += 1;
            return Ok(Vec::new());
        }
        if !signature.is_assigned() {
            return Err(CollectiveError::routing(format!(
                "{signature} reached a non-root daemon without a global id"
            )));
        }
        let global_id = signature.global_id;

        if self.subtree_completed(global_id) {
            tracing::debug!(%signature, "subtree already completed this op, acking");
            self.counters.duplicates += 1;
            self.send_ack(effects, from, signature, message.ack_id, AckKind::Ack);
            return Ok(Vec::new());
        }

        let created = match self.locate(&signature, effects.local_daemon()) {
            Located::Conflict(reason) => {
                tracing::error!(%signature, %reason, "xcast protocol violation");
                self.counters.protocol_violations += 1;
                return Ok(Vec::new());
            }
            Located::Active(_) => false,
            Located::Pending(local_id) => {
                if let Some(mut op) = self.pending.remove(&local_id) {
                    op.signature.global_id = global_id;
                    self.activate(op);
                }
                true
            }
            Located::Absent => {
                let ack_id_down = self.fresh_ack_id();
                let mut op = XcastOp::new(signature, message.tag, message.payload, ack_id_down);
                // Already delivered here before a promotion reshaped the subtree.
                op.processed = global_id <= self.op_id_completed;
                self.activate(op);
                true
            }
        };

        let deliveries = self.process(effects, global_id, Some(message.ack_id), created)?;
        self.advance(effects);
        Ok(deliveries)
    }

    fn recv_at_root<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        message: XcastMessage,
    ) -> CollectiveResult<Vec<Delivery>> {
        let signature = message.signature;
        let fresh = self
            .numbered
            .entry(signature.initiator)
            .or_default()
            .insert(signature.local_id);
        if !fresh {
            tracing::debug!(%signature, "root already numbered this op, ignoring resend");
            self.counters.duplicates += 1;
            return Ok(Vec::new());
        }

        let global_id = self.next_global_id;
        self.next_global_id += 1;
        let own = if signature.initiator == effects.local_daemon() {
            self.pending.remove(&signature.local_id)
        } else {
            None
        };
        let mut op = match own {
            Some(op) => op,
            None => {
                let ack_id_down = self.fresh_ack_id();
                XcastOp::new(signature, message.tag, message.payload, ack_id_down)
            }
        };
        op.signature.global_id = global_id;
        tracing::debug!(signature = %op.signature, "root assigned global id");
        self.activate(op);

        let deliveries = self.process(effects, global_id, None, true)?;
        self.advance(effects);
        Ok(deliveries)
    }

    /// Whether this subtree is known to have completed `global_id` since the
    /// last promotion
    fn subtree_completed(&self, global_id: u64) -> bool {
        global_id <= self.op_id_completed
            && global_id > self.op_id_completed_at_promotion
            && !self.active.contains_key(&global_id)
    }

    /// Find the op a signature refers to. Initiator and local id take
    /// precedence; a global id alone may not claim an op from another origin.
    fn locate(&self, signature: &XcastSignature, me: DaemonId) -> Located {
        let origin = (signature.initiator, signature.local_id);
        if let Some(&global_id) = self.origins.get(&origin) {
            if signature.is_assigned() && global_id != signature.global_id {
                return Located::Conflict(format!(
                    "origin already bound to global id {global_id}"
                ));
            }
            return Located::Active(global_id);
        }
        if signature.initiator == me && self.pending.contains_key(&signature.local_id) {
            return Located::Pending(signature.local_id);
        }
        if let Some(op) = self.active.get(&signature.global_id) {
            return Located::Conflict(format!(
                "global id already used by {}",
                op.signature
            ));
        }
        Located::Absent
    }

    fn activate(&mut self, op: XcastOp) {
        let signature = op.signature;
        self.origins
            .insert((signature.initiator, signature.local_id), signature.global_id);
        self.active.insert(signature.global_id, op);
    }

    /// Forward and deliver an active op as needed
    fn process<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        global_id: u64,
        ack_id_up: Option<AckId>,
        created: bool,
    ) -> CollectiveResult<Vec<Delivery>> {
        let Some(op) = self.active.get_mut(&global_id) else {
            return Ok(Vec::new());
        };
        if let Some(ack_id) = ack_id_up {
            op.ack_id_up = ack_id;
        }

        let forward = created || op.replay_pending;
        op.replay_pending = false;
        let deliver = !op.processed;
        op.processed = true;

        let mut deliveries = Vec::new();
        if op.tag.is_routing_sensitive() {
            if deliver {
                deliveries.extend(deliver_locally(effects, op)?);
            }
            if forward {
                forward_to_children(effects, op)?;
            }
        } else {
            if forward {
                forward_to_children(effects, op)?;
            }
            if deliver {
                deliveries.extend(deliver_locally(effects, op)?);
            }
        }
        if deliver {
            self.counters.delivered += 1;
        }
        Ok(deliveries)
    }

    // ========================================================================
    // XCAST_ACK receive
    // ========================================================================

    /// Handle an inbound ack or ack-request
    pub fn recv_ack<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        from: DaemonId,
        message: XcastAckMessage,
    ) -> CollectiveResult<()> {
        match message.kind {
            AckKind::Ack => self.recv_child_ack(effects, from, message),
            AckKind::Request => self.recv_ack_request(effects, from, message),
        }
        Ok(())
    }

    fn recv_child_ack<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        from: DaemonId,
        message: XcastAckMessage,
    ) {
        let signature = message.signature;
        let Some(slot) = effects
            .current_children()
            .iter()
            .position(|child| *child == Some(from))
        else {
            tracing::debug!(%signature, %from, "dropping ack from a daemon that is not our child");
            self.counters.stale_dropped += 1;
            return;
        };
        let Some(op) = self.active.get_mut(&signature.global_id) else {
            tracing::debug!(%signature, %from, "dropping ack for an op that is not active");
            self.counters.stale_dropped += 1;
            return;
        };
        if message.ack_id != op.ack_id_down {
            tracing::debug!(
                %signature,
                %from,
                got = %message.ack_id,
                want = %op.ack_id_down,
                "dropping stale ack"
            );
            self.counters.stale_dropped += 1;
            return;
        }
        if !op.acked.insert(slot) {
            tracing::error!(%signature, %from, "child acknowledged the same round twice");
            self.counters.protocol_violations += 1;
            return;
        }
        if op.reported() > op.expected {
            tracing::error!(
                %signature,
                reported = op.reported(),
                expected = op.expected,
                "more acks than expected children"
            );
            self.counters.protocol_violations += 1;
        }
        self.advance(effects);
    }

    fn recv_ack_request<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        from: DaemonId,
        message: XcastAckMessage,
    ) {
        let signature = message.signature;
        if effects.current_parent() != Some(from) {
            tracing::debug!(%signature, %from, "dropping ack request from a daemon that is not our parent");
            self.counters.stale_dropped += 1;
            return;
        }
        if let Some(op) = self.active.get_mut(&signature.global_id) {
            op.ack_id_up = message.ack_id;
            self.advance(effects);
        } else if signature.global_id <= self.op_id_completed {
            self.send_ack(effects, from, signature, message.ack_id, AckKind::Ack);
        } else {
            tracing::warn!(%signature, "ack requested for an op this daemon never saw");
        }
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Complete ready ops from the head of the active list
    fn advance<E: CollectiveEffects>(&mut self, effects: &E) {
        let is_root = effects.is_root();
        loop {
            let Some((&global_id, op)) = self.active.iter().next() else {
                break;
            };
            if !op.is_ready() {
                break;
            }
            if !is_root {
                if !op.ack_id_up.is_valid() {
                    // Waits for the new parent's ack request.
                    break;
                }
                match effects.current_parent() {
                    Some(parent) => {
                        self.send_ack(effects, parent, op.signature, op.ack_id_up, AckKind::Ack);
                    }
                    None => {
                        tracing::error!(signature = %op.signature, "no parent to acknowledge to");
                        break;
                    }
                }
            }

            if let Some(op) = self.active.remove(&global_id) {
                self.origins
                    .remove(&(op.signature.initiator, op.signature.local_id));
            }
            self.record_completion(global_id);
        }
    }

    fn record_completion(&mut self, global_id: u64) {
        if global_id <= self.op_id_completed {
            tracing::debug!(global_id, "re-completed an op replayed after promotion");
            return;
        }
        if global_id != self.op_id_completed + 1 {
            tracing::error!(
                global_id,
                completed = self.op_id_completed,
                "xcast completion order gap"
            );
            self.counters.ordering_faults += 1;
        }
        self.op_id_completed = global_id;
        self.counters.completed += 1;
    }

    fn send_ack<E: CollectiveEffects>(
        &self,
        effects: &E,
        dest: DaemonId,
        signature: XcastSignature,
        ack_id: AckId,
        kind: AckKind,
    ) {
        let message = WireMessage::XcastAck(XcastAckMessage {
            signature,
            ack_id,
            kind,
        });
        let sent = wire::encode(message)
            .and_then(|bytes| effects.send(dest, Tag::XCAST_ACK, bytes).map_err(Into::into));
        if let Err(err) = sent {
            tracing::warn!(%signature, %dest, error = %err, "failed to send xcast ack");
        }
    }

    // ========================================================================
    // Fault handling
    // ========================================================================

    /// Reconcile in-flight ops with a changed tree
    pub fn on_topology_change<E: CollectiveEffects>(&mut self, effects: &E, change: &TopologyChange) {
        if change.promoted {
            self.op_id_completed_at_promotion = self.op_id_completed;
            for op in self.active.values_mut() {
                op.replay_pending = true;
            }
            tracing::debug!(
                completed = self.op_id_completed,
                active = self.active.len(),
                "promoted; holding active ops for replay"
            );
        }

        if change.ancestors_changed {
            self.resend_pending(effects);
        }

        if change.parent_changed || change.promoted {
            for op in self.active.values_mut() {
                op.ack_id_up = AckId::INVALID;
            }
        }

        if change.children_changed || change.promoted {
            self.refresh_children(effects, change);
        }

        self.advance(effects);
    }

    fn resend_pending<E: CollectiveEffects>(&self, effects: &E) {
        let root = effects.root();
        for op in self.pending.values() {
            tracing::debug!(signature = %op.signature, "re-sending unconfirmed xcast to root");
            let sent = wire::encode(op.message(AckId::INVALID))
                .and_then(|bytes| effects.send(root, Tag::XCAST, bytes).map_err(Into::into));
            if let Err(err) = sent {
                tracing::warn!(signature = %op.signature, error = %err, "xcast resend failed");
            }
        }
    }

    fn refresh_children<E: CollectiveEffects>(&mut self, effects: &E, change: &TopologyChange) {
        let children = effects.current_children();
        let expected = children.iter().flatten().count();
        let global_ids: Vec<u64> = self.active.keys().copied().collect();

        for global_id in global_ids {
            let new_round = self
                .active
                .get(&global_id)
                .map(|op| !op.acked.is_empty() || change.promoted)
                .unwrap_or(false);
            let ack_id_down = if new_round {
                Some(self.fresh_ack_id())
            } else {
                None
            };
            let Some(op) = self.active.get_mut(&global_id) else {
                continue;
            };
            if let Some(ack_id) = ack_id_down {
                op.ack_id_down = ack_id;
                op.acked.clear();
            }
            op.expected = expected;
            if op.replay_pending {
                continue;
            }

            for (slot, child) in children.iter().enumerate() {
                let Some(child) = *child else { continue };
                let unchanged = change.previous_children.get(slot) == Some(&Some(child));
                let outcome = if !unchanged {
                    wire::encode(op.message(op.ack_id_down))
                        .and_then(|bytes| effects.send(child, Tag::XCAST, bytes).map_err(Into::into))
                } else if new_round {
                    let request = WireMessage::XcastAck(XcastAckMessage {
                        signature: op.signature,
                        ack_id: op.ack_id_down,
                        kind: AckKind::Request,
                    });
                    wire::encode(request).and_then(|bytes| {
                        effects.send(child, Tag::XCAST_ACK, bytes).map_err(Into::into)
                    })
                } else {
                    Ok(())
                };
                if let Err(err) = outcome {
                    tracing::warn!(signature = %op.signature, %child, error = %err, "failed to reach child after topology change");
                }
            }
        }
    }
}

fn forward_to_children<E: CollectiveEffects>(effects: &E, op: &mut XcastOp) -> CollectiveResult<()> {
    let children = effects.current_children();
    op.expected = children.iter().flatten().count();
    op.acked.clear();
    if op.expected == 0 {
        return Ok(());
    }
    let bytes = wire::encode(op.message(op.ack_id_down))?;
    for child in children.into_iter().flatten() {
        if let Err(err) = effects.send(child, Tag::XCAST, bytes.clone()) {
            tracing::warn!(signature = %op.signature, %child, error = %err, "failed to forward xcast");
        }
    }
    Ok(())
}

fn deliver_locally<E: CollectiveEffects>(
    effects: &E,
    op: &XcastOp,
) -> CollectiveResult<Option<Delivery>> {
    let payload = compression::unpack(op.tag, &op.payload)?;
    tracing::trace!(signature = %op.signature, tag = %op.tag, len = payload.len(), "xcast delivered");
    if op.tag == Tag::FENCE_RELEASE || op.tag == Tag::GROUP_RELEASE {
        return Ok(Some(Delivery {
            tag: op.tag,
            payload,
        }));
    }
    effects.deliver(op.tag, payload);
    Ok(None)
}
