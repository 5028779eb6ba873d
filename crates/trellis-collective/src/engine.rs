//! Per-daemon collective engine
//!
//! [`CollectiveEngine`] owns the xcast, fence and group state of one daemon.
//! It is the single context value every entry point runs against: local
//! calls, inbound messages by tag, and topology reconciliation. The engine
//! never blocks and never re-enters itself; sends (including sends to self)
//! are queued by the transport and come back through
//! [`CollectiveEngine::handle_message`].

use crate::compression::Compressor;
use crate::config::CollectiveConfig;
use crate::errors::{CollectiveError, CollectiveResult};
use crate::fence::{FenceCounters, FenceEngine, FenceOptions};
use crate::group::{GroupCounters, GroupEngine, GroupOutcome, GroupRecord, GroupRequest};
use crate::signature::FenceSignature;
use crate::tracker::Completion;
use crate::wire::{self, WireMessage};
use crate::xcast::{Delivery, XcastCounters, XcastEngine, XcastProgress};
use serde::{Deserialize, Serialize};
use trellis_core::{CollectiveEffects, DaemonId, Tag, TopologyChange, TrellisConfig};

/// Diagnostic counters of one daemon
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectiveStats {
    /// Broadcast engine
    pub xcast: XcastCounters,
    /// Fence engine
    pub fence: FenceCounters,
    /// Group engine
    pub group: GroupCounters,
    /// Inbound messages that failed non-fatally
    pub rejected_messages: u64,
    /// Fatal failures that forced the daemon to exit
    pub fatal_errors: u64,
}

/// Collective state of one daemon
#[derive(Debug)]
pub struct CollectiveEngine {
    xcast: XcastEngine,
    fence: FenceEngine,
    group: GroupEngine,
    rejected_messages: u64,
    fatal_errors: u64,
}

impl CollectiveEngine {
    /// Engine configured by `config`
    pub fn new(config: CollectiveConfig) -> CollectiveResult<Self> {
        config.validate()?;
        Ok(Self {
            xcast: XcastEngine::new(Compressor::new(config.compression)),
            fence: FenceEngine::new(),
            group: GroupEngine::new(config.initial_context_id),
            rejected_messages: 0,
            fatal_errors: 0,
        })
    }

    /// Broadcast `payload` to the `tag` consumer of every daemon
    pub fn xcast<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        tag: Tag,
        payload: Vec<u8>,
    ) -> CollectiveResult<()> {
        self.xcast.broadcast(effects, tag, payload)
    }

    /// Join the fence named by `signature`; the released bucket resolves
    /// `completion`
    pub fn fence<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        signature: FenceSignature,
        options: FenceOptions,
        data: Vec<u8>,
        completion: Completion<Vec<u8>>,
    ) -> CollectiveResult<()> {
        self.fence.fence(effects, signature, options, data, completion)
    }

    /// Take part in a group construct or destruct
    pub fn group<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        request: GroupRequest,
        completion: Completion<GroupOutcome>,
    ) -> CollectiveResult<()> {
        self.group.group(effects, request, completion)
    }

    /// Receive handler for every collective tag. Failures are logged; fatal
    /// ones terminate the daemon through `LifecycleEffects`.
    pub fn handle_message<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        from: DaemonId,
        tag: Tag,
        bytes: &[u8],
    ) {
        if let Err(err) = self.dispatch(effects, from, tag, bytes) {
            if err.is_fatal() {
                tracing::error!(%tag, %from, error = %err, "unrecoverable collective failure");
                self.fatal_errors += 1;
                effects.force_exit(&err.to_string());
            } else {
                tracing::warn!(%tag, %from, error = %err, "collective message rejected");
                self.rejected_messages += 1;
            }
        }
    }

    fn dispatch<E: CollectiveEffects>(
        &mut self,
        effects: &E,
        from: DaemonId,
        tag: Tag,
        bytes: &[u8],
    ) -> CollectiveResult<()> {
        match wire::decode(tag, bytes)? {
            WireMessage::Xcast(message) => {
                for delivery in self.xcast.recv(effects, from, message)? {
                    self.consume(effects, delivery)?;
                }
                Ok(())
            }
            WireMessage::XcastAck(message) => self.xcast.recv_ack(effects, from, message),
            WireMessage::Fence(message) => self.fence.recv(effects, &mut self.xcast, from, message),
            WireMessage::Group(message) => self.group.recv(effects, &mut self.xcast, from, message),
            WireMessage::FenceRelease(_) | WireMessage::GroupRelease(_) => {
                Err(CollectiveError::routing(format!(
                    "{tag} from {from} arrived outside a broadcast"
                )))
            }
        }
    }

    /// Route a release delivered by xcast to its engine
    fn consume<E: CollectiveEffects>(&mut self, effects: &E, delivery: Delivery) -> CollectiveResult<()> {
        match wire::decode(delivery.tag, &delivery.payload)? {
            WireMessage::FenceRelease(message) => self.fence.release(message),
            WireMessage::GroupRelease(message) => self.group.release(effects, message),
            other => {
                return Err(CollectiveError::malformed(
                    delivery.tag,
                    format!("xcast carried a {} message", other.tag()),
                ))
            }
        }
        Ok(())
    }

    /// Reconcile every engine with a changed tree
    pub fn on_topology_change<E: CollectiveEffects>(&mut self, effects: &E, change: &TopologyChange) {
        if change.is_empty() {
            return;
        }
        tracing::debug!(
            daemon = %effects.local_daemon(),
            parent_changed = change.parent_changed,
            children_changed = change.children_changed,
            ancestors_changed = change.ancestors_changed,
            promoted = change.promoted,
            "topology changed"
        );
        self.xcast.on_topology_change(effects, change);
        self.fence.on_topology_change(effects, &mut self.xcast, change);
        self.group.on_topology_change(effects, &mut self.xcast, change);
    }

    /// Constructed group known under `group_id`
    pub fn lookup_group(&self, group_id: &str) -> Option<&GroupRecord> {
        self.group.lookup(group_id)
    }

    pub fn xcast_progress(&self) -> XcastProgress {
        self.xcast.progress()
    }

    pub fn fence_engine(&self) -> &FenceEngine {
        &self.fence
    }

    pub fn group_engine(&self) -> &GroupEngine {
        &self.group
    }

    pub fn stats(&self) -> CollectiveStats {
        CollectiveStats {
            xcast: self.xcast.counters(),
            fence: self.fence.counters(),
            group: self.group.counters(),
            rejected_messages: self.rejected_messages,
            fatal_errors: self.fatal_errors,
        }
    }
}
