//! Simulated Daemon Cluster
//!
//! A radix tree of daemons sharing one [`SimNetwork`]. Nothing happens until
//! the test steps the network, so interleavings are fully under test
//! control: [`SimCluster::step`] delivers the oldest message,
//! [`SimCluster::step_where`] picks a specific one and
//! [`SimCluster::run_until_idle`] drains everything.

use crate::directory::StaticDirectory;
use crate::effects::{NodeRecord, SimEffects};
use crate::network::{Envelope, SimNetwork};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot::{self, error::TryRecvError};
use trellis_collective::{
    CollectiveConfig, CollectiveEngine, CollectiveError, CollectiveResult, FenceOptions,
    FenceSignature, GroupOutcome, GroupRequest,
};
use trellis_core::{DaemonId, JobId, RadixTree, Tag, TopologyChange};

/// Upper bound on deliveries in one `run_until_idle`
const MAX_STEPS: usize = 100_000;

/// One simulated daemon
#[derive(Debug)]
pub struct SimNode {
    pub engine: CollectiveEngine,
    pub effects: SimEffects,
}

/// Result of a fence or group call, available once released
#[derive(Debug)]
pub struct Outcome<T> {
    receiver: oneshot::Receiver<CollectiveResult<T>>,
}

impl<T> Outcome<T> {
    /// The released result, or `None` while the collective is in progress
    pub fn try_take(&mut self) -> Option<CollectiveResult<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(CollectiveError::ChannelClosed)),
        }
    }

    /// The released result; panics if the collective has not been released
    pub fn take(mut self) -> CollectiveResult<T> {
        self.try_take().expect("collective has not been released")
    }
}

/// Deterministic cluster of daemons over a radix tree rooted at daemon 0
#[derive(Debug)]
pub struct SimCluster {
    tree: RadixTree,
    network: SimNetwork,
    directory: StaticDirectory,
    living: Arc<Mutex<Vec<DaemonId>>>,
    nodes: BTreeMap<DaemonId, SimNode>,
}

impl SimCluster {
    /// Cluster of `size` daemons with fan-out `radix` and default configuration
    pub fn new(size: usize, radix: usize) -> Self {
        Self::with_config(size, radix, CollectiveConfig::default())
            .expect("valid simulated cluster")
    }

    /// Cluster whose engines all use `config`
    pub fn with_config(size: usize, radix: usize, config: CollectiveConfig) -> CollectiveResult<Self> {
        let tree = RadixTree::new(radix, size)?;
        let network = SimNetwork::new();
        let directory = StaticDirectory::new();
        let living = Arc::new(Mutex::new(tree.living()));

        let mut nodes = BTreeMap::new();
        for (daemon, view) in tree.views() {
            let effects = SimEffects::new(view, living.clone(), network.clone(), directory.clone());
            let engine = CollectiveEngine::new(config.clone())?;
            nodes.insert(daemon, SimNode { engine, effects });
        }
        tracing::debug!(size, radix, "simulated cluster ready");

        Ok(Self {
            tree,
            network,
            directory,
            living,
            nodes,
        })
    }

    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    pub fn directory(&self) -> &StaticDirectory {
        &self.directory
    }

    /// Register an application job with rank `i` on `placement[i]`
    pub fn add_job(&self, job: impl Into<JobId>, placement: &[DaemonId]) {
        self.directory.add_job(job, placement);
    }

    /// Living daemons
    pub fn daemons(&self) -> Vec<DaemonId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node(&self, daemon: DaemonId) -> &SimNode {
        self.nodes
            .get(&daemon)
            .unwrap_or_else(|| panic!("{daemon} is not alive"))
    }

    fn node_mut(&mut self, daemon: DaemonId) -> &mut SimNode {
        self.nodes
            .get_mut(&daemon)
            .unwrap_or_else(|| panic!("{daemon} is not alive"))
    }

    pub fn engine(&self, daemon: DaemonId) -> &CollectiveEngine {
        &self.node(daemon).engine
    }

    pub fn effects(&self, daemon: DaemonId) -> &SimEffects {
        &self.node(daemon).effects
    }

    // ========================================================================
    // Local calls
    // ========================================================================

    /// Start a broadcast on `daemon`
    pub fn xcast(&mut self, daemon: DaemonId, tag: Tag, payload: Vec<u8>) -> CollectiveResult<()> {
        let node = self.node_mut(daemon);
        node.engine.xcast(&node.effects, tag, payload)
    }

    /// Join a fence on `daemon`
    pub fn fence(
        &mut self,
        daemon: DaemonId,
        signature: FenceSignature,
        options: FenceOptions,
        data: Vec<u8>,
    ) -> CollectiveResult<Outcome<Vec<u8>>> {
        let (completion, receiver) = oneshot::channel();
        let node = self.node_mut(daemon);
        node.engine
            .fence(&node.effects, signature, options, data, completion)?;
        Ok(Outcome { receiver })
    }

    /// Submit a group request on `daemon`
    pub fn group(&mut self, daemon: DaemonId, request: GroupRequest) -> CollectiveResult<Outcome<GroupOutcome>> {
        let (completion, receiver) = oneshot::channel();
        let node = self.node_mut(daemon);
        node.engine.group(&node.effects, request, completion)?;
        Ok(Outcome { receiver })
    }

    // ========================================================================
    // Network stepping
    // ========================================================================

    /// Hand an envelope to its destination's receive handler
    pub fn deliver(&mut self, envelope: Envelope) {
        let Some(node) = self.nodes.get_mut(&envelope.to) else {
            return;
        };
        tracing::trace!(from = %envelope.from, to = %envelope.to, tag = %envelope.tag, "sim deliver");
        node.engine
            .handle_message(&node.effects, envelope.from, envelope.tag, &envelope.payload);
    }

    /// Deliver the oldest message in flight; false if there was none
    pub fn step(&mut self) -> bool {
        match self.network.pop() {
            Some(envelope) => {
                self.deliver(envelope);
                true
            }
            None => false,
        }
    }

    /// Deliver the oldest message matching `filter`
    pub fn step_where<F>(&mut self, filter: F) -> bool
    where
        F: Fn(&Envelope) -> bool,
    {
        match self.network.take_where(filter) {
            Some(envelope) => {
                self.deliver(envelope);
                true
            }
            None => false,
        }
    }

    /// Keep delivering matching messages until none is left
    pub fn run_while<F>(&mut self, filter: F) -> usize
    where
        F: Fn(&Envelope) -> bool,
    {
        let mut steps = 0;
        while self.step_where(&filter) {
            steps += 1;
            assert!(steps < MAX_STEPS, "simulation did not quiesce");
        }
        steps
    }

    /// Deliver until the network is empty; returns the number of deliveries
    pub fn run_until_idle(&mut self) -> usize {
        self.run_while(|_| true)
    }

    // ========================================================================
    // Faults
    // ========================================================================

    /// Fail `daemon`: drop its traffic, recompute the tree and reconcile
    /// every survivor whose view changed
    pub fn kill(&mut self, daemon: DaemonId) -> CollectiveResult<()> {
        self.tree.fail(daemon)?;
        self.network.fail(daemon);
        self.nodes.remove(&daemon);
        *self.living.lock() = self.tree.living();
        tracing::debug!(%daemon, "simulated daemon failed");

        let views = self.tree.views();
        let mut changes: Vec<(DaemonId, TopologyChange)> = Vec::new();
        for (id, node) in &self.nodes {
            if let Some(view) = views.get(id) {
                let previous = node.effects.set_view(view.clone());
                changes.push((*id, view.diff(&previous)));
            }
        }
        for (id, change) in changes {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.engine.on_topology_change(&node.effects, &change);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Observations
    // ========================================================================

    pub fn record(&self, daemon: DaemonId) -> NodeRecord {
        self.effects(daemon).record()
    }

    /// Payloads delivered on `daemon` for `tag`, in order
    pub fn deliveries(&self, daemon: DaemonId, tag: Tag) -> Vec<Vec<u8>> {
        self.record(daemon)
            .deliveries
            .into_iter()
            .filter(|(delivered, _)| *delivered == tag)
            .map(|(_, payload)| payload)
            .collect()
    }

    /// Forced exit reasons recorded on `daemon`
    pub fn exits(&self, daemon: DaemonId) -> Vec<String> {
        self.record(daemon).exits
    }
}
