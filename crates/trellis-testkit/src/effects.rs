//! Simulated effect handlers
//!
//! [`SimEffects`] implements every `trellis_core` effect trait for one
//! simulated daemon. Sends go onto the shared [`SimNetwork`]; deliveries,
//! forced exits and installed group data are recorded for assertions.

use crate::directory::StaticDirectory;
use crate::network::{Envelope, SimNetwork};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use trellis_core::{
    DaemonId, DeliveryEffects, DirectoryEffects, EndpointInfo, InfoEntry, JobId, LifecycleEffects,
    LookupError, ProcId, Result, Tag, TopologyEffects, TopologyView, TransportEffects,
    TrellisError,
};

/// Job name the simulated daemons run under
pub const DAEMON_JOB: &str = "trellis-daemons";

/// What one simulated daemon did that is visible outside the engine
#[derive(Debug, Clone, Default)]
pub struct NodeRecord {
    /// Payloads handed to local consumers, in delivery order
    pub deliveries: Vec<(Tag, Vec<u8>)>,
    /// Reasons given for forced exits
    pub exits: Vec<String>,
    /// Group data currently installed, by group id
    pub installed: BTreeMap<String, (Vec<InfoEntry>, Vec<EndpointInfo>)>,
}

/// Effect bundle of one simulated daemon
#[derive(Debug, Clone)]
pub struct SimEffects {
    view: Arc<Mutex<TopologyView>>,
    living: Arc<Mutex<Vec<DaemonId>>>,
    network: SimNetwork,
    directory: StaticDirectory,
    record: Arc<Mutex<NodeRecord>>,
}

impl SimEffects {
    /// Effects for the daemon described by `view`. `living` is shared by the
    /// whole cluster.
    pub fn new(
        view: TopologyView,
        living: Arc<Mutex<Vec<DaemonId>>>,
        network: SimNetwork,
        directory: StaticDirectory,
    ) -> Self {
        Self {
            view: Arc::new(Mutex::new(view)),
            living,
            network,
            directory,
            record: Arc::new(Mutex::new(NodeRecord::default())),
        }
    }

    /// Effects for a lone daemon that is its own root
    pub fn standalone() -> Self {
        let view = TopologyView {
            daemon: DaemonId(0),
            parent: None,
            children: Vec::new(),
            ancestors: Vec::new(),
            positions: vec![0],
            descendant_slots: BTreeMap::new(),
        };
        Self::new(
            view,
            Arc::new(Mutex::new(vec![DaemonId(0)])),
            SimNetwork::new(),
            StaticDirectory::new(),
        )
    }

    /// Replace the tree view, returning the previous one
    pub fn set_view(&self, view: TopologyView) -> TopologyView {
        std::mem::replace(&mut *self.view.lock(), view)
    }

    pub fn view(&self) -> TopologyView {
        self.view.lock().clone()
    }

    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    pub fn directory(&self) -> &StaticDirectory {
        &self.directory
    }

    /// Snapshot of everything recorded so far
    pub fn record(&self) -> NodeRecord {
        self.record.lock().clone()
    }
}

impl TransportEffects for SimEffects {
    fn send(&self, dest: DaemonId, tag: Tag, payload: Vec<u8>) -> Result<()> {
        let from = self.local_daemon();
        if !self.living.lock().contains(&dest) {
            return Err(TrellisError::transport(format!("{dest} is unreachable")));
        }
        self.network.push(Envelope {
            from,
            to: dest,
            tag,
            payload,
        });
        Ok(())
    }
}

impl TopologyEffects for SimEffects {
    fn local_daemon(&self) -> DaemonId {
        self.view.lock().daemon
    }

    fn root(&self) -> DaemonId {
        DaemonId(0)
    }

    fn current_parent(&self) -> Option<DaemonId> {
        self.view.lock().parent
    }

    fn current_children(&self) -> Vec<Option<DaemonId>> {
        self.view.lock().children.clone()
    }

    fn child_slot_for(&self, daemon: DaemonId) -> Option<usize> {
        self.view.lock().child_slot_for(daemon)
    }

    fn daemons(&self) -> Vec<DaemonId> {
        self.living.lock().clone()
    }
}

impl DirectoryEffects for SimEffects {
    fn daemon_job(&self) -> JobId {
        JobId::new(DAEMON_JOB)
    }

    fn daemons_hosting(&self, proc: &ProcId) -> std::result::Result<Vec<DaemonId>, LookupError> {
        self.directory.lookup(proc)
    }

    fn install_group_info(&self, group_id: &str, info: &[InfoEntry], endpoints: &[EndpointInfo]) {
        self.record
            .lock()
            .installed
            .insert(group_id.to_string(), (info.to_vec(), endpoints.to_vec()));
    }

    fn remove_group_info(&self, group_id: &str) {
        self.record.lock().installed.remove(group_id);
    }
}

impl DeliveryEffects for SimEffects {
    fn deliver(&self, tag: Tag, payload: Vec<u8>) {
        self.record.lock().deliveries.push((tag, payload));
    }
}

impl LifecycleEffects for SimEffects {
    fn force_exit(&self, reason: &str) {
        tracing::warn!(daemon = %self.local_daemon(), %reason, "simulated daemon forced to exit");
        self.record.lock().exits.push(reason.to_string());
    }
}
