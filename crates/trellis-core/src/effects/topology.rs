//! Spanning-tree topology effects

use crate::DaemonId;
use serde::{Deserialize, Serialize};

/// The local daemon's view of the current spanning tree
pub trait TopologyEffects {
    /// This daemon
    fn local_daemon(&self) -> DaemonId;

    /// Root of the tree
    fn root(&self) -> DaemonId;

    /// Whether this daemon is the root
    fn is_root(&self) -> bool {
        self.local_daemon() == self.root()
    }

    /// Current parent, `None` on the root
    fn current_parent(&self) -> Option<DaemonId>;

    /// Ordered child slots; `None` marks a removed slot
    fn current_children(&self) -> Vec<Option<DaemonId>>;

    /// Index of the child slot whose subtree contains `daemon`, if any
    fn child_slot_for(&self, daemon: DaemonId) -> Option<usize>;

    /// Every living daemon
    fn daemons(&self) -> Vec<DaemonId>;
}

/// Notification that the local view of the tree changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyChange {
    /// The parent is a different daemon than before
    pub parent_changed: bool,
    /// Any child slot changed occupant or was removed or added
    pub children_changed: bool,
    /// The chain of ancestors up to the root changed
    pub ancestors_changed: bool,
    /// This daemon took over the position of a failed ancestor
    pub promoted: bool,
    /// Child slots before the change
    pub previous_children: Vec<Option<DaemonId>>,
}

impl TopologyChange {
    /// Whether anything at all changed
    pub fn is_empty(&self) -> bool {
        !(self.parent_changed || self.children_changed || self.ancestors_changed || self.promoted)
    }
}
