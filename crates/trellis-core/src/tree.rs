//! Radix spanning tree with failure promotion
//!
//! Daemons are laid out as a k-ary heap rooted at daemon 0: the parent of
//! `r` is `(r - 1) / k` and its children are `r*k + 1 ..= r*k + k`. When a
//! daemon fails, the first living daemon of its subtree (depth-first,
//! left-to-right) is promoted into its position and adopts the failed
//! daemon's remaining child subtrees after its own. A failed daemon with no
//! living descendants leaves an empty child slot behind.
//!
//! ```text
//!        0                    0
//!      /   \                /   \
//!     1     2     fail 1   3     2
//!    / \   / \    ----->   |    / \
//!   3   4 5   6            4   5   6
//! ```

use crate::{DaemonId, Result, TopologyChange, TrellisError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One daemon's position in the current tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyView {
    /// The daemon this view belongs to
    pub daemon: DaemonId,
    /// Effective parent, `None` for the root
    pub parent: Option<DaemonId>,
    /// Ordered child slots; `None` for a slot whose subtree died out
    pub children: Vec<Option<DaemonId>>,
    /// Ancestors from the parent up to the root
    pub ancestors: Vec<DaemonId>,
    /// Heap positions this daemon currently occupies (its own first)
    pub positions: Vec<usize>,
    /// Every descendant mapped to the child slot whose subtree holds it
    pub descendant_slots: BTreeMap<DaemonId, usize>,
}

impl TopologyView {
    /// Child slot whose subtree contains `daemon`
    pub fn child_slot_for(&self, daemon: DaemonId) -> Option<usize> {
        self.descendant_slots.get(&daemon).copied()
    }

    /// Change flags describing the move from `previous` to `self`
    pub fn diff(&self, previous: &TopologyView) -> TopologyChange {
        TopologyChange {
            parent_changed: self.parent != previous.parent,
            children_changed: self.children != previous.children,
            ancestors_changed: self.ancestors != previous.ancestors,
            promoted: self.positions.len() > previous.positions.len(),
            previous_children: previous.children.clone(),
        }
    }
}

/// k-ary spanning tree over a fixed daemon population
#[derive(Debug, Clone)]
pub struct RadixTree {
    radix: usize,
    size: usize,
    failed: BTreeSet<DaemonId>,
}

struct Subtree {
    daemon: DaemonId,
    positions: Vec<usize>,
    slots: Vec<Option<Subtree>>,
}

impl Subtree {
    fn members(&self, out: &mut Vec<DaemonId>) {
        out.push(self.daemon);
        for child in self.slots.iter().flatten() {
            child.members(out);
        }
    }
}

impl RadixTree {
    /// Tree over daemons `0..size` with fan-out `radix`
    pub fn new(radix: usize, size: usize) -> Result<Self> {
        if radix == 0 {
            return Err(TrellisError::invalid("radix must be at least 1"));
        }
        if size == 0 {
            return Err(TrellisError::invalid("tree needs at least one daemon"));
        }
        Ok(Self {
            radix,
            size,
            failed: BTreeSet::new(),
        })
    }

    /// Fan-out of the tree
    pub fn radix(&self) -> usize {
        self.radix
    }

    /// Root daemon
    pub fn root(&self) -> DaemonId {
        DaemonId(0)
    }

    /// Mark a daemon as failed
    pub fn fail(&mut self, daemon: DaemonId) -> Result<()> {
        if daemon == self.root() {
            return Err(TrellisError::topology("the root daemon cannot fail"));
        }
        if daemon.index() >= self.size {
            return Err(TrellisError::invalid(format!("{daemon} is not in the tree")));
        }
        if self.failed.insert(daemon) {
            tracing::info!(%daemon, living = self.size - self.failed.len(), "daemon marked failed");
        }
        Ok(())
    }

    /// Whether a daemon is part of the tree and has not failed
    pub fn is_alive(&self, daemon: DaemonId) -> bool {
        daemon.index() < self.size && !self.failed.contains(&daemon)
    }

    /// Living daemons in rank order
    pub fn living(&self) -> Vec<DaemonId> {
        (0..self.size)
            .map(|rank| DaemonId(rank as u32))
            .filter(|daemon| !self.failed.contains(daemon))
            .collect()
    }

    /// Views of every living daemon
    pub fn views(&self) -> BTreeMap<DaemonId, TopologyView> {
        let mut views = BTreeMap::new();
        if let Some(root) = self.build(0) {
            Self::collect_views(&root, None, &[], &mut views);
        }
        views
    }

    /// View of a single daemon, `None` if it has failed
    pub fn view(&self, daemon: DaemonId) -> Option<TopologyView> {
        self.views().remove(&daemon)
    }

    fn heap_children(&self, position: usize) -> impl Iterator<Item = usize> {
        let first = position * self.radix + 1;
        let end = (first + self.radix).min(self.size);
        first.min(end)..end
    }

    fn build(&self, position: usize) -> Option<Subtree> {
        if position >= self.size {
            return None;
        }
        let subtrees: Vec<Option<Subtree>> = self
            .heap_children(position)
            .map(|child| self.build(child))
            .collect();
        let daemon = DaemonId(position as u32);

        let mut node = if self.failed.contains(&daemon) {
            let mut living = subtrees.into_iter().flatten();
            let mut heir = living.next()?;
            heir.positions.push(position);
            heir.slots.extend(living.map(Some));
            heir
        } else {
            Subtree {
                daemon,
                positions: vec![position],
                slots: subtrees,
            }
        };
        while matches!(node.slots.last(), Some(None)) {
            node.slots.pop();
        }
        Some(node)
    }

    fn collect_views(
        node: &Subtree,
        parent: Option<DaemonId>,
        ancestors: &[DaemonId],
        views: &mut BTreeMap<DaemonId, TopologyView>,
    ) {
        let mut descendant_slots = BTreeMap::new();
        for (slot, child) in node.slots.iter().enumerate() {
            if let Some(child) = child {
                let mut members = Vec::new();
                child.members(&mut members);
                for member in members {
                    descendant_slots.insert(member, slot);
                }
            }
        }

        views.insert(
            node.daemon,
            TopologyView {
                daemon: node.daemon,
                parent,
                children: node
                    .slots
                    .iter()
                    .map(|slot| slot.as_ref().map(|child| child.daemon))
                    .collect(),
                ancestors: ancestors.to_vec(),
                positions: node.positions.clone(),
                descendant_slots,
            },
        );

        let mut chain = Vec::with_capacity(ancestors.len() + 1);
        chain.push(node.daemon);
        chain.extend_from_slice(ancestors);
        for child in node.slots.iter().flatten() {
            Self::collect_views(child, Some(node.daemon), &chain, views);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(rank: u32) -> DaemonId {
        DaemonId(rank)
    }

    #[test]
    fn binary_heap_layout() {
        let tree = RadixTree::new(2, 4).unwrap();
        let views = tree.views();
        assert_eq!(views[&d(0)].children, vec![Some(d(1)), Some(d(2))]);
        assert_eq!(views[&d(1)].children, vec![Some(d(3))]);
        assert_eq!(views[&d(3)].ancestors, vec![d(1), d(0)]);
        assert_eq!(views[&d(0)].child_slot_for(d(3)), Some(0));
        assert_eq!(views[&d(0)].child_slot_for(d(2)), Some(1));
        assert_eq!(views[&d(0)].child_slot_for(d(0)), None);
    }

    #[test]
    fn failed_interior_daemon_promotes_first_descendant() {
        let mut tree = RadixTree::new(2, 7).unwrap();
        let before = tree.views();
        tree.fail(d(1)).unwrap();
        let after = tree.views();

        assert!(!after.contains_key(&d(1)));
        assert_eq!(after[&d(0)].children, vec![Some(d(3)), Some(d(2))]);
        assert_eq!(after[&d(3)].children, vec![Some(d(4))]);
        assert_eq!(after[&d(4)].parent, Some(d(3)));

        let heir = after[&d(3)].diff(&before[&d(3)]);
        assert!(heir.promoted && heir.parent_changed && heir.children_changed);

        let adopted = after[&d(4)].diff(&before[&d(4)]);
        assert!(adopted.parent_changed && adopted.ancestors_changed && !adopted.promoted);

        let root = after[&d(0)].diff(&before[&d(0)]);
        assert!(root.children_changed && !root.parent_changed);
        assert_eq!(root.previous_children, vec![Some(d(1)), Some(d(2))]);

        let untouched = after[&d(5)].diff(&before[&d(5)]);
        assert!(untouched.is_empty());
    }

    #[test]
    fn failed_leaf_leaves_empty_slot() {
        let mut tree = RadixTree::new(3, 4).unwrap();
        tree.fail(d(2)).unwrap();
        assert_eq!(
            tree.views()[&d(0)].children,
            vec![Some(d(1)), None, Some(d(3))]
        );

        tree.fail(d(3)).unwrap();
        assert_eq!(tree.views()[&d(0)].children, vec![Some(d(1))]);
    }

    #[test]
    fn root_cannot_fail() {
        let mut tree = RadixTree::new(2, 3).unwrap();
        assert!(tree.fail(d(0)).is_err());
        assert!(tree.fail(d(9)).is_err());
        assert_eq!(tree.living().len(), 3);
    }

    proptest::proptest! {
        #[test]
        fn every_survivor_hangs_off_its_parent(
            radix in 1usize..5,
            size in 1usize..40,
            failures in proptest::collection::vec(1u32..40, 0..12),
        ) {
            let mut tree = RadixTree::new(radix, size).unwrap();
            for rank in failures.into_iter().filter(|rank| (*rank as usize) < size) {
                tree.fail(d(rank)).unwrap();
            }
            let views = tree.views();
            proptest::prop_assert_eq!(views.keys().copied().collect::<Vec<_>>(), tree.living());
            for view in views.values() {
                match view.parent {
                    None => proptest::prop_assert_eq!(view.daemon, tree.root()),
                    Some(parent) => proptest::prop_assert!(
                        views[&parent].children.contains(&Some(view.daemon))
                    ),
                }
            }
        }
    }
}
