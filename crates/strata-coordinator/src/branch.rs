//! Write branches and the branch-history store.
//!
//! Every primary publishes writes on a branch. When leadership moves, the
//! new primary creates a child branch rooted at the latest timestamp it
//! holds on the parent, so the history of any key subrange is a path through
//! a DAG of branches. The coordinator records new branches as primaries
//! propose them and garbage-collects branches no live contract can reach.
//!
//! The store is an owned graph keyed by [`BranchId`]; nodes refer to their
//! parents by id, never by reference.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_types::{BranchId, Region, RegionMap, Timestamp};

/// A position in the write history of some subrange: a branch and a
/// timestamp on it.
///
/// `branch: None` is the pre-history root, the state of a region before any
/// write. Versions order first by branch id and then by timestamp, which
/// gives a deterministic (if arbitrary across divergent branches) total
/// order used for tie-breaking during elections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    /// The branch holding the writes, or `None` for the pre-history root.
    pub branch: Option<BranchId>,
    /// The latest timestamp on that branch.
    pub timestamp: Timestamp,
}

impl Version {
    /// The version of a region before any write.
    pub const ZERO: Version = Version {
        branch: None,
        timestamp: Timestamp::ZERO,
    };

    /// Creates a version on a branch.
    pub fn new(branch: BranchId, timestamp: Timestamp) -> Self {
        Self {
            branch: Some(branch),
            timestamp,
        }
    }
}

/// The birth record of a branch: the region it spans and, for each subrange,
/// the version it was rooted at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchNode {
    /// The region the branch covers.
    pub region: Region,
    /// Per-subrange parent versions. Entries cover `region` exactly.
    pub origin: RegionMap<Version>,
}

/// The branch-history store: a DAG of [`BranchNode`]s keyed by id.
///
/// Also used for the fragments that travel inside acks; a fragment is just a
/// small history containing the nodes needed to interpret the ack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchHistory {
    branches: BTreeMap<BranchId, BranchNode>,
}

impl BranchHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a branch node.
    ///
    /// # Panics
    ///
    /// Panics if the store already holds a different node under `id`, if the
    /// node names itself as a parent, or if a parent already present does
    /// not have strictly smaller origin timestamps over the overlapping
    /// region. Parents not yet present are not checked; fragments may arrive
    /// child-first.
    pub fn insert(&mut self, id: BranchId, node: BranchNode) {
        if let Some(existing) = self.branches.get(&id) {
            assert!(
                *existing == node,
                "conflicting nodes recorded for branch {id}"
            );
            return;
        }
        for (region, version) in node.origin.iter() {
            let Some(parent) = version.branch else {
                continue;
            };
            assert!(parent != id, "branch {id} cannot be its own parent");
            if let Some(parent_node) = self.branches.get(&parent) {
                for (_, parent_version) in parent_node.origin.mask(region).iter() {
                    assert!(
                        parent_version.timestamp < version.timestamp,
                        "branch {id} roots at {} but its parent {parent} roots at {}",
                        version.timestamp,
                        parent_version.timestamp,
                    );
                }
            }
        }
        self.branches.insert(id, node);
    }

    /// Looks up a branch node.
    pub fn get(&self, id: &BranchId) -> Option<&BranchNode> {
        self.branches.get(id)
    }

    /// Returns true if the branch is recorded.
    pub fn contains(&self, id: &BranchId) -> bool {
        self.branches.contains_key(id)
    }

    /// Removes a branch node.
    pub fn remove(&mut self, id: &BranchId) -> Option<BranchNode> {
        self.branches.remove(id)
    }

    /// Merges another history into this one.
    ///
    /// Shared ids must carry identical nodes; fragments from different
    /// replicas describe the same immutable birth records.
    pub fn merge_from(&mut self, other: &BranchHistory) {
        for (id, node) in &other.branches {
            self.insert(*id, node.clone());
        }
    }

    /// Iterates over the recorded branches.
    pub fn iter(&self) -> impl Iterator<Item = (&BranchId, &BranchNode)> {
        self.branches.iter()
    }

    /// Iterates over the recorded branch ids.
    pub fn branch_ids(&self) -> impl Iterator<Item = &BranchId> {
        self.branches.keys()
    }

    /// Number of recorded branches.
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    /// Returns true if no branches are recorded.
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}
