//! Replicated table state and coordinator diffs.
//!
//! [`TableRaftState`] is the slice of the table's Raft state machine the
//! coordinator reads and rewrites: the config, the live contracts, and the
//! branch history. The coordinator never mutates it directly; it produces a
//! [`ContractDiff`] and a [`BranchDiff`] that the Raft layer applies
//! atomically as one log entry, and that [`TableRaftState::apply`]
//! reproduces on every replica's state machine.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strata_types::{BranchId, CPU_SHARDING_FACTOR, ContractId, KeyRange, Region, cpu_subspace};

use crate::branch::BranchHistory;
use crate::config::TableConfig;
use crate::contract::Contract;

/// The contract half of a coordinator diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDiff {
    /// Contracts to drop.
    pub remove: BTreeSet<ContractId>,
    /// Contracts to install.
    pub add: BTreeMap<ContractId, (Region, Contract)>,
}

impl ContractDiff {
    /// Returns true if the diff changes nothing.
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

/// The branch-history half of a coordinator diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchDiff {
    /// Branches no live contract can reach; safe to drop.
    pub remove: BTreeSet<BranchId>,
    /// Newly recorded branches, with their nodes.
    pub add: BranchHistory,
}

impl BranchDiff {
    /// Returns true if the diff changes nothing.
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

/// A violated invariant of the replicated table state.
///
/// These indicate a bug somewhere in the control plane, not a recoverable
/// domain situation; the process should stop rather than keep coordinating
/// over inconsistent state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// A config shard does not name its primary among its replicas.
    #[error("config shard {shard} does not include its primary among its replicas")]
    BadShard {
        /// Index of the offending shard.
        shard: usize,
    },

    /// Contract regions do not exactly tile a CPU subspace.
    #[error("contract regions do not exactly tile cpu subspace {subspace}")]
    RegionCover {
        /// Index of the subspace with a gap or overlap.
        subspace: usize,
    },

    /// A contract's role sets are inconsistent.
    #[error("contract {id} violates role containment")]
    BadContract {
        /// The offending contract.
        id: ContractId,
    },

    /// A contract references a branch the history does not hold.
    #[error("contract {id} references branch {branch}, which is not recorded")]
    MissingBranch {
        /// The offending contract.
        id: ContractId,
        /// The unrecorded branch.
        branch: BranchId,
    },

    /// A recorded branch references an ancestor the history does not hold.
    #[error("branch {branch} references ancestor {ancestor}, which is not recorded")]
    MissingAncestor {
        /// The branch whose origin is dangling.
        branch: BranchId,
        /// The unrecorded ancestor.
        ancestor: BranchId,
    },
}

/// The table-level Raft state the coordinator consumes and rewrites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRaftState {
    /// The demanded layout.
    pub config: TableConfig,
    /// Live contracts, keyed by id.
    pub contracts: BTreeMap<ContractId, (Region, Contract)>,
    /// Recorded write branches.
    pub branch_history: BranchHistory,
}

impl TableRaftState {
    /// Creates a state with no contracts and no branches.
    pub fn new(config: TableConfig) -> Self {
        Self {
            config,
            contracts: BTreeMap::new(),
            branch_history: BranchHistory::new(),
        }
    }

    /// Applies a coordinator diff, the way the Raft apply path does.
    pub fn apply(&mut self, contracts: &ContractDiff, branches: &BranchDiff) {
        for id in &contracts.remove {
            self.contracts.remove(id);
        }
        for (id, pair) in &contracts.add {
            self.contracts.insert(*id, pair.clone());
        }
        for id in &branches.remove {
            self.branch_history.remove(id);
        }
        self.branch_history.merge_from(&branches.add);
    }

    /// Checks the state's invariants: well-formed config, contracts that
    /// exactly tile each CPU subspace, role containment, and a branch
    /// history that holds every referenced branch and ancestor.
    pub fn validate(&self) -> Result<(), StateError> {
        for (index, shard) in self.config.shards.iter().enumerate() {
            if !shard.is_well_formed() {
                return Err(StateError::BadShard { shard: index });
            }
        }

        let mut subspace_keys: Vec<Vec<KeyRange>> = vec![Vec::new(); CPU_SHARDING_FACTOR];
        for (id, (region, contract)) in &self.contracts {
            if !contract.is_well_formed() {
                return Err(StateError::BadContract { id: *id });
            }

            let index = (0..CPU_SHARDING_FACTOR)
                .find(|i| cpu_subspace(*i).hash == region.hash)
                .ok_or(StateError::RegionCover { subspace: 0 })?;
            subspace_keys[index].push(region.keys.clone());

            self.check_branch_recorded(*id, contract.branch)?;
        }

        for (index, ranges) in subspace_keys.iter().enumerate() {
            if !strata_types::key_ranges_tile(&KeyRange::universe(), ranges) {
                return Err(StateError::RegionCover { subspace: index });
            }
        }

        Ok(())
    }

    fn check_branch_recorded(&self, id: ContractId, branch: BranchId) -> Result<(), StateError> {
        let mut queue = vec![branch];
        let mut seen = BTreeSet::new();
        while let Some(current) = queue.pop() {
            if !seen.insert(current) {
                continue;
            }
            let node = self
                .branch_history
                .get(&current)
                .ok_or(if current == branch {
                    StateError::MissingBranch { id, branch }
                } else {
                    StateError::MissingAncestor {
                        branch,
                        ancestor: current,
                    }
                })?;
            for (_, version) in node.origin.iter() {
                if let Some(parent) = version.branch {
                    queue.push(parent);
                }
            }
        }
        Ok(())
    }
}
