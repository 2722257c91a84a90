//! The contract coordinator.
//!
//! The coordinator is the deterministic control-plane transition of a table:
//! given the current Raft state (config, contracts, branch history) and a
//! snapshot of the replicas' acks, it computes which contracts to retire,
//! which to install, and which branch-history entries to record or drop. An
//! external driver invokes it whenever any input changes; the Raft layer
//! applies the resulting diff atomically.
//!
//! The computation runs in three passes:
//!
//! 1. Project every live contract onto the config's shard boundaries and
//!    break its acks into homogeneous fragments ([`fragments`]).
//! 2. Run the per-region transition on every resulting sub-region
//!    ([`transition`]).
//! 3. Diff the produced contracts against the live ones, reusing ids for
//!    unchanged `(region, contract)` pairs, and recompute which branches
//!    stay reachable.
//!
//! Everything here is pure: no I/O, no clocks, no randomness. Repeated runs
//! over identical inputs produce identical diffs, and a run over a state
//! that already absorbed its own diff produces an empty one.

mod fragments;
mod transition;

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use strata_types::{BranchId, ContractId, Region, RegionMap, ServerId};

use crate::ack::{AckSnapshot, AckState, ContractAck};
use crate::contract::{Contract, contract_id_for};
use crate::state::{BranchDiff, ContractDiff, TableRaftState};

use fragments::{AckFrag, break_ack_into_fragments, fragments_over, partition_at_fragment_boundaries};
use transition::calculate_contract;

/// Computes the next contract set.
///
/// Produced `(region, contract)` pairs identical to a live pair keep that
/// pair's id and appear in neither half of the diff; every other live
/// contract is removed and every other produced pair is added under its
/// content-hash id.
pub fn calculate_all_contracts(
    old_state: &TableRaftState,
    acks: &dyn AckSnapshot,
) -> ContractDiff {
    let acks_by_contract = collect_acks(old_state, acks);
    let no_acks = BTreeMap::new();

    let mut produced: Vec<(Region, Contract)> = Vec::new();
    for (contract_id, (region, contract)) in &old_state.contracts {
        let contract_acks = acks_by_contract.get(contract_id).unwrap_or(&no_acks);
        for shard_index in 0..old_state.config.shard_count() {
            let shard_region = old_state.config.shard_region(shard_index);
            let Some(work_region) = region.intersection(&shard_region) else {
                continue;
            };

            let frags: BTreeMap<ServerId, RegionMap<AckFrag>> = contract_acks
                .iter()
                .map(|(server, ack)| {
                    (
                        *server,
                        break_ack_into_fragments(ack, contract.branch, &work_region),
                    )
                })
                .collect();

            for sub_region in partition_at_fragment_boundaries(&work_region, &frags) {
                let sub_acks = fragments_over(&frags, &sub_region);
                let next = calculate_contract(
                    contract,
                    &old_state.config.shards[shard_index],
                    &sub_acks,
                );
                trace!(region = %sub_region, from = %contract_id, "computed contract");
                produced.push((sub_region, next));
            }
        }
    }

    let live_pairs: BTreeMap<&(Region, Contract), &ContractId> = old_state
        .contracts
        .iter()
        .map(|(id, pair)| (pair, id))
        .collect();

    let mut kept: BTreeSet<ContractId> = BTreeSet::new();
    let mut add: BTreeMap<ContractId, (Region, Contract)> = BTreeMap::new();
    for pair in produced {
        match live_pairs.get(&pair) {
            Some(id) => {
                kept.insert(**id);
            }
            None => {
                add.insert(contract_id_for(&pair.0, &pair.1), pair);
            }
        }
    }
    let remove: BTreeSet<ContractId> = old_state
        .contracts
        .keys()
        .filter(|id| !kept.contains(id))
        .copied()
        .collect();

    debug!(
        removed = remove.len(),
        added = add.len(),
        unchanged = kept.len(),
        "contract pass complete"
    );
    ContractDiff { remove, add }
}

/// Computes the branch-history diff that accompanies a contract diff.
///
/// A branch stays recorded exactly while some surviving contract's branch
/// can reach it through parent links. Newly reachable branches are pulled
/// from the acks' history fragments.
///
/// # Panics
///
/// Panics if a branch referenced by a surviving contract is recorded neither
/// in the state nor in any live ack's fragment; the ack ingress layer
/// guarantees proposals arrive with the history that roots them.
pub fn calculate_branch_history(
    old_state: &TableRaftState,
    acks: &dyn AckSnapshot,
    contracts: &ContractDiff,
) -> BranchDiff {
    // Everything we can know about branches: the store plus the fragments
    // carried by acks for still-live contracts.
    let mut known = old_state.branch_history.clone();
    acks.read_all(&mut |_, contract_id, ack| {
        if old_state.contracts.contains_key(contract_id) {
            known.merge_from(&ack.branch_history);
        }
    });

    // Branches referenced once the diff lands.
    let mut queue: Vec<BranchId> = old_state
        .contracts
        .iter()
        .filter(|(id, _)| !contracts.remove.contains(id))
        .map(|(_, (_, c))| c.branch)
        .chain(contracts.add.values().map(|(_, c)| c.branch))
        .collect();

    // Close over parent links.
    let mut reachable: BTreeSet<BranchId> = BTreeSet::new();
    while let Some(id) = queue.pop() {
        if !reachable.insert(id) {
            continue;
        }
        let node = known
            .get(&id)
            .unwrap_or_else(|| panic!("branch {id} is referenced by a live contract but unrecorded"));
        for (_, version) in node.origin.iter() {
            if let Some(parent) = version.branch {
                queue.push(parent);
            }
        }
    }

    let remove: BTreeSet<BranchId> = old_state
        .branch_history
        .branch_ids()
        .filter(|id| !reachable.contains(id))
        .copied()
        .collect();
    let mut add = crate::branch::BranchHistory::new();
    for id in &reachable {
        if !old_state.branch_history.contains(id) {
            add.insert(*id, known.get(id).expect("reachable branch resolved above").clone());
        }
    }

    debug!(
        removed = remove.len(),
        added = add.len(),
        reachable = reachable.len(),
        "branch pass complete"
    );
    BranchDiff { remove, add }
}

/// Collects the usable acks, keyed by the contract they refer to.
///
/// Acks for contracts the state no longer holds are garbage, and a
/// [`AckState::Nothing`] ack means the same as no ack at all.
fn collect_acks(
    old_state: &TableRaftState,
    acks: &dyn AckSnapshot,
) -> BTreeMap<ContractId, BTreeMap<ServerId, ContractAck>> {
    let mut by_contract: BTreeMap<ContractId, BTreeMap<ServerId, ContractAck>> = BTreeMap::new();
    acks.read_all(&mut |server, contract_id, ack| {
        if ack.state == AckState::Nothing {
            return;
        }
        if !old_state.contracts.contains_key(contract_id) {
            return;
        }
        by_contract
            .entry(*contract_id)
            .or_default()
            .insert(*server, ack.clone());
    });
    by_contract
}
