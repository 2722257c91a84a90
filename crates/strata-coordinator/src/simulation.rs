//! Randomized churn simulation.
//!
//! Drives the coordinator through many rounds of random config changes and
//! random (but role-plausible) ack patterns, checking the universal
//! invariants after every pass:
//!
//! - the state always validates (region cover, role containment, recorded
//!   branches)
//! - voter sets only ever change by committing a staged `temp_voters`
//! - a ready primary the config still wants is never replaced
//! - with unchanged acks the coordinator reaches a fixpoint within a couple
//!   of passes, and at the fixpoint every recorded branch is reachable
//!
//! Everything is driven by a seeded RNG: the same seed reproduces the same
//! trajectory, so a failure here is a deterministic repro.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use strata_types::{
    BranchId, CPU_SHARDING_FACTOR, ContractId, KeyRange, RangeEnd, Region, RegionMap, ServerId,
    StoreKey, Timestamp, cpu_subspace,
};

use crate::ack::{AckState, ContractAck};
use crate::branch::{BranchHistory, BranchNode, Version};
use crate::config::{ShardConfig, ShardScheme, TableConfig};
use crate::contract::{Contract, Primary, contract_id_for};
use crate::coordinator::{calculate_all_contracts, calculate_branch_history};
use crate::state::{ContractDiff, TableRaftState};

const ROUNDS: usize = 120;
const SERVER_POOL: [u8; 4] = [1, 2, 3, 4];

fn server(n: u8) -> ServerId {
    ServerId::from_bytes([n; 16])
}

struct ChurnSim {
    rng: SmallRng,
    state: TableRaftState,
    acks: BTreeMap<(ServerId, ContractId), ContractAck>,
    /// Monotonic source of branch root timestamps.
    clock: u64,
    branch_seq: u16,
}

impl ChurnSim {
    fn new(seed: u64) -> Self {
        let mut sim = Self {
            rng: SmallRng::seed_from_u64(seed),
            state: TableRaftState::new(TableConfig::new(
                vec![ShardConfig {
                    replicas: BTreeSet::from([server(1), server(2), server(3)]),
                    primary: server(1),
                }],
                ShardScheme::single(),
            )),
            acks: BTreeMap::new(),
            clock: 0,
            branch_seq: 0,
        };

        for i in 0..CPU_SHARDING_FACTOR {
            let region = cpu_subspace(i);
            let root = sim.mint_branch();
            sim.state.branch_history.insert(
                root,
                BranchNode {
                    region: region.clone(),
                    origin: RegionMap::new(region.clone(), Version::ZERO),
                },
            );
            let contract = Contract {
                replicas: BTreeSet::from([server(1), server(2), server(3)]),
                voters: BTreeSet::from([server(1), server(2), server(3)]),
                temp_voters: None,
                primary: Some(Primary {
                    server: server(1),
                    hand_over: None,
                }),
                branch: root,
            };
            sim.state
                .contracts
                .insert(contract_id_for(&region, &contract), (region, contract));
        }

        // An unreferenced branch; the first pass must collect it.
        let orphan = sim.mint_branch();
        sim.state.branch_history.insert(
            orphan,
            BranchNode {
                region: cpu_subspace(0),
                origin: RegionMap::new(cpu_subspace(0), Version::ZERO),
            },
        );

        sim
    }

    fn run(&mut self) {
        for _ in 0..ROUNDS {
            self.round();
        }
    }

    fn round(&mut self) {
        if self.rng.gen_bool(0.3) {
            self.state.config = self.random_config();
        }
        self.generate_acks();
        self.clock += 1;

        let before = self.state.clone();
        let contract_diff = calculate_all_contracts(&before, &self.acks);
        let branch_diff = calculate_branch_history(&before, &self.acks, &contract_diff);

        check_quorum_safety(&before, &contract_diff);
        check_primary_monotonicity(&before, &self.acks, &contract_diff);

        self.acks
            .retain(|(_, cid), _| !contract_diff.remove.contains(cid));
        self.state.apply(&contract_diff, &branch_diff);
        self.state.validate().expect("state must stay valid");

        // With unchanged acks the coordinator must settle. One extra pass can
        // legitimately change things (a config change landing mid-transition
        // chains a second staged voter change); after that, nothing may.
        let mut extra_passes = 0;
        loop {
            let cd = calculate_all_contracts(&self.state, &self.acks);
            let bd = calculate_branch_history(&self.state, &self.acks, &cd);
            if cd.is_empty() && bd.is_empty() {
                break;
            }
            extra_passes += 1;
            assert!(
                extra_passes <= 2,
                "coordinator failed to reach a fixpoint on unchanged acks"
            );
            check_quorum_safety(&self.state, &cd);
            self.acks.retain(|(_, cid), _| !cd.remove.contains(cid));
            self.state.apply(&cd, &bd);
            self.state.validate().expect("state must stay valid");
        }

        check_no_unreachable_branches(&self.state);
    }

    // ------------------------------------------------------------------
    // Input generation
    // ------------------------------------------------------------------

    fn mint_branch(&mut self) -> BranchId {
        self.branch_seq += 1;
        let mut bytes = [0u8; 16];
        bytes[0] = 0xbb;
        bytes[1..3].copy_from_slice(&self.branch_seq.to_be_bytes());
        BranchId::from_bytes(bytes)
    }

    fn random_config(&mut self) -> TableConfig {
        let scheme = if self.rng.gen_bool(0.3) {
            ShardScheme::new(vec![StoreKey::from("m")])
        } else {
            ShardScheme::single()
        };
        let shards = (0..scheme.shard_count())
            .map(|_| self.random_shard())
            .collect();
        TableConfig::new(shards, scheme)
    }

    fn random_shard(&mut self) -> ShardConfig {
        loop {
            let replicas: BTreeSet<ServerId> = SERVER_POOL
                .iter()
                .filter(|_| self.rng.gen_bool(0.6))
                .map(|n| server(*n))
                .collect();
            if replicas.is_empty() {
                continue;
            }
            let pick = self.rng.gen_range(0..replicas.len());
            let primary = *replicas.iter().nth(pick).unwrap();
            return ShardConfig { replicas, primary };
        }
    }

    /// Regenerates the ack map with states each server could legally report
    /// for its role under the contract.
    fn generate_acks(&mut self) {
        self.acks.clear();
        let contracts: Vec<(ContractId, Region, Contract)> = self
            .state
            .contracts
            .iter()
            .map(|(id, (r, c))| (*id, r.clone(), c.clone()))
            .collect();

        for (cid, region, contract) in contracts {
            match &contract.primary {
                Some(primary) => {
                    let roll: f64 = self.rng.r#gen();
                    if roll < 0.65 {
                        self.acks.insert(
                            (primary.server, cid),
                            ContractAck::new(AckState::PrimaryReady),
                        );
                    } else if roll < 0.8 {
                        let ack = self.propose_branch(&region, contract.branch);
                        self.acks.insert((primary.server, cid), ack);
                    }
                    // Otherwise the primary has gone silent.

                    for s in contract.replicas.iter().copied() {
                        if s == primary.server {
                            continue;
                        }
                        let roll: f64 = self.rng.r#gen();
                        if roll < 0.55 {
                            self.acks
                                .insert((s, cid), ContractAck::new(AckState::SecondaryStreaming));
                        } else if roll < 0.7 {
                            self.acks.insert(
                                (s, cid),
                                ContractAck::new(AckState::SecondaryBackfilling),
                            );
                        } else if roll < 0.9 {
                            let elapsed = self.rng.gen_bool(0.7);
                            let ack = self.report_versions(&region, contract.branch, elapsed);
                            self.acks.insert((s, cid), ack);
                        }
                        // Otherwise the secondary is silent.
                    }
                }
                None => {
                    for s in contract.replicas.iter().copied() {
                        if self.rng.gen_bool(0.85) {
                            let elapsed = self.rng.gen_bool(0.7);
                            let ack = self.report_versions(&region, contract.branch, elapsed);
                            self.acks.insert((s, cid), ack);
                        }
                    }
                }
            }
        }
    }

    /// A `PrimaryNeedBranch` ack proposing a child of `parent` over the
    /// whole contract region.
    fn propose_branch(&mut self, region: &Region, parent: BranchId) -> ContractAck {
        self.clock += 1;
        let proposed = self.mint_branch();
        let mut history = BranchHistory::new();
        history.insert(
            proposed,
            BranchNode {
                region: region.clone(),
                origin: RegionMap::new(
                    region.clone(),
                    Version::new(parent, Timestamp::new(self.clock)),
                ),
            },
        );
        let mut ack = ContractAck::new(AckState::PrimaryNeedBranch);
        ack.branch = Some(proposed);
        ack.branch_history = history;
        ack
    }

    /// A `SecondaryNeedPrimary` ack, sometimes with a version boundary at
    /// `"m"` to exercise region fragmentation.
    fn report_versions(&mut self, region: &Region, branch: BranchId, elapsed: bool) -> ContractAck {
        let m = StoreKey::from("m");
        let splittable =
            region.keys.left < m && RangeEnd::Bounded(m.clone()) < region.keys.right;
        let version = if splittable && self.rng.gen_bool(0.3) {
            let left = Region::new(
                region.hash,
                KeyRange::new(region.keys.left.clone(), RangeEnd::Bounded(m.clone())),
            );
            let right = Region::new(region.hash, KeyRange::new(m, region.keys.right.clone()));
            RegionMap::from_entries(vec![
                (left, Version::new(branch, Timestamp::new(self.rng.gen_range(0..=self.clock)))),
                (right, Version::new(branch, Timestamp::new(self.rng.gen_range(0..=self.clock)))),
            ])
        } else {
            RegionMap::new(
                region.clone(),
                Version::new(branch, Timestamp::new(self.rng.gen_range(0..=self.clock))),
            )
        };
        let mut ack = ContractAck::new(AckState::SecondaryNeedPrimary);
        ack.version = Some(version);
        ack.failover_timeout_elapsed = elapsed;
        ack
    }
}

// ----------------------------------------------------------------------
// Invariant checks
// ----------------------------------------------------------------------

/// Voter sets never jump: a changed voter set must be exactly the staged
/// `temp_voters` of the contract it replaces.
fn check_quorum_safety(before: &TableRaftState, diff: &ContractDiff) {
    for (region, new_c) in diff.add.values() {
        let (_, old_c) = before
            .contracts
            .values()
            .find(|(r, _)| r.contains_region(region))
            .expect("every new region refines an old contract's region");
        if old_c.voters != new_c.voters {
            assert_eq!(
                old_c.temp_voters.as_ref(),
                Some(&new_c.voters),
                "voter change skipped joint consensus"
            );
        }
    }
}

/// A ready primary the config still names is never replaced.
fn check_primary_monotonicity(
    before: &TableRaftState,
    acks: &BTreeMap<(ServerId, ContractId), ContractAck>,
    diff: &ContractDiff,
) {
    for (region, new_c) in diff.add.values() {
        let (old_id, (_, old_c)) = before
            .contracts
            .iter()
            .find(|(_, (r, _))| r.contains_region(region))
            .expect("every new region refines an old contract's region");
        let Some(old_primary) = &old_c.primary else {
            continue;
        };
        if old_primary.hand_over.is_some() {
            continue;
        }
        let config_primary = (0..before.config.shard_count())
            .find(|i| before.config.shard_region(*i).contains_region(region))
            .map(|i| before.config.shards[i].primary)
            .expect("every new region lies in a config shard");
        let still_ready = acks
            .get(&(old_primary.server, *old_id))
            .is_some_and(|a| a.state == AckState::PrimaryReady);
        if config_primary == old_primary.server && still_ready {
            assert_eq!(
                new_c.primary.as_ref().map(|p| p.server),
                Some(old_primary.server),
                "a ready primary the config still wants was replaced"
            );
        }
    }
}

/// At a fixpoint, every recorded branch is reachable from some contract.
fn check_no_unreachable_branches(state: &TableRaftState) {
    let mut queue: Vec<BranchId> = state.contracts.values().map(|(_, c)| c.branch).collect();
    let mut reachable = BTreeSet::new();
    while let Some(id) = queue.pop() {
        if !reachable.insert(id) {
            continue;
        }
        let node = state.branch_history.get(&id).expect("recorded branch");
        for (_, version) in node.origin.iter() {
            if let Some(parent) = version.branch {
                queue.push(parent);
            }
        }
    }
    for id in state.branch_history.branch_ids() {
        assert!(
            reachable.contains(id),
            "branch {id} survived garbage collection without a referent"
        );
    }
}

#[test]
fn churn_converges_seed_1() {
    ChurnSim::new(0x5712a7a).run();
}

#[test]
fn churn_converges_seed_2() {
    ChurnSim::new(0xc0ffee).run();
}

#[test]
fn churn_converges_seed_3() {
    ChurnSim::new(42).run();
}
