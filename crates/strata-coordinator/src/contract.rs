//! Replication contracts.
//!
//! A contract is the per-region agreement the coordinator publishes and the
//! replicas obey: which servers host the data, which of them vote on writes,
//! who the primary is, and which write branch the region is on. Replicas
//! never act on the raw table config; they act on contracts, and the
//! coordinator is the only component that turns config into contracts.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strata_types::{BranchId, ContractId, ID_LENGTH, KeyRange, RangeEnd, Region, ServerId, StoreKey};

/// The primary replica for a region, with an optional hand-over in flight.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Primary {
    /// The server currently acting as primary.
    pub server: ServerId,
    /// When set, the primary has been asked to drain and pass leadership to
    /// this server. The outgoing primary keeps serving until it reports the
    /// transfer complete.
    pub hand_over: Option<ServerId>,
}

/// A replication contract for one region.
///
/// # Invariants
///
/// - `voters ⊆ replicas`, and `temp_voters ⊆ replicas` when present
/// - `temp_voters`, when present, differs from `voters`
/// - `primary.server` and `primary.hand_over` are replicas when present
///
/// While `temp_voters` is set the region is in joint consensus: writes must
/// be acknowledged by a majority of `voters` and a majority of `temp_voters`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Contract {
    /// Servers hosting the region's data.
    pub replicas: BTreeSet<ServerId>,
    /// Servers currently counting toward write quorum.
    pub voters: BTreeSet<ServerId>,
    /// Target voter set during a joint-consensus transition.
    pub temp_voters: Option<BTreeSet<ServerId>>,
    /// The current primary, if any.
    pub primary: Option<Primary>,
    /// The branch the primary is (or was) producing.
    pub branch: BranchId,
}

impl Contract {
    /// Returns true if the contract's internal invariants hold.
    pub fn is_well_formed(&self) -> bool {
        let roles_contained = self.voters.is_subset(&self.replicas)
            && self
                .temp_voters
                .as_ref()
                .is_none_or(|t| t.is_subset(&self.replicas) && *t != self.voters)
            && self.primary.as_ref().is_none_or(|p| {
                self.replicas.contains(&p.server)
                    && p.hand_over.as_ref().is_none_or(|h| self.replicas.contains(h))
            });
        roles_contained && !self.voters.is_empty()
    }
}

// ============================================================================
// Contract ids
// ============================================================================

/// Mints the id for a contract over a region.
///
/// The id is a truncated SHA-256 digest of the pair's canonical encoding, so
/// structurally equal `(region, contract)` pairs always carry the same id
/// and the coordinator stays a pure function. Distinct regions never collide
/// in practice because the region is part of the digest.
pub fn contract_id_for(region: &Region, contract: &Contract) -> ContractId {
    let mut hasher = Sha256::new();

    put_region(&mut hasher, region);
    put_server_set(&mut hasher, &contract.replicas);
    put_server_set(&mut hasher, &contract.voters);
    match &contract.temp_voters {
        Some(temp) => {
            hasher.update([1u8]);
            put_server_set(&mut hasher, temp);
        }
        None => hasher.update([0u8]),
    }
    match &contract.primary {
        Some(primary) => {
            hasher.update([1u8]);
            hasher.update(primary.server.as_bytes());
            match &primary.hand_over {
                Some(target) => {
                    hasher.update([1u8]);
                    hasher.update(target.as_bytes());
                }
                None => hasher.update([0u8]),
            }
        }
        None => hasher.update([0u8]),
    }
    hasher.update(contract.branch.as_bytes());

    let digest = hasher.finalize();
    let mut id = [0u8; ID_LENGTH];
    id.copy_from_slice(&digest[..ID_LENGTH]);
    ContractId::from_bytes(id)
}

fn put_key(hasher: &mut Sha256, key: &StoreKey) {
    hasher.update((key.as_bytes().len() as u64).to_le_bytes());
    hasher.update(key.as_bytes());
}

fn put_key_range(hasher: &mut Sha256, range: &KeyRange) {
    put_key(hasher, &range.left);
    match &range.right {
        RangeEnd::Bounded(right) => {
            hasher.update([1u8]);
            put_key(hasher, right);
        }
        RangeEnd::Unbounded => hasher.update([0u8]),
    }
}

fn put_region(hasher: &mut Sha256, region: &Region) {
    hasher.update(region.hash.begin.to_le_bytes());
    match region.hash.end {
        RangeEnd::Bounded(end) => {
            hasher.update([1u8]);
            hasher.update(end.to_le_bytes());
        }
        RangeEnd::Unbounded => hasher.update([0u8]),
    }
    put_key_range(hasher, &region.keys);
}

fn put_server_set(hasher: &mut Sha256, servers: &BTreeSet<ServerId>) {
    hasher.update((servers.len() as u64).to_le_bytes());
    for server in servers {
        hasher.update(server.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::cpu_subspace;

    fn server(n: u8) -> ServerId {
        ServerId::from_bytes([n; ID_LENGTH])
    }

    fn branch(n: u8) -> BranchId {
        BranchId::from_bytes([n; ID_LENGTH])
    }

    fn simple_contract() -> Contract {
        Contract {
            replicas: BTreeSet::from([server(1), server(2)]),
            voters: BTreeSet::from([server(1), server(2)]),
            temp_voters: None,
            primary: Some(Primary {
                server: server(1),
                hand_over: None,
            }),
            branch: branch(0xb1),
        }
    }

    #[test]
    fn equal_pairs_get_equal_ids() {
        let region = cpu_subspace(0);
        let a = contract_id_for(&region, &simple_contract());
        let b = contract_id_for(&region, &simple_contract());
        assert_eq!(a, b);
    }

    #[test]
    fn different_content_gets_different_ids() {
        let region = cpu_subspace(0);
        let base = simple_contract();

        let mut no_primary = base.clone();
        no_primary.primary = None;
        assert_ne!(
            contract_id_for(&region, &base),
            contract_id_for(&region, &no_primary)
        );

        let mut staged = base.clone();
        staged.temp_voters = Some(BTreeSet::from([server(1)]));
        assert_ne!(
            contract_id_for(&region, &base),
            contract_id_for(&region, &staged)
        );
    }

    #[test]
    fn different_regions_get_different_ids() {
        let contract = simple_contract();
        assert_ne!(
            contract_id_for(&cpu_subspace(0), &contract),
            contract_id_for(&cpu_subspace(1), &contract)
        );
    }

    #[test]
    fn well_formedness_checks_roles() {
        let mut contract = simple_contract();
        assert!(contract.is_well_formed());

        contract.voters.insert(server(9));
        assert!(!contract.is_well_formed());

        let mut stray_primary = simple_contract();
        stray_primary.primary = Some(Primary {
            server: server(9),
            hand_over: None,
        });
        assert!(!stray_primary.is_well_formed());

        let mut redundant_temp = simple_contract();
        redundant_temp.temp_voters = Some(redundant_temp.voters.clone());
        assert!(!redundant_temp.is_well_formed());
    }
}
