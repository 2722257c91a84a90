//! Ack fragmentation.
//!
//! An ack is not homogeneous over a contract's region: a secondary's version
//! map and a proposed branch's origin can change value partway through the
//! key range. Before running the per-region transition, each ack is broken
//! into fragments that are constant over their region, and the work region
//! is partitioned at every fragment boundary. Each resulting sub-region then
//! sees one plain value per server, and divergent subranges fall out as
//! separate contracts with no special handling (this is what splits a region
//! between two failover winners).

use std::collections::{BTreeMap, BTreeSet};

use strata_types::{BranchId, KeyRange, RangeEnd, Region, RegionMap, ServerId, StoreKey};

use crate::ack::{AckState, ContractAck};
use crate::branch::Version;

/// One ack, restricted to a region over which all of its fields are
/// constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AckFrag {
    pub state: AckState,
    /// The server's version over the fragment (`SecondaryNeedPrimary` only).
    pub version: Option<Version>,
    /// The proposed branch, where its origin is rooted at the contract's
    /// current branch (`PrimaryNeedBranch` only).
    pub branch: Option<BranchId>,
    pub failover_timeout_elapsed: bool,
}

impl AckFrag {
    fn bare(state: AckState, failover_timeout_elapsed: bool) -> Self {
        Self {
            state,
            version: None,
            branch: None,
            failover_timeout_elapsed,
        }
    }
}

/// Breaks `ack` into homogeneous fragments over `region`.
///
/// `current_branch` is the branch of the contract the ack refers to; a
/// proposed branch survives into a fragment only where its origin names
/// `current_branch` as the parent, which resolves the branch-adoption
/// consistency check per subrange.
///
/// An ack whose payload does not cover `region` contributes bare fragments
/// (no version, no proposal) for the uncovered remainder.
pub(crate) fn break_ack_into_fragments(
    ack: &ContractAck,
    current_branch: BranchId,
    region: &Region,
) -> RegionMap<AckFrag> {
    match ack.state {
        AckState::SecondaryNeedPrimary => {
            let Some(version) = &ack.version else {
                // Ill-formed; treat like a missing ack.
                return RegionMap::empty();
            };
            let entries: Vec<(Region, AckFrag)> = version
                .mask(region)
                .iter()
                .map(|(r, v)| {
                    let mut frag =
                        AckFrag::bare(ack.state, ack.failover_timeout_elapsed);
                    frag.version = Some(*v);
                    (r.clone(), frag)
                })
                .collect();
            debug_assert!(
                RegionMap::from_entries(entries.clone()).covers(region),
                "need-primary version map must cover the contract region"
            );
            RegionMap::from_entries(entries)
        }

        AckState::PrimaryNeedBranch => {
            let proposal = ack
                .branch
                .and_then(|b| ack.branch_history.get(&b).map(|node| (b, node)));
            let Some((proposed, node)) = proposal else {
                // No proposal we can interpret; the state still counts.
                return RegionMap::new(
                    region.clone(),
                    AckFrag::bare(ack.state, ack.failover_timeout_elapsed),
                );
            };

            let mut entries: Vec<(Region, AckFrag)> = node
                .origin
                .mask(region)
                .iter()
                .map(|(r, v)| {
                    let mut frag =
                        AckFrag::bare(ack.state, ack.failover_timeout_elapsed);
                    if v.branch == Some(current_branch) {
                        frag.branch = Some(proposed);
                    }
                    (r.clone(), frag)
                })
                .collect();

            // Whatever the origin leaves uncovered still acks the state,
            // just without an adoptable proposal.
            let covered: Vec<KeyRange> =
                entries.iter().map(|(r, _)| r.keys.clone()).collect();
            for keys in subtract_all(&region.keys, &covered) {
                entries.push((
                    Region::new(region.hash, keys),
                    AckFrag::bare(ack.state, ack.failover_timeout_elapsed),
                ));
            }
            RegionMap::from_entries(entries)
        }

        _ => RegionMap::new(
            region.clone(),
            AckFrag::bare(ack.state, ack.failover_timeout_elapsed),
        ),
    }
}

/// Partitions `region` along the key dimension at every internal fragment
/// boundary, in key order.
pub(crate) fn partition_at_fragment_boundaries(
    region: &Region,
    frags: &BTreeMap<ServerId, RegionMap<AckFrag>>,
) -> Vec<Region> {
    let mut cuts: BTreeSet<StoreKey> = BTreeSet::new();
    for map in frags.values() {
        for (r, _) in map.iter() {
            if r.keys.left > region.keys.left {
                cuts.insert(r.keys.left.clone());
            }
            if let RangeEnd::Bounded(right) = &r.keys.right {
                if RangeEnd::Bounded(right.clone()) < region.keys.right {
                    cuts.insert(right.clone());
                }
            }
        }
    }

    let mut pieces = Vec::with_capacity(cuts.len() + 1);
    let mut left = region.keys.left.clone();
    for cut in cuts {
        pieces.push(Region::new(
            region.hash,
            KeyRange::new(left.clone(), RangeEnd::Bounded(cut.clone())),
        ));
        left = cut;
    }
    pieces.push(Region::new(
        region.hash,
        KeyRange::new(left, region.keys.right.clone()),
    ));
    pieces
}

/// The per-server fragment values over one sub-region of the partition.
pub(crate) fn fragments_over(
    frags: &BTreeMap<ServerId, RegionMap<AckFrag>>,
    region: &Region,
) -> BTreeMap<ServerId, AckFrag> {
    frags
        .iter()
        .filter_map(|(server, map)| map.value_over(region).map(|f| (*server, f.clone())))
        .collect()
}

fn subtract_all(range: &KeyRange, covered: &[KeyRange]) -> Vec<KeyRange> {
    let mut remainder = vec![range.clone()];
    for c in covered {
        remainder = remainder.iter().flat_map(|r| r.subtract(c)).collect();
    }
    remainder
}
