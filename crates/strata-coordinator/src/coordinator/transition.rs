//! The per-region contract transition.
//!
//! `calculate_contract` takes the contract currently covering a region, the
//! config's demands for the shard the region belongs to, and the region's
//! ack fragments, and computes the next contract. It is a pure function; the
//! same inputs always produce the same contract.
//!
//! Protocol phases never collapse: every decision gates on the *old*
//! contract and mutates the *new* one, so replicas always observe each
//! intermediate contract (staged voters, hand-over, no-primary) before the
//! next step can proceed. That is what keeps quorum hand-offs safe.

use std::collections::BTreeMap;

use strata_types::ServerId;

use crate::ack::AckState;
use crate::config::ShardConfig;
use crate::contract::{Contract, Primary};

use super::fragments::AckFrag;

/// Computes the next contract for one homogeneous sub-region.
pub(crate) fn calculate_contract(
    old: &Contract,
    shard: &ShardConfig,
    acks: &BTreeMap<ServerId, AckFrag>,
) -> Contract {
    let mut new = old.clone();

    // Servers the config wants join the replica set immediately; departures
    // wait until the end, when the new quorum membership is known.
    new.replicas.extend(shard.replicas.iter().copied());

    // Voter changes run as joint consensus. Stage the target set in
    // temp_voters once every incoming voter is caught up; commit on a later
    // pass once every staged voter is caught up.
    match &old.temp_voters {
        None => {
            if old.voters != shard.replicas {
                let incoming_ready = shard
                    .replicas
                    .iter()
                    .filter(|s| !old.voters.contains(*s))
                    .all(|s| is_caught_up(s, old, acks));
                if incoming_ready {
                    new.temp_voters = Some(shard.replicas.clone());
                }
            }
        }
        Some(staged) => {
            if staged.iter().all(|s| is_caught_up(s, old, acks)) {
                new.voters = staged.clone();
                new.temp_voters = None;
            }
        }
    }

    match &old.primary {
        Some(primary) => {
            if let Some(target) = &primary.hand_over {
                if ack_state(acks, &primary.server) == Some(AckState::PrimaryReady)
                    && ack_state(acks, target) == Some(AckState::SecondaryStreaming)
                {
                    // The outgoing primary has drained and the target is
                    // caught up; step the primary down so the successor can
                    // be elected. Until the target streams, the hand-over
                    // contract stays in place and the primary keeps serving.
                    new.primary = None;
                } else if *target != shard.primary {
                    // The config moved again mid-transfer. Abandon this
                    // hand-over; a fresh one can start on a later pass.
                    new.primary = Some(Primary {
                        server: primary.server,
                        hand_over: None,
                    });
                }
            } else if primary.server != shard.primary
                && new.replicas.contains(&shard.primary)
                && ack_state(acks, &shard.primary) == Some(AckState::SecondaryStreaming)
            {
                // The config wants a different primary and the target is
                // caught up; ask the current primary to drain.
                new.primary = Some(Primary {
                    server: primary.server,
                    hand_over: Some(shard.primary),
                });
            }

            // Failover: the primary has gone silent and a majority of the
            // voters have waited out the failover timeout.
            if !primary_is_acking(&primary.server, acks) && failover_timeout_quorum(old, acks) {
                new.primary = None;
            }
        }
        None => {
            if let Some(server) = elect_primary(old, shard, acks) {
                new.primary = Some(Primary {
                    server,
                    hand_over: None,
                });
            }
        }
    }

    // Adopt the branch a surviving primary proposes. The fragment carries
    // the proposal only where it is rooted at the contract's current branch.
    if let (Some(old_primary), Some(new_primary)) = (&old.primary, &new.primary) {
        if old_primary.server == new_primary.server {
            if let Some(frag) = acks.get(&old_primary.server) {
                if frag.state == AckState::PrimaryNeedBranch {
                    if let Some(branch) = frag.branch {
                        new.branch = branch;
                    }
                }
            }
        }
    }

    // Drop servers the config no longer lists, unless the new contract
    // still needs them for quorum or leadership.
    let voters = new.voters.clone();
    let temp_voters = new.temp_voters.clone();
    let primary = new.primary.clone();
    new.replicas.retain(|s| {
        shard.replicas.contains(s)
            || voters.contains(s)
            || temp_voters.as_ref().is_some_and(|t| t.contains(s))
            || primary.as_ref().is_some_and(|p| p.server == *s)
    });

    // A staged set equal to the committed set would be a no-op transition.
    if new.temp_voters.as_ref() == Some(&new.voters) {
        new.temp_voters = None;
    }

    new
}

fn ack_state(acks: &BTreeMap<ServerId, AckFrag>, server: &ServerId) -> Option<AckState> {
    acks.get(server).map(|f| f.state)
}

/// Whether `server` can count toward a voter-set change: it is streaming, or
/// it is the contract's primary and reports itself live.
fn is_caught_up(server: &ServerId, old: &Contract, acks: &BTreeMap<ServerId, AckFrag>) -> bool {
    match ack_state(acks, server) {
        Some(AckState::SecondaryStreaming) => true,
        Some(AckState::PrimaryReady | AckState::PrimaryNeedBranch) => {
            old.primary.as_ref().is_some_and(|p| p.server == *server)
        }
        _ => false,
    }
}

/// Whether the primary's own ack shows it alive in a primary role.
fn primary_is_acking(server: &ServerId, acks: &BTreeMap<ServerId, AckFrag>) -> bool {
    matches!(
        ack_state(acks, server),
        Some(AckState::PrimaryReady | AckState::PrimaryNeedBranch)
    )
}

/// Whether a strict majority of the voters report a need-primary state with
/// the failover timeout elapsed.
fn failover_timeout_quorum(old: &Contract, acks: &BTreeMap<ServerId, AckFrag>) -> bool {
    let elapsed = old
        .voters
        .iter()
        .filter(|s| {
            acks.get(*s).is_some_and(|f| {
                f.state == AckState::SecondaryNeedPrimary && f.failover_timeout_elapsed
            })
        })
        .count();
    elapsed * 2 > old.voters.len()
}

/// Chooses a primary for a contract that has none.
///
/// Requires a strict majority of the voters to be ready to vote (acking
/// need-primary with a version). The config's choice wins if it is among the
/// candidates; otherwise the candidate with the latest version does, with
/// ties broken toward the smallest server id.
fn elect_primary(
    old: &Contract,
    shard: &ShardConfig,
    acks: &BTreeMap<ServerId, AckFrag>,
) -> Option<ServerId> {
    let candidates: Vec<(&ServerId, &crate::branch::Version)> = old
        .voters
        .iter()
        .filter_map(|s| match acks.get(s) {
            Some(frag) if frag.state == AckState::SecondaryNeedPrimary => {
                frag.version.as_ref().map(|v| (s, v))
            }
            _ => None,
        })
        .collect();

    if candidates.len() * 2 <= old.voters.len() {
        return None;
    }
    if candidates.iter().any(|(s, _)| **s == shard.primary) {
        return Some(shard.primary);
    }
    candidates
        .into_iter()
        .max_by(|(sa, va), (sb, vb)| va.cmp(vb).then_with(|| sb.cmp(sa)))
        .map(|(s, _)| *s)
}
