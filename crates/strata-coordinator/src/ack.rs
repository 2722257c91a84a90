//! Contract acknowledgements.
//!
//! Replicas report their status with respect to a specific contract as a
//! [`ContractAck`]. The coordinator consumes a snapshot of the whole
//! `(server, contract)` ack map through the [`AckSnapshot`] capability; acks
//! that refer to contracts the state no longer holds are garbage and are
//! ignored.
//!
//! Which states a server may legally report is enforced where acks enter
//! the system, not here; the coordinator treats an ill-formed ack exactly
//! like a missing one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_types::{BranchId, ContractId, RegionMap, ServerId};

use crate::branch::{BranchHistory, Version};

/// A replica's status with respect to a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckState {
    /// The server is not participating in the contract.
    Nothing,
    /// A replica with no live primary, ready to vote in an election.
    SecondaryNeedPrimary,
    /// A replica copying data from the primary's history.
    SecondaryBackfilling,
    /// A replica applying the primary's write stream in real time.
    SecondaryStreaming,
    /// A new primary that has not yet published its branch.
    PrimaryNeedBranch,
    /// A primary that is live, serving, and caught up.
    PrimaryReady,
}

/// A replica's acknowledgement of one contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAck {
    /// The reported state.
    pub state: AckState,
    /// For [`AckState::SecondaryNeedPrimary`]: the latest version the server
    /// holds, per subrange of the contract's region.
    pub version: Option<RegionMap<Version>>,
    /// For [`AckState::PrimaryNeedBranch`]: the branch the new primary
    /// proposes to produce.
    pub branch: Option<BranchId>,
    /// Branch nodes sufficient to interpret `version` or root `branch`.
    pub branch_history: BranchHistory,
    /// For [`AckState::SecondaryNeedPrimary`]: whether this server has
    /// waited out the failover timeout without hearing from a primary. The
    /// only notion of time the coordinator ever sees.
    pub failover_timeout_elapsed: bool,
}

impl ContractAck {
    /// Creates a bare ack in the given state.
    pub fn new(state: AckState) -> Self {
        Self {
            state,
            version: None,
            branch: None,
            branch_history: BranchHistory::new(),
            failover_timeout_elapsed: false,
        }
    }

    /// Returns true if the ack carries the payload its state requires.
    pub fn is_well_formed(&self) -> bool {
        match self.state {
            AckState::SecondaryNeedPrimary => self.version.is_some() && self.branch.is_none(),
            AckState::PrimaryNeedBranch => self.branch.is_some() && self.version.is_none(),
            _ => self.version.is_none() && self.branch.is_none(),
        }
    }
}

/// Read-only view of the ack map, held for the duration of one coordinator
/// call.
///
/// The real system keeps acks in a concurrently updated watchable map; the
/// caller snapshots it (or holds a read guard) and hands the coordinator
/// this capability. Tests implement it with a plain `BTreeMap`.
pub trait AckSnapshot {
    /// Visits every `(server, contract, ack)` entry.
    fn read_all(&self, visit: &mut dyn FnMut(&ServerId, &ContractId, &ContractAck));
}

impl AckSnapshot for BTreeMap<(ServerId, ContractId), ContractAck> {
    fn read_all(&self, visit: &mut dyn FnMut(&ServerId, &ContractId, &ContractAck)) {
        for ((server, contract), ack) in self {
            visit(server, contract, ack);
        }
    }
}
