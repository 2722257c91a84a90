//! # strata-coordinator: The contract coordinator for `StrataDB` tables
//!
//! A `StrataDB` table is sharded by key range, replicated per shard, and fanned
//! out across cores by a fixed hash partition. The replicas of each region obey
//! a *contract*: who hosts the data, who votes on writes, who leads, and which
//! write branch the region is on. This crate computes those contracts.
//!
//! ## Architecture
//!
//! ```text
//!        table config ──┐
//!   live contracts ─────┤
//!   branch history ─────┼──► coordinator ──► contract diff + branch diff
//!        ack snapshot ──┘    (pure function)        │
//!                                                   ▼
//!                                           Raft log entry,
//!                                       applied on every replica
//! ```
//!
//! The coordinator is a pure function over the table's Raft state and a
//! snapshot of the replicas' acks. It drives every reconfiguration the table
//! can undergo: replica additions and removals (through joint consensus),
//! primary hand-overs, shard splits, and failover, including failovers whose
//! winners differ across subranges of a region. It performs no I/O, keeps no
//! clocks (time reaches it only as a boolean on acks), and is idempotent:
//! re-running it over a state that absorbed its own diff changes nothing.
//!
//! ## Key components
//!
//! - [`contract`]: the per-region replication agreement
//! - [`ack`]: replica acknowledgements and the snapshot capability
//! - [`branch`]: write branches and the branch-history DAG
//! - [`config`], [`state`]: the demanded layout and the replicated state
//! - [`coordinator`]: the transition itself
//!
//! ## Example
//!
//! ```ignore
//! use strata_coordinator::{calculate_all_contracts, calculate_branch_history};
//!
//! let contract_diff = calculate_all_contracts(&state, &acks);
//! let branch_diff = calculate_branch_history(&state, &acks, &contract_diff);
//! // The Raft layer applies both as one log entry:
//! state.apply(&contract_diff, &branch_diff);
//! ```

pub mod ack;
pub mod branch;
pub mod config;
pub mod contract;
pub mod coordinator;
pub mod state;

#[cfg(test)]
mod simulation;

pub use ack::{AckSnapshot, AckState, ContractAck};
pub use branch::{BranchHistory, BranchNode, Version};
pub use config::{ShardConfig, ShardScheme, TableConfig};
pub use contract::{Contract, Primary, contract_id_for};
pub use coordinator::{calculate_all_contracts, calculate_branch_history};
pub use state::{BranchDiff, ContractDiff, StateError, TableRaftState};
