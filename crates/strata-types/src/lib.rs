//! # strata-types: Core types for `StrataDB`
//!
//! This crate contains the types shared across the `StrataDB` control plane:
//! - Opaque identifiers ([`ServerId`], [`ContractId`], [`BranchId`])
//! - Write timestamps ([`Timestamp`])
//! - The key-space model ([`StoreKey`], [`KeyRange`], [`HashRange`],
//!   [`Region`]) and the CPU-sharding partition of the hash dimension
//! - Piecewise maps over regions ([`RegionMap`])

use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

pub mod region;
pub mod region_map;

pub use region::{
    CPU_SHARDING_FACTOR, HashRange, KeyRange, RangeEnd, Region, StoreKey, cpu_subspace,
    cpu_subspace_index, key_ranges_tile,
};
pub use region_map::RegionMap;

// ============================================================================
// Opaque identifiers - Copy (16-byte tokens)
// ============================================================================

/// Number of bytes in an opaque identifier.
pub const ID_LENGTH: usize = 16;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name([u8; ID_LENGTH]);

        impl $name {
            /// Creates an identifier from raw bytes.
            pub const fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
                Self(bytes)
            }

            /// Returns the identifier's raw bytes.
            pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
                &self.0
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(
                    f,
                    concat!(stringify!($name), "({:02x}{:02x}{:02x}{:02x}...)"),
                    self.0[0], self.0[1], self.0[2], self.0[3]
                )
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(
                    f,
                    concat!($prefix, "{:02x}{:02x}{:02x}{:02x}"),
                    self.0[0], self.0[1], self.0[2], self.0[3]
                )
            }
        }
    };
}

opaque_id!(
    /// Unique identifier for a server in the cluster.
    ///
    /// Server ids are opaque tokens assigned when a server joins the cluster
    /// and never change. They are globally unique and totally ordered; the
    /// ordering carries no meaning beyond giving deterministic tie-breaks.
    ServerId,
    "srv:"
);

opaque_id!(
    /// Unique identifier for a replication contract.
    ///
    /// Contract ids are minted by the coordinator as a content hash of the
    /// `(region, contract)` pair, so a structurally identical contract for
    /// the same region always carries the same id across coordinator runs.
    ContractId,
    "con:"
);

opaque_id!(
    /// Unique identifier for a write branch.
    ///
    /// A branch is the lineage of writes produced by a single primary over a
    /// region. Branch ids are minted by the primary that creates the branch.
    BranchId,
    "br:"
);

// ============================================================================
// Timestamp - Copy (8-byte value)
// ============================================================================

/// A logical write timestamp on a branch.
///
/// Timestamps increase strictly along any path through the branch history:
/// a child branch always roots at a strictly later timestamp than the point
/// where its parent branch was rooted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The timestamp before any write (time zero).
    pub const ZERO: Timestamp = Timestamp(0);

    /// Creates a timestamp from a raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the timestamp as a `u64`.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_display_is_hex_prefix() {
        let id = ServerId::from_bytes([0xab; ID_LENGTH]);
        assert_eq!(format!("{id}"), "srv:abababab");
        assert_eq!(format!("{id:?}"), "ServerId(abababab...)");
    }

    #[test]
    fn ids_order_by_bytes() {
        let a = ServerId::from_bytes([1; ID_LENGTH]);
        let b = ServerId::from_bytes([2; ID_LENGTH]);
        assert!(a < b);
    }

    #[test]
    fn timestamp_ordering() {
        assert!(Timestamp::ZERO < Timestamp::new(1));
        assert_eq!(format!("{}", Timestamp::new(42)), "t42");
    }
}
