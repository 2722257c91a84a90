//! The key-space model.
//!
//! The data space of a table is two-dimensional: a hash dimension in
//! `[0, 2^64)` used for CPU sharding, and a key dimension of arbitrary byte
//! strings used for range sharding. A [`Region`] is a half-open rectangle in
//! that space. Regions support intersection, subtraction along the key
//! dimension, containment, and exact-cover checks; those operations are all
//! the coordinator needs to project contracts onto shard boundaries.
//!
//! # CPU sharding
//!
//! The hash dimension is statically partitioned into [`CPU_SHARDING_FACTOR`]
//! equal slices. Every contract lives entirely inside one slice, so per-slice
//! work can proceed on independent cores without coordination. Nothing in
//! this crate ever merges regions across slices.

use std::fmt::{self, Debug, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// Store keys
// ============================================================================

/// A key in the store: an arbitrary byte string, ordered lexicographically.
///
/// The empty key is the minimum of the key space.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct StoreKey(Bytes);

impl StoreKey {
    /// The minimum key (the empty byte string).
    pub fn min() -> Self {
        Self(Bytes::new())
    }

    /// Creates a key from bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Returns the key's bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns true if this is the minimum key.
    pub fn is_min(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreKey({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for StoreKey {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for StoreKey {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

// ============================================================================
// Interval bounds
// ============================================================================

/// The exclusive upper bound of a half-open interval.
///
/// `Unbounded` stands for the top of the dimension (`+∞` for keys, `2^64`
/// for hashes). The derived ordering places `Bounded(_) < Unbounded`, which
/// is exactly the order of the bounds they denote, so interval arithmetic
/// can use `min`/`max` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RangeEnd<T> {
    /// The interval ends just before this value.
    Bounded(T),
    /// The interval extends to the top of the dimension.
    Unbounded,
}

impl<T> RangeEnd<T> {
    /// Returns true if the bound is `Unbounded`.
    pub fn is_unbounded(&self) -> bool {
        matches!(self, RangeEnd::Unbounded)
    }
}

// ============================================================================
// Key ranges
// ============================================================================

/// A half-open range of store keys `[left, right)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub left: StoreKey,
    /// Exclusive upper bound.
    pub right: RangeEnd<StoreKey>,
}

impl KeyRange {
    /// The whole key space, `[min, +∞)`.
    pub fn universe() -> Self {
        Self {
            left: StoreKey::min(),
            right: RangeEnd::Unbounded,
        }
    }

    /// Creates a key range.
    pub fn new(left: StoreKey, right: RangeEnd<StoreKey>) -> Self {
        Self { left, right }
    }

    /// Returns true if the range contains no keys.
    pub fn is_empty(&self) -> bool {
        match &self.right {
            RangeEnd::Bounded(right) => *right <= self.left,
            RangeEnd::Unbounded => false,
        }
    }

    /// Returns true if `other` is entirely inside this range.
    pub fn contains_range(&self, other: &KeyRange) -> bool {
        self.left <= other.left && other.right <= self.right
    }

    /// Intersects two ranges. Returns `None` if they do not overlap.
    pub fn intersection(&self, other: &KeyRange) -> Option<KeyRange> {
        let left = self.left.clone().max(other.left.clone());
        let right = self.right.clone().min(other.right.clone());
        let result = KeyRange { left, right };
        if result.is_empty() { None } else { Some(result) }
    }

    /// Subtracts `other` from this range.
    ///
    /// Returns the up-to-two non-empty pieces of `self` not covered by
    /// `other`, in key order.
    pub fn subtract(&self, other: &KeyRange) -> Vec<KeyRange> {
        let Some(overlap) = self.intersection(other) else {
            return vec![self.clone()];
        };
        let mut pieces = Vec::new();
        let below = KeyRange {
            left: self.left.clone(),
            right: RangeEnd::Bounded(overlap.left.clone()),
        };
        if !below.is_empty() {
            pieces.push(below);
        }
        if let RangeEnd::Bounded(overlap_right) = &overlap.right {
            let above = KeyRange {
                left: overlap_right.clone(),
                right: self.right.clone(),
            };
            if !above.is_empty() {
                pieces.push(above);
            }
        }
        pieces
    }
}

impl Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.right {
            RangeEnd::Bounded(right) => write!(f, "[{}, {})", self.left, right),
            RangeEnd::Unbounded => write!(f, "[{}, +inf)", self.left),
        }
    }
}

// ============================================================================
// Hash ranges
// ============================================================================

/// A half-open range `[begin, end)` in the hash dimension `[0, 2^64)`.
///
/// `RangeEnd::Unbounded` denotes `2^64`, which is not representable as a
/// `u64` bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HashRange {
    /// Inclusive lower bound.
    pub begin: u64,
    /// Exclusive upper bound.
    pub end: RangeEnd<u64>,
}

impl HashRange {
    /// The whole hash dimension, `[0, 2^64)`.
    pub fn universe() -> Self {
        Self {
            begin: 0,
            end: RangeEnd::Unbounded,
        }
    }

    /// Creates a hash range.
    pub fn new(begin: u64, end: RangeEnd<u64>) -> Self {
        Self { begin, end }
    }

    /// Returns true if the range contains no hash values.
    pub fn is_empty(&self) -> bool {
        match self.end {
            RangeEnd::Bounded(end) => end <= self.begin,
            RangeEnd::Unbounded => false,
        }
    }

    /// Returns true if `other` is entirely inside this range.
    pub fn contains_range(&self, other: &HashRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    /// Intersects two ranges. Returns `None` if they do not overlap.
    pub fn intersection(&self, other: &HashRange) -> Option<HashRange> {
        let begin = self.begin.max(other.begin);
        let end = self.end.min(other.end);
        let result = HashRange { begin, end };
        if result.is_empty() { None } else { Some(result) }
    }
}

// ============================================================================
// Regions
// ============================================================================

/// A half-open rectangle in the hash × key space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Region {
    /// The hash-dimension extent.
    pub hash: HashRange,
    /// The key-dimension extent.
    pub keys: KeyRange,
}

impl Region {
    /// The whole data space.
    pub fn universe() -> Self {
        Self {
            hash: HashRange::universe(),
            keys: KeyRange::universe(),
        }
    }

    /// Creates a region.
    pub fn new(hash: HashRange, keys: KeyRange) -> Self {
        Self { hash, keys }
    }

    /// A region spanning the full hash dimension over the given keys.
    pub fn from_keys(keys: KeyRange) -> Self {
        Self {
            hash: HashRange::universe(),
            keys,
        }
    }

    /// Returns true if the region contains no data.
    pub fn is_empty(&self) -> bool {
        self.hash.is_empty() || self.keys.is_empty()
    }

    /// Returns true if `other` is entirely inside this region.
    pub fn contains_region(&self, other: &Region) -> bool {
        self.hash.contains_range(&other.hash) && self.keys.contains_range(&other.keys)
    }

    /// Intersects two regions. Returns `None` if they do not overlap.
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        let hash = self.hash.intersection(&other.hash)?;
        let keys = self.keys.intersection(&other.keys)?;
        Some(Region { hash, keys })
    }

    /// Returns true if the regions overlap.
    pub fn overlaps(&self, other: &Region) -> bool {
        self.intersection(other).is_some()
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hash.end {
            RangeEnd::Bounded(end) => {
                write!(f, "{} x [{:#x}, {:#x})", self.keys, self.hash.begin, end)
            }
            RangeEnd::Unbounded => write!(f, "{} x [{:#x}, 2^64)", self.keys, self.hash.begin),
        }
    }
}

// ============================================================================
// CPU sharding
// ============================================================================

/// Number of equal hash-dimension slices used to spread shard work across
/// cores. Contracts never cross a slice boundary.
pub const CPU_SHARDING_FACTOR: usize = 8;

/// Width of one CPU subspace in the hash dimension.
const SUBSPACE_STRIDE: u64 = ((1u128 << 64) / CPU_SHARDING_FACTOR as u128) as u64;

/// Returns CPU subspace `index`: the `index`-th hash slice over the full key
/// space.
///
/// # Panics
///
/// Panics if `index >= CPU_SHARDING_FACTOR`.
pub fn cpu_subspace(index: usize) -> Region {
    assert!(
        index < CPU_SHARDING_FACTOR,
        "cpu subspace index {index} out of range"
    );
    let begin = index as u64 * SUBSPACE_STRIDE;
    let end = if index + 1 == CPU_SHARDING_FACTOR {
        RangeEnd::Unbounded
    } else {
        RangeEnd::Bounded((index as u64 + 1) * SUBSPACE_STRIDE)
    };
    Region {
        hash: HashRange::new(begin, end),
        keys: KeyRange::universe(),
    }
}

/// Returns the index of the CPU subspace that `region` lives in.
///
/// The region's hash extent must be exactly one subspace; contract regions
/// are constructed that way and never split along the hash dimension.
pub fn cpu_subspace_index(region: &Region) -> usize {
    let index = (region.hash.begin / SUBSPACE_STRIDE) as usize;
    debug_assert_eq!(
        region.hash,
        cpu_subspace(index).hash,
        "region hash extent is not a cpu subspace"
    );
    index
}

/// Checks that `ranges` exactly tile `universe`: sorted by left bound they
/// must chain without gaps or overlaps from `universe.left` to
/// `universe.right`, and none may be empty.
pub fn key_ranges_tile(universe: &KeyRange, ranges: &[KeyRange]) -> bool {
    let mut sorted: Vec<&KeyRange> = ranges.iter().collect();
    sorted.sort_by(|a, b| a.left.cmp(&b.left));

    let mut cursor = RangeEnd::Bounded(universe.left.clone());
    for range in sorted {
        if range.is_empty() || RangeEnd::Bounded(range.left.clone()) != cursor {
            return false;
        }
        cursor = range.right.clone();
    }
    cursor == universe.right
}
