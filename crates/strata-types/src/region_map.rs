//! Piecewise-constant maps over regions.
//!
//! A [`RegionMap`] assigns a value to each of a set of disjoint regions. It
//! is how the control plane represents anything that varies across the key
//! space: a secondary's per-range version vector, or the per-range origin of
//! a write branch. The map is a plain owned list of `(region, value)` pairs;
//! lookups walk the list, which is fine at control-plane sizes (a handful of
//! entries per map).

use serde::{Deserialize, Serialize};

use crate::region::Region;

/// A map from disjoint regions to values.
///
/// Entries are kept in insertion order. Two maps compare equal only if their
/// entries match pairwise, which is sufficient for the coordinator (maps are
/// built deterministically).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMap<T> {
    entries: Vec<(Region, T)>,
}

impl<T> RegionMap<T> {
    /// Creates an empty map.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Creates a map with a single entry.
    pub fn new(region: Region, value: T) -> Self {
        debug_assert!(!region.is_empty(), "region map entry must be non-empty");
        Self {
            entries: vec![(region, value)],
        }
    }

    /// Creates a map from entries.
    ///
    /// Entries must be non-empty and pairwise disjoint.
    pub fn from_entries(entries: Vec<(Region, T)>) -> Self {
        debug_assert!(
            entries.iter().all(|(r, _)| !r.is_empty()),
            "region map entries must be non-empty"
        );
        debug_assert!(
            entries
                .iter()
                .enumerate()
                .all(|(i, (a, _))| entries[..i].iter().all(|(b, _)| !a.overlaps(b))),
            "region map entries must be disjoint"
        );
        Self { entries }
    }

    /// Returns true if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates over the entries.
    pub fn iter(&self) -> impl Iterator<Item = (&Region, &T)> {
        self.entries.iter().map(|(r, v)| (r, v))
    }
}

impl<T: Clone> RegionMap<T> {
    /// Restricts the map to `region`, clipping entries at its edges.
    pub fn mask(&self, region: &Region) -> RegionMap<T> {
        let entries = self
            .entries
            .iter()
            .filter_map(|(r, v)| r.intersection(region).map(|clipped| (clipped, v.clone())))
            .collect();
        RegionMap { entries }
    }

    /// Returns the value over `region`, if a single entry contains all of it.
    pub fn value_over(&self, region: &Region) -> Option<&T> {
        self.entries
            .iter()
            .find(|(r, _)| r.contains_region(region))
            .map(|(_, v)| v)
    }

    /// Returns true if the entries, restricted to `region`, cover it exactly.
    pub fn covers(&self, region: &Region) -> bool {
        let masked = self.mask(region);
        if !masked
            .entries
            .iter()
            .all(|(r, _)| r.hash == region.hash)
        {
            return false;
        }
        let key_ranges: Vec<_> = masked.entries.iter().map(|(r, _)| r.keys.clone()).collect();
        crate::region::key_ranges_tile(&region.keys, &key_ranges)
    }
}
