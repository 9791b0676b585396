//! An offset-sorted, dominance-free fragment index.

use super::Fragment;

/// CoverSet indexes fragments by offset while maintaining the invariant
/// that no element is strictly dominated by another (a fragment
/// dominates another iff its interval is a strict superset). Fragments
/// absorbed from many replicas and stores in arbitrary order therefore
/// settle into a sequence whose begins and ends are both strictly
/// increasing, which is what overlap queries lean on.
///
/// A set is owned by a single caller at a time; there is no internal
/// synchronization.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CoverSet {
    items: Vec<Fragment>,
}

impl CoverSet {
    pub fn new() -> CoverSet {
        CoverSet::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Fragment> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[Fragment] {
        &self.items
    }

    /// Add `fragment` to the set, returning whether the set changed.
    ///
    /// A fragment covered by an existing element is discarded (equal
    /// intervals keep the earlier element, even if metadata differs).
    /// Otherwise it is inserted in offset order and any elements it
    /// strictly dominates are removed. Touching intervals never
    /// dominate one another.
    pub fn add(&mut self, fragment: Fragment) -> bool {
        // First index whose begin is >= fragment.begin. Strictly
        // increasing begins make this the only candidate region.
        let ind = self.items.partition_point(|f| f.begin < fragment.begin);

        if ind < self.items.len()
            && self.items[ind].begin == fragment.begin
            && self.items[ind].end >= fragment.end
        {
            return false;
        }
        if ind > 0 && self.items[ind - 1].end >= fragment.end {
            return false;
        }

        // Elements from `ind` with end <= fragment.end are dominated.
        let mut last = ind;
        while last < self.items.len() && self.items[last].end <= fragment.end {
            last += 1;
        }
        self.items.splice(ind..last, [fragment]);
        true
    }

    /// Smallest covered offset, or zero for an empty set.
    pub fn begin_offset(&self) -> i64 {
        self.items.first().map(|f| f.begin).unwrap_or(0)
    }

    /// Largest covered offset, or zero for an empty set.
    pub fn end_offset(&self) -> i64 {
        self.items.iter().map(|f| f.end).max().unwrap_or(0)
    }

    /// Index of the fragment covering `offset` which extends furthest
    /// forward, and whether `offset` is covered at all. When not
    /// covered, the index is that of the first fragment whose end
    /// exceeds `offset` (`len()` when none does).
    pub fn longest_overlapping_fragment(&self, offset: i64) -> (usize, bool) {
        let ind = self.items.partition_point(|f| f.begin <= offset);
        if ind > 0 && self.items[ind - 1].end > offset {
            return (ind - 1, true);
        }
        (self.items.partition_point(|f| f.end <= offset), false)
    }
}

impl<'a> IntoIterator for &'a CoverSet {
    type Item = &'a Fragment;
    type IntoIter = std::slice::Iter<'a, Fragment>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl std::ops::Index<usize> for CoverSet {
    type Output = Fragment;

    fn index(&self, ind: usize) -> &Fragment {
        &self.items[ind]
    }
}
