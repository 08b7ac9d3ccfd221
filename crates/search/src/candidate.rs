//! Candidate sets: EntryIDs produced by index scans
//!
//! A candidate set is a superset of a filter's answer, never the answer
//! itself; every candidate is re-checked by the evaluator. Two flags record
//! how far the set can be trusted:
//!
//! - `partial`: the scan hit `max_scan_size` and stopped collecting
//! - `unusable`: no index could narrow the filter at all
//!
//! Either flag means the set must not be used to restrict the search.

use dirstore_core::EntryId;
use rustc_hash::FxHashSet;

/// Deduplicating, insertion-ordered set of EntryIDs with confidence flags
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    ids: Vec<EntryId>,
    seen: FxHashSet<EntryId>,
    partial: bool,
    unusable: bool,
}

impl CandidateSet {
    /// Empty set with room for `hint` ids
    pub fn new(hint: usize) -> Self {
        let mut seen = FxHashSet::default();
        seen.reserve(hint);
        Self {
            ids: Vec::with_capacity(hint),
            seen,
            partial: false,
            unusable: false,
        }
    }

    /// Empty set flagged unusable
    pub fn unusable() -> Self {
        Self {
            unusable: true,
            ..Self::default()
        }
    }

    /// Add an id; adding an id twice has no effect
    ///
    /// Returns true if the id was new.
    pub fn add(&mut self, id: EntryId) -> bool {
        if self.seen.insert(id) {
            self.ids.push(id);
            true
        } else {
            false
        }
    }

    /// Number of ids
    pub fn size(&self) -> usize {
        self.ids.len()
    }

    /// Whether the set holds no ids
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether the id is in the set
    pub fn contains(&self, id: EntryId) -> bool {
        self.seen.contains(&id)
    }

    /// Ids in insertion order
    pub fn ids(&self) -> &[EntryId] {
        &self.ids
    }

    /// Scan stopped at the size bound
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// No index narrowed the filter
    pub fn is_unusable(&self) -> bool {
        self.unusable
    }

    /// Neither partial nor unusable
    pub fn is_authoritative(&self) -> bool {
        !self.partial && !self.unusable
    }

    /// Flag the set partial
    pub fn mark_partial(&mut self) {
        self.partial = true;
    }

    /// Flag the set unusable
    pub fn mark_unusable(&mut self) {
        self.unusable = true;
    }

    /// Intersection; flags of either operand carry over
    pub fn and(self, other: &CandidateSet) -> CandidateSet {
        let mut out = CandidateSet::new(self.ids.len().min(other.ids.len()));
        for id in self.ids {
            if other.contains(id) {
                out.add(id);
            }
        }
        out.partial = self.partial || other.partial;
        out.unusable = self.unusable || other.unusable;
        out
    }

    /// Union; flags of either operand carry over
    pub fn or(mut self, other: &CandidateSet) -> CandidateSet {
        for id in &other.ids {
            self.add(*id);
        }
        self.partial |= other.partial;
        self.unusable |= other.unusable;
        self
    }

    /// Ids in ascending order
    pub fn into_sorted_ids(self) -> Vec<EntryId> {
        let mut ids = self.ids;
        ids.sort_unstable();
        ids
    }
}

impl FromIterator<EntryId> for CandidateSet {
    fn from_iter<I: IntoIterator<Item = EntryId>>(iter: I) -> Self {
        let mut set = CandidateSet::default();
        for id in iter {
            set.add(id);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(ids: &[u64]) -> CandidateSet {
        ids.iter().map(|n| EntryId::new(*n)).collect()
    }

    #[test]
    fn test_add_keeps_insertion_order() {
        let s = set(&[3, 1, 3, 2, 1]);
        let got: Vec<u64> = s.ids().iter().map(|i| i.as_u64()).collect();
        assert_eq!(got, vec![3, 1, 2]);
        assert_eq!(s.size(), 3);
    }

    #[test]
    fn test_and_intersects() {
        let got = set(&[1, 2, 3, 4]).and(&set(&[4, 2, 9]));
        assert_eq!(got.into_sorted_ids(), vec![EntryId::new(2), EntryId::new(4)]);
    }

    #[test]
    fn test_or_unions() {
        let got = set(&[1, 2]).or(&set(&[2, 3]));
        assert_eq!(got.size(), 3);
        assert!(got.is_authoritative());
    }

    #[test]
    fn test_unusable_constructor() {
        let s = CandidateSet::unusable();
        assert!(s.is_unusable());
        assert!(!s.is_partial());
        assert!(s.is_empty());
    }

    proptest! {
        #[test]
        fn prop_add_is_idempotent(id in any::<u64>(), times in 1usize..20) {
            let mut s = CandidateSet::new(0);
            for _ in 0..times {
                s.add(EntryId::new(id));
            }
            prop_assert_eq!(s.size(), 1);
        }

        #[test]
        fn prop_flags_never_improve(
            a in proptest::collection::vec(0u64..50, 0..20),
            b in proptest::collection::vec(0u64..50, 0..20),
            a_partial: bool, a_unusable: bool, b_partial: bool, b_unusable: bool,
        ) {
            let mut left = set(&a);
            let mut right = set(&b);
            if a_partial { left.mark_partial(); }
            if a_unusable { left.mark_unusable(); }
            if b_partial { right.mark_partial(); }
            if b_unusable { right.mark_unusable(); }

            let and = left.clone().and(&right);
            prop_assert_eq!(and.is_partial(), a_partial || b_partial);
            prop_assert_eq!(and.is_unusable(), a_unusable || b_unusable);

            let or = left.or(&right);
            prop_assert_eq!(or.is_partial(), a_partial || b_partial);
            prop_assert_eq!(or.is_unusable(), a_unusable || b_unusable);
        }
    }
}
