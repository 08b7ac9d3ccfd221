//! Index scanner: turns filter leaves into candidate sets
//!
//! Every leaf is first planned into a [`LeafPlan`], which names the index
//! table, the first key to visit and the predicate that keeps the walk
//! inside the answer. Plans are shared with the paged search, which walks
//! the same ranges across transaction renewals.
//!
//! A leaf the indices cannot narrow yields an unusable set. A walk that
//! hits `max_scan_size` stops and marks its set partial. Neither is an
//! error: the search falls back to evaluating every entry of the scope.

use std::cmp::Ordering;

use tracing::debug;

use dirstore_core::{AttributeDescriptor, Error, MatchingRule, Result};
use dirstore_storage::key::{encode_entry_id, encode_forward, encode_reverse, FWD_TAG};
use dirstore_storage::{CursorStart, Direction, EntryStore, IndexDb, KeyOrdering, KvRead};

use crate::candidate::CandidateSet;
use crate::filter::{Filter, FilterKind};

// ============================================================================
// Plans
// ============================================================================

/// Condition every key of a range walk must satisfy
///
/// Keys come out of the cursor in table order, so the first key that fails
/// ends the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KeyPredicate {
    /// Exactly this key (all its duplicates)
    Exact(Vec<u8>),
    /// Keys starting with these bytes; only contiguous in lexical tables
    Prefix(Vec<u8>),
    /// Keys carrying this tag byte
    Tag(u8),
    /// Keys ordering at or below `bound`
    AtMost {
        bound: Vec<u8>,
        ordering: KeyOrdering,
    },
}

impl KeyPredicate {
    pub(crate) fn accepts(&self, key: &[u8]) -> bool {
        match self {
            KeyPredicate::Exact(k) => key == k.as_slice(),
            KeyPredicate::Prefix(p) => key.starts_with(p),
            KeyPredicate::Tag(t) => key.first() == Some(t),
            KeyPredicate::AtMost { bound, ordering } => {
                ordering.compare(key, bound) != Ordering::Greater
            }
        }
    }
}

/// Forward walk over one index table
#[derive(Debug, Clone)]
pub(crate) struct RangeScan {
    pub(crate) db: IndexDb,
    pub(crate) start: Vec<u8>,
    pub(crate) predicate: KeyPredicate,
    /// Attribute whose values the keys encode; `None` for structural tables
    pub(crate) attribute: Option<String>,
}

impl RangeScan {
    fn exact(db: IndexDb, key: Vec<u8>, attribute: Option<String>) -> Self {
        Self {
            db,
            start: key.clone(),
            predicate: KeyPredicate::Exact(key),
            attribute,
        }
    }

    /// Whether the walk visits `key`: at or after the start, inside the predicate
    pub(crate) fn covers(&self, key: &[u8]) -> bool {
        self.db.ordering().compare(key, &self.start) != Ordering::Less
            && self.predicate.accepts(key)
    }
}

/// How one filter leaf is served by the indices
#[derive(Debug, Clone)]
pub(crate) enum LeafPlan {
    /// No index narrows the leaf
    Unusable,
    /// No entry can match
    Empty,
    /// Single probe of a unique index
    Lookup {
        db: IndexDb,
        key: Vec<u8>,
        attribute: String,
    },
    /// Cursor walk
    Range(RangeScan),
}

impl LeafPlan {
    /// The plan as a range walk, if it reads an index at all
    pub(crate) fn into_range(self) -> Option<RangeScan> {
        match self {
            LeafPlan::Lookup { db, key, attribute } => {
                Some(RangeScan::exact(db, key, Some(attribute)))
            }
            LeafPlan::Range(range) => Some(range),
            LeafPlan::Unusable | LeafPlan::Empty => None,
        }
    }
}

/// Whether an index table's key order agrees with a rule's value order
fn order_matches(rule: MatchingRule, ordering: KeyOrdering) -> bool {
    match rule {
        MatchingRule::Integer => ordering == KeyOrdering::TagThenLengthMagnitude,
        MatchingRule::CaseIgnore | MatchingRule::CaseExact | MatchingRule::Octet => {
            ordering == KeyOrdering::Lexical
        }
        MatchingRule::DistinguishedName => false,
    }
}

// ============================================================================
// IndexScanner
// ============================================================================

/// Computes candidate sets inside one read transaction
pub struct IndexScanner<'a, T: KvRead> {
    store: &'a EntryStore,
    txn: &'a T,
    max_scan_size: usize,
}

impl<'a, T: KvRead> IndexScanner<'a, T> {
    /// Scanner bounded by the store's configured `max_scan_size`
    pub fn new(store: &'a EntryStore, txn: &'a T) -> Self {
        Self {
            store,
            txn,
            max_scan_size: store.config().max_scan_size,
        }
    }

    /// Override the scan bound
    pub fn with_max_scan_size(mut self, max_scan_size: usize) -> Self {
        self.max_scan_size = max_scan_size;
        self
    }

    /// Candidate set of a filter tree, memoized on each node
    ///
    /// AND intersects the children that produced a trustworthy set and
    /// ignores the others; if none did the result is unusable. OR unions its
    /// children and is unusable as soon as one child is. NOT and PRESENT are
    /// always unusable.
    pub fn candidates<'f>(&self, filter: &'f Filter) -> Result<&'f CandidateSet> {
        if let Some(memo) = filter.memoized_candidates() {
            return Ok(memo);
        }
        let set = match filter.kind() {
            FilterKind::And(children) => self.and_candidates(children)?,
            FilterKind::Or(children) => self.or_candidates(children)?,
            FilterKind::Not(_) | FilterKind::Present(_) => CandidateSet::unusable(),
            _ => self.scan(filter)?,
        };
        Ok(filter.memoize_candidates(set))
    }

    fn and_candidates(&self, children: &[Filter]) -> Result<CandidateSet> {
        let mut usable: Vec<&CandidateSet> = Vec::with_capacity(children.len());
        let mut partial = false;
        for child in children {
            let set = self.candidates(child)?;
            if set.is_authoritative() {
                if set.is_empty() {
                    return Ok(CandidateSet::new(0));
                }
                usable.push(set);
            } else if set.is_partial() {
                partial = true;
            }
        }
        usable.sort_by_key(|s| s.size());
        let Some((first, rest)) = usable.split_first() else {
            let mut set = CandidateSet::unusable();
            if partial {
                set.mark_partial();
            }
            return Ok(set);
        };
        Ok(rest.iter().fold((*first).clone(), |acc, set| acc.and(set)))
    }

    fn or_candidates(&self, children: &[Filter]) -> Result<CandidateSet> {
        let mut out = CandidateSet::new(0);
        for child in children {
            out = out.or(self.candidates(child)?);
            if out.is_unusable() {
                break;
            }
        }
        Ok(out)
    }

    /// Candidate set of one leaf, without memoization
    pub fn scan(&self, leaf: &Filter) -> Result<CandidateSet> {
        let plan = plan_leaf(self.store, self.txn, leaf)?;
        self.run(plan)
    }

    fn run(&self, plan: LeafPlan) -> Result<CandidateSet> {
        match plan {
            LeafPlan::Unusable => Ok(CandidateSet::unusable()),
            LeafPlan::Empty => Ok(CandidateSet::new(0)),
            LeafPlan::Lookup { db, key, .. } => {
                let mut set = CandidateSet::new(1);
                match db.get(self.txn, &key) {
                    Ok(id) => {
                        set.add(id);
                    }
                    Err(Error::KeyNotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
                Ok(set)
            }
            LeafPlan::Range(range) => self.walk(range),
        }
    }

    fn walk(&self, range: RangeScan) -> Result<CandidateSet> {
        let mut set = CandidateSet::new(self.max_scan_size.min(64));
        let cursor = range
            .db
            .scan(self.txn, CursorStart::At(range.start), Direction::Forward)?;
        for item in cursor {
            let (key, id) = item?;
            if !range.predicate.accepts(&key) {
                break;
            }
            if set.size() >= self.max_scan_size {
                debug!(
                    index = range.db.name(),
                    max_scan_size = self.max_scan_size,
                    "scan limit reached, candidate set partial"
                );
                set.mark_partial();
                break;
            }
            set.add(id);
        }
        Ok(set)
    }
}

// ============================================================================
// Planning
// ============================================================================

/// Plan a leaf against the store's indices
pub(crate) fn plan_leaf(store: &EntryStore, txn: &impl KvRead, leaf: &Filter) -> Result<LeafPlan> {
    let max_key = store.config().max_key_bytes;
    let plan = match leaf.kind() {
        FilterKind::Equality(a) => {
            let (Some(desc), Some(value)) = (a.descriptor(), a.value()) else {
                return Ok(LeafPlan::Empty);
            };
            let Some(index) = store.attribute_index(&desc.name).filter(|i| i.has_forward()) else {
                return Ok(LeafPlan::Unusable);
            };
            // Stored keys are bounded too, so an oversized assertion matches none
            let Ok(key) = encode_forward(value, max_key) else {
                return Ok(LeafPlan::Empty);
            };
            let db = index.db().clone();
            let attribute = desc.name.clone();
            if db.is_unique() {
                LeafPlan::Lookup { db, key, attribute }
            } else {
                LeafPlan::Range(RangeScan::exact(db, key, Some(attribute)))
            }
        }
        FilterKind::GreaterOrEqual(a) | FilterKind::LessOrEqual(a) => {
            let (Some(desc), Some(value)) = (a.descriptor(), a.value()) else {
                return Ok(LeafPlan::Empty);
            };
            let Some(db) = ordered_index(store, desc) else {
                return Ok(LeafPlan::Unusable);
            };
            let Ok(key) = encode_forward(value, max_key) else {
                return Ok(LeafPlan::Unusable);
            };
            if matches!(leaf.kind(), FilterKind::GreaterOrEqual(_)) {
                LeafPlan::Range(RangeScan {
                    db,
                    start: key,
                    predicate: KeyPredicate::Tag(FWD_TAG),
                    attribute: Some(desc.name.clone()),
                })
            } else {
                let ordering = db.ordering();
                LeafPlan::Range(RangeScan {
                    db,
                    start: vec![FWD_TAG],
                    predicate: KeyPredicate::AtMost {
                        bound: key,
                        ordering,
                    },
                    attribute: Some(desc.name.clone()),
                })
            }
        }
        FilterKind::Substrings(s) => {
            let Some(desc) = s.descriptor().filter(|_| !s.is_undefined()) else {
                return Ok(LeafPlan::Empty);
            };
            let Some(index) = store.attribute_index(&desc.name) else {
                return Ok(LeafPlan::Unusable);
            };
            if desc.substring != desc.equality || index.db().ordering() != KeyOrdering::Lexical {
                return Ok(LeafPlan::Unusable);
            }
            let prefix = match (s.initial(), s.final_fragment()) {
                (Some(initial), _) if !initial.is_empty() && index.has_forward() => {
                    encode_forward(initial, max_key)
                }
                (_, Some(final_)) if !final_.is_empty() && index.has_reverse() => {
                    encode_reverse(final_, max_key)
                }
                _ => return Ok(LeafPlan::Unusable),
            };
            let Ok(prefix) = prefix else {
                return Ok(LeafPlan::Empty);
            };
            LeafPlan::Range(RangeScan {
                db: index.db().clone(),
                start: prefix.clone(),
                predicate: KeyPredicate::Prefix(prefix),
                attribute: Some(desc.name.clone()),
            })
        }
        FilterKind::OneLevel(parent) => {
            // Root entries have no ParentID record
            if parent.is_root() {
                return Ok(LeafPlan::Unusable);
            }
            match store.id_of_dn_in(txn, parent) {
                Ok(id) => LeafPlan::Range(RangeScan::exact(
                    store.parent_index().clone(),
                    encode_entry_id(id),
                    None,
                )),
                Err(Error::EntryNotFound(_)) => LeafPlan::Empty,
                Err(e) => return Err(e),
            }
        }
        FilterKind::And(_) | FilterKind::Or(_) | FilterKind::Not(_) | FilterKind::Present(_) => {
            LeafPlan::Unusable
        }
    };
    Ok(plan)
}

/// Forward-keyed index whose order agrees with the attribute's ordering rule
fn ordered_index(store: &EntryStore, desc: &AttributeDescriptor) -> Option<IndexDb> {
    let rule = desc.ordering?;
    if desc.equality != Some(rule) {
        return None;
    }
    let index = store.attribute_index(&desc.name)?;
    if !index.has_forward() || !order_matches(rule, index.db().ordering()) {
        return None;
    }
    Some(index.db().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirstore_core::{Dn, Entry, EntryId, Schema, StoreConfig};
    use std::sync::Arc;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn store_with(config: StoreConfig) -> EntryStore {
        let store = EntryStore::open(Arc::new(Schema::standard()), config).unwrap();
        store
            .add(Entry::new(dn("dc=x")).with_attribute("objectClass", &["domain"]))
            .unwrap();
        store
    }

    fn person(store: &EntryStore, cn: &str, extra: &[(&str, &str)]) -> EntryId {
        let mut e = Entry::new(dn(&format!("cn={},dc=x", cn)))
            .with_attribute("objectClass", &["person"])
            .with_attribute("cn", &[cn]);
        for (name, value) in extra {
            e = e.with_attribute(name, &[value]);
        }
        store.add(e).unwrap()
    }

    fn scan(store: &EntryStore, filter: &Filter) -> CandidateSet {
        let txn = store.begin_read();
        IndexScanner::new(store, &txn).candidates(filter).unwrap().clone()
    }

    // ========================================================================
    // KeyPredicate
    // ========================================================================

    #[test]
    fn test_key_predicates() {
        assert!(KeyPredicate::Exact(b"Fa".to_vec()).accepts(b"Fa"));
        assert!(!KeyPredicate::Exact(b"Fa".to_vec()).accepts(b"Fab"));
        assert!(KeyPredicate::Prefix(b"Fa".to_vec()).accepts(b"Fab"));
        assert!(KeyPredicate::Tag(FWD_TAG).accepts(b"Fzz"));
        assert!(!KeyPredicate::Tag(FWD_TAG).accepts(b"Rzz"));
        let at_most = KeyPredicate::AtMost {
            bound: b"F20".to_vec(),
            ordering: KeyOrdering::TagThenLengthMagnitude,
        };
        assert!(at_most.accepts(b"F9"));
        assert!(at_most.accepts(b"F20"));
        assert!(!at_most.accepts(b"F100"));
    }

    // ========================================================================
    // Leaves
    // ========================================================================

    #[test]
    fn test_equality_scan() {
        let store = store_with(StoreConfig::default());
        let alice = person(&store, "Alice", &[]);
        person(&store, "Bob", &[]);
        let schema = store.schema().clone();
        let set = scan(&store, &Filter::equality(&schema, "cn", "ALICE"));
        assert!(set.is_authoritative());
        assert_eq!(set.ids(), &[alice]);
    }

    #[test]
    fn test_unique_equality_lookup() {
        let store = store_with(StoreConfig::default());
        let a = person(&store, "a", &[("uid", "jdoe")]);
        let schema = store.schema().clone();
        assert_eq!(scan(&store, &Filter::equality(&schema, "uid", "JDOE")).ids(), &[a]);
        assert!(scan(&store, &Filter::equality(&schema, "uid", "nobody")).is_empty());
    }

    #[test]
    fn test_unindexed_attribute_is_unusable() {
        let store = store_with(StoreConfig::default());
        let schema = store.schema().clone();
        let set = scan(&store, &Filter::equality(&schema, "description", "x"));
        assert!(set.is_unusable());
    }

    #[test]
    fn test_numeric_range_scans() {
        let store = store_with(StoreConfig::default());
        let mut ids = Vec::new();
        for (i, n) in ["5", "20", "100", "1000"].iter().enumerate() {
            ids.push(person(&store, &format!("p{}", i), &[("uidNumber", n)]));
        }
        let schema = store.schema().clone();

        let ge = scan(&store, &Filter::greater_or_equal(&schema, "uidNumber", "20"));
        assert!(ge.is_authoritative());
        assert_eq!(ge.into_sorted_ids(), ids[1..].to_vec());

        let le = scan(&store, &Filter::less_or_equal(&schema, "uidNumber", "100"));
        assert!(le.is_authoritative());
        assert_eq!(le.into_sorted_ids(), ids[..3].to_vec());
    }

    #[test]
    fn test_string_range_scan() {
        let store = store_with(StoreConfig::default());
        let a = person(&store, "alpha", &[]);
        let b = person(&store, "beta", &[]);
        person(&store, "gamma", &[]);
        let schema = store.schema().clone();
        let le = scan(&store, &Filter::less_or_equal(&schema, "cn", "c"));
        assert_eq!(le.into_sorted_ids(), vec![a, b]);
    }

    #[test]
    fn test_substring_initial_and_final_scans() {
        let store = store_with(StoreConfig::default());
        let john = person(&store, "John Smith", &[]);
        let jane = person(&store, "Jane Smithers", &[]);
        let schema = store.schema().clone();

        let initial = scan(&store, &Filter::substrings(&schema, "cn", Some("j"), &[], None));
        assert_eq!(initial.into_sorted_ids(), vec![john, jane]);

        let final_ = scan(&store, &Filter::substrings(&schema, "cn", None, &[], Some("smith")));
        assert_eq!(final_.ids(), &[john]);

        let any_only = scan(&store, &Filter::substrings(&schema, "cn", None, &["smith"], None));
        assert!(any_only.is_unusable());
    }

    #[test]
    fn test_one_level_scan() {
        let store = store_with(StoreConfig::default());
        let a = person(&store, "A", &[]);
        let b = person(&store, "B", &[]);
        let set = scan(&store, &Filter::one_level(dn("dc=x")));
        assert_eq!(set.into_sorted_ids(), vec![a, b]);
        assert!(scan(&store, &Filter::one_level(dn("dc=missing"))).is_empty());
        assert!(scan(&store, &Filter::one_level(Dn::root())).is_unusable());
    }

    #[test]
    fn test_scan_limit_marks_partial() {
        let store = store_with(StoreConfig::default().with_max_scan_size(5));
        for i in 0..6 {
            person(&store, &format!("p{}", i), &[]);
        }
        let set = scan(&store, &Filter::present("objectClass"));
        assert!(set.is_unusable());

        let schema = store.schema().clone();
        let set = scan(&store, &Filter::equality(&schema, "objectClass", "person"));
        assert!(set.is_partial());
        assert!(set.size() <= 5);
    }

    #[test]
    fn test_undefined_leaf_plans_empty() {
        let store = store_with(StoreConfig::default());
        let schema = store.schema().clone();
        let set = scan(&store, &Filter::equality(&schema, "unknownAttr", "x"));
        assert!(set.is_authoritative());
        assert!(set.is_empty());
    }

    // ========================================================================
    // Combination
    // ========================================================================

    #[test]
    fn test_and_skips_unusable_children() {
        let store = store_with(StoreConfig::default());
        let alice = person(&store, "Alice", &[("mail", "a@x")]);
        person(&store, "Bob", &[("mail", "b@x")]);
        let schema = store.schema().clone();
        let f = Filter::and(vec![
            Filter::equality(&schema, "cn", "alice"),
            Filter::present("mail"),
            Filter::not(Filter::equality(&schema, "cn", "bob")),
        ]);
        let set = scan(&store, &f);
        assert!(set.is_authoritative());
        assert_eq!(set.ids(), &[alice]);
    }

    #[test]
    fn test_and_of_unusable_children_is_unusable() {
        let store = store_with(StoreConfig::default());
        let f = Filter::and(vec![Filter::present("cn"), Filter::present("mail")]);
        assert!(scan(&store, &f).is_unusable());
    }

    #[test]
    fn test_or_with_unusable_child_is_unusable() {
        let store = store_with(StoreConfig::default());
        let schema = store.schema().clone();
        let usable = Filter::or(vec![
            Filter::equality(&schema, "cn", "a"),
            Filter::equality(&schema, "cn", "b"),
        ]);
        assert!(scan(&store, &usable).is_authoritative());
        let f = Filter::or(vec![Filter::equality(&schema, "cn", "a"), Filter::present("sn")]);
        assert!(scan(&store, &f).is_unusable());
    }

    #[test]
    fn test_candidates_are_memoized() {
        let store = store_with(StoreConfig::default());
        let schema = store.schema().clone();
        let f = Filter::equality(&schema, "cn", "a");
        let txn = store.begin_read();
        let scanner = IndexScanner::new(&store, &txn);
        scanner.candidates(&f).unwrap();
        assert!(f.memoized_candidates().is_some());
    }
}
