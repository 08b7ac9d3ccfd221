//! Search executor
//!
//! A search plans the filter into a candidate set, then confirms every
//! candidate with the evaluator and the scope. When the candidate set cannot
//! be trusted the executor enumerates the whole scope instead, walking the
//! ParentID index down from the base entry.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use dirstore_core::{Dn, Entry, EntryId, Error, Result};
use dirstore_storage::{EntryStore, KvRead};

use crate::evaluate::evaluate;
use crate::filter::{Filter, Truth};
use crate::paged::PagedSearch;
use crate::scan::IndexScanner;

/// Search scope relative to the base DN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The base entry only
    Base,
    /// Immediate children of the base
    OneLevel,
    /// The base and everything below it
    Subtree,
}

impl Scope {
    /// Whether `dn` lies in this scope around `base`
    pub fn contains(&self, base: &Dn, dn: &Dn) -> bool {
        match self {
            Scope::Base => dn.normalized() == base.normalized(),
            Scope::OneLevel => dn
                .parent()
                .map(|p| p.normalized() == base.normalized())
                .unwrap_or(false),
            Scope::Subtree => dn.is_within(base),
        }
    }

    /// Whether a stored entry lies in this scope around `base`
    ///
    /// Unlike [`contains`](Scope::contains), a root entry's parent is the
    /// empty DN even when its DN has several RDNs.
    pub fn contains_entry(&self, base: &Dn, entry: &Entry) -> bool {
        match self {
            Scope::OneLevel => entry.parent_dn().normalized() == base.normalized(),
            _ => self.contains(base, entry.dn()),
        }
    }
}

/// Entries returned by a search
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    /// Matching entries
    pub entries: Vec<Entry>,
    /// More entries matched than the size limit allowed
    pub truncated: bool,
}

impl SearchResult {
    /// Number of entries returned
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing matched
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Normalized DNs of the returned entries
    pub fn dns(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.dn().normalized().to_string())
            .collect()
    }
}

/// Search interface over a shared store
#[derive(Debug, Clone)]
pub struct Searcher {
    store: Arc<EntryStore>,
}

/// Extension trait giving a shared store a search interface
pub trait StoreSearchExt {
    /// Search interface on this store
    fn searcher(&self) -> Searcher;
}

impl StoreSearchExt for Arc<EntryStore> {
    fn searcher(&self) -> Searcher {
        Searcher::new(Arc::clone(self))
    }
}

impl Searcher {
    /// Create a searcher
    pub fn new(store: Arc<EntryStore>) -> Self {
        Self { store }
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    /// Search in a fresh read transaction
    ///
    /// `size_limit` 0 means unlimited.
    ///
    /// # Errors
    /// `EntryNotFound` if a non-empty base DN is not stored.
    pub fn search(
        &self,
        filter: &mut Filter,
        base: &Dn,
        scope: Scope,
        size_limit: usize,
    ) -> Result<SearchResult> {
        let txn = self.store.begin_read();
        self.search_in(&txn, filter, base, scope, size_limit)
    }

    /// Search inside an existing transaction
    pub fn search_in(
        &self,
        txn: &impl KvRead,
        filter: &mut Filter,
        base: &Dn,
        scope: Scope,
        size_limit: usize,
    ) -> Result<SearchResult> {
        filter.reset();
        let filter = &*filter;

        let base_id = if base.is_root() {
            None
        } else {
            Some(self.store.id_of_dn_in(txn, base)?)
        };

        let mut collector = Collector::new(filter, base, scope, size_limit);

        if scope == Scope::Base {
            if let Some(id) = base_id {
                let entry = self.store.get_by_id_in(txn, id)?;
                collector.offer(entry);
            }
            return Ok(collector.finish());
        }

        let scanner = IndexScanner::new(&self.store, txn);
        let candidates = scanner.candidates(filter)?;
        if candidates.is_authoritative() {
            for id in candidates.clone().into_sorted_ids() {
                let entry = match self.store.get_by_id_in(txn, id) {
                    Ok(entry) => entry,
                    Err(Error::EntryNotFound(_)) => {
                        warn!(entry_id = id.as_u64(), "index points at a missing entry");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if !collector.offer(entry) {
                    break;
                }
            }
            return Ok(collector.finish());
        }

        debug!(
            base = %base,
            ?scope,
            partial = candidates.is_partial(),
            "candidates not usable, evaluating the whole scope"
        );
        self.enumerate_scope(txn, base_id, scope, &mut collector)?;
        Ok(collector.finish())
    }

    /// Feed every entry of the scope to the collector
    fn enumerate_scope(
        &self,
        txn: &impl KvRead,
        base_id: Option<EntryId>,
        scope: Scope,
        collector: &mut Collector<'_>,
    ) -> Result<()> {
        let Some(base_id) = base_id else {
            // Root base: every stored entry is below it
            for item in self.store.scan_entries(txn, None)? {
                let (_, entry) = item?;
                if !collector.offer(entry) {
                    break;
                }
            }
            return Ok(());
        };

        let mut queue: VecDeque<EntryId> = match scope {
            Scope::Subtree => VecDeque::from([base_id]),
            _ => self.store.children_in(txn, base_id)?.into(),
        };
        while let Some(id) = queue.pop_front() {
            if scope == Scope::Subtree {
                queue.extend(self.store.children_in(txn, id)?);
            }
            let entry = self.store.get_by_id_in(txn, id)?;
            if !collector.offer(entry) {
                break;
            }
        }
        Ok(())
    }

    /// Paged search handle
    ///
    /// # Errors
    /// `InvalidParameter` if `page_size` is 0.
    pub fn paged(
        &self,
        filter: Filter,
        base: Dn,
        scope: Scope,
        page_size: usize,
    ) -> Result<PagedSearch> {
        PagedSearch::new(Arc::clone(&self.store), filter, base, scope, page_size)
    }
}

/// Confirms entries against filter and scope, enforcing the size limit
pub(crate) struct Collector<'f> {
    filter: &'f Filter,
    base: &'f Dn,
    scope: Scope,
    size_limit: usize,
    result: SearchResult,
}

impl<'f> Collector<'f> {
    pub(crate) fn new(filter: &'f Filter, base: &'f Dn, scope: Scope, size_limit: usize) -> Self {
        Self {
            filter,
            base,
            scope,
            size_limit,
            result: SearchResult::default(),
        }
    }

    pub(crate) fn matches(&self, entry: &Entry) -> bool {
        self.scope.contains_entry(self.base, entry) && evaluate(self.filter, entry) == Truth::True
    }

    /// Offer an entry; returns false once the search should stop
    pub(crate) fn offer(&mut self, entry: Entry) -> bool {
        if !self.matches(&entry) {
            return true;
        }
        if self.size_limit > 0 && self.result.entries.len() >= self.size_limit {
            self.result.truncated = true;
            return false;
        }
        self.result.entries.push(entry);
        true
    }

    pub(crate) fn finish(self) -> SearchResult {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirstore_core::{Schema, StoreConfig};

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn populated(config: StoreConfig) -> Arc<EntryStore> {
        let store = Arc::new(EntryStore::open(Arc::new(Schema::standard()), config).unwrap());
        store
            .add(Entry::new(dn("dc=x")).with_attribute("objectClass", &["domain"]))
            .unwrap();
        store
            .add(Entry::new(dn("ou=people,dc=x")).with_attribute("objectClass", &["organizationalUnit"]))
            .unwrap();
        for (cn, parent) in [("a", "dc=x"), ("b", "dc=x"), ("c", "ou=people,dc=x")] {
            store
                .add(
                    Entry::new(dn(&format!("cn={},{}", cn, parent)))
                        .with_attribute("objectClass", &["person"])
                        .with_attribute("cn", &[cn]),
                )
                .unwrap();
        }
        store
    }

    fn sorted(mut v: Vec<String>) -> Vec<String> {
        v.sort();
        v
    }

    #[test]
    fn test_scope_contains() {
        let base = dn("dc=x");
        assert!(Scope::Base.contains(&base, &dn("DC=X")));
        assert!(Scope::OneLevel.contains(&base, &dn("cn=a,dc=x")));
        assert!(!Scope::OneLevel.contains(&base, &dn("cn=a,ou=p,dc=x")));
        assert!(Scope::Subtree.contains(&base, &dn("cn=a,ou=p,dc=x")));
        assert!(Scope::Subtree.contains(&base, &base));
        assert!(Scope::OneLevel.contains(&Dn::root(), &base));
    }

    #[test]
    fn test_configured_suffix_sits_one_level_below_root() {
        let config = StoreConfig::default().with_suffix("dc=example,dc=com");
        let store = Arc::new(EntryStore::open(Arc::new(Schema::standard()), config).unwrap());
        let suffix = store
            .add(Entry::new(dn("dc=example,dc=com")).with_attribute("objectClass", &["domain"]))
            .unwrap();
        store
            .add(Entry::new(dn("ou=a,dc=example,dc=com")).with_attribute("objectClass", &["organizationalUnit"]))
            .unwrap();
        let stored = store.get_by_id(suffix).unwrap();

        assert!(evaluate(&Filter::one_level(Dn::root()), &stored).is_true());
        assert_eq!(
            evaluate(&Filter::one_level(dn("dc=com")), &stored),
            Truth::False
        );
        assert!(Scope::OneLevel.contains_entry(&Dn::root(), &stored));

        let searcher = store.searcher();
        let mut f = Filter::present("objectClass");
        let res = searcher
            .search(&mut f, &Dn::root(), Scope::OneLevel, 0)
            .unwrap();
        assert_eq!(res.dns(), vec!["dc=example,dc=com"]);

        // Index path and evaluator agree on a parent that is not stored
        let mut f = Filter::one_level(dn("dc=com"));
        let res = searcher.search(&mut f, &Dn::root(), Scope::Subtree, 0).unwrap();
        assert!(res.is_empty());
        let mut f = Filter::one_level(Dn::root());
        let res = searcher.search(&mut f, &Dn::root(), Scope::Subtree, 0).unwrap();
        assert_eq!(res.dns(), vec!["dc=example,dc=com"]);
    }

    #[test]
    fn test_subtree_indexed_search() {
        let store = populated(StoreConfig::default());
        let schema = store.schema().clone();
        let mut f = Filter::equality(&schema, "objectClass", "person");
        let res = store
            .searcher()
            .search(&mut f, &dn("dc=x"), Scope::Subtree, 0)
            .unwrap();
        assert_eq!(
            sorted(res.dns()),
            vec!["cn=a,dc=x", "cn=b,dc=x", "cn=c,ou=people,dc=x"]
        );
        assert!(!res.truncated);
    }

    #[test]
    fn test_one_level_scope_filters_candidates() {
        let store = populated(StoreConfig::default());
        let schema = store.schema().clone();
        let mut f = Filter::equality(&schema, "objectClass", "person");
        let res = store
            .searcher()
            .search(&mut f, &dn("dc=x"), Scope::OneLevel, 0)
            .unwrap();
        assert_eq!(sorted(res.dns()), vec!["cn=a,dc=x", "cn=b,dc=x"]);
    }

    #[test]
    fn test_fallback_enumerates_scope() {
        let store = populated(StoreConfig::default());
        let mut f = Filter::present("cn");
        let res = store
            .searcher()
            .search(&mut f, &dn("ou=people,dc=x"), Scope::Subtree, 0)
            .unwrap();
        assert_eq!(res.dns(), vec!["cn=c,ou=people,dc=x"]);

        let res = store
            .searcher()
            .search(&mut f, &Dn::root(), Scope::Subtree, 0)
            .unwrap();
        assert_eq!(res.len(), 3);
    }

    #[test]
    fn test_base_scope() {
        let store = populated(StoreConfig::default());
        let mut f = Filter::present("objectClass");
        let res = store
            .searcher()
            .search(&mut f, &dn("cn=a,dc=x"), Scope::Base, 0)
            .unwrap();
        assert_eq!(res.dns(), vec!["cn=a,dc=x"]);

        let res = store
            .searcher()
            .search(&mut f, &Dn::root(), Scope::Base, 0)
            .unwrap();
        assert!(res.is_empty());
    }

    #[test]
    fn test_missing_base_is_not_found() {
        let store = populated(StoreConfig::default());
        let mut f = Filter::present("cn");
        let err = store
            .searcher()
            .search(&mut f, &dn("dc=nowhere"), Scope::Subtree, 0);
        assert!(matches!(err, Err(Error::EntryNotFound(_))));
    }

    #[test]
    fn test_size_limit_truncates() {
        let store = populated(StoreConfig::default());
        let schema = store.schema().clone();
        let mut f = Filter::equality(&schema, "objectClass", "person");
        let res = store
            .searcher()
            .search(&mut f, &dn("dc=x"), Scope::Subtree, 2)
            .unwrap();
        assert_eq!(res.len(), 2);
        assert!(res.truncated);

        let res = store
            .searcher()
            .search(&mut f, &dn("dc=x"), Scope::Subtree, 3)
            .unwrap();
        assert_eq!(res.len(), 3);
        assert!(!res.truncated);
    }

    #[test]
    fn test_filter_reusable_across_searches() {
        let store = populated(StoreConfig::default());
        let schema = store.schema().clone();
        let mut f = Filter::equality(&schema, "cn", "a");
        let searcher = store.searcher();
        assert_eq!(searcher.search(&mut f, &dn("dc=x"), Scope::Subtree, 0).unwrap().len(), 1);
        store
            .add(
                Entry::new(dn("cn=a,ou=people,dc=x"))
                    .with_attribute("objectClass", &["person"])
                    .with_attribute("cn", &["a"]),
            )
            .unwrap();
        assert_eq!(searcher.search(&mut f, &dn("dc=x"), Scope::Subtree, 0).unwrap().len(), 2);
    }
}
