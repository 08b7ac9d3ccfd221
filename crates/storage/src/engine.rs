//! KvEngine: ordered in-memory key-value engine with named tables
//!
//! This module implements the storage backend every index sits on:
//! - Named tables of `BTreeMap<key, BTreeSet<value>>`, each with its own key order
//! - Duplicate-value tables (sorted duplicates, numeric order for EntryID values)
//! - `parking_lot::RwLock` around an `Arc` catalog for snapshot reads
//! - A single writer `Mutex`, so write transactions are serialized
//!
//! # Design Notes
//!
//! - **Copy-on-write tables**: a write transaction clones the catalog (cheap,
//!   one `Arc` per table) and `Arc::make_mut`s only the tables it touches.
//! - **Snapshot reads**: a read transaction holds the catalog `Arc` current at
//!   begin; commits swap in a new catalog and never disturb open readers.
//! - **Cursors own their table**: a cursor clones the table `Arc`, so it stays
//!   valid no matter what happens to the transaction that opened it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::key::length_then_magnitude;
use crate::txn::{ReadTxn, WriteTxn};

// ============================================================================
// Key ordering
// ============================================================================

/// Comparison function of a table's keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyOrdering {
    /// Plain bytewise order
    Lexical,
    /// Shorter keys first, equal lengths bytewise
    LengthThenMagnitude,
    /// First byte (key tag) bytewise, remainder length-then-magnitude
    ///
    /// Used by numeric attribute indices so that forward and reverse keys
    /// form two contiguous ranges.
    TagThenLengthMagnitude,
}

impl KeyOrdering {
    /// Compare two keys
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyOrdering::Lexical => a.cmp(b),
            KeyOrdering::LengthThenMagnitude => length_then_magnitude(a, b),
            KeyOrdering::TagThenLengthMagnitude => match (a.split_first(), b.split_first()) {
                (Some((ta, ra)), Some((tb, rb))) => {
                    ta.cmp(tb).then_with(|| length_then_magnitude(ra, rb))
                }
                _ => a.len().cmp(&b.len()),
            },
        }
    }
}

/// Byte string carrying the order it sorts by
#[derive(Debug, Clone)]
pub(crate) struct OrderedKey {
    ordering: KeyOrdering,
    bytes: Vec<u8>,
}

impl OrderedKey {
    fn new(ordering: KeyOrdering, bytes: &[u8]) -> Self {
        Self {
            ordering,
            bytes: bytes.to_vec(),
        }
    }
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering.compare(&self.bytes, &other.bytes)
    }
}

// ============================================================================
// Table
// ============================================================================

/// Static description of a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    /// Table name, unique within the engine
    pub name: String,
    /// Key order
    pub ordering: KeyOrdering,
    /// Whether a key may carry several values
    pub duplicates: bool,
}

impl TableSpec {
    /// One value per key
    pub fn unique(name: impl Into<String>, ordering: KeyOrdering) -> Self {
        Self {
            name: name.into(),
            ordering,
            duplicates: false,
        }
    }

    /// Sorted duplicate values per key
    pub fn with_duplicates(name: impl Into<String>, ordering: KeyOrdering) -> Self {
        Self {
            name: name.into(),
            ordering,
            duplicates: true,
        }
    }
}

/// Duplicate values are EntryID byte strings and sort numerically
const VALUE_ORDERING: KeyOrdering = KeyOrdering::LengthThenMagnitude;

/// One named, ordered table
#[derive(Debug, Clone)]
pub struct Table {
    spec: TableSpec,
    rows: BTreeMap<OrderedKey, BTreeSet<OrderedKey>>,
    pairs: usize,
}

impl Table {
    pub(crate) fn new(spec: TableSpec) -> Self {
        Self {
            spec,
            rows: BTreeMap::new(),
            pairs: 0,
        }
    }

    /// Table description
    pub fn spec(&self) -> &TableSpec {
        &self.spec
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Key order of this table
    pub fn ordering(&self) -> KeyOrdering {
        self.spec.ordering
    }

    fn wrap_key(&self, key: &[u8]) -> OrderedKey {
        OrderedKey::new(self.spec.ordering, key)
    }

    fn wrap_value(value: &[u8]) -> OrderedKey {
        OrderedKey::new(VALUE_ORDERING, value)
    }

    /// First value stored under `key`
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.rows
            .get(&self.wrap_key(key))
            .and_then(|set| set.iter().next())
            .map(|v| v.bytes.as_slice())
    }

    /// All values stored under `key`, in duplicate order
    pub fn values(&self, key: &[u8]) -> impl Iterator<Item = &[u8]> + '_ {
        self.rows
            .get(&self.wrap_key(key))
            .into_iter()
            .flat_map(|set| set.iter().map(|v| v.bytes.as_slice()))
    }

    /// Whether any value is stored under `key`
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.rows.contains_key(&self.wrap_key(key))
    }

    /// Whether exactly this pair is stored
    pub fn contains_pair(&self, key: &[u8], value: &[u8]) -> bool {
        self.rows
            .get(&self.wrap_key(key))
            .map(|set| set.contains(&Self::wrap_value(value)))
            .unwrap_or(false)
    }

    /// Number of distinct keys
    pub fn key_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of stored pairs
    pub fn len(&self) -> usize {
        self.pairs
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.pairs == 0
    }

    /// Store a pair
    ///
    /// Unique tables replace the existing value; duplicate tables add the
    /// value to the key's set. Returns true if the table changed.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> bool {
        let wrapped = self.wrap_key(key);
        let duplicates = self.spec.duplicates;
        let set = self.rows.entry(wrapped).or_default();
        let value = Self::wrap_value(value);
        if duplicates {
            let added = set.insert(value);
            if added {
                self.pairs += 1;
            }
            added
        } else {
            if set.contains(&value) {
                return false;
            }
            if set.is_empty() {
                self.pairs += 1;
            }
            set.clear();
            set.insert(value);
            true
        }
    }

    /// Store a pair unless the key (unique table) or pair (duplicate table) exists
    ///
    /// Returns false and leaves the table untouched on conflict.
    pub fn put_no_overwrite(&mut self, key: &[u8], value: &[u8]) -> bool {
        let occupied = if self.spec.duplicates {
            self.contains_pair(key, value)
        } else {
            self.contains_key(key)
        };
        if occupied {
            return false;
        }
        self.put(key, value)
    }

    /// Remove every value stored under `key`
    pub fn delete_key(&mut self, key: &[u8]) -> bool {
        match self.rows.remove(&self.wrap_key(key)) {
            Some(set) => {
                self.pairs -= set.len();
                true
            }
            None => false,
        }
    }

    /// Remove one pair
    pub fn delete_pair(&mut self, key: &[u8], value: &[u8]) -> bool {
        let wrapped = self.wrap_key(key);
        let Some(set) = self.rows.get_mut(&wrapped) else {
            return false;
        };
        if !set.remove(&Self::wrap_value(value)) {
            return false;
        }
        self.pairs -= 1;
        if set.is_empty() {
            self.rows.remove(&wrapped);
        }
        true
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// Iteration direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending keys, ascending duplicates
    Forward,
    /// Descending keys, descending duplicates
    Backward,
}

/// Where a cursor starts, relative to its direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorStart {
    /// First pair in iteration order
    First,
    /// First key at or past `key` in iteration order
    At(Vec<u8>),
    /// Strictly past the pair `(key, value)`; resumes an earlier cursor
    After {
        /// Key of the last pair seen
        key: Vec<u8>,
        /// Value of the last pair seen
        value: Vec<u8>,
    },
}

/// Iterator over (key, value) pairs of one table
///
/// Yields one item per duplicate value. The cursor owns an `Arc` of the
/// table snapshot it was opened on.
#[derive(Debug)]
pub struct Cursor {
    table: Arc<Table>,
    direction: Direction,
    start: Option<CursorStart>,
    position: Option<(OrderedKey, OrderedKey)>,
    exhausted: bool,
}

impl Cursor {
    /// Open a cursor on a table snapshot
    pub fn new(table: Arc<Table>, start: CursorStart, direction: Direction) -> Self {
        Self {
            table,
            direction,
            start: Some(start),
            position: None,
            exhausted: false,
        }
    }

    /// Key order of the underlying table
    pub fn ordering(&self) -> KeyOrdering {
        self.table.ordering()
    }

    /// Last pair yielded
    pub fn position(&self) -> Option<(&[u8], &[u8])> {
        self.position
            .as_ref()
            .map(|(k, v)| (k.bytes.as_slice(), v.bytes.as_slice()))
    }

    fn first_from(&self, bound: Bound<&OrderedKey>) -> Option<(OrderedKey, OrderedKey)> {
        let rows = &self.table.rows;
        let found = match self.direction {
            Direction::Forward => rows
                .range::<OrderedKey, _>((bound, Bound::Unbounded))
                .next()
                .and_then(|(k, set)| set.iter().next().map(|v| (k, v))),
            Direction::Backward => rows
                .range::<OrderedKey, _>((Bound::Unbounded, bound))
                .next_back()
                .and_then(|(k, set)| set.iter().next_back().map(|v| (k, v))),
        };
        found.map(|(k, v)| (k.clone(), v.clone()))
    }

    fn after(&self, key: &OrderedKey, value: &OrderedKey) -> Option<(OrderedKey, OrderedKey)> {
        if let Some(set) = self.table.rows.get(key) {
            let sibling = match self.direction {
                Direction::Forward => set
                    .range::<OrderedKey, _>((Bound::Excluded(value), Bound::Unbounded))
                    .next(),
                Direction::Backward => set
                    .range::<OrderedKey, _>((Bound::Unbounded, Bound::Excluded(value)))
                    .next_back(),
            };
            if let Some(v) = sibling {
                return Some((key.clone(), v.clone()));
            }
        }
        self.first_from(Bound::Excluded(key))
    }
}

impl Iterator for Cursor {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let next = match (&self.position, self.start.take()) {
            (Some((k, v)), _) => self.after(k, v),
            (None, None) | (None, Some(CursorStart::First)) => self.first_from(Bound::Unbounded),
            (None, Some(CursorStart::At(key))) => {
                let key = self.table.wrap_key(&key);
                self.first_from(Bound::Included(&key))
            }
            (None, Some(CursorStart::After { key, value })) => {
                let key = self.table.wrap_key(&key);
                let value = Table::wrap_value(&value);
                self.after(&key, &value)
            }
        };
        match next {
            Some((k, v)) => {
                let item = (k.bytes.clone(), v.bytes.clone());
                self.position = Some((k, v));
                Some(item)
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

// ============================================================================
// KvEngine
// ============================================================================

/// Set of tables visible to one transaction
#[derive(Debug, Clone, Default)]
pub(crate) struct Catalog {
    pub(crate) tables: FxHashMap<String, Arc<Table>>,
}

/// Ordered key-value engine
///
/// Thread-safe: any number of concurrent read transactions, one write
/// transaction at a time.
#[derive(Debug, Default)]
pub struct KvEngine {
    /// Committed catalog
    state: RwLock<Arc<Catalog>>,
    /// Held by the active write transaction
    writer: Mutex<()>,
    /// Number of committed write transactions
    commits: AtomicU64,
}

impl KvEngine {
    /// Create an empty engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a read transaction on the latest committed state
    pub fn begin_read(&self) -> ReadTxn {
        let catalog = Arc::clone(&self.state.read());
        ReadTxn::new(catalog, self.commit_count())
    }

    /// Begin a write transaction
    ///
    /// Blocks while another write transaction is active.
    pub fn begin_write(&self) -> WriteTxn<'_> {
        let guard = self.writer.lock();
        let catalog = Catalog::clone(&self.state.read());
        WriteTxn::new(self, guard, catalog)
    }

    /// Number of committed write transactions
    pub fn commit_count(&self) -> u64 {
        self.commits.load(AtomicOrdering::Acquire)
    }

    /// Publish a catalog; called by `WriteTxn::commit` with the writer lock held
    pub(crate) fn publish(&self, catalog: Catalog) -> u64 {
        *self.state.write() = Arc::new(catalog);
        self.commits.fetch_add(1, AtomicOrdering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::encode_entry_id;
    use crate::txn::KvRead;
    use dirstore_core::EntryId;

    fn id(n: u64) -> Vec<u8> {
        encode_entry_id(EntryId::new(n))
    }

    fn dup_table() -> Table {
        Table::new(TableSpec::with_duplicates("t", KeyOrdering::Lexical))
    }

    #[test]
    fn test_tag_then_length_magnitude_separates_tags() {
        let ord = KeyOrdering::TagThenLengthMagnitude;
        assert_eq!(ord.compare(b"F9", b"F10"), Ordering::Less);
        assert_eq!(ord.compare(b"F99999", b"R0"), Ordering::Less);
        assert_eq!(ord.compare(b"F", b"F0"), Ordering::Less);
        assert_eq!(ord.compare(b"", b"F"), Ordering::Less);
        // Length-first would interleave the tags
        assert_eq!(
            KeyOrdering::LengthThenMagnitude.compare(b"F99999", b"R0"),
            Ordering::Greater
        );
    }

    #[test]
    fn test_unique_table_put_replaces() {
        let mut t = Table::new(TableSpec::unique("u", KeyOrdering::Lexical));
        assert!(t.put(b"k", &id(1)));
        assert!(t.put(b"k", &id(2)));
        assert_eq!(t.get(b"k"), Some(id(2).as_slice()));
        assert_eq!(t.len(), 1);
        assert!(!t.put_no_overwrite(b"k", &id(3)));
        assert_eq!(t.get(b"k"), Some(id(2).as_slice()));
    }

    #[test]
    fn test_duplicates_sorted_numerically() {
        let mut t = dup_table();
        for n in [300u64, 2, 256, 9] {
            t.put(b"k", &id(n));
        }
        let got: Vec<Vec<u8>> = t.values(b"k").map(|v| v.to_vec()).collect();
        assert_eq!(got, vec![id(2), id(9), id(256), id(300)]);
        assert_eq!(t.len(), 4);
        assert_eq!(t.key_count(), 1);
    }

    #[test]
    fn test_delete_pair_drops_empty_key() {
        let mut t = dup_table();
        t.put(b"k", &id(1));
        t.put(b"k", &id(2));
        assert!(t.delete_pair(b"k", &id(1)));
        assert!(!t.delete_pair(b"k", &id(1)));
        assert!(t.contains_key(b"k"));
        assert!(t.delete_pair(b"k", &id(2)));
        assert!(!t.contains_key(b"k"));
        assert!(t.is_empty());
    }

    #[test]
    fn test_cursor_forward_yields_every_duplicate() {
        let mut t = dup_table();
        t.put(b"a", &id(2));
        t.put(b"a", &id(1));
        t.put(b"b", &id(3));
        let cursor = Cursor::new(Arc::new(t), CursorStart::First, Direction::Forward);
        let got: Vec<(Vec<u8>, Vec<u8>)> = cursor.collect();
        assert_eq!(
            got,
            vec![
                (b"a".to_vec(), id(1)),
                (b"a".to_vec(), id(2)),
                (b"b".to_vec(), id(3)),
            ]
        );
    }

    #[test]
    fn test_cursor_backward_from_key() {
        let mut t = dup_table();
        t.put(b"a", &id(1));
        t.put(b"c", &id(2));
        t.put(b"c", &id(3));
        t.put(b"e", &id(4));
        let cursor = Cursor::new(
            Arc::new(t),
            CursorStart::At(b"d".to_vec()),
            Direction::Backward,
        );
        let got: Vec<Vec<u8>> = cursor.map(|(_, v)| v).collect();
        assert_eq!(got, vec![id(3), id(2), id(1)]);
    }

    #[test]
    fn test_cursor_resumes_after_pair() {
        let mut t = dup_table();
        t.put(b"a", &id(1));
        t.put(b"a", &id(2));
        t.put(b"b", &id(3));
        let table = Arc::new(t);
        let resumed = Cursor::new(
            Arc::clone(&table),
            CursorStart::After {
                key: b"a".to_vec(),
                value: id(1),
            },
            Direction::Forward,
        );
        let got: Vec<Vec<u8>> = resumed.map(|(_, v)| v).collect();
        assert_eq!(got, vec![id(2), id(3)]);

        // Resume point whose pair no longer exists
        let gone = Cursor::new(
            table,
            CursorStart::After {
                key: b"a5".to_vec(),
                value: id(9),
            },
            Direction::Forward,
        );
        let got: Vec<Vec<u8>> = gone.map(|(_, v)| v).collect();
        assert_eq!(got, vec![id(3)]);
    }

    #[test]
    fn test_read_snapshot_isolated_from_later_commit() {
        let engine = KvEngine::new();
        let mut w = engine.begin_write();
        w.create_table(TableSpec::unique("t", KeyOrdering::Lexical))
            .unwrap();
        w.table_mut("t").unwrap().put(b"k", b"v1");
        w.commit().unwrap();

        let reader = engine.begin_read();
        let mut w = engine.begin_write();
        w.table_mut("t").unwrap().put(b"k", b"v2");
        w.commit().unwrap();

        assert_eq!(reader.table("t").unwrap().get(b"k"), Some(&b"v1"[..]));
        let fresh = engine.begin_read();
        assert_eq!(fresh.table("t").unwrap().get(b"k"), Some(&b"v2"[..]));
        assert_eq!(engine.commit_count(), 2);
    }

    #[test]
    fn test_dropped_write_txn_discards_changes() {
        let engine = KvEngine::new();
        let mut w = engine.begin_write();
        w.create_table(TableSpec::unique("t", KeyOrdering::Lexical))
            .unwrap();
        w.commit().unwrap();

        {
            let mut w = engine.begin_write();
            w.table_mut("t").unwrap().put(b"k", b"v");
        }
        let r = engine.begin_read();
        assert!(r.table("t").unwrap().is_empty());
        assert_eq!(engine.commit_count(), 1);
    }
}
