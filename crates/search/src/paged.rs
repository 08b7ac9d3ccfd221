//! Paged search with read-transaction renewal
//!
//! A [`PagedSearch`] hands out pages of matching entries. Each page resumes
//! from a [`PageCookie`] naming the last (index key, EntryID) pair returned.
//! Underneath, a [`ResumableScan`] walks either an index range or the entry
//! table and, every `page_renew_steps` cursor steps, drops its read
//! transaction and repositions a fresh one just past the last pair seen.
//! Entries written between renewals may therefore show up in later pages.

use std::cmp::Ordering;
use std::io::{Cursor as IoCursor, Read};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use tracing::debug;

use dirstore_core::{Dn, Entry, EntryId, Error, Result};
use dirstore_storage::key::encode_entry_id;
use dirstore_storage::{CursorStart, Direction, EntryCursor, EntryStore, IndexCursor, ReadTxn};

use crate::filter::{Filter, FilterKind};
use crate::scan::{plan_leaf, LeafPlan, RangeScan};
use crate::search::{Collector, Scope};

// ============================================================================
// PageCookie
// ============================================================================

/// Resume point of a paged search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCookie {
    key: Vec<u8>,
    id: EntryId,
}

impl PageCookie {
    /// Cookie resuming after `(key, id)`
    pub fn new(key: Vec<u8>, id: EntryId) -> Self {
        Self { key, id }
    }

    /// Index key of the last pair returned
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// EntryID of the last pair returned
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Opaque byte form: `u32 key length ++ key ++ u64 id`, big-endian
    pub fn encode(&self) -> Vec<u8> {
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, self.key.len() as u32);
        let mut id = [0u8; 8];
        BigEndian::write_u64(&mut id, self.id.as_u64());

        let mut out = Vec::with_capacity(4 + self.key.len() + 8);
        out.extend_from_slice(&len);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&id);
        out
    }

    /// Parse the byte form
    ///
    /// # Errors
    /// `InvalidParameter` if the bytes are not a cookie.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bad = |_| Error::InvalidParameter("malformed page cookie".to_string());
        let mut rdr = IoCursor::new(bytes);
        let len = rdr.read_u32::<BigEndian>().map_err(bad)? as usize;
        if bytes.len() != 4 + len + 8 {
            return Err(Error::InvalidParameter("malformed page cookie".to_string()));
        }
        let mut key = vec![0u8; len];
        rdr.read_exact(&mut key).map_err(bad)?;
        let id = rdr.read_u64::<BigEndian>().map_err(bad)?;
        Ok(Self::new(key, EntryId::new(id)))
    }

    /// Base64 text form, for protocols that carry cookies as strings
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.encode())
    }

    /// Parse the base64 text form
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(s)
            .map_err(|e| Error::InvalidParameter(format!("page cookie is not base64: {}", e)))?;
        Self::decode(&bytes)
    }
}

// ============================================================================
// ResumableScan
// ============================================================================

/// What a resumable scan walks
#[derive(Debug, Clone)]
pub(crate) enum ScanSource {
    /// An index range; keys re-checked against the range predicate
    Index(RangeScan),
    /// The entry table in EntryID order
    Entries,
}

enum SourceCursor {
    Index(IndexCursor),
    Entries(EntryCursor),
}

/// Lazy, finite sequence of `(resume point, entry)` pairs
///
/// Renews its read transaction every `renew_steps` cursor steps and can be
/// restarted from any cookie it produced.
pub struct ResumableScan {
    store: Arc<EntryStore>,
    source: ScanSource,
    renew_steps: usize,
    txn: ReadTxn,
    cursor: SourceCursor,
    last: Option<PageCookie>,
    steps: usize,
    renewals: u64,
    done: bool,
}

impl ResumableScan {
    pub(crate) fn open(
        store: Arc<EntryStore>,
        source: ScanSource,
        resume: Option<PageCookie>,
        renew_steps: usize,
    ) -> Result<Self> {
        let txn = store.begin_read();
        let cursor = Self::position(&store, &txn, &source, resume.as_ref())?;
        Ok(Self {
            store,
            source,
            renew_steps: renew_steps.max(1),
            txn,
            cursor,
            last: resume,
            steps: 0,
            renewals: 0,
            done: false,
        })
    }

    fn position(
        store: &EntryStore,
        txn: &ReadTxn,
        source: &ScanSource,
        after: Option<&PageCookie>,
    ) -> Result<SourceCursor> {
        match source {
            ScanSource::Index(range) => {
                let start = match after {
                    Some(cookie) => CursorStart::After {
                        key: cookie.key.clone(),
                        value: encode_entry_id(cookie.id),
                    },
                    None => CursorStart::At(range.start.clone()),
                };
                Ok(SourceCursor::Index(range.db.scan(txn, start, Direction::Forward)?))
            }
            ScanSource::Entries => Ok(SourceCursor::Entries(
                store.scan_entries(txn, after.map(|c| c.id))?,
            )),
        }
    }

    /// Drop the read transaction and reposition after the last pair seen
    fn renew(&mut self) -> Result<()> {
        self.txn = self.store.begin_read();
        self.cursor = Self::position(&self.store, &self.txn, &self.source, self.last.as_ref())?;
        self.steps = 0;
        self.renewals += 1;
        debug!(renewals = self.renewals, "paged scan renewed its read transaction");
        Ok(())
    }

    /// Number of transaction renewals so far
    pub fn renewals(&self) -> u64 {
        self.renewals
    }

    fn step(&mut self) -> Result<Option<(PageCookie, Entry)>> {
        loop {
            if self.steps >= self.renew_steps {
                self.renew()?;
            }
            self.steps += 1;
            match &mut self.cursor {
                SourceCursor::Index(cursor) => {
                    let Some(item) = cursor.next() else {
                        return Ok(None);
                    };
                    let (key, id) = item?;
                    // After a renewal the data may have moved under the cursor
                    let ScanSource::Index(range) = &self.source else {
                        return Ok(None);
                    };
                    if !range.predicate.accepts(&key) {
                        return Ok(None);
                    }
                    let entry = match self.store.get_by_id_in(&self.txn, id) {
                        Ok(entry) => entry,
                        Err(Error::EntryNotFound(_)) => {
                            self.last = Some(PageCookie::new(key, id));
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    let first = first_key_in_range(&self.store, range, &entry)?;
                    let cookie = PageCookie::new(key, id);
                    self.last = Some(cookie.clone());
                    // An entry with several values in range is emitted at its first key only
                    if first.map_or(true, |first| first == cookie.key) {
                        return Ok(Some((cookie, entry)));
                    }
                }
                SourceCursor::Entries(cursor) => {
                    let Some(item) = cursor.next() else {
                        return Ok(None);
                    };
                    let (id, entry) = item?;
                    let cookie = PageCookie::new(encode_entry_id(id), id);
                    self.last = Some(cookie.clone());
                    return Ok(Some((cookie, entry)));
                }
            }
        }
    }
}

/// Smallest key of `entry` the range walk visits
///
/// `None` for structural tables, where each entry appears under one key.
fn first_key_in_range(
    store: &EntryStore,
    range: &RangeScan,
    entry: &Entry,
) -> Result<Option<Vec<u8>>> {
    let Some(index) = range
        .attribute
        .as_deref()
        .and_then(|name| store.attribute_index(name))
    else {
        return Ok(None);
    };
    let Some(attr) = entry.attribute(&index.descriptor().name) else {
        return Ok(None);
    };
    let ordering = range.db.ordering();
    let mut first: Option<Vec<u8>> = None;
    for value in attr.values() {
        for key in store.value_keys(index, value.normalized())? {
            if !range.covers(&key) {
                continue;
            }
            let smaller = first
                .as_deref()
                .map_or(true, |f| ordering.compare(&key, f) == Ordering::Less);
            if smaller {
                first = Some(key);
            }
        }
    }
    Ok(first)
}

impl Iterator for ResumableScan {
    type Item = Result<(PageCookie, Entry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// ============================================================================
// PagedSearch
// ============================================================================

/// One page of a paged search
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Matching entries of this page
    pub entries: Vec<Entry>,
    /// Resume point for the next page, `None` once the scan is exhausted
    pub cookie: Option<PageCookie>,
}

/// Handle producing successive pages of one search
#[derive(Debug)]
pub struct PagedSearch {
    store: Arc<EntryStore>,
    filter: Filter,
    base: Dn,
    scope: Scope,
    page_size: usize,
    renew_steps: usize,
    renewals: u64,
}

impl PagedSearch {
    /// Create a paged search
    ///
    /// # Errors
    /// `InvalidParameter` if `page_size` is 0.
    pub fn new(
        store: Arc<EntryStore>,
        filter: Filter,
        base: Dn,
        scope: Scope,
        page_size: usize,
    ) -> Result<Self> {
        if page_size == 0 {
            return Err(Error::InvalidParameter(
                "page size must be greater than 0".to_string(),
            ));
        }
        let renew_steps = store.config().page_renew_steps;
        Ok(Self {
            store,
            filter,
            base,
            scope,
            page_size,
            renew_steps,
            renewals: 0,
        })
    }

    /// Override the number of steps between transaction renewals
    pub fn with_renew_steps(mut self, steps: usize) -> Self {
        self.renew_steps = steps.max(1);
        self
    }

    /// Transaction renewals performed across all pages so far
    pub fn renewals(&self) -> u64 {
        self.renewals
    }

    /// Pick the scan source: an index range if the filter has an indexable
    /// leaf at the top (or directly under a top-level AND), the ParentID
    /// range for a one-level scope, the entry table otherwise
    fn choose_source(&self) -> Result<Option<ScanSource>> {
        let txn = self.store.begin_read();
        let leaves: Vec<&Filter> = match self.filter.kind() {
            FilterKind::And(children) => children.iter().filter(|c| c.is_leaf()).collect(),
            _ if self.filter.is_leaf() => vec![&self.filter],
            _ => Vec::new(),
        };
        for leaf in leaves {
            match plan_leaf(&self.store, &txn, leaf)? {
                LeafPlan::Empty => return Ok(None),
                LeafPlan::Unusable => continue,
                plan => return Ok(plan.into_range().map(ScanSource::Index)),
            }
        }
        if self.scope == Scope::OneLevel && !self.base.is_root() {
            let one_level = Filter::one_level(self.base.clone());
            if let Some(range) = plan_leaf(&self.store, &txn, &one_level)?.into_range() {
                return Ok(Some(ScanSource::Index(range)));
            }
        }
        Ok(Some(ScanSource::Entries))
    }

    /// Fetch the page following `cookie` (the first page for `None`)
    ///
    /// A full page always carries a cookie; the page after it may be empty.
    ///
    /// # Errors
    /// `EntryNotFound` if a non-empty base DN is not stored.
    pub fn next_page(&mut self, cookie: Option<&PageCookie>) -> Result<Page> {
        self.filter.reset();
        if !self.base.is_root() {
            self.store.id_of_dn_in(&self.store.begin_read(), &self.base)?;
        } else if self.scope == Scope::Base {
            return Ok(Page::default());
        }

        let Some(source) = self.choose_source()? else {
            return Ok(Page::default());
        };
        let mut scan = ResumableScan::open(
            Arc::clone(&self.store),
            source,
            cookie.cloned(),
            self.renew_steps,
        )?;

        let collector = Collector::new(&self.filter, &self.base, self.scope, 0);
        let mut page = Page::default();
        let mut full = false;
        for item in scan.by_ref() {
            let (position, entry) = item?;
            if !collector.matches(&entry) {
                continue;
            }
            page.entries.push(entry);
            if page.entries.len() >= self.page_size {
                page.cookie = Some(position);
                full = true;
                break;
            }
        }
        self.renewals += scan.renewals();
        if !full {
            page.cookie = None;
        }
        Ok(page)
    }

    /// Drain every remaining page into one list
    pub fn collect_all(&mut self) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        let mut cookie = None;
        loop {
            let page = self.next_page(cookie.as_ref())?;
            out.extend(page.entries);
            match page.cookie {
                Some(next) => cookie = Some(next),
                None => return Ok(out),
            }
        }
    }
}
