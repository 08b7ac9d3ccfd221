//! EntryStore: entries, structural indices and attribute indices
//!
//! # Tables
//!
//! | table | key | value |
//! |---|---|---|
//! | `id2entry` | EntryID bytes | encoded entry blob |
//! | `dn2id` | `F ++ normalized DN` | EntryID (unique) |
//! | `parentid` | parent EntryID bytes | child EntryIDs (duplicates) |
//! | `attrmeta` | `EntryID ++ ':' ++ attribute id` | encoded [`AttributeMeta`] |
//! | `meta` | counter name | big-endian u64 |
//! | `idx.<attribute>` | `F`/`R` index key | EntryIDs |
//!
//! # Write ordering
//!
//! ADD writes the DN index first, so a duplicate DN fails before any other
//! index is touched. DELETE removes the DN index last. Everything happens in
//! one write transaction; a failure drops the transaction and nothing of the
//! operation becomes visible.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use dirstore_core::{
    AttributeDelta, AttributeDescriptor, AttributeMeta, AttributeValue, Dn, Entry, EntryId, Error,
    Result, Schema, StoreConfig,
};

use crate::engine::{Cursor, CursorStart, Direction, KeyOrdering, KvEngine, TableSpec};
use crate::index::{IndexDb, PutMode};
use crate::key::{
    attribute_meta_key, attribute_meta_prefix, decode_entry_id, encode_entry_id, encode_forward,
    encode_reverse,
};
use crate::txn::{KvRead, ReadTxn, WriteTxn};
use crate::uniqueness::{ScopeGuard, ScopeLocks, GLOBAL_SCOPE};

/// EntryID → entry blob
pub const ID2ENTRY: &str = "id2entry";
/// Normalized DN → EntryID
pub const DN2ID: &str = "dn2id";
/// Parent EntryID → child EntryIDs
pub const PARENTID: &str = "parentid";
/// Per-(entry, attribute) change metadata
pub const ATTRMETA: &str = "attrmeta";
/// Persistent counters
pub const META: &str = "meta";

const LAST_ID_KEY: &[u8] = b"nextid";
const USN_KEY: &[u8] = b"usn";

/// Table name of an attribute index
pub fn attribute_table_name(attribute: &str) -> String {
    format!("idx.{}", attribute.to_ascii_lowercase())
}

// ============================================================================
// AttributeIndex
// ============================================================================

/// An indexed attribute: its descriptor plus the table holding its keys
#[derive(Debug, Clone)]
pub struct AttributeIndex {
    descriptor: Arc<AttributeDescriptor>,
    db: IndexDb,
}

impl AttributeIndex {
    /// Attribute descriptor
    pub fn descriptor(&self) -> &Arc<AttributeDescriptor> {
        &self.descriptor
    }

    /// Backing index table
    pub fn db(&self) -> &IndexDb {
        &self.db
    }

    /// Whether forward keys are maintained
    ///
    /// Unique attributes always keep them; the uniqueness check looks up the
    /// forward key.
    pub fn has_forward(&self) -> bool {
        self.descriptor
            .index
            .as_ref()
            .map(|i| i.equality || i.unique)
            .unwrap_or(false)
    }

    /// Whether reverse keys are maintained
    pub fn has_reverse(&self) -> bool {
        self.descriptor
            .index
            .as_ref()
            .map(|i| i.substring)
            .unwrap_or(false)
    }

    fn is_unique(&self) -> bool {
        self.descriptor
            .index
            .as_ref()
            .map(|i| i.unique)
            .unwrap_or(false)
    }

    fn scopes(&self) -> &[Dn] {
        self.descriptor
            .index
            .as_ref()
            .map(|i| i.uniqueness_scopes.as_slice())
            .unwrap_or(&[])
    }
}

// ============================================================================
// EntryStore
// ============================================================================

/// Hierarchical entry store
///
/// Thread-safe; share it behind an `Arc`. Reads run on snapshots, writes are
/// serialized by the engine's writer lock.
#[derive(Debug)]
pub struct EntryStore {
    engine: KvEngine,
    schema: Arc<Schema>,
    config: StoreConfig,
    suffixes: Vec<Dn>,
    dn_index: IndexDb,
    parent_index: IndexDb,
    attribute_indexes: FxHashMap<String, AttributeIndex>,
    scope_locks: ScopeLocks,
}

impl EntryStore {
    /// Open a store, creating every table the schema needs
    ///
    /// # Errors
    /// `InvalidParameter` if the configuration does not validate.
    pub fn open(schema: Arc<Schema>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let suffixes = config.suffix_dns()?;
        let engine = KvEngine::new();

        let mut txn = engine.begin_write();
        txn.create_table(TableSpec::unique(ID2ENTRY, KeyOrdering::LengthThenMagnitude))?;
        txn.create_table(TableSpec::unique(ATTRMETA, KeyOrdering::Lexical))?;
        txn.create_table(TableSpec::unique(META, KeyOrdering::Lexical))?;
        let dn_index = IndexDb::open(&mut txn, DN2ID, true, KeyOrdering::Lexical)?;
        let parent_index =
            IndexDb::open(&mut txn, PARENTID, false, KeyOrdering::LengthThenMagnitude)?;

        let mut attribute_indexes = FxHashMap::default();
        for desc in schema.indexed() {
            let Some(index) = &desc.index else {
                continue;
            };
            let ordering = if index.numeric_order {
                KeyOrdering::TagThenLengthMagnitude
            } else {
                KeyOrdering::Lexical
            };
            let db = IndexDb::open(
                &mut txn,
                &attribute_table_name(&desc.name),
                index.unique_storage(),
                ordering,
            )?;
            attribute_indexes.insert(
                desc.name.to_ascii_lowercase(),
                AttributeIndex {
                    descriptor: Arc::clone(desc),
                    db,
                },
            );
        }
        txn.commit()?;

        info!(
            indexed_attributes = attribute_indexes.len(),
            suffixes = suffixes.len(),
            "entry store opened"
        );

        Ok(Self {
            engine,
            schema,
            config,
            suffixes,
            dn_index,
            parent_index,
            attribute_indexes,
            scope_locks: ScopeLocks::new(),
        })
    }

    /// Open a store with the standard schema and default configuration
    pub fn with_defaults() -> Result<Self> {
        Self::open(Arc::new(Schema::standard()), StoreConfig::default())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Schema handle
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Store configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// DN index
    pub fn dn_index(&self) -> &IndexDb {
        &self.dn_index
    }

    /// ParentID index
    pub fn parent_index(&self) -> &IndexDb {
        &self.parent_index
    }

    /// Index of an attribute, `None` if unindexed or unknown
    pub fn attribute_index(&self, attribute: &str) -> Option<&AttributeIndex> {
        self.attribute_indexes.get(&attribute.to_ascii_lowercase())
    }

    /// Begin a read transaction
    pub fn begin_read(&self) -> ReadTxn {
        self.engine.begin_read()
    }

    /// Begin a write transaction
    pub fn begin_write(&self) -> WriteTxn<'_> {
        self.engine.begin_write()
    }

    /// Run `f` in a write transaction, committing on success
    ///
    /// On error the transaction is dropped and nothing `f` did is visible.
    pub fn write<T>(&self, f: impl FnOnce(&mut WriteTxn<'_>) -> Result<T>) -> Result<T> {
        let mut txn = self.engine.begin_write();
        let out = f(&mut txn)?;
        txn.commit()?;
        Ok(out)
    }

    /// DN index key of a DN
    ///
    /// # Errors
    /// `InvalidParameter` if the normalized DN exceeds the key size limit.
    pub fn dn_key(&self, dn: &Dn) -> Result<Vec<u8>> {
        encode_forward(dn.normalized().as_bytes(), self.config.max_key_bytes)
    }

    /// Whether a DN names a root entry (no parent)
    pub fn is_root_dn(&self, dn: &Dn) -> bool {
        dn.depth() == 1 || self.suffixes.iter().any(|s| s == dn)
    }

    // ------------------------------------------------------------------
    // Convenience operations (one transaction each)
    // ------------------------------------------------------------------

    /// Add an entry, returning its new EntryID
    pub fn add(&self, entry: Entry) -> Result<EntryId> {
        self.write(|txn| self.add_in(txn, entry))
    }

    /// Add an entry under an EntryID obtained from [`reserve_id`](Self::reserve_id)
    pub fn add_with_id(&self, entry: Entry, id: EntryId) -> Result<EntryId> {
        self.write(|txn| self.add_with_id_in(txn, entry, id))
    }

    /// Allocate an EntryID for a later [`add_with_id`](Self::add_with_id)
    pub fn reserve_id(&self) -> Result<EntryId> {
        self.write(|txn| self.reserve_id_in(txn))
    }

    /// Apply deltas to an entry
    pub fn modify(&self, id: EntryId, deltas: Vec<AttributeDelta>) -> Result<()> {
        self.write(|txn| self.modify_in(txn, id, deltas).map(|_| ()))
    }

    /// Delete a leaf entry
    pub fn delete(&self, id: EntryId) -> Result<()> {
        self.write(|txn| self.delete_in(txn, id).map(|_| ()))
    }

    /// Load an entry by id
    pub fn get_by_id(&self, id: EntryId) -> Result<Entry> {
        self.get_by_id_in(&self.begin_read(), id)
    }

    /// Load an entry by DN
    pub fn get_by_dn(&self, dn: &Dn) -> Result<Entry> {
        self.get_by_dn_in(&self.begin_read(), dn)
    }

    /// Whether the entry has no children
    pub fn is_leaf(&self, id: EntryId) -> Result<bool> {
        self.is_leaf_in(&self.begin_read(), id)
    }

    /// Child EntryIDs, ascending
    pub fn children(&self, id: EntryId) -> Result<Vec<EntryId>> {
        self.children_in(&self.begin_read(), id)
    }

    /// Number of stored entries
    pub fn entry_count(&self) -> Result<usize> {
        self.entry_count_in(&self.begin_read())
    }

    /// Persisted metadata of one attribute of one entry
    pub fn attribute_meta(&self, id: EntryId, attribute: &str) -> Result<Option<AttributeMeta>> {
        self.attribute_meta_in(&self.begin_read(), id, attribute)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Load an entry by id
    ///
    /// # Errors
    /// `EntryNotFound` if no blob is stored under the id.
    pub fn get_by_id_in(&self, txn: &impl KvRead, id: EntryId) -> Result<Entry> {
        let table = txn.table(ID2ENTRY)?;
        match table.get(&encode_entry_id(id)) {
            Some(blob) => Entry::decode(blob),
            None => Err(Error::entry_not_found_id(id)),
        }
    }

    /// Resolve a DN to its EntryID
    ///
    /// # Errors
    /// `EntryNotFound` if the DN is not stored.
    pub fn id_of_dn_in(&self, txn: &impl KvRead, dn: &Dn) -> Result<EntryId> {
        let key = self.dn_key(dn)?;
        match self.dn_index.get(txn, &key) {
            Err(Error::KeyNotFound { .. }) => Err(Error::EntryNotFound(dn.to_string())),
            other => other,
        }
    }

    /// Load an entry by DN
    pub fn get_by_dn_in(&self, txn: &impl KvRead, dn: &Dn) -> Result<Entry> {
        let id = self.id_of_dn_in(txn, dn)?;
        self.get_by_id_in(txn, id)
    }

    /// Whether the entry has no children (one ParentID probe)
    pub fn is_leaf_in(&self, txn: &impl KvRead, id: EntryId) -> Result<bool> {
        Ok(!self.parent_index.contains(txn, &encode_entry_id(id))?)
    }

    /// Child EntryIDs, ascending
    pub fn children_in(&self, txn: &impl KvRead, id: EntryId) -> Result<Vec<EntryId>> {
        self.parent_index.get_all(txn, &encode_entry_id(id))
    }

    /// Number of stored entries
    pub fn entry_count_in(&self, txn: &impl KvRead) -> Result<usize> {
        Ok(txn.table(ID2ENTRY)?.len())
    }

    /// Persisted metadata of one attribute, `None` if never written
    pub fn attribute_meta_in(
        &self,
        txn: &impl KvRead,
        id: EntryId,
        attribute: &str,
    ) -> Result<Option<AttributeMeta>> {
        let Some(desc) = self.schema.get(attribute) else {
            return Ok(None);
        };
        let table = txn.table(ATTRMETA)?;
        table
            .get(&attribute_meta_key(id, desc.id))
            .map(|bytes| bincode::deserialize(bytes).map_err(Error::from))
            .transpose()
    }

    /// Every persisted attribute metadata record of an entry, by attribute id
    pub fn attribute_metas_in(
        &self,
        txn: &impl KvRead,
        id: EntryId,
    ) -> Result<Vec<(u16, AttributeMeta)>> {
        let prefix = attribute_meta_prefix(id);
        let cursor = txn.cursor(
            ATTRMETA,
            CursorStart::At(prefix.clone()),
            Direction::Forward,
        )?;
        let mut out = Vec::new();
        for (key, value) in cursor {
            if !key.starts_with(&prefix) {
                break;
            }
            // Longer EntryIDs can share the prefix bytes
            if key.len() != prefix.len() + 2 {
                continue;
            }
            let attribute_id = BigEndian::read_u16(&key[prefix.len()..]);
            out.push((attribute_id, bincode::deserialize(&value)?));
        }
        Ok(out)
    }

    /// Iterate over stored entries in EntryID order
    pub fn scan_entries(&self, txn: &impl KvRead, after: Option<EntryId>) -> Result<EntryCursor> {
        let start = match after {
            Some(id) => CursorStart::At(encode_entry_id(id.next())),
            None => CursorStart::First,
        };
        Ok(EntryCursor {
            inner: txn.cursor(ID2ENTRY, start, Direction::Forward)?,
        })
    }

    // ------------------------------------------------------------------
    // Sequences
    // ------------------------------------------------------------------

    fn read_counter(txn: &impl KvRead, key: &[u8]) -> Result<u64> {
        match txn.table(META)?.get(key) {
            Some(bytes) if bytes.len() == 8 => Ok(BigEndian::read_u64(bytes)),
            Some(bytes) => Err(Error::StorageEngine(format!(
                "corrupt counter '{}' of {} bytes",
                String::from_utf8_lossy(key),
                bytes.len()
            ))),
            None => Ok(0),
        }
    }

    fn write_counter(txn: &mut WriteTxn<'_>, key: &[u8], value: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, value);
        txn.table_mut(META)?.put(key, &buf);
        Ok(())
    }

    /// Allocate the next EntryID in this transaction
    pub fn reserve_id_in(&self, txn: &mut WriteTxn<'_>) -> Result<EntryId> {
        let next = Self::read_counter(txn, LAST_ID_KEY)? + 1;
        Self::write_counter(txn, LAST_ID_KEY, next)?;
        Ok(EntryId::new(next))
    }

    /// USN of this transaction, allocated on first use
    fn txn_usn(&self, txn: &mut WriteTxn<'_>) -> Result<u64> {
        if let Some(usn) = txn.usn() {
            return Ok(usn);
        }
        let usn = Self::read_counter(txn, USN_KEY)? + 1;
        Self::write_counter(txn, USN_KEY, usn)?;
        txn.set_usn(usn);
        Ok(usn)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    fn fail(&self, txn: &mut WriteTxn<'_>, operation: &str, subject: &str, e: Error) -> Error {
        if e.is_fatal() {
            error!(operation, entry = subject, error = %e, "fatal storage failure, aborting transaction");
            txn.mark_failed();
        }
        e
    }

    /// Add an entry inside `txn`
    ///
    /// # Errors
    /// - `InvalidParameter`: empty DN, malformed value or oversized key
    /// - `EntryExists`: the DN is taken
    /// - `ParentNotFound`: the parent DN is not stored
    /// - `ConstraintViolation`: a unique attribute value is taken
    pub fn add_in(&self, txn: &mut WriteTxn<'_>, entry: Entry) -> Result<EntryId> {
        let subject = entry.dn().to_string();
        self.add_entry(txn, entry, None)
            .map_err(|e| self.fail(txn, "add", &subject, e))
    }

    /// Add an entry under a reserved EntryID inside `txn`
    pub fn add_with_id_in(&self, txn: &mut WriteTxn<'_>, entry: Entry, id: EntryId) -> Result<EntryId> {
        let subject = entry.dn().to_string();
        self.add_entry(txn, entry, Some(id))
            .map_err(|e| self.fail(txn, "add", &subject, e))
    }

    fn add_entry(
        &self,
        txn: &mut WriteTxn<'_>,
        mut entry: Entry,
        reserved: Option<EntryId>,
    ) -> Result<EntryId> {
        entry.normalize(&self.schema)?;
        let dn = entry.dn().clone();
        if dn.is_root() {
            return Err(Error::InvalidParameter("cannot add the empty DN".to_string()));
        }
        let dn_key = self.dn_key(&dn)?;
        self.check_key_sizes(&entry)?;

        let id = match reserved {
            Some(id) => self.claim_reserved(txn, id)?,
            None => self.reserve_id_in(txn)?,
        };

        match self.dn_index.put(txn, &dn_key, id, PutMode::Create) {
            Err(Error::KeyExists { .. }) => return Err(Error::EntryExists(dn.to_string())),
            other => other?,
        }

        let parent_id = self.resolve_parent(txn, &dn)?;
        if let Some(parent) = parent_id {
            self.parent_index
                .put(txn, &encode_entry_id(parent), id, PutMode::Create)?;
        }

        let usn = self.txn_usn(txn)?;
        for attr in entry.attributes() {
            if let Some(index) = self.attribute_index(attr.name()) {
                for value in attr.values() {
                    self.index_value(txn, index, value, id, &dn)?;
                }
            }
            if let Some(desc) = self.schema.get(attr.name()) {
                self.touch_meta(txn, id, desc, usn)?;
            }
        }

        entry.assign(id, parent_id);
        self.write_blob(txn, id, &entry)?;
        debug!(entry_id = %id, dn = %dn, parent_id = ?parent_id, "entry added");
        Ok(id)
    }

    fn claim_reserved(&self, txn: &mut WriteTxn<'_>, id: EntryId) -> Result<EntryId> {
        if id.as_u64() == 0 {
            return Err(Error::InvalidParameter("entry id 0 is not assignable".to_string()));
        }
        if txn.table(ID2ENTRY)?.contains_key(&encode_entry_id(id)) {
            return Err(Error::InvalidParameter(format!("entry id {} already in use", id)));
        }
        if Self::read_counter(txn, LAST_ID_KEY)? < id.as_u64() {
            Self::write_counter(txn, LAST_ID_KEY, id.as_u64())?;
        }
        Ok(id)
    }

    fn check_key_sizes(&self, entry: &Entry) -> Result<()> {
        for attr in entry.attributes() {
            if let Some(index) = self.attribute_index(attr.name()) {
                for value in attr.values() {
                    self.value_keys(index, value.normalized())?;
                }
            }
        }
        Ok(())
    }

    fn resolve_parent(&self, txn: &impl KvRead, dn: &Dn) -> Result<Option<EntryId>> {
        if self.is_root_dn(dn) {
            return Ok(None);
        }
        let parent = dn
            .parent()
            .ok_or_else(|| Error::InvalidParameter("the empty DN has no parent".to_string()))?;
        match self.dn_index.get(txn, &self.dn_key(&parent)?) {
            Ok(id) => Ok(Some(id)),
            Err(Error::KeyNotFound { .. }) => Err(Error::ParentNotFound(dn.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Index keys written for one normalized value of an indexed attribute
    pub fn value_keys(&self, index: &AttributeIndex, normalized: &[u8]) -> Result<Vec<Vec<u8>>> {
        let limit = self.config.max_key_bytes;
        let mut keys = Vec::with_capacity(2);
        if index.has_forward() {
            keys.push(encode_forward(normalized, limit)?);
        }
        if index.has_reverse() {
            keys.push(encode_reverse(normalized, limit)?);
        }
        Ok(keys)
    }

    /// Write the forward/reverse keys of one value, checking uniqueness first
    fn index_value(
        &self,
        txn: &mut WriteTxn<'_>,
        index: &AttributeIndex,
        value: &AttributeValue,
        id: EntryId,
        dn: &Dn,
    ) -> Result<()> {
        let keys = self.value_keys(index, value.normalized())?;
        let _guards = if index.is_unique() {
            self.check_unique(txn, index, value, id, dn)?
        } else {
            Vec::new()
        };
        for key in &keys {
            match index.db().put(txn, key, id, PutMode::Create) {
                Ok(()) => {}
                Err(Error::KeyExists { .. }) => {
                    return Err(Error::ConstraintViolation {
                        attribute: index.descriptor().name.clone(),
                        reason: format!("value '{}' already in use", value.as_str_lossy()),
                    })
                }
                Err(e) => {
                    if e.is_fatal() {
                        error!(entry_id = %id, attribute = %index.descriptor().name, error = %e, "index write failed");
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Scoped-uniqueness check; returns the scope locks to hold through the write
    fn check_unique(
        &self,
        txn: &WriteTxn<'_>,
        index: &AttributeIndex,
        value: &AttributeValue,
        id: EntryId,
        dn: &Dn,
    ) -> Result<Vec<ScopeGuard>> {
        let guards = self.lock_scopes(index, dn);
        self.unique_conflict(txn, index, value, id, dn)?;
        Ok(guards)
    }

    /// Locks of the uniqueness scopes `dn` falls in
    fn lock_scopes(&self, index: &AttributeIndex, dn: &Dn) -> Vec<ScopeGuard> {
        let name = &index.descriptor().name;
        let scopes = index.scopes();
        if scopes.is_empty() {
            return vec![self.scope_locks.lock(name, GLOBAL_SCOPE)];
        }
        self.scope_locks.lock_all(
            name,
            scopes
                .iter()
                .filter(|s| dn.is_within(s))
                .map(|s| s.normalized()),
        )
    }

    /// Fails if another entry in one of `dn`'s uniqueness scopes holds `value`
    ///
    /// Callers hold the scope locks.
    fn unique_conflict(
        &self,
        txn: &WriteTxn<'_>,
        index: &AttributeIndex,
        value: &AttributeValue,
        id: EntryId,
        dn: &Dn,
    ) -> Result<()> {
        let name = &index.descriptor().name;
        let scopes = index.scopes();
        let applicable: Vec<&Dn> = scopes.iter().filter(|s| dn.is_within(s)).collect();
        if !scopes.is_empty() && applicable.is_empty() {
            return Ok(());
        }

        let key = encode_forward(value.normalized(), self.config.max_key_bytes)?;
        for other in index.db().get_all(txn, &key)? {
            if other == id {
                continue;
            }
            let conflict = if scopes.is_empty() {
                true
            } else {
                let other_dn = self.get_by_id_in(txn, other)?.dn().clone();
                applicable.iter().any(|s| other_dn.is_within(s))
            };
            if conflict {
                debug!(attribute = %name, entry_id = %id, holder = %other, "uniqueness conflict");
                return Err(Error::ConstraintViolation {
                    attribute: name.clone(),
                    reason: format!(
                        "value '{}' already held by entry {}",
                        value.as_str_lossy(),
                        other
                    ),
                });
            }
        }
        Ok(())
    }

    /// Remove the keys of one value; a missing key is logged, not fatal
    fn unindex_value(
        &self,
        txn: &mut WriteTxn<'_>,
        index: &AttributeIndex,
        normalized: &[u8],
        id: EntryId,
    ) -> Result<()> {
        for key in self.value_keys(index, normalized)? {
            match index.db().put(txn, &key, id, PutMode::Delete) {
                Ok(()) => {}
                Err(Error::KeyNotFound { .. }) => {
                    warn!(entry_id = %id, attribute = %index.descriptor().name, "index key missing on removal");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn touch_meta(
        &self,
        txn: &mut WriteTxn<'_>,
        id: EntryId,
        desc: &AttributeDescriptor,
        usn: u64,
    ) -> Result<()> {
        let key = attribute_meta_key(id, desc.id);
        let origin = self.config.local_origin;
        let table = txn.table_mut(ATTRMETA)?;
        let previous: Option<AttributeMeta> = table
            .get(&key)
            .map(bincode::deserialize)
            .transpose()?;
        let meta = match previous {
            Some(prev) => prev.bumped(origin, usn),
            None => AttributeMeta::created(origin, usn),
        };
        table.put(&key, &bincode::serialize(&meta)?);
        Ok(())
    }

    fn drop_meta(&self, txn: &mut WriteTxn<'_>, id: EntryId, desc: &AttributeDescriptor) -> Result<()> {
        txn.table_mut(ATTRMETA)?
            .delete_key(&attribute_meta_key(id, desc.id));
        Ok(())
    }

    fn write_blob(&self, txn: &mut WriteTxn<'_>, id: EntryId, entry: &Entry) -> Result<()> {
        let blob = entry.encode()?;
        txn.table_mut(ID2ENTRY)?.put(&encode_entry_id(id), blob);
        Ok(())
    }

    /// Apply deltas inside `txn`, returning the updated entry
    ///
    /// # Errors
    /// - `EntryNotFound`: no entry with that id
    /// - `ConstraintViolation`: adding a present value, deleting an absent one,
    ///   or a uniqueness conflict
    /// - `NotAllowedOnNonLeaf`: renaming an entry with children
    /// - `EntryExists` / `ParentNotFound`: rename target taken / parent missing
    pub fn modify_in(
        &self,
        txn: &mut WriteTxn<'_>,
        id: EntryId,
        deltas: Vec<AttributeDelta>,
    ) -> Result<Entry> {
        self.modify_entry(txn, id, deltas)
            .map_err(|e| self.fail(txn, "modify", &id.to_string(), e))
    }

    fn modify_entry(
        &self,
        txn: &mut WriteTxn<'_>,
        id: EntryId,
        deltas: Vec<AttributeDelta>,
    ) -> Result<Entry> {
        let mut entry = self.get_by_id_in(txn, id)?;
        let usn = self.txn_usn(txn)?;
        for delta in deltas {
            match delta {
                AttributeDelta::Add { attribute, values } => {
                    self.apply_add(txn, &mut entry, id, &attribute, values, usn)?
                }
                AttributeDelta::Delete { attribute, values } => {
                    self.apply_delete(txn, &mut entry, id, &attribute, values, usn)?
                }
                AttributeDelta::Replace { attribute, values } => {
                    self.apply_replace(txn, &mut entry, id, &attribute, values, usn)?
                }
                AttributeDelta::Rename { new_dn } => self.apply_rename(txn, &mut entry, id, new_dn)?,
            }
        }
        entry.prune_empty();
        self.write_blob(txn, id, &entry)?;
        debug!(entry_id = %id, usn, "entry modified");
        Ok(entry)
    }

    fn normalize_values(
        &self,
        attribute: &str,
        values: Vec<AttributeValue>,
    ) -> Result<Vec<AttributeValue>> {
        let mut attr = dirstore_core::Attribute::new(attribute, values);
        if let Some(desc) = self.schema.get(attribute) {
            attr.normalize_with(desc)?;
        }
        Ok(attr.values().to_vec())
    }

    fn canonical_name(&self, attribute: &str) -> String {
        self.schema
            .get(attribute)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| attribute.to_string())
    }

    fn apply_add(
        &self,
        txn: &mut WriteTxn<'_>,
        entry: &mut Entry,
        id: EntryId,
        attribute: &str,
        values: Vec<AttributeValue>,
        usn: u64,
    ) -> Result<()> {
        let values = self.normalize_values(attribute, values)?;
        if values.is_empty() {
            return Err(Error::InvalidParameter(format!(
                "add of attribute '{}' without values",
                attribute
            )));
        }
        if let Some(existing) = entry.attribute(attribute) {
            if let Some(dup) = values
                .iter()
                .find(|v| existing.contains_normalized(v.normalized()))
            {
                return Err(Error::ConstraintViolation {
                    attribute: attribute.to_string(),
                    reason: format!("value '{}' already present", dup.as_str_lossy()),
                });
            }
        }
        if let Some(index) = self.attribute_index(attribute) {
            for value in &values {
                self.index_value(txn, index, value, id, entry.dn())?;
            }
        }
        entry.add_values(&self.canonical_name(attribute), values);
        if let Some(desc) = self.schema.get(attribute) {
            self.touch_meta(txn, id, desc, usn)?;
        }
        Ok(())
    }

    fn apply_delete(
        &self,
        txn: &mut WriteTxn<'_>,
        entry: &mut Entry,
        id: EntryId,
        attribute: &str,
        values: Vec<AttributeValue>,
        usn: u64,
    ) -> Result<()> {
        let no_such_attribute = || Error::ConstraintViolation {
            attribute: attribute.to_string(),
            reason: "no such attribute".to_string(),
        };

        if values.is_empty() {
            let removed = entry
                .remove_attribute(attribute)
                .ok_or_else(no_such_attribute)?;
            if let Some(index) = self.attribute_index(attribute) {
                for value in removed.values() {
                    self.unindex_value(txn, index, value.normalized(), id)?;
                }
            }
            if let Some(desc) = self.schema.get(attribute) {
                self.drop_meta(txn, id, desc)?;
            }
            return Ok(());
        }

        let values = self.normalize_values(attribute, values)?;
        let existing = entry.attribute(attribute).ok_or_else(no_such_attribute)?;
        if let Some(missing) = values
            .iter()
            .find(|v| !existing.contains_normalized(v.normalized()))
        {
            return Err(Error::ConstraintViolation {
                attribute: attribute.to_string(),
                reason: format!("no such value '{}'", missing.as_str_lossy()),
            });
        }
        if let Some(index) = self.attribute_index(attribute) {
            for value in &values {
                self.unindex_value(txn, index, value.normalized(), id)?;
            }
        }
        let emptied = match entry.attribute_mut(attribute) {
            Some(attr) => {
                for value in &values {
                    attr.remove_normalized(value.normalized());
                }
                attr.is_empty()
            }
            None => true,
        };
        if let Some(desc) = self.schema.get(attribute) {
            if emptied {
                self.drop_meta(txn, id, desc)?;
            } else {
                self.touch_meta(txn, id, desc, usn)?;
            }
        }
        Ok(())
    }

    fn apply_replace(
        &self,
        txn: &mut WriteTxn<'_>,
        entry: &mut Entry,
        id: EntryId,
        attribute: &str,
        values: Vec<AttributeValue>,
        usn: u64,
    ) -> Result<()> {
        let values = self.normalize_values(attribute, values)?;
        let index = self.attribute_index(attribute);
        if let Some(index) = index {
            for value in &values {
                self.value_keys(index, value.normalized())?;
            }
        }
        if let Some(old) = entry.remove_attribute(attribute) {
            if let Some(index) = index {
                for value in old.values() {
                    self.unindex_value(txn, index, value.normalized(), id)?;
                }
            }
        }
        let desc = self.schema.get(attribute);
        if values.is_empty() {
            if let Some(desc) = desc {
                self.drop_meta(txn, id, desc)?;
            }
            return Ok(());
        }
        if let Some(index) = index {
            for value in &values {
                self.index_value(txn, index, value, id, entry.dn())?;
            }
        }
        entry.add_values(&self.canonical_name(attribute), values);
        if let Some(desc) = desc {
            self.touch_meta(txn, id, desc, usn)?;
        }
        Ok(())
    }

    fn apply_rename(
        &self,
        txn: &mut WriteTxn<'_>,
        entry: &mut Entry,
        id: EntryId,
        new_dn: Dn,
    ) -> Result<()> {
        if new_dn.is_root() {
            return Err(Error::InvalidParameter("cannot rename to the empty DN".to_string()));
        }
        if &new_dn == entry.dn() {
            return Ok(());
        }
        if !self.is_leaf_in(txn, id)? {
            return Err(Error::NotAllowedOnNonLeaf(entry.dn().to_string()));
        }

        // Values that were fine under the old DN may collide in the new scopes
        let mut _guards = Vec::new();
        for attr in entry.attributes() {
            let Some(index) = self
                .attribute_index(attr.name())
                .filter(|i| i.is_unique() && !i.scopes().is_empty())
            else {
                continue;
            };
            _guards.extend(self.lock_scopes(index, &new_dn));
            for value in attr.values() {
                self.unique_conflict(txn, index, value, id, &new_dn)?;
            }
        }

        let new_key = self.dn_key(&new_dn)?;
        match self.dn_index.put(txn, &new_key, id, PutMode::Create) {
            Err(Error::KeyExists { .. }) => return Err(Error::EntryExists(new_dn.to_string())),
            other => other?,
        }
        let new_parent = self.resolve_parent(txn, &new_dn)?;
        if new_parent == Some(id) {
            return Err(Error::InvalidParameter(format!(
                "cannot move {} below itself",
                entry.dn()
            )));
        }

        let old_key = self.dn_key(entry.dn())?;
        self.dn_index.put(txn, &old_key, id, PutMode::Delete)?;
        if let Some(old_parent) = entry.parent_id() {
            self.parent_index
                .put(txn, &encode_entry_id(old_parent), id, PutMode::Delete)?;
        }
        if let Some(parent) = new_parent {
            self.parent_index
                .put(txn, &encode_entry_id(parent), id, PutMode::Create)?;
        }
        debug!(entry_id = %id, from = %entry.dn(), to = %new_dn, "entry renamed");
        entry.set_dn(new_dn, new_parent);
        Ok(())
    }

    /// Delete a leaf entry inside `txn`, returning what was removed
    ///
    /// # Errors
    /// `EntryNotFound` if absent, `NotAllowedOnNonLeaf` if it has children.
    pub fn delete_in(&self, txn: &mut WriteTxn<'_>, id: EntryId) -> Result<Entry> {
        self.delete_entry(txn, id)
            .map_err(|e| self.fail(txn, "delete", &id.to_string(), e))
    }

    fn delete_entry(&self, txn: &mut WriteTxn<'_>, id: EntryId) -> Result<Entry> {
        let entry = self.get_by_id_in(txn, id)?;
        if !self.is_leaf_in(txn, id)? {
            return Err(Error::NotAllowedOnNonLeaf(entry.dn().to_string()));
        }

        txn.table_mut(ID2ENTRY)?.delete_key(&encode_entry_id(id));

        let metas = self.attribute_metas_in(txn, id)?;
        let table = txn.table_mut(ATTRMETA)?;
        for (attribute_id, _) in metas {
            table.delete_key(&attribute_meta_key(id, attribute_id));
        }

        for attr in entry.attributes() {
            if let Some(index) = self.attribute_index(attr.name()) {
                for value in attr.values() {
                    self.unindex_value(txn, index, value.normalized(), id)?;
                }
            }
        }

        if let Some(parent) = entry.parent_id() {
            self.parent_index
                .put(txn, &encode_entry_id(parent), id, PutMode::Delete)?;
        }
        let dn_key = self.dn_key(entry.dn())?;
        self.dn_index.put(txn, &dn_key, id, PutMode::Delete)?;
        debug!(entry_id = %id, dn = %entry.dn(), "entry deleted");
        Ok(entry)
    }
}

// ============================================================================
// EntryCursor
// ============================================================================

/// Entries in EntryID order, decoded lazily
#[derive(Debug)]
pub struct EntryCursor {
    inner: Cursor,
}

impl Iterator for EntryCursor {
    type Item = Result<(EntryId, Entry)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, blob) = self.inner.next()?;
        Some(decode_entry_id(&key).and_then(|id| Ok((id, Entry::decode(&blob)?))))
    }
}
