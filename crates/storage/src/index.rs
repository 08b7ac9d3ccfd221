//! IndexDb: typed view of one index table mapping keys to EntryIDs
//!
//! An index is either unique (one id per key) or duplicate-valued (sorted
//! ids per key). `KeyExists` and `KeyNotFound` are returned raw; callers map
//! them to domain errors.

use dirstore_core::{EntryId, Error, Result};

use crate::engine::{Cursor, CursorStart, Direction, KeyOrdering, TableSpec};
use crate::key::{decode_entry_id, encode_entry_id};
use crate::txn::{KvRead, WriteTxn};

/// Mutation requested by [`IndexDb::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Insert; a unique index fails with `KeyExists` if the key is present
    Create,
    /// Insert or overwrite
    Update,
    /// Remove the pair (unique index: the whole key)
    Delete,
}

/// Handle on one index table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDb {
    name: String,
    unique: bool,
    ordering: KeyOrdering,
}

impl IndexDb {
    /// Open an index, creating its table if absent
    pub fn open(
        txn: &mut WriteTxn<'_>,
        name: &str,
        unique: bool,
        ordering: KeyOrdering,
    ) -> Result<Self> {
        let index = Self {
            name: name.to_string(),
            unique,
            ordering,
        };
        txn.create_table(index.spec())?;
        Ok(index)
    }

    /// Table layout backing this index
    pub fn spec(&self) -> TableSpec {
        if self.unique {
            TableSpec::unique(self.name.clone(), self.ordering)
        } else {
            TableSpec::with_duplicates(self.name.clone(), self.ordering)
        }
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether each key maps to at most one id
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Key order of the table
    pub fn ordering(&self) -> KeyOrdering {
        self.ordering
    }

    fn key_exists(&self) -> Error {
        Error::KeyExists {
            index: self.name.clone(),
        }
    }

    fn key_not_found(&self) -> Error {
        Error::KeyNotFound {
            index: self.name.clone(),
        }
    }

    /// Apply a mutation
    ///
    /// # Errors
    /// - `KeyExists`: `Create` on a unique index whose key is present
    /// - `KeyNotFound`: `Delete` of an absent key or pair
    pub fn put(&self, txn: &mut WriteTxn<'_>, key: &[u8], id: EntryId, mode: PutMode) -> Result<()> {
        let value = encode_entry_id(id);
        let table = txn.table_mut(&self.name)?;
        match mode {
            PutMode::Create => {
                if self.unique && table.contains_key(key) {
                    return Err(self.key_exists());
                }
                table.put(key, &value);
                Ok(())
            }
            PutMode::Update => {
                table.put(key, &value);
                Ok(())
            }
            PutMode::Delete => {
                let removed = if self.unique {
                    table.delete_key(key)
                } else {
                    table.delete_pair(key, &value)
                };
                if removed {
                    Ok(())
                } else {
                    Err(self.key_not_found())
                }
            }
        }
    }

    /// Id stored under an exact key (the smallest one for duplicate indices)
    ///
    /// # Errors
    /// `KeyNotFound` if the key is absent.
    pub fn get(&self, txn: &impl KvRead, key: &[u8]) -> Result<EntryId> {
        let table = txn.table(&self.name)?;
        match table.get(key) {
            Some(bytes) => decode_entry_id(bytes),
            None => Err(self.key_not_found()),
        }
    }

    /// Every id stored under an exact key, ascending; empty if absent
    pub fn get_all(&self, txn: &impl KvRead, key: &[u8]) -> Result<Vec<EntryId>> {
        let table = txn.table(&self.name)?;
        table.values(key).map(decode_entry_id).collect()
    }

    /// Whether any id is stored under the key
    pub fn contains(&self, txn: &impl KvRead, key: &[u8]) -> Result<bool> {
        Ok(txn.table(&self.name)?.contains_key(key))
    }

    /// Number of (key, id) pairs
    pub fn len(&self, txn: &impl KvRead) -> Result<usize> {
        Ok(txn.table(&self.name)?.len())
    }

    /// Open a cursor over (key, id) pairs
    pub fn scan(
        &self,
        txn: &impl KvRead,
        start: CursorStart,
        direction: Direction,
    ) -> Result<IndexCursor> {
        Ok(IndexCursor {
            inner: txn.cursor(&self.name, start, direction)?,
        })
    }
}

/// Cursor over an index, decoding ids
#[derive(Debug)]
pub struct IndexCursor {
    inner: Cursor,
}

impl IndexCursor {
    /// Key order of the index
    pub fn ordering(&self) -> KeyOrdering {
        self.inner.ordering()
    }
}

impl Iterator for IndexCursor {
    type Item = Result<(Vec<u8>, EntryId)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = self.inner.next()?;
        Some(decode_entry_id(&value).map(|id| (key, id)))
    }
}
