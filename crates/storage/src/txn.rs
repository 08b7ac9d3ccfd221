//! Read and write transactions over the KvEngine
//!
//! Every store operation runs inside one of these. Release on every exit
//! path is ownership: dropping a `ReadTxn` releases its snapshot, dropping a
//! `WriteTxn` without `commit` discards its changes and frees the writer
//! lock. Cursors opened from either kind own their table snapshot.

use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::debug;

use dirstore_core::{Error, Result};

use crate::engine::{Catalog, Cursor, CursorStart, Direction, KvEngine, Table, TableSpec};

/// Read access shared by both transaction kinds
pub trait KvRead {
    /// Snapshot of a table as seen by this transaction
    ///
    /// # Errors
    /// `StorageEngine` if the table does not exist.
    fn table(&self, name: &str) -> Result<&Arc<Table>>;

    /// Open a cursor on a table
    fn cursor(&self, name: &str, start: CursorStart, direction: Direction) -> Result<Cursor> {
        Ok(Cursor::new(Arc::clone(self.table(name)?), start, direction))
    }
}

fn lookup<'c>(catalog: &'c Catalog, name: &str) -> Result<&'c Arc<Table>> {
    catalog
        .tables
        .get(name)
        .ok_or_else(|| Error::StorageEngine(format!("no such table '{}'", name)))
}

// ============================================================================
// ReadTxn
// ============================================================================

/// Read-only transaction on a committed snapshot
#[derive(Debug, Clone)]
pub struct ReadTxn {
    catalog: Arc<Catalog>,
    generation: u64,
}

impl ReadTxn {
    pub(crate) fn new(catalog: Arc<Catalog>, generation: u64) -> Self {
        Self {
            catalog,
            generation,
        }
    }

    /// Commit count of the snapshot this transaction reads
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl KvRead for ReadTxn {
    fn table(&self, name: &str) -> Result<&Arc<Table>> {
        lookup(&self.catalog, name)
    }
}

// ============================================================================
// WriteTxn
// ============================================================================

/// Lifecycle state of a write transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// Accepting operations
    Active,
    /// A fatal error occurred; only drop (abort) remains
    Failed,
    /// Changes published
    Committed,
}

/// Exclusive read-write transaction
///
/// Holds the engine's writer lock until committed or dropped.
pub struct WriteTxn<'e> {
    engine: &'e KvEngine,
    _writer: MutexGuard<'e, ()>,
    catalog: Catalog,
    status: TxnStatus,
    usn: Option<u64>,
}

impl<'e> WriteTxn<'e> {
    pub(crate) fn new(engine: &'e KvEngine, writer: MutexGuard<'e, ()>, catalog: Catalog) -> Self {
        Self {
            engine,
            _writer: writer,
            catalog,
            status: TxnStatus::Active,
            usn: None,
        }
    }

    /// Current status
    pub fn status(&self) -> TxnStatus {
        self.status
    }

    fn ensure_active(&self) -> Result<()> {
        if self.status == TxnStatus::Active {
            Ok(())
        } else {
            Err(Error::TransactionNotActive)
        }
    }

    /// Create a table unless it exists
    ///
    /// # Errors
    /// `InvalidParameter` if a table of that name exists with another layout.
    pub fn create_table(&mut self, spec: TableSpec) -> Result<()> {
        self.ensure_active()?;
        match self.catalog.tables.get(&spec.name) {
            Some(existing) if existing.spec() == &spec => Ok(()),
            Some(existing) => Err(Error::InvalidParameter(format!(
                "table '{}' exists with layout {:?}",
                spec.name,
                existing.spec()
            ))),
            None => {
                debug!(table = %spec.name, ordering = ?spec.ordering, duplicates = spec.duplicates, "creating table");
                self.catalog
                    .tables
                    .insert(spec.name.clone(), Arc::new(Table::new(spec)));
                Ok(())
            }
        }
    }

    /// Mutable access to a table, copying it on first write
    pub fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.ensure_active()?;
        let table = self
            .catalog
            .tables
            .get_mut(name)
            .ok_or_else(|| Error::StorageEngine(format!("no such table '{}'", name)))?;
        Ok(Arc::make_mut(table))
    }

    /// Mark the transaction failed; every further operation and `commit` fail
    pub fn mark_failed(&mut self) {
        self.status = TxnStatus::Failed;
    }

    /// USN allocated for this transaction, if any
    pub(crate) fn usn(&self) -> Option<u64> {
        self.usn
    }

    pub(crate) fn set_usn(&mut self, usn: u64) {
        self.usn = Some(usn);
    }

    /// Publish all changes atomically
    ///
    /// # Errors
    /// `TransactionNotActive` if the transaction was marked failed.
    pub fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        let catalog = std::mem::take(&mut self.catalog);
        let generation = self.engine.publish(catalog);
        self.status = TxnStatus::Committed;
        debug!(generation, "write transaction committed");
        Ok(())
    }

    /// Discard all changes
    pub fn abort(self) {
        drop(self);
    }
}

impl KvRead for WriteTxn<'_> {
    fn table(&self, name: &str) -> Result<&Arc<Table>> {
        lookup(&self.catalog, name)
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if self.status != TxnStatus::Committed {
            debug!(status = ?self.status, "write transaction aborted, changes discarded");
        }
    }
}

impl std::fmt::Debug for WriteTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTxn")
            .field("status", &self.status)
            .field("tables", &self.catalog.tables.len())
            .field("usn", &self.usn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::KeyOrdering;

    #[test]
    fn test_missing_table_is_engine_error() {
        let engine = KvEngine::new();
        let r = engine.begin_read();
        assert!(matches!(r.table("nope"), Err(Error::StorageEngine(_))));
    }

    #[test]
    fn test_create_table_is_idempotent() {
        let engine = KvEngine::new();
        let mut w = engine.begin_write();
        let spec = TableSpec::unique("t", KeyOrdering::Lexical);
        w.create_table(spec.clone()).unwrap();
        w.create_table(spec).unwrap();
        let other = TableSpec::with_duplicates("t", KeyOrdering::Lexical);
        assert!(matches!(
            w.create_table(other),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_failed_txn_refuses_work_and_commit() {
        let engine = KvEngine::new();
        let mut w = engine.begin_write();
        w.create_table(TableSpec::unique("t", KeyOrdering::Lexical))
            .unwrap();
        w.mark_failed();
        assert_eq!(w.status(), TxnStatus::Failed);
        assert!(matches!(w.table_mut("t"), Err(Error::TransactionNotActive)));
        assert!(matches!(w.commit(), Err(Error::TransactionNotActive)));
        assert_eq!(engine.commit_count(), 0);
    }

    #[test]
    fn test_write_txn_sees_own_writes() {
        let engine = KvEngine::new();
        let mut w = engine.begin_write();
        w.create_table(TableSpec::unique("t", KeyOrdering::Lexical))
            .unwrap();
        w.table_mut("t").unwrap().put(b"k", b"v");
        assert_eq!(w.table("t").unwrap().get(b"k"), Some(&b"v"[..]));
        w.abort();
        assert_eq!(engine.commit_count(), 0);
    }

    #[test]
    fn test_cursor_outlives_transaction() {
        let engine = KvEngine::new();
        let mut w = engine.begin_write();
        w.create_table(TableSpec::unique("t", KeyOrdering::Lexical))
            .unwrap();
        w.table_mut("t").unwrap().put(b"k", b"v");
        w.commit().unwrap();

        let cursor = {
            let r = engine.begin_read();
            r.cursor("t", CursorStart::First, Direction::Forward).unwrap()
        };
        assert_eq!(cursor.count(), 1);
    }
}
