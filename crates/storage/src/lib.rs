//! Storage layer for the directory store
//!
//! This crate implements everything below the query layer:
//! - Key codec: forward/reverse index keys, minimal-width EntryID keys
//! - KvEngine: named ordered tables with snapshot reads and a single writer
//! - ReadTxn / WriteTxn: the transaction context every operation runs in
//! - IndexDb: unique and duplicate-valued key → EntryID indices
//! - ScopeLocks: per-(attribute, scope) mutexes for uniqueness checks
//! - EntryStore: entry blobs, DN and ParentID indices, attribute indices
//!
//! # Concurrency
//!
//! Any number of readers see immutable snapshots; writers are serialized and
//! publish atomically on commit. A dropped write transaction leaves no trace.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod index;
pub mod key;
pub mod store;
pub mod txn;
pub mod uniqueness;

pub use engine::{Cursor, CursorStart, Direction, KeyOrdering, KvEngine, Table, TableSpec};
pub use index::{IndexCursor, IndexDb, PutMode};
pub use key::KeyTag;
pub use store::{AttributeIndex, EntryCursor, EntryStore};
pub use txn::{KvRead, ReadTxn, TxnStatus, WriteTxn};
pub use uniqueness::ScopeLocks;
