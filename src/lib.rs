//! dirstore - storage and query kernel for a hierarchical directory server
//!
//! dirstore keeps directory entries (a DN plus named, multi-valued
//! attributes) in ordered key-value tables and answers filtered searches by
//! combining index scans with a tri-valued filter evaluator.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use dirstore::{Dn, Entry, EntryStore, Filter, Scope, StoreSearchExt};
//!
//! let store = Arc::new(EntryStore::with_defaults()?);
//! store.add(Entry::new(Dn::parse("dc=x")?).with_attribute("objectClass", &["domain"]))?;
//! store.add(Entry::new(Dn::parse("cn=alice,dc=x")?).with_attribute("cn", &["Alice"]))?;
//!
//! let mut filter = Filter::equality(store.schema(), "cn", "alice");
//! let result = store.searcher().search(&mut filter, &Dn::parse("dc=x")?, Scope::Subtree, 0)?;
//! ```
//!
//! # Architecture
//!
//! - `dirstore-core`: data model, schema handle, configuration, errors
//! - `dirstore-storage`: key codec, transactional engine, indices, entry store
//! - `dirstore-search`: candidate sets, filters, evaluator, scanner, searches

pub use dirstore_core::*;
pub use dirstore_search::{
    evaluate, CandidateSet, Filter, FilterKind, IndexScanner, Page, PageCookie, PagedSearch,
    Scope, SearchResult, Searcher, StoreSearchExt, Truth,
};
pub use dirstore_storage::{EntryStore, KvEngine, KvRead, ReadTxn, TxnStatus, WriteTxn};
