//! Query layer for the directory store
//!
//! This crate provides:
//! - CandidateSet: EntryIDs produced by index scans, with partial/unusable flags
//! - Filter: the filter tree, with per-node memo slots
//! - evaluate: tri-valued (TRUE/FALSE/UNDEFINED) evaluation against an entry
//! - IndexScanner: filter leaves to candidate sets, AND/OR combination
//! - Searcher: search executor with full-scope fallback
//! - PagedSearch: cookie-driven pages over a resumable, renewing scan
//! - StoreSearchExt extension trait for `store.searcher()`
//!
//! # Usage
//!
//! ```ignore
//! use dirstore_search::{Filter, Scope, StoreSearchExt};
//!
//! let mut filter = Filter::equality(store.schema(), "cn", "alice");
//! let result = store.searcher().search(&mut filter, &base, Scope::Subtree, 0)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod candidate;
pub mod evaluate;
pub mod filter;
pub mod paged;
pub mod scan;
pub mod search;

pub use candidate::CandidateSet;
pub use evaluate::{evaluate, substring_match};
pub use filter::{Assertion, Filter, FilterKind, SubstringAssertion, Truth};
pub use paged::{Page, PageCookie, PagedSearch, ResumableScan};
pub use scan::IndexScanner;
pub use search::{Scope, SearchResult, Searcher, StoreSearchExt};
