//! Core types for the directory store
//!
//! This crate defines the foundational types used throughout the system:
//! - EntryId: Dense primary key of every entry
//! - Dn: Distinguished name with normalized form
//! - AttributeValue / Attribute / Entry: the stored data model
//! - AttributeDelta: one change of a modify operation
//! - Schema: attribute descriptors, matching rules, index catalog
//! - StoreConfig: TOML-backed configuration
//! - Error: Error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod entry;
pub mod error;
pub mod schema;
pub mod types;
pub mod value;

pub use config::StoreConfig;
pub use entry::{AttributeDelta, Entry};
pub use error::{Error, Result};
pub use schema::{AttributeDescriptor, IndexDescriptor, MatchingRule, Schema};
pub use types::{Dn, EntryId};
pub use value::{Attribute, AttributeMeta, AttributeValue, ValueMeta};
