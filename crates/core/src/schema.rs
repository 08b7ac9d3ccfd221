//! Schema handle: attribute descriptors, matching rules and index catalog
//!
//! The store never consults a process-wide table. Callers build a [`Schema`],
//! wrap it in an `Arc` and hand it to the store; every index decision and
//! every filter comparison goes through that handle.

use crate::error::{Error, Result};
use crate::types::Dn;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

/// Fold a string with case-ignore rules
///
/// Trims, collapses every whitespace run to a single space and lowercases.
pub fn fold_case_ignore(s: &str) -> String {
    collapse_whitespace(s.trim()).to_lowercase()
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

fn utf8(raw: &[u8]) -> Result<&str> {
    std::str::from_utf8(raw)
        .map_err(|_| Error::InvalidParameter("value is not valid UTF-8".to_string()))
}

// ============================================================================
// MatchingRule
// ============================================================================

/// Matching rule of an attribute
///
/// A rule normalizes raw values into the byte form that indices store and
/// filters compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchingRule {
    /// Case-insensitive string, whitespace collapsed
    CaseIgnore,
    /// Case-sensitive string, whitespace collapsed
    CaseExact,
    /// Raw bytes
    Octet,
    /// Non-negative integer in canonical decimal form
    Integer,
    /// Distinguished name
    DistinguishedName,
}

impl MatchingRule {
    /// Normalize a raw attribute value
    ///
    /// # Errors
    /// `InvalidParameter` when the value does not fit the rule's syntax.
    pub fn normalize(&self, raw: &[u8]) -> Result<Vec<u8>> {
        match self {
            MatchingRule::CaseIgnore => Ok(fold_case_ignore(utf8(raw)?).into_bytes()),
            MatchingRule::CaseExact => Ok(collapse_whitespace(utf8(raw)?.trim()).into_bytes()),
            MatchingRule::Octet => Ok(raw.to_vec()),
            MatchingRule::Integer => {
                let s = utf8(raw)?.trim();
                if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(Error::InvalidParameter(format!(
                        "'{}' is not a non-negative integer",
                        s
                    )));
                }
                let stripped = s.trim_start_matches('0');
                if stripped.is_empty() {
                    Ok(b"0".to_vec())
                } else {
                    Ok(stripped.as_bytes().to_vec())
                }
            }
            MatchingRule::DistinguishedName => {
                Ok(Dn::parse(utf8(raw)?)?.normalized().as_bytes().to_vec())
            }
        }
    }

    /// Normalize a substring fragment
    ///
    /// Like [`normalize`](Self::normalize) but without trimming, so that a
    /// fragment keeps the spaces that separate it from its neighbours.
    pub fn normalize_fragment(&self, raw: &[u8]) -> Result<Vec<u8>> {
        match self {
            MatchingRule::CaseIgnore | MatchingRule::DistinguishedName => {
                Ok(collapse_whitespace(utf8(raw)?).to_lowercase().into_bytes())
            }
            MatchingRule::CaseExact => Ok(collapse_whitespace(utf8(raw)?).into_bytes()),
            MatchingRule::Octet | MatchingRule::Integer => Ok(raw.to_vec()),
        }
    }

    /// Equality on normalized values
    pub fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        a == b
    }

    /// Ordering on normalized values, `None` if the rule has no ordering
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Option<Ordering> {
        match self {
            MatchingRule::CaseIgnore | MatchingRule::CaseExact | MatchingRule::Octet => {
                Some(a.cmp(b))
            }
            MatchingRule::Integer => Some(a.len().cmp(&b.len()).then_with(|| a.cmp(b))),
            MatchingRule::DistinguishedName => None,
        }
    }

    /// Whether the rule defines an ordering
    pub fn has_ordering(&self) -> bool {
        !matches!(self, MatchingRule::DistinguishedName)
    }

    /// Whether the rule defines substring matching
    pub fn has_substrings(&self) -> bool {
        !matches!(self, MatchingRule::Integer)
    }
}

// ============================================================================
// IndexDescriptor
// ============================================================================

/// How an attribute is indexed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// At most one live entry per value (within each uniqueness scope)
    pub unique: bool,
    /// Maintain forward (FWD) keys: equality, ordering and prefix scans
    pub equality: bool,
    /// Maintain reverse (REV) keys: suffix scans
    pub substring: bool,
    /// Order keys by length-then-magnitude instead of lexically
    pub numeric_order: bool,
    /// DN subtrees the uniqueness constraint is scoped to (empty = global)
    pub uniqueness_scopes: Vec<Dn>,
}

impl IndexDescriptor {
    /// Non-unique index with forward keys only
    pub fn equality() -> Self {
        Self {
            unique: false,
            equality: true,
            substring: false,
            numeric_order: false,
            uniqueness_scopes: Vec::new(),
        }
    }

    /// Index with forward and reverse keys
    pub fn equality_and_substring() -> Self {
        Self {
            substring: true,
            ..Self::equality()
        }
    }

    /// Mark the index unique
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Order keys numerically
    pub fn numeric(mut self) -> Self {
        self.numeric_order = true;
        self
    }

    /// Scope the uniqueness constraint to the given subtrees
    pub fn scoped(mut self, scopes: Vec<Dn>) -> Self {
        self.uniqueness_scopes = scopes;
        self
    }

    /// Whether values are stored one-per-key in the table
    ///
    /// Scoped-unique indices allow the same value in different scopes, so
    /// only globally unique indices use unique table storage.
    pub fn unique_storage(&self) -> bool {
        self.unique && self.uniqueness_scopes.is_empty()
    }
}

// ============================================================================
// AttributeDescriptor
// ============================================================================

/// Resolved description of one attribute type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    /// Canonical attribute name
    pub name: String,
    /// Compact id used in attribute-metadata keys, assigned at registration
    pub id: u16,
    /// Equality matching rule
    pub equality: Option<MatchingRule>,
    /// Ordering matching rule (GE/LE)
    pub ordering: Option<MatchingRule>,
    /// Substring matching rule
    pub substring: Option<MatchingRule>,
    /// Values are distinguished names
    pub dn_typed: bool,
    /// Index configuration, `None` if unindexed
    pub index: Option<IndexDescriptor>,
}

impl AttributeDescriptor {
    /// Describe an attribute whose rules all derive from `rule`
    pub fn new(name: impl Into<String>, rule: MatchingRule) -> Self {
        Self {
            name: name.into(),
            id: 0,
            equality: Some(rule),
            ordering: rule.has_ordering().then_some(rule),
            substring: rule.has_substrings().then_some(rule),
            dn_typed: rule == MatchingRule::DistinguishedName,
            index: None,
        }
    }

    /// Attach an index configuration
    pub fn with_index(mut self, index: IndexDescriptor) -> Self {
        self.index = Some(index);
        self
    }

    /// Drop the ordering rule
    pub fn without_ordering(mut self) -> Self {
        self.ordering = None;
        self
    }

    /// Drop the substring rule
    pub fn without_substring(mut self) -> Self {
        self.substring = None;
        self
    }

    /// Normalize a stored value with the equality rule (raw bytes otherwise)
    pub fn normalize(&self, raw: &[u8]) -> Result<Vec<u8>> {
        match self.equality {
            Some(rule) => rule.normalize(raw),
            None => Ok(raw.to_vec()),
        }
    }

    /// Whether the attribute is indexed at all
    pub fn is_indexed(&self) -> bool {
        self.index.is_some()
    }
}

// ============================================================================
// Schema
// ============================================================================

/// Schema handle and index catalog
///
/// Maps attribute names (case-insensitively) to their descriptors. Build it
/// once, then share it as `Arc<Schema>` with the store.
#[derive(Debug, Default)]
pub struct Schema {
    attributes: FxHashMap<String, Arc<AttributeDescriptor>>,
    next_id: u16,
}

impl Schema {
    /// Create an empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Common directory attribute types
    ///
    /// - objectClass, cn, sn, mail: case-ignore, indexed (cn and sn with substrings)
    /// - uid: case-ignore, unique
    /// - member, manager: DN-typed, indexed
    /// - uidNumber: integer, numeric-ordered unique index
    /// - description: case-ignore, unindexed
    pub fn standard() -> Self {
        let mut schema = Self::new();
        let defs = [
            AttributeDescriptor::new("objectClass", MatchingRule::CaseIgnore)
                .with_index(IndexDescriptor::equality()),
            AttributeDescriptor::new("cn", MatchingRule::CaseIgnore)
                .with_index(IndexDescriptor::equality_and_substring()),
            AttributeDescriptor::new("sn", MatchingRule::CaseIgnore)
                .with_index(IndexDescriptor::equality_and_substring()),
            AttributeDescriptor::new("mail", MatchingRule::CaseIgnore)
                .with_index(IndexDescriptor::equality()),
            AttributeDescriptor::new("uid", MatchingRule::CaseIgnore)
                .with_index(IndexDescriptor::equality().unique()),
            AttributeDescriptor::new("member", MatchingRule::DistinguishedName)
                .with_index(IndexDescriptor::equality()),
            AttributeDescriptor::new("manager", MatchingRule::DistinguishedName)
                .with_index(IndexDescriptor::equality()),
            AttributeDescriptor::new("uidNumber", MatchingRule::Integer)
                .with_index(IndexDescriptor::equality().unique().numeric()),
            AttributeDescriptor::new("description", MatchingRule::CaseIgnore),
        ];
        for def in defs {
            // Names above are distinct, registration cannot fail
            let _ = schema.register(def);
        }
        schema
    }

    /// Register an attribute type and assign its id
    ///
    /// # Errors
    /// `InvalidParameter` if the name is empty or already registered, or if
    /// a numeric-ordered index is requested for a non-integer attribute.
    pub fn register(&mut self, mut desc: AttributeDescriptor) -> Result<u16> {
        if desc.name.is_empty() {
            return Err(Error::InvalidParameter("empty attribute name".to_string()));
        }
        let lookup = desc.name.to_ascii_lowercase();
        if self.attributes.contains_key(&lookup) {
            return Err(Error::InvalidParameter(format!(
                "attribute '{}' already registered",
                desc.name
            )));
        }
        if let Some(index) = &desc.index {
            if index.numeric_order && desc.equality != Some(MatchingRule::Integer) {
                return Err(Error::InvalidParameter(format!(
                    "numeric-ordered index on non-integer attribute '{}'",
                    desc.name
                )));
            }
        }
        self.next_id += 1;
        desc.id = self.next_id;
        self.attributes.insert(lookup, Arc::new(desc));
        Ok(self.next_id)
    }

    /// Look up a descriptor by name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&Arc<AttributeDescriptor>> {
        self.attributes.get(&name.to_ascii_lowercase())
    }

    /// Iterate over indexed attributes
    pub fn indexed(&self) -> impl Iterator<Item = &Arc<AttributeDescriptor>> {
        self.attributes.values().filter(|d| d.is_indexed())
    }

    /// Number of registered attributes
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Whether no attribute is registered
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_case_ignore() {
        assert_eq!(fold_case_ignore("  Hello \t  World  "), "hello world");
        assert_eq!(fold_case_ignore(""), "");
    }

    #[test]
    fn test_integer_normalization() {
        let rule = MatchingRule::Integer;
        assert_eq!(rule.normalize(b"00042").unwrap(), b"42".to_vec());
        assert_eq!(rule.normalize(b"000").unwrap(), b"0".to_vec());
        assert!(rule.normalize(b"-5").is_err());
        assert!(rule.normalize(b"4x").is_err());
        assert!(rule.normalize(b"").is_err());
    }

    #[test]
    fn test_integer_ordering_is_numeric() {
        let rule = MatchingRule::Integer;
        assert_eq!(rule.compare(b"9", b"10"), Some(Ordering::Less));
        assert_eq!(rule.compare(b"100", b"99"), Some(Ordering::Greater));
        assert_eq!(rule.compare(b"42", b"42"), Some(Ordering::Equal));
    }

    #[test]
    fn test_dn_rule_has_no_ordering() {
        let rule = MatchingRule::DistinguishedName;
        assert!(rule.compare(b"a", b"b").is_none());
        assert_eq!(
            rule.normalize(b"CN=A, DC=X").unwrap(),
            b"cn=a,dc=x".to_vec()
        );
    }

    #[test]
    fn test_fragment_keeps_boundary_spaces() {
        let rule = MatchingRule::CaseIgnore;
        assert_eq!(rule.normalize_fragment(b"John  ").unwrap(), b"john ".to_vec());
        assert_eq!(rule.normalize(b"John  ").unwrap(), b"john".to_vec());
    }

    #[test]
    fn test_non_utf8_rejected_by_string_rules() {
        assert!(MatchingRule::CaseIgnore.normalize(&[0xff, 0xfe]).is_err());
        assert!(MatchingRule::Octet.normalize(&[0xff, 0xfe]).is_ok());
    }

    #[test]
    fn test_descriptor_defaults_from_rule() {
        let cn = AttributeDescriptor::new("cn", MatchingRule::CaseIgnore);
        assert_eq!(cn.ordering, Some(MatchingRule::CaseIgnore));
        assert!(!cn.dn_typed);

        let member = AttributeDescriptor::new("member", MatchingRule::DistinguishedName);
        assert!(member.ordering.is_none());
        assert!(member.dn_typed);

        let num = AttributeDescriptor::new("uidNumber", MatchingRule::Integer);
        assert!(num.substring.is_none());
    }

    #[test]
    fn test_schema_register_and_lookup() {
        let mut schema = Schema::new();
        let id = schema
            .register(AttributeDescriptor::new("givenName", MatchingRule::CaseIgnore))
            .unwrap();
        assert_eq!(id, 1);
        let desc = schema.get("GIVENNAME").unwrap();
        assert_eq!(desc.name, "givenName");
        assert_eq!(desc.id, 1);

        let dup = schema.register(AttributeDescriptor::new("givenname", MatchingRule::CaseIgnore));
        assert!(matches!(dup, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_schema_rejects_numeric_index_on_strings() {
        let mut schema = Schema::new();
        let res = schema.register(
            AttributeDescriptor::new("cn", MatchingRule::CaseIgnore)
                .with_index(IndexDescriptor::equality().numeric()),
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_standard_schema() {
        let schema = Schema::standard();
        assert_eq!(schema.len(), 9);
        assert!(schema.get("uid").unwrap().index.as_ref().unwrap().unique);
        assert!(!schema.get("description").unwrap().is_indexed());
        assert_eq!(schema.indexed().count(), 8);
    }

    #[test]
    fn test_unique_storage_only_for_global_uniqueness() {
        let global = IndexDescriptor::equality().unique();
        assert!(global.unique_storage());
        let scoped = IndexDescriptor::equality()
            .unique()
            .scoped(vec![Dn::parse("ou=a,dc=x").unwrap()]);
        assert!(!scoped.unique_storage());
    }

    proptest::proptest! {
        #[test]
        fn prop_integer_ordering_matches_numeric(a in 0u64..u64::MAX, b in 0u64..u64::MAX) {
            let rule = MatchingRule::Integer;
            let na = rule.normalize(format!("{:0>5}", a).as_bytes()).unwrap();
            let nb = rule.normalize(b.to_string().as_bytes()).unwrap();
            proptest::prop_assert_eq!(rule.compare(&na, &nb), Some(a.cmp(&b)));
        }
    }
}
