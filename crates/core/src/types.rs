//! Core identity types for the directory store
//!
//! This module defines the foundational types:
//! - EntryId: Dense 64-bit primary key of every entry
//! - Dn: Distinguished name with its normalized form

use crate::error::{Error, Result};
use crate::schema::fold_case_ignore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Dense primary key identifying one directory entry
///
/// EntryIDs are assigned from a persistent, append-only sequence and are
/// never reused once committed. `EntryId(0)` is never assigned; the first
/// entry receives id 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(u64);

impl EntryId {
    /// Smallest assignable id
    pub const FIRST: EntryId = EntryId(1);

    /// Wrap a raw id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw numeric value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The id following this one in the sequence
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntryId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// ============================================================================
// Distinguished names
// ============================================================================

/// Distinguished name
///
/// Holds the caller-supplied form of each RDN next to its normalized form.
/// Normalization lowercases attribute types, folds values with case-ignore
/// rules (trim, collapse whitespace, lowercase) and sorts the AVAs of
/// multi-valued RDNs, so two DNs naming the same entry compare equal on
/// `normalized()`.
///
/// RDNs are stored leaf first: `cn=A,dc=x` has `rdns() == ["cn=a", "dc=x"]`.
/// The empty DN (zero RDNs) is the root of the naming tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dn {
    raw_rdns: Vec<String>,
    rdns: Vec<String>,
    normalized: String,
}

impl Dn {
    /// Parse a DN string
    ///
    /// Commas and plus signs escaped with a backslash are part of the value.
    ///
    /// # Errors
    /// `InvalidParameter` if an RDN is empty or lacks `type=value` form.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let mut raw_rdns = Vec::new();
        let mut rdns = Vec::new();
        for raw in split_unescaped(trimmed, ',') {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(Error::InvalidParameter(format!("empty RDN in DN '{}'", s)));
            }
            rdns.push(normalize_rdn(raw, s)?);
            raw_rdns.push(raw.to_string());
        }

        Ok(Self::from_parts(raw_rdns, rdns))
    }

    /// The empty DN
    pub fn root() -> Self {
        Self {
            raw_rdns: Vec::new(),
            rdns: Vec::new(),
            normalized: String::new(),
        }
    }

    fn from_parts(raw_rdns: Vec<String>, rdns: Vec<String>) -> Self {
        let normalized = rdns.join(",");
        Self {
            raw_rdns,
            rdns,
            normalized,
        }
    }

    /// Normalized string form, used as the DN index key
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Normalized RDNs, leaf first
    pub fn rdns(&self) -> &[String] {
        &self.rdns
    }

    /// Leaf RDN in normalized form, `None` for the empty DN
    pub fn rdn(&self) -> Option<&str> {
        self.rdns.first().map(String::as_str)
    }

    /// Number of RDNs
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// Whether this is the empty DN
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// DN of the parent, `None` for the empty DN
    ///
    /// The parent of a single-RDN DN is the empty DN.
    pub fn parent(&self) -> Option<Dn> {
        if self.is_root() {
            return None;
        }
        Some(Self::from_parts(
            self.raw_rdns[1..].to_vec(),
            self.rdns[1..].to_vec(),
        ))
    }

    /// Whether `self` lies strictly below `ancestor`
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        self.depth() > ancestor.depth() && self.ends_with(ancestor)
    }

    /// Whether `self` equals `base` or lies below it
    pub fn is_within(&self, base: &Dn) -> bool {
        self.depth() >= base.depth() && self.ends_with(base)
    }

    fn ends_with(&self, suffix: &Dn) -> bool {
        let skip = self.depth() - suffix.depth();
        self.rdns[skip..] == suffix.rdns[..]
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for Dn {}

impl std::hash::Hash for Dn {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw_rdns.join(","))
    }
}

impl std::str::FromStr for Dn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Dn::parse(s)
    }
}

/// Split on `sep` occurrences not preceded by an escaping backslash
fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

fn normalize_rdn(raw: &str, dn: &str) -> Result<String> {
    let mut avas = Vec::new();
    for ava in split_unescaped(raw, '+') {
        let (attr, value) = ava.split_once('=').ok_or_else(|| {
            Error::InvalidParameter(format!("RDN '{}' of DN '{}' is not type=value", raw, dn))
        })?;
        let attr = attr.trim();
        if attr.is_empty() {
            return Err(Error::InvalidParameter(format!(
                "RDN '{}' of DN '{}' has an empty attribute type",
                raw, dn
            )));
        }
        avas.push(format!(
            "{}={}",
            attr.to_ascii_lowercase(),
            fold_case_ignore(value)
        ));
    }
    avas.sort();
    Ok(avas.join("+"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================
    // EntryId Tests
    // ========================================

    #[test]
    fn test_entry_id_ordering_and_next() {
        let a = EntryId::new(7);
        assert_eq!(a.next(), EntryId::new(8));
        assert!(a < a.next());
        assert_eq!(EntryId::FIRST.as_u64(), 1);
        assert_eq!(a.to_string(), "7");
    }

    // ========================================
    // Dn Tests
    // ========================================

    #[test]
    fn test_dn_normalization() {
        let dn = Dn::parse("CN=John   Smith , DC=Example,dc=COM").unwrap();
        assert_eq!(dn.normalized(), "cn=john smith,dc=example,dc=com");
        assert_eq!(dn.depth(), 3);
        assert_eq!(dn.rdn(), Some("cn=john smith"));
        assert_eq!(dn.to_string(), "CN=John   Smith,DC=Example,dc=COM");
    }

    #[test]
    fn test_dn_equality_is_on_normalized_form() {
        let a = Dn::parse("cn=A,dc=x").unwrap();
        let b = Dn::parse("CN=a, DC=X").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_dn_parent_chain() {
        let dn = Dn::parse("cn=A,ou=People,dc=x").unwrap();
        let parent = dn.parent().unwrap();
        assert_eq!(parent.normalized(), "ou=people,dc=x");
        let top = parent.parent().unwrap();
        assert_eq!(top.normalized(), "dc=x");
        let root = top.parent().unwrap();
        assert!(root.is_root());
        assert_eq!(root.normalized(), "");
        assert!(root.parent().is_none());
    }

    #[test]
    fn test_dn_escaped_comma() {
        let dn = Dn::parse(r"cn=Smith\, John,dc=x").unwrap();
        assert_eq!(dn.depth(), 2);
        assert_eq!(dn.rdn(), Some(r"cn=smith\, john"));
    }

    #[test]
    fn test_dn_multi_valued_rdn_sorted() {
        let a = Dn::parse("uid=j+cn=J,dc=x").unwrap();
        let b = Dn::parse("cn=j+uid=J,dc=x").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.rdn(), Some("cn=j+uid=j"));
    }

    #[test]
    fn test_dn_descendant_checks() {
        let base = Dn::parse("dc=x").unwrap();
        let child = Dn::parse("cn=A,dc=x").unwrap();
        let other = Dn::parse("cn=A,dc=xx").unwrap();
        assert!(child.is_descendant_of(&base));
        assert!(child.is_within(&base));
        assert!(base.is_within(&base));
        assert!(!base.is_descendant_of(&base));
        assert!(!other.is_within(&base));
        assert!(child.is_within(&Dn::root()));
    }

    #[test]
    fn test_dn_invalid() {
        assert!(matches!(
            Dn::parse("cn=A,,dc=x"),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            Dn::parse("justtext"),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(Dn::parse("=x"), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_dn_empty_is_root() {
        assert!(Dn::parse("").unwrap().is_root());
        assert!(Dn::parse("   ").unwrap().is_root());
    }
}
