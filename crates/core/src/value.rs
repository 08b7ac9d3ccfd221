//! Attribute values and attributes
//!
//! This module defines:
//! - AttributeValue: raw bytes plus the normalized form indices and filters use
//! - ValueMeta: per-value replication metadata carried through the store
//! - Attribute: named, ordered list of values
//! - AttributeMeta: per-attribute change metadata persisted by the store

use crate::error::{Error, Result};
use crate::schema::AttributeDescriptor;
use serde::{Deserialize, Serialize};

/// Replication metadata attached to a single value
///
/// Produced and consumed by the replication layer; this store only carries
/// it through the entry blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueMeta {
    /// Replica that originated the value
    pub origin: u32,
    /// Per-value version counter
    pub version: u64,
    /// Update sequence number at which the value was written
    pub usn: u64,
}

/// Change metadata of one attribute of one entry
///
/// Persisted under `EntryID-bytes ++ ':' ++ attribute-id`. Every write
/// transaction that changes the attribute bumps `version` and stamps the
/// transaction's USN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMeta {
    /// Replica that made the last change
    pub origin: u32,
    /// Number of changes applied to the attribute
    pub version: u64,
    /// USN of the last change
    pub usn: u64,
}

impl AttributeMeta {
    /// Metadata for a freshly created attribute
    pub fn created(origin: u32, usn: u64) -> Self {
        Self {
            origin,
            version: 1,
            usn,
        }
    }

    /// Metadata after one more change
    pub fn bumped(&self, origin: u32, usn: u64) -> Self {
        Self {
            origin,
            version: self.version + 1,
            usn,
        }
    }
}

// ============================================================================
// AttributeValue
// ============================================================================

/// One value of an attribute
///
/// `normalized` starts out equal to `raw` and is recomputed with the
/// attribute's matching rule when the owning entry is normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeValue {
    raw: Vec<u8>,
    normalized: Vec<u8>,
    meta: Option<ValueMeta>,
}

impl AttributeValue {
    /// Create a value from raw bytes
    pub fn new(raw: impl Into<Vec<u8>>) -> Self {
        let raw = raw.into();
        Self {
            normalized: raw.clone(),
            raw,
            meta: None,
        }
    }

    /// Attach replication metadata
    pub fn with_meta(mut self, meta: ValueMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Raw bytes as supplied by the caller
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Normalized bytes
    pub fn normalized(&self) -> &[u8] {
        &self.normalized
    }

    /// Raw value as text, lossily decoded
    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }

    /// Replication metadata, if any
    pub fn meta(&self) -> Option<&ValueMeta> {
        self.meta.as_ref()
    }

    /// Recompute the normalized form with the descriptor's equality rule
    pub fn normalize_with(&mut self, desc: &AttributeDescriptor) -> Result<()> {
        self.normalized = desc.normalize(&self.raw)?;
        Ok(())
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        Self::new(s.into_bytes())
    }
}

// ============================================================================
// Attribute
// ============================================================================

/// Named, ordered list of values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    name: String,
    values: Vec<AttributeValue>,
}

impl Attribute {
    /// Create an attribute
    pub fn new(name: impl Into<String>, values: Vec<AttributeValue>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// Attribute name as stored
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this attribute has the given name (case-insensitive)
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Values in insertion order
    pub fn values(&self) -> &[AttributeValue] {
        &self.values
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the attribute has no values
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether a value with this normalized form is present
    pub fn contains_normalized(&self, normalized: &[u8]) -> bool {
        self.values.iter().any(|v| v.normalized() == normalized)
    }

    /// Append a value unless an equal (normalized) value is present
    ///
    /// Returns true if the value was added.
    pub fn push_unique(&mut self, value: AttributeValue) -> bool {
        if self.contains_normalized(value.normalized()) {
            return false;
        }
        self.values.push(value);
        true
    }

    /// Remove the value with this normalized form
    ///
    /// Returns the removed value.
    pub fn remove_normalized(&mut self, normalized: &[u8]) -> Option<AttributeValue> {
        let pos = self.values.iter().position(|v| v.normalized() == normalized)?;
        Some(self.values.remove(pos))
    }

    /// Normalize all values with the descriptor and adopt its canonical name
    ///
    /// # Errors
    /// `InvalidParameter` on a value the matching rule rejects, or when two
    /// values normalize to the same form.
    pub fn normalize_with(&mut self, desc: &AttributeDescriptor) -> Result<()> {
        self.name = desc.name.clone();
        for value in &mut self.values {
            value.normalize_with(desc)?;
        }
        for (i, value) in self.values.iter().enumerate() {
            if self.values[..i]
                .iter()
                .any(|earlier| earlier.normalized() == value.normalized())
            {
                return Err(Error::InvalidParameter(format!(
                    "duplicate value '{}' for attribute '{}'",
                    value.as_str_lossy(),
                    self.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::MatchingRule;

    #[test]
    fn test_value_starts_unnormalized() {
        let v = AttributeValue::from("Alice");
        assert_eq!(v.raw(), b"Alice");
        assert_eq!(v.normalized(), b"Alice");
        assert!(v.meta().is_none());
    }

    #[test]
    fn test_attribute_normalize_with() {
        let desc = AttributeDescriptor::new("cn", MatchingRule::CaseIgnore);
        let mut attr = Attribute::new("CN", vec!["Alice  Smith".into(), "bob".into()]);
        attr.normalize_with(&desc).unwrap();
        assert_eq!(attr.name(), "cn");
        assert!(attr.contains_normalized(b"alice smith"));
        assert_eq!(attr.values()[0].raw(), b"Alice  Smith");
    }

    #[test]
    fn test_attribute_rejects_duplicate_normalized_values() {
        let desc = AttributeDescriptor::new("cn", MatchingRule::CaseIgnore);
        let mut attr = Attribute::new("cn", vec!["Alice".into(), "ALICE".into()]);
        assert!(matches!(
            attr.normalize_with(&desc),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_push_unique_and_remove() {
        let mut attr = Attribute::new("cn", vec!["a".into()]);
        assert!(!attr.push_unique("a".into()));
        assert!(attr.push_unique("b".into()));
        assert_eq!(attr.len(), 2);
        assert!(attr.remove_normalized(b"a").is_some());
        assert!(attr.remove_normalized(b"a").is_none());
        assert_eq!(attr.len(), 1);
    }

    #[test]
    fn test_attribute_meta_bump() {
        let meta = AttributeMeta::created(1, 10);
        let next = meta.bumped(2, 11);
        assert_eq!(next.version, 2);
        assert_eq!(next.origin, 2);
        assert_eq!(next.usn, 11);
    }
}
