//! Directory entries and modification deltas

use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::types::{Dn, EntryId};
use crate::value::{Attribute, AttributeValue};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

/// One directory entry
///
/// The store assigns `id` and `parent_id` on add. The encoded blob is cached
/// after the first [`encode`](Entry::encode) and dropped by every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    id: Option<EntryId>,
    dn: Dn,
    parent_id: Option<EntryId>,
    attributes: Vec<Attribute>,
    #[serde(skip)]
    encoded: OnceCell<Vec<u8>>,
}

impl Entry {
    /// Create an entry with no attributes
    pub fn new(dn: Dn) -> Self {
        Self {
            id: None,
            dn,
            parent_id: None,
            attributes: Vec::new(),
            encoded: OnceCell::new(),
        }
    }

    /// Builder: add an attribute with string values
    pub fn with_attribute(mut self, name: &str, values: &[&str]) -> Self {
        self.add_values(name, values.iter().map(|v| AttributeValue::from(*v)).collect());
        self
    }

    /// EntryID, `None` until stored
    pub fn id(&self) -> Option<EntryId> {
        self.id
    }

    /// Distinguished name
    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    /// Parent's EntryID, `None` for root entries and unstored entries
    pub fn parent_id(&self) -> Option<EntryId> {
        self.parent_id
    }

    /// Attributes in insertion order
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// DN of the parent entry
    ///
    /// A stored entry without a parent id is a root, whatever its DN text
    /// says (configured suffixes have several RDNs); its parent is the empty
    /// DN. Unstored entries derive the parent from the DN.
    pub fn parent_dn(&self) -> Dn {
        if self.id.is_some() && self.parent_id.is_none() {
            return Dn::root();
        }
        self.dn.parent().unwrap_or_else(Dn::root)
    }

    /// Look up an attribute by name (case-insensitive)
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.is_named(name))
    }

    /// Whether the entry has at least one value of the attribute
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).map(|a| !a.is_empty()).unwrap_or(false)
    }

    /// Record the identity assigned by the store
    pub fn assign(&mut self, id: EntryId, parent_id: Option<EntryId>) {
        self.id = Some(id);
        self.parent_id = parent_id;
        self.invalidate();
    }

    /// Replace the DN (rename)
    pub fn set_dn(&mut self, dn: Dn, parent_id: Option<EntryId>) {
        self.dn = dn;
        self.parent_id = parent_id;
        self.invalidate();
    }

    /// Append values to an attribute, creating it if needed
    ///
    /// Values already present (by normalized form) are skipped.
    pub fn add_values(&mut self, name: &str, values: Vec<AttributeValue>) {
        self.invalidate();
        match self.attributes.iter_mut().find(|a| a.is_named(name)) {
            Some(attr) => {
                for v in values {
                    attr.push_unique(v);
                }
            }
            None => self.attributes.push(Attribute::new(name, values)),
        }
    }

    /// Mutable access to an attribute
    pub fn attribute_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.invalidate();
        self.attributes.iter_mut().find(|a| a.is_named(name))
    }

    /// Remove an attribute entirely, returning it
    pub fn remove_attribute(&mut self, name: &str) -> Option<Attribute> {
        self.invalidate();
        let pos = self.attributes.iter().position(|a| a.is_named(name))?;
        Some(self.attributes.remove(pos))
    }

    /// Drop attributes left without values
    pub fn prune_empty(&mut self) {
        self.invalidate();
        self.attributes.retain(|a| !a.is_empty());
    }

    /// Normalize every value with the schema's matching rules
    ///
    /// Attributes the schema does not know keep their raw bytes as
    /// normalized form. Attributes listed twice under different spellings are
    /// merged first.
    pub fn normalize(&mut self, schema: &Schema) -> Result<()> {
        self.invalidate();
        let mut merged: Vec<Attribute> = Vec::with_capacity(self.attributes.len());
        for attr in self.attributes.drain(..) {
            match merged.iter_mut().find(|a| a.is_named(attr.name())) {
                Some(existing) => {
                    let name = existing.name().to_string();
                    let mut values = existing.values().to_vec();
                    values.extend(attr.values().iter().cloned());
                    *existing = Attribute::new(name, values);
                }
                None => merged.push(attr),
            }
        }
        for attr in &mut merged {
            if let Some(desc) = schema.get(attr.name()) {
                attr.normalize_with(desc)?;
            }
        }
        merged.retain(|a| !a.is_empty());
        self.attributes = merged;
        Ok(())
    }

    /// Encode the entry blob, caching the result
    pub fn encode(&self) -> Result<&[u8]> {
        self.encoded
            .get_or_try_init(|| bincode::serialize(self).map_err(Error::from))
            .map(Vec::as_slice)
    }

    /// Decode an entry blob
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut entry: Entry = bincode::deserialize(bytes)?;
        entry.encoded = OnceCell::from(bytes.to_vec());
        Ok(entry)
    }

    fn invalidate(&mut self) {
        self.encoded = OnceCell::new();
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.dn == other.dn
            && self.parent_id == other.parent_id
            && self.attributes == other.attributes
    }
}

// ============================================================================
// AttributeDelta
// ============================================================================

/// One change of a modify operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeDelta {
    /// Add values (already-present values are an error)
    Add {
        /// Attribute name
        attribute: String,
        /// Values to add
        values: Vec<AttributeValue>,
    },
    /// Delete the listed values, or the whole attribute if `values` is empty
    Delete {
        /// Attribute name
        attribute: String,
        /// Values to delete
        values: Vec<AttributeValue>,
    },
    /// Replace all values (empty `values` deletes the attribute)
    Replace {
        /// Attribute name
        attribute: String,
        /// New values
        values: Vec<AttributeValue>,
    },
    /// Move the entry to a new DN
    Rename {
        /// Target DN
        new_dn: Dn,
    },
}

impl AttributeDelta {
    /// Add string values
    pub fn add(attribute: &str, values: &[&str]) -> Self {
        AttributeDelta::Add {
            attribute: attribute.to_string(),
            values: values.iter().map(|v| AttributeValue::from(*v)).collect(),
        }
    }

    /// Delete string values (none = whole attribute)
    pub fn delete(attribute: &str, values: &[&str]) -> Self {
        AttributeDelta::Delete {
            attribute: attribute.to_string(),
            values: values.iter().map(|v| AttributeValue::from(*v)).collect(),
        }
    }

    /// Replace with string values
    pub fn replace(attribute: &str, values: &[&str]) -> Self {
        AttributeDelta::Replace {
            attribute: attribute.to_string(),
            values: values.iter().map(|v| AttributeValue::from(*v)).collect(),
        }
    }

    /// Attribute touched by this delta, `None` for renames
    pub fn attribute(&self) -> Option<&str> {
        match self {
            AttributeDelta::Add { attribute, .. }
            | AttributeDelta::Delete { attribute, .. }
            | AttributeDelta::Replace { attribute, .. } => Some(attribute),
            AttributeDelta::Rename { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> Entry {
        Entry::new(Dn::parse("cn=Alice,dc=x").unwrap())
            .with_attribute("objectClass", &["person"])
            .with_attribute("cn", &["Alice"])
    }

    #[test]
    fn test_attribute_lookup_is_case_insensitive() {
        let entry = person();
        assert!(entry.has_attribute("OBJECTCLASS"));
        assert!(entry.attribute("Cn").is_some());
        assert!(!entry.has_attribute("sn"));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut entry = person();
        entry.assign(EntryId::new(3), Some(EntryId::new(1)));
        let bytes = entry.encode().unwrap().to_vec();
        let decoded = Entry::decode(&bytes).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.id(), Some(EntryId::new(3)));
        assert_eq!(decoded.parent_id(), Some(EntryId::new(1)));
    }

    #[test]
    fn test_parent_dn_follows_root_status() {
        let mut suffix = Entry::new(Dn::parse("dc=example,dc=com").unwrap());
        assert_eq!(suffix.parent_dn(), Dn::parse("dc=com").unwrap());
        suffix.assign(EntryId::new(1), None);
        assert!(suffix.parent_dn().is_root());

        let mut child = person();
        child.assign(EntryId::new(2), Some(EntryId::new(1)));
        assert_eq!(child.parent_dn().normalized(), "dc=x");
    }

    #[test]
    fn test_mutation_drops_cached_blob() {
        let mut entry = person();
        let before = entry.encode().unwrap().to_vec();
        entry.add_values("sn", vec!["Smith".into()]);
        let after = entry.encode().unwrap().to_vec();
        assert_ne!(before, after);
    }

    #[test]
    fn test_normalize_merges_and_folds() {
        let schema = Schema::standard();
        let mut entry = Entry::new(Dn::parse("cn=A,dc=x").unwrap())
            .with_attribute("CN", &["Alice"])
            .with_attribute("cn", &["Al"]);
        entry.normalize(&schema).unwrap();
        let cn = entry.attribute("cn").unwrap();
        assert_eq!(cn.name(), "cn");
        assert_eq!(cn.len(), 2);
        assert!(cn.contains_normalized(b"alice"));
    }

    #[test]
    fn test_normalize_rejects_bad_integer() {
        let schema = Schema::standard();
        let mut entry =
            Entry::new(Dn::parse("cn=A,dc=x").unwrap()).with_attribute("uidNumber", &["abc"]);
        assert!(entry.normalize(&schema).is_err());
    }

    #[test]
    fn test_delta_helpers() {
        let d = AttributeDelta::add("cn", &["x"]);
        assert_eq!(d.attribute(), Some("cn"));
        let r = AttributeDelta::Rename {
            new_dn: Dn::parse("cn=B,dc=x").unwrap(),
        };
        assert!(r.attribute().is_none());
    }
}
