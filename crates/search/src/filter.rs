//! Filter tree
//!
//! A parsed search filter: boolean nodes own their children, leaves carry an
//! attribute descriptor resolved against the schema and assertion values
//! already normalized with the matching rule the leaf needs.
//!
//! Each node has two memo slots:
//! - `result`: a TRUE/FALSE/UNDEFINED that holds for every entry (for example
//!   UNDEFINED because the attribute type is unknown)
//! - `candidates`: the candidate set computed for the current search
//!
//! Per-value comparisons are never memoized.

use std::sync::Arc;

use once_cell::unsync::OnceCell;

use dirstore_core::schema::MatchingRule;
use dirstore_core::{AttributeDescriptor, Dn, Schema};

use crate::candidate::CandidateSet;

/// Three-valued filter result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Truth {
    /// The entry matches
    True,
    /// The entry does not match
    False,
    /// Match cannot be determined
    Undefined,
}

impl Truth {
    /// TRUE/FALSE from a boolean
    pub fn from_bool(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }

    /// Negation; UNDEFINED stays UNDEFINED
    pub fn negate(self) -> Self {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Undefined => Truth::Undefined,
        }
    }

    /// Whether this is TRUE
    pub fn is_true(self) -> bool {
        self == Truth::True
    }
}

/// Attribute/value assertion of an EQUALITY, GE or LE leaf
#[derive(Debug, Clone)]
pub struct Assertion {
    attribute: String,
    descriptor: Option<Arc<AttributeDescriptor>>,
    rule: Option<MatchingRule>,
    value: Option<Vec<u8>>,
}

impl Assertion {
    fn resolve(
        schema: &Schema,
        attribute: &str,
        raw: &[u8],
        pick: impl Fn(&AttributeDescriptor) -> Option<MatchingRule>,
    ) -> Self {
        let descriptor = schema.get(attribute).cloned();
        let rule = descriptor.as_deref().and_then(pick);
        let value = rule.and_then(|r| r.normalize(raw).ok());
        Self {
            attribute: attribute.to_string(),
            descriptor,
            rule,
            value,
        }
    }

    /// Attribute name as written in the filter
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Resolved descriptor, `None` for unknown attribute types
    pub fn descriptor(&self) -> Option<&Arc<AttributeDescriptor>> {
        self.descriptor.as_ref()
    }

    /// Matching rule used for the comparison, `None` if the type has none
    pub fn rule(&self) -> Option<MatchingRule> {
        self.rule
    }

    /// Normalized assertion value, `None` if it could not be normalized
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Whether the leaf is UNDEFINED for every entry
    pub fn is_undefined(&self) -> bool {
        self.value.is_none()
    }
}

/// SUBSTRINGS assertion with normalized fragments
#[derive(Debug, Clone)]
pub struct SubstringAssertion {
    attribute: String,
    descriptor: Option<Arc<AttributeDescriptor>>,
    initial: Option<Vec<u8>>,
    any: Vec<Vec<u8>>,
    final_: Option<Vec<u8>>,
    dn_suffix: Option<Dn>,
    valid: bool,
}

impl SubstringAssertion {
    fn resolve(
        schema: &Schema,
        attribute: &str,
        initial: Option<&str>,
        any: &[&str],
        final_: Option<&str>,
    ) -> Self {
        let descriptor = schema.get(attribute).cloned();
        let rule = descriptor.as_deref().and_then(|d| d.substring);
        let mut out = Self {
            attribute: attribute.to_string(),
            descriptor: descriptor.clone(),
            initial: None,
            any: Vec::new(),
            final_: None,
            dn_suffix: None,
            valid: false,
        };
        let Some(rule) = rule else {
            return out;
        };
        let fragment = |s: &str| rule.normalize_fragment(s.as_bytes()).ok();
        // Stored string values are trimmed at both ends
        let trims = !matches!(rule, MatchingRule::Octet | MatchingRule::Integer);

        let initial_norm = match initial.map(|s| fragment(if trims { s.trim_start() } else { s })) {
            Some(None) => return out,
            Some(Some(v)) => Some(v),
            None => None,
        };
        let mut final_norm = match final_.map(|s| fragment(if trims { s.trim_end() } else { s })) {
            Some(None) => return out,
            Some(Some(v)) => Some(v),
            None => None,
        };
        let mut any_norm = Vec::with_capacity(any.len());
        for s in any {
            match fragment(s) {
                Some(v) => any_norm.push(v),
                None => return out,
            }
        }

        let dn_typed = descriptor.as_deref().map(|d| d.dn_typed).unwrap_or(false);
        if dn_typed && initial.is_none() && any.is_empty() {
            out.dn_suffix = final_
                .and_then(|s| Dn::parse(s.trim_start_matches(',')).ok())
                .filter(|dn| !dn.is_root());
            if let Some(suffix) = &out.dn_suffix {
                final_norm = Some(format!(",{}", suffix.normalized()).into_bytes());
            }
        }
        out.initial = initial_norm;
        out.any = any_norm;
        out.final_ = final_norm;
        out.valid = true;
        out
    }

    /// Attribute name as written in the filter
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Resolved descriptor
    pub fn descriptor(&self) -> Option<&Arc<AttributeDescriptor>> {
        self.descriptor.as_ref()
    }

    /// Normalized initial fragment
    pub fn initial(&self) -> Option<&[u8]> {
        self.initial.as_deref()
    }

    /// Normalized middle fragments, in order
    pub fn any(&self) -> &[Vec<u8>] {
        &self.any
    }

    /// Normalized final fragment
    pub fn final_fragment(&self) -> Option<&[u8]> {
        self.final_.as_deref()
    }

    /// Subtree to match DN-typed values against, for a final-only DN filter
    pub fn dn_suffix(&self) -> Option<&Dn> {
        self.dn_suffix.as_ref()
    }

    /// Whether the leaf is UNDEFINED for every entry
    pub fn is_undefined(&self) -> bool {
        !self.valid
    }
}

/// The nine filter kinds
#[derive(Debug, Clone)]
pub enum FilterKind {
    /// All children must match
    And(Vec<Filter>),
    /// Any child must match
    Or(Vec<Filter>),
    /// Negation
    Not(Box<Filter>),
    /// Equality match
    Equality(Assertion),
    /// Ordering match, value >= assertion
    GreaterOrEqual(Assertion),
    /// Ordering match, value <= assertion
    LessOrEqual(Assertion),
    /// Substring match
    Substrings(SubstringAssertion),
    /// Attribute presence
    Present(String),
    /// Immediate children of a DN
    OneLevel(Dn),
}

/// One node of a filter tree
#[derive(Debug, Clone)]
pub struct Filter {
    kind: FilterKind,
    result: OnceCell<Truth>,
    candidates: OnceCell<CandidateSet>,
}

impl Filter {
    fn node(kind: FilterKind) -> Self {
        Self {
            kind,
            result: OnceCell::new(),
            candidates: OnceCell::new(),
        }
    }

    /// AND of the children (empty AND is TRUE)
    pub fn and(children: Vec<Filter>) -> Self {
        Self::node(FilterKind::And(children))
    }

    /// OR of the children (empty OR is FALSE)
    pub fn or(children: Vec<Filter>) -> Self {
        Self::node(FilterKind::Or(children))
    }

    /// NOT of the child
    #[allow(clippy::should_implement_trait)]
    pub fn not(child: Filter) -> Self {
        Self::node(FilterKind::Not(Box::new(child)))
    }

    /// `(attribute=value)`
    pub fn equality(schema: &Schema, attribute: &str, value: impl AsRef<[u8]>) -> Self {
        Self::node(FilterKind::Equality(Assertion::resolve(
            schema,
            attribute,
            value.as_ref(),
            |d| d.equality,
        )))
    }

    /// `(attribute>=value)`
    pub fn greater_or_equal(schema: &Schema, attribute: &str, value: impl AsRef<[u8]>) -> Self {
        Self::node(FilterKind::GreaterOrEqual(Assertion::resolve(
            schema,
            attribute,
            value.as_ref(),
            |d| d.ordering,
        )))
    }

    /// `(attribute<=value)`
    pub fn less_or_equal(schema: &Schema, attribute: &str, value: impl AsRef<[u8]>) -> Self {
        Self::node(FilterKind::LessOrEqual(Assertion::resolve(
            schema,
            attribute,
            value.as_ref(),
            |d| d.ordering,
        )))
    }

    /// `(attribute=initial*any*...*final)`
    pub fn substrings(
        schema: &Schema,
        attribute: &str,
        initial: Option<&str>,
        any: &[&str],
        final_: Option<&str>,
    ) -> Self {
        Self::node(FilterKind::Substrings(SubstringAssertion::resolve(
            schema, attribute, initial, any, final_,
        )))
    }

    /// `(attribute=*)`
    pub fn present(attribute: &str) -> Self {
        Self::node(FilterKind::Present(attribute.to_string()))
    }

    /// Immediate children of `parent`
    pub fn one_level(parent: Dn) -> Self {
        Self::node(FilterKind::OneLevel(parent))
    }

    /// Node kind
    pub fn kind(&self) -> &FilterKind {
        &self.kind
    }

    /// Whether this node is a leaf (not AND/OR/NOT)
    pub fn is_leaf(&self) -> bool {
        !matches!(
            self.kind,
            FilterKind::And(_) | FilterKind::Or(_) | FilterKind::Not(_)
        )
    }

    /// Entry-independent result, if known
    pub fn memoized_result(&self) -> Option<Truth> {
        self.result.get().copied()
    }

    pub(crate) fn memoize_result(&self, truth: Truth) -> Truth {
        *self.result.get_or_init(|| truth)
    }

    /// Candidate set computed for the current search, if any
    pub fn memoized_candidates(&self) -> Option<&CandidateSet> {
        self.candidates.get()
    }

    pub(crate) fn memoize_candidates(&self, set: CandidateSet) -> &CandidateSet {
        self.candidates.get_or_init(|| set)
    }

    /// Clear both memo slots of the whole tree
    pub fn reset(&mut self) {
        self.result = OnceCell::new();
        self.candidates = OnceCell::new();
        match &mut self.kind {
            FilterKind::And(children) | FilterKind::Or(children) => {
                for child in children {
                    child.reset();
                }
            }
            FilterKind::Not(child) => child.reset(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truth_negation() {
        assert_eq!(Truth::True.negate(), Truth::False);
        assert_eq!(Truth::False.negate(), Truth::True);
        assert_eq!(Truth::Undefined.negate(), Truth::Undefined);
    }

    #[test]
    fn test_equality_normalizes_assertion() {
        let schema = Schema::standard();
        let f = Filter::equality(&schema, "CN", "  Alice   Smith ");
        let FilterKind::Equality(a) = f.kind() else {
            panic!("expected equality");
        };
        assert_eq!(a.value(), Some(&b"alice smith"[..]));
        assert_eq!(a.descriptor().unwrap().name, "cn");
    }

    #[test]
    fn test_unknown_attribute_is_undefined() {
        let schema = Schema::standard();
        let f = Filter::equality(&schema, "favouriteColour", "blue");
        let FilterKind::Equality(a) = f.kind() else {
            panic!("expected equality");
        };
        assert!(a.is_undefined());
    }

    #[test]
    fn test_bad_integer_assertion_is_undefined() {
        let schema = Schema::standard();
        let f = Filter::greater_or_equal(&schema, "uidNumber", "ten");
        let FilterKind::GreaterOrEqual(a) = f.kind() else {
            panic!("expected ge");
        };
        assert!(a.is_undefined());
    }

    #[test]
    fn test_ordering_needs_ordering_rule() {
        let schema = Schema::standard();
        let f = Filter::less_or_equal(&schema, "member", "cn=a,dc=x");
        let FilterKind::LessOrEqual(a) = f.kind() else {
            panic!("expected le");
        };
        assert!(a.rule().is_none());
        assert!(a.is_undefined());
    }

    #[test]
    fn test_substring_fragments_normalized() {
        let schema = Schema::standard();
        let f = Filter::substrings(&schema, "cn", Some(" Jo"), &["HN  x"], Some("Doe "));
        let FilterKind::Substrings(s) = f.kind() else {
            panic!("expected substrings");
        };
        assert_eq!(s.initial(), Some(&b"jo"[..]));
        assert_eq!(s.any(), &[b"hn x".to_vec()]);
        assert_eq!(s.final_fragment(), Some(&b"doe"[..]));
        assert!(s.dn_suffix().is_none());
    }

    #[test]
    fn test_dn_substring_final_only_becomes_suffix() {
        let schema = Schema::standard();
        let f = Filter::substrings(&schema, "member", None, &[], Some(", OU=People,DC=X"));
        let FilterKind::Substrings(s) = f.kind() else {
            panic!("expected substrings");
        };
        assert_eq!(s.dn_suffix().unwrap().normalized(), "ou=people,dc=x");
        assert_eq!(s.final_fragment(), Some(&b",ou=people,dc=x"[..]));
    }

    #[test]
    fn test_substrings_on_integer_undefined() {
        let schema = Schema::standard();
        let f = Filter::substrings(&schema, "uidNumber", Some("1"), &[], None);
        let FilterKind::Substrings(s) = f.kind() else {
            panic!("expected substrings");
        };
        assert!(s.is_undefined());
    }

    #[test]
    fn test_reset_clears_memos_recursively() {
        let schema = Schema::standard();
        let mut f = Filter::and(vec![Filter::present("cn"), Filter::equality(&schema, "x", "y")]);
        f.memoize_result(Truth::Undefined);
        if let FilterKind::And(children) = f.kind() {
            children[1].memoize_result(Truth::Undefined);
            children[1].memoize_candidates(CandidateSet::unusable());
        }
        f.reset();
        assert!(f.memoized_result().is_none());
        if let FilterKind::And(children) = f.kind() {
            assert!(children[1].memoized_result().is_none());
            assert!(children[1].memoized_candidates().is_none());
        }
    }
}
