//! Tri-valued filter evaluation against one entry
//!
//! Entry-independent UNDEFINED results (unknown attribute type, missing
//! matching rule, unparseable assertion) are memoized on the leaf; per-value
//! comparisons never are.

use std::borrow::Cow;
use std::cmp::Ordering;

use dirstore_core::{AttributeValue, Dn, Entry, MatchingRule};

use crate::filter::{Assertion, Filter, FilterKind, SubstringAssertion, Truth};

/// Evaluate a filter tree against an entry
pub fn evaluate(filter: &Filter, entry: &Entry) -> Truth {
    if let Some(memo) = filter.memoized_result() {
        return memo;
    }
    match filter.kind() {
        FilterKind::And(children) => {
            let mut undefined = false;
            for child in children {
                match evaluate(child, entry) {
                    Truth::False => return Truth::False,
                    Truth::Undefined => undefined = true,
                    Truth::True => {}
                }
            }
            if undefined {
                Truth::Undefined
            } else {
                Truth::True
            }
        }
        FilterKind::Or(children) => {
            let mut undefined = false;
            for child in children {
                match evaluate(child, entry) {
                    Truth::True => return Truth::True,
                    Truth::Undefined => undefined = true,
                    Truth::False => {}
                }
            }
            if undefined {
                Truth::Undefined
            } else {
                Truth::False
            }
        }
        FilterKind::Not(child) => evaluate(child, entry).negate(),
        FilterKind::Equality(a) => match_assertion(filter, a, entry, |ord| ord == Ordering::Equal),
        FilterKind::GreaterOrEqual(a) => {
            match_assertion(filter, a, entry, |ord| ord != Ordering::Less)
        }
        FilterKind::LessOrEqual(a) => {
            match_assertion(filter, a, entry, |ord| ord != Ordering::Greater)
        }
        FilterKind::Substrings(s) => match_substrings(filter, s, entry),
        FilterKind::Present(attribute) => Truth::from_bool(entry.has_attribute(attribute)),
        FilterKind::OneLevel(parent) => {
            Truth::from_bool(entry.parent_dn().normalized() == parent.normalized())
        }
    }
}

/// Comparable form of a stored value under `rule`
///
/// Stored values are normalized with the equality rule; a different rule
/// renormalizes the raw bytes.
fn comparable<'v>(
    value: &'v AttributeValue,
    rule: MatchingRule,
    equality: Option<MatchingRule>,
) -> Option<Cow<'v, [u8]>> {
    if equality == Some(rule) {
        Some(Cow::Borrowed(value.normalized()))
    } else {
        rule.normalize(value.raw()).ok().map(Cow::Owned)
    }
}

fn match_assertion(
    node: &Filter,
    assertion: &Assertion,
    entry: &Entry,
    accept: impl Fn(Ordering) -> bool,
) -> Truth {
    let (Some(descriptor), Some(rule), Some(wanted)) =
        (assertion.descriptor(), assertion.rule(), assertion.value())
    else {
        return node.memoize_result(Truth::Undefined);
    };
    let Some(attr) = entry.attribute(&descriptor.name) else {
        return Truth::False;
    };
    let found = attr.values().iter().any(|v| {
        comparable(v, rule, descriptor.equality)
            .and_then(|bytes| {
                rule.compare(&bytes, wanted)
                    .or_else(|| rule.equal(&bytes, wanted).then_some(Ordering::Equal))
            })
            .map(&accept)
            .unwrap_or(false)
    });
    Truth::from_bool(found)
}

fn match_substrings(node: &Filter, assertion: &SubstringAssertion, entry: &Entry) -> Truth {
    let Some(descriptor) = assertion.descriptor().filter(|_| !assertion.is_undefined()) else {
        return node.memoize_result(Truth::Undefined);
    };
    let Some(attr) = entry.attribute(&descriptor.name) else {
        return Truth::False;
    };

    if let Some(suffix) = assertion.dn_suffix() {
        let found = attr.values().iter().any(|v| {
            std::str::from_utf8(v.normalized())
                .ok()
                .and_then(|s| Dn::parse(s).ok())
                .map(|dn| dn.is_descendant_of(suffix))
                .unwrap_or(false)
        });
        return Truth::from_bool(found);
    }

    let Some(rule) = descriptor.substring else {
        return node.memoize_result(Truth::Undefined);
    };
    let found = attr.values().iter().any(|v| {
        comparable(v, rule, descriptor.equality)
            .map(|bytes| {
                substring_match(
                    &bytes,
                    assertion.initial(),
                    assertion.any(),
                    assertion.final_fragment(),
                )
            })
            .unwrap_or(false)
    });
    Truth::from_bool(found)
}

/// Match a normalized value against substring fragments
///
/// `initial` must be a prefix and `final_` a suffix, and the two may not
/// overlap. Every `any` fragment must then occur, in order and without
/// overlapping its predecessor, in the span between them. Fragments may be
/// adjacent: `ab*cd*ef` matches `abcdef`.
pub fn substring_match(
    value: &[u8],
    initial: Option<&[u8]>,
    any: &[Vec<u8>],
    final_: Option<&[u8]>,
) -> bool {
    let mut start = 0;
    let mut end = value.len();

    if let Some(initial) = initial {
        if !value.starts_with(initial) {
            return false;
        }
        start = initial.len();
    }
    if let Some(final_) = final_ {
        if value.len() < start + final_.len() || !value.ends_with(final_) {
            return false;
        }
        end = value.len() - final_.len();
    }

    let mut pos = start;
    for fragment in any {
        match find_fragment(&value[pos..end], fragment) {
            Some(offset) => pos += offset + fragment.len(),
            None => return false,
        }
    }
    true
}

/// Leftmost occurrence of `needle` in `haystack`
///
/// On a mismatch the window advances by one byte, so fragments with
/// repeated leading bytes (`aab` in `aaab`) are still found. Taking the
/// leftmost occurrence ends each fragment as early as possible, which leaves
/// the most room for the fragments after it.
fn find_fragment(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}
