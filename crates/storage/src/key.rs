//! Key codec for index and structural tables
//!
//! ## Layout
//!
//! - Index key: 1-byte tag followed by value bytes. `F` (0x46) keys hold the
//!   normalized value as-is, `R` (0x52) keys hold it byte-reversed, so both
//!   prefix and suffix matches become ordered-range scans.
//! - EntryID key: big-endian bytes trimmed to the minimum width that
//!   represents the id (at least one byte). Tables keyed this way order keys
//!   length-then-magnitude, which is numeric order.
//! - Attribute-metadata key: `EntryID-bytes ++ ':' ++ 2-byte attribute id`.
//!
//! Keys with different tags never compare as equivalent.

use byteorder::{BigEndian, ByteOrder};
use dirstore_core::{EntryId, Error, Result};
use std::cmp::Ordering;

/// Tag byte of forward keys
pub const FWD_TAG: u8 = b'F';

/// Tag byte of reverse keys
pub const REV_TAG: u8 = b'R';

/// Separator inside attribute-metadata keys
pub const META_SEPARATOR: u8 = b':';

/// Kind of index key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyTag {
    /// Value bytes as-is
    Forward,
    /// Value bytes reversed
    Reverse,
}

impl KeyTag {
    /// Tag byte written in front of the value
    pub fn byte(&self) -> u8 {
        match self {
            KeyTag::Forward => FWD_TAG,
            KeyTag::Reverse => REV_TAG,
        }
    }

    /// Parse a tag byte
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            FWD_TAG => Some(KeyTag::Forward),
            REV_TAG => Some(KeyTag::Reverse),
            _ => None,
        }
    }
}

fn check_len(len: usize, max_key_bytes: usize) -> Result<()> {
    if len + 1 > max_key_bytes {
        return Err(Error::InvalidParameter(format!(
            "index key of {} bytes exceeds limit of {}",
            len + 1,
            max_key_bytes
        )));
    }
    Ok(())
}

/// Forward key: `F ++ value`
///
/// # Errors
/// `InvalidParameter` if the key would exceed `max_key_bytes`.
pub fn encode_forward(value: &[u8], max_key_bytes: usize) -> Result<Vec<u8>> {
    check_len(value.len(), max_key_bytes)?;
    let mut key = Vec::with_capacity(value.len() + 1);
    key.push(FWD_TAG);
    key.extend_from_slice(value);
    Ok(key)
}

/// Reverse key: `R ++ reversed(value)`
///
/// # Errors
/// `InvalidParameter` if the key would exceed `max_key_bytes`.
pub fn encode_reverse(value: &[u8], max_key_bytes: usize) -> Result<Vec<u8>> {
    check_len(value.len(), max_key_bytes)?;
    let mut key = Vec::with_capacity(value.len() + 1);
    key.push(REV_TAG);
    key.extend(value.iter().rev());
    Ok(key)
}

/// Key of the given kind
pub fn encode(tag: KeyTag, value: &[u8], max_key_bytes: usize) -> Result<Vec<u8>> {
    match tag {
        KeyTag::Forward => encode_forward(value, max_key_bytes),
        KeyTag::Reverse => encode_reverse(value, max_key_bytes),
    }
}

/// Recover the value of a forward key
///
/// # Errors
/// `InvalidParameter` if the key is empty or not a forward key.
pub fn decode_forward_key(key: &[u8]) -> Result<Vec<u8>> {
    match key.split_first() {
        Some((&FWD_TAG, rest)) => Ok(rest.to_vec()),
        _ => Err(Error::InvalidParameter("not a forward index key".to_string())),
    }
}

/// Recover the value of a reverse key
///
/// # Errors
/// `InvalidParameter` if the key is empty or not a reverse key.
pub fn decode_reverse_key(key: &[u8]) -> Result<Vec<u8>> {
    match key.split_first() {
        Some((&REV_TAG, rest)) => Ok(rest.iter().rev().copied().collect()),
        _ => Err(Error::InvalidParameter("not a reverse index key".to_string())),
    }
}

/// Tag of an encoded key, `None` if the key is empty or untagged
pub fn key_tag(key: &[u8]) -> Option<KeyTag> {
    key.first().and_then(|b| KeyTag::from_byte(*b))
}

// ============================================================================
// EntryID keys
// ============================================================================

/// Minimal-width big-endian encoding of an EntryID
pub fn encode_entry_id(id: EntryId) -> Vec<u8> {
    let raw = id.as_u64();
    let width = std::cmp::max(1, 8 - (raw.leading_zeros() as usize) / 8);
    let mut buf = vec![0u8; width];
    BigEndian::write_uint(&mut buf, raw, width);
    buf
}

/// Decode a minimal-width EntryID key
///
/// # Errors
/// `StorageEngine` if the slice is empty or wider than 8 bytes.
pub fn decode_entry_id(bytes: &[u8]) -> Result<EntryId> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(Error::StorageEngine(format!(
            "corrupt entry id key of {} bytes",
            bytes.len()
        )));
    }
    Ok(EntryId::new(BigEndian::read_uint(bytes, bytes.len())))
}

/// Attribute-metadata key
pub fn attribute_meta_key(id: EntryId, attribute_id: u16) -> Vec<u8> {
    let mut key = encode_entry_id(id);
    key.push(META_SEPARATOR);
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, attribute_id);
    key.extend_from_slice(&buf);
    key
}

/// Prefix shared by every attribute-metadata key of one entry
pub fn attribute_meta_prefix(id: EntryId) -> Vec<u8> {
    let mut key = encode_entry_id(id);
    key.push(META_SEPARATOR);
    key
}

// ============================================================================
// Comparators
// ============================================================================

/// Length-then-magnitude order
///
/// A shorter byte string always orders first; equal lengths compare bytewise.
/// Minimal-width big-endian integers therefore sort numerically.
pub fn length_then_magnitude(a: &[u8], b: &[u8]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
