//! Internal key representation.
//!
//! Every record carries a `(user_key, sequence, kind)` triple encoded as
//! `user_key || (sequence << 8 | kind)` with the 8-byte tag little-endian.
//! The internal ordering is user key ascending, then tag descending, so the
//! newest revision of a key sorts first.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Monotonic write counter. Only the low 56 bits are usable; the top byte of
/// the packed tag holds the value kind.
pub type Sequence = u64;

/// Largest assignable sequence number.
pub const MAX_SEQUENCE: Sequence = (1 << 56) - 1;

pub const TAG_LEN: usize = 8;

/// Kind of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Kind {
    Deletion = 0,
    Value = 1,
}

/// Kind used when building seek targets. `Value` is the largest kind, and
/// tags order descending, so a seek tag positions before every entry of the
/// same user key with sequence <= the target.
pub const SEEK_KIND: Kind = Kind::Value;

impl Kind {
    pub fn from_u8(b: u8) -> Result<Kind> {
        match b {
            0 => Ok(Kind::Deletion),
            1 => Ok(Kind::Value),
            _ => Err(crate::corrupt!("bad value kind: {b}")),
        }
    }
}

pub fn pack_tag(seq: Sequence, kind: Kind) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE);
    (seq << 8) | kind as u64
}

pub fn unpack_tag(tag: u64) -> Result<(Sequence, Kind)> {
    let kind = Kind::from_u8((tag & 0xff) as u8)?;
    Ok((tag >> 8, kind))
}

/// Appends `user_key || tag` to `dst`.
pub fn append_internal_key(dst: &mut Vec<u8>, user_key: &[u8], seq: Sequence, kind: Kind) {
    dst.extend_from_slice(user_key);
    let mut tag = [0u8; TAG_LEN];
    LittleEndian::write_u64(&mut tag, pack_tag(seq, kind));
    dst.extend_from_slice(&tag);
}

/// An owned encoded internal key. File metadata boundaries and compaction
/// pointers are stored in this form.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct InternalKey(Vec<u8>);

impl InternalKey {
    pub fn new(user_key: &[u8], seq: Sequence, kind: Kind) -> Self {
        let mut buf = Vec::with_capacity(user_key.len() + TAG_LEN);
        append_internal_key(&mut buf, user_key, seq, kind);
        InternalKey(buf)
    }

    /// Wraps an already-encoded internal key.
    pub fn decode(encoded: &[u8]) -> Result<Self> {
        if encoded.len() < TAG_LEN {
            return Err(Error::Corruption("internal key too short".to_string()));
        }
        Ok(InternalKey(encoded.to_vec()))
    }

    pub fn encoded(&self) -> &[u8] {
        &self.0
    }

    pub fn user_key(&self) -> &[u8] {
        user_key(&self.0)
    }

    pub fn tag(&self) -> u64 {
        extract_tag(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.len() < TAG_LEN {
            return write!(f, "InternalKey(<short>)");
        }
        let (seq, kind) = unpack_tag(self.tag()).map_err(|_| std::fmt::Error)?;
        write!(
            f,
            "InternalKey({:?}@{seq}:{kind:?})",
            String::from_utf8_lossy(self.user_key())
        )
    }
}

/// User-key slice of an encoded internal key.
pub fn user_key(ikey: &[u8]) -> &[u8] {
    debug_assert!(ikey.len() >= TAG_LEN);
    &ikey[..ikey.len() - TAG_LEN]
}

/// Packed `(sequence, kind)` tag of an encoded internal key.
pub fn extract_tag(ikey: &[u8]) -> u64 {
    debug_assert!(ikey.len() >= TAG_LEN);
    LittleEndian::read_u64(&ikey[ikey.len() - TAG_LEN..])
}

/// Splits an encoded internal key into its parts.
pub fn parse_internal_key(ikey: &[u8]) -> Result<(&[u8], Sequence, Kind)> {
    if ikey.len() < TAG_LEN {
        return Err(Error::Corruption("internal key too short".to_string()));
    }
    let (seq, kind) = unpack_tag(extract_tag(ikey))?;
    Ok((user_key(ikey), seq, kind))
}

/// A seek target for point reads: the encoded internal key
/// `(user_key, seq, SEEK_KIND)`.
pub struct LookupKey(Vec<u8>);

impl LookupKey {
    pub fn new(user_key: &[u8], seq: Sequence) -> Self {
        let mut buf = Vec::with_capacity(user_key.len() + TAG_LEN);
        append_internal_key(&mut buf, user_key, seq, SEEK_KIND);
        LookupKey(buf)
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.0
    }

    pub fn user_key(&self) -> &[u8] {
        user_key(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip() {
        for &(seq, kind) in &[
            (0, Kind::Deletion),
            (1, Kind::Value),
            (MAX_SEQUENCE, Kind::Value),
        ] {
            let (s, k) = unpack_tag(pack_tag(seq, kind)).unwrap();
            assert_eq!((s, k), (seq, kind));
        }
    }

    #[test]
    fn internal_key_parts() {
        let ik = InternalKey::new(b"user", 42, Kind::Value);
        assert_eq!(ik.user_key(), b"user");
        let (uk, seq, kind) = parse_internal_key(ik.encoded()).unwrap();
        assert_eq!(uk, b"user");
        assert_eq!(seq, 42);
        assert_eq!(kind, Kind::Value);
    }

    #[test]
    fn empty_user_key_is_valid() {
        let ik = InternalKey::new(b"", 7, Kind::Deletion);
        assert_eq!(ik.user_key(), b"");
        assert_eq!(ik.encoded().len(), TAG_LEN);
    }

    #[test]
    fn bad_kind_is_corruption() {
        assert!(unpack_tag(0xff).is_err());
    }
}
