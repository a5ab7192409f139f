//! Stable identifiers used across the mount: inode numbers and
//! object-store object ids. Adapted from `B3Digest` in the teacher's
//! `digests.rs`, generalized to an arbitrary-length, backing-store-defined
//! hash instead of a fixed blake3 digest (source-control backing stores use
//! a variety of hash algorithms and object kinds; the core must not assume
//! one).

use std::fmt;

use thiserror::Error;

/// A 64-bit inode number. `0` is reserved to mean "unset"; the mount root
/// is always `1` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct InodeNumber(u64);

impl InodeNumber {
    pub const UNSET: InodeNumber = InodeNumber(0);
    pub const ROOT: InodeNumber = InodeNumber(1);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObjectIdError {
    #[error("object id must not be empty")]
    Empty,
}

/// An opaque, immutable byte string identifying a source-control object
/// (tree, blob, or commit-like root). Equality is byte equality (spec §3).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ObjectId(bytes::Bytes);

impl ObjectId {
    pub fn new(bytes: impl Into<bytes::Bytes>) -> Result<Self, ObjectIdError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(ObjectIdError::Empty);
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", data_encoding::HEXLOWER.encode(&self.0))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", data_encoding::HEXLOWER.encode(&self.0))
    }
}

/// A 20-byte SHA1 digest, used for `BlobMetadata` and for materialized-file
/// dirty-hash tracking in the overlay (spec §3, §4.2).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha1([u8; 20]);

impl Sha1 {
    pub fn from_bytes(value: [u8; 20]) -> Self {
        Self(value)
    }

    pub fn of(data: &[u8]) -> Self {
        use sha1::{Digest, Sha1 as Sha1Hasher};
        let mut hasher = Sha1Hasher::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for Sha1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", data_encoding::HEXLOWER.encode(&self.0))
    }
}

/// Metadata derivable from a blob's contents; cached so repeated reads of
/// `getattr` or diff comparisons don't re-hash unchanged blobs (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobMetadata {
    pub sha1: Sha1,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_number_root_is_one() {
        assert_eq!(InodeNumber::ROOT.get(), 1);
        assert!(InodeNumber::UNSET.is_unset());
    }

    #[test]
    fn object_id_rejects_empty() {
        assert!(ObjectId::new(Vec::<u8>::new()).is_err());
        assert!(ObjectId::new(vec![1, 2, 3]).is_ok());
    }

    #[test]
    fn sha1_matches_known_vector() {
        // sha1("") = da39a3ee5e6b4b0d3255bfef95601890afd80709
        let hash = Sha1::of(b"");
        assert_eq!(
            data_encoding::HEXLOWER.encode(hash.as_bytes()),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }
}
