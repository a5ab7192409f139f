//! Relative paths and path components used throughout the mount.
//!
//! These mirror the borrowed/owned split of `std::path::{Path, PathBuf}`,
//! but are always relative, always a sequence of validated components, and
//! carry no platform-specific parsing: a mount's [`CasePolicy`] is the only
//! thing that ever changes how two paths compare.

use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt::{self, Debug, Display},
    hash::{Hash, Hasher},
};

use bstr::ByteSlice;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path component must not be empty")]
    Empty,
    #[error("path component must not contain '/' or NUL")]
    InvalidByte,
    #[error("path component must not be '.' or '..'")]
    DotOrDotDot,
}

/// A single validated path component: no `/`, no NUL, not empty, not `.`/`..`.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct PathComponent(bytes::Bytes);

impl PathComponent {
    pub fn new(bytes: impl Into<bytes::Bytes>) -> Result<Self, PathError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(PathError::Empty);
        }
        if bytes.contains(&b'/') || bytes.contains(&0u8) {
            return Err(PathError::InvalidByte);
        }
        if bytes.as_ref() == b"." || bytes.as_ref() == b".." {
            return Err(PathError::DotOrDotDot);
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The byte sequence used for comparisons under `policy`.
    ///
    /// Case-insensitive-preserving mounts fold to lowercase for lookups
    /// while leaving the original bytes (returned by [`PathComponent::as_bytes`])
    /// untouched, matching the "preserving" half of the policy name.
    fn fold_key(&self, policy: CasePolicy) -> std::borrow::Cow<'_, [u8]> {
        match policy {
            CasePolicy::Sensitive => std::borrow::Cow::Borrowed(self.as_bytes()),
            CasePolicy::InsensitivePreserving => {
                std::borrow::Cow::Owned(self.0.to_ascii_lowercase())
            }
        }
    }
}

impl Debug for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self.0.as_bstr(), f)
    }
}

impl Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self.0.as_bstr(), f)
    }
}

/// How a mount compares path components to each other.
///
/// Fixed at mount creation (spec §3); every directory map in the inode graph
/// and every overlay directory record is built against one policy and never
/// changes it at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasePolicy {
    Sensitive,
    InsensitivePreserving,
}

/// Borrowed relative path: a `/`-joined sequence of [`PathComponent`]s.
#[derive(Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct RelativePath {
    inner: [u8],
}

impl RelativePath {
    pub const ROOT: &'static RelativePath =
        unsafe { RelativePath::from_bytes_unchecked(&[]) };

    const unsafe fn from_bytes_unchecked(bytes: &[u8]) -> &RelativePath {
        unsafe { std::mem::transmute(bytes) }
    }

    pub fn parent(&self) -> Option<&RelativePath> {
        let (parent, _name) = self.inner.rsplit_once_str(b"/")?;
        Some(unsafe { RelativePath::from_bytes_unchecked(parent) })
    }

    pub fn join(&self, name: &PathComponent) -> RelativePathBuf {
        let mut v = self.inner.to_vec();
        if !v.is_empty() {
            v.push(b'/');
        }
        v.extend_from_slice(name.as_bytes());
        RelativePathBuf { inner: v }
    }

    pub fn components(&self) -> impl Iterator<Item = &[u8]> {
        let mut iter = self.inner.split_str(b"/");
        if self.inner.is_empty() {
            let _ = iter.next();
        }
        iter
    }

    pub fn file_name(&self) -> Option<&[u8]> {
        self.components().last()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Debug for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self.inner.as_bstr(), f)
    }
}

impl Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self.inner.as_bstr(), f)
    }
}

/// Owned relative path, see [`RelativePath`].
#[derive(Clone, Default, Eq, Hash, PartialEq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct RelativePathBuf {
    inner: Vec<u8>,
}

impl RelativePathBuf {
    pub fn root() -> Self {
        Self { inner: Vec::new() }
    }

    pub fn from_components<'a>(
        components: impl IntoIterator<Item = &'a PathComponent>,
    ) -> Self {
        let mut buf = Self::root();
        for c in components {
            buf = buf.join(c);
        }
        buf
    }
}

impl std::ops::Deref for RelativePathBuf {
    type Target = RelativePath;

    fn deref(&self) -> &Self::Target {
        unsafe { RelativePath::from_bytes_unchecked(&self.inner) }
    }
}

impl AsRef<RelativePath> for RelativePathBuf {
    fn as_ref(&self) -> &RelativePath {
        self
    }
}

impl Borrow<RelativePath> for RelativePathBuf {
    fn borrow(&self) -> &RelativePath {
        self
    }
}

impl ToOwned for RelativePath {
    type Owned = RelativePathBuf;

    fn to_owned(&self) -> Self::Owned {
        RelativePathBuf {
            inner: self.inner.to_owned(),
        }
    }
}

impl Debug for RelativePathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}

impl Display for RelativePathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&**self, f)
    }
}

/// A `HashMap` from [`PathComponent`] to `V` that honors a mount's
/// [`CasePolicy`] for lookups while preserving the originally-inserted
/// component's casing when iterated or returned.
///
/// Backs `OverlayDir::entries` and `TreeInode::children` (spec §3): both
/// need case-policy-aware lookup without losing the on-disk casing of a
/// case-insensitive-preserving entry.
#[derive(Debug, Clone)]
pub struct CaseAwareMap<V> {
    policy: CasePolicy,
    entries: HashMap<FoldedKey, (PathComponent, V)>,
}

#[derive(Debug, Clone, Eq)]
struct FoldedKey(bytes::Bytes);

impl PartialEq for FoldedKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Hash for FoldedKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl<V> CaseAwareMap<V> {
    pub fn new(policy: CasePolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    fn key_for(&self, name: &PathComponent) -> FoldedKey {
        FoldedKey(bytes::Bytes::copy_from_slice(&name.fold_key(self.policy)))
    }

    pub fn get(&self, name: &PathComponent) -> Option<&V> {
        self.entries.get(&self.key_for(name)).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, name: &PathComponent) -> Option<&mut V> {
        let key = self.key_for(name);
        self.entries.get_mut(&key).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &PathComponent) -> bool {
        self.entries.contains_key(&self.key_for(name))
    }

    pub fn insert(&mut self, name: PathComponent, value: V) -> Option<V> {
        let key = self.key_for(&name);
        self.entries.insert(key, (name, value)).map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &PathComponent) -> Option<V> {
        self.entries.remove(&self.key_for(name)).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries sorted by their original (preserved-case) name
    /// under the map's policy — the ordering spec §3/§4.4 requires for
    /// `Tree`/`readdir`.
    pub fn iter_sorted(&self) -> impl Iterator<Item = (&PathComponent, &V)> {
        let mut items: Vec<_> = self.entries.values().map(|(k, v)| (k, v)).collect();
        items.sort_by(|(a, _), (b, _)| {
            let policy = self.policy;
            a.fold_key(policy).cmp(&b.fold_key(policy))
        });
        items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty("", 0)]
    #[case("a", 1)]
    #[case("a/b", 2)]
    fn components(#[case] s: &str, #[case] n: usize) {
        let buf = RelativePathBuf {
            inner: s.as_bytes().to_vec(),
        };
        assert_eq!(n, buf.components().count());
    }

    #[test]
    fn join_and_parent() {
        let root = RelativePath::ROOT;
        let a = root.join(&PathComponent::new("a").unwrap());
        let ab = a.join(&PathComponent::new("b").unwrap());
        assert_eq!(ab.as_bytes(), b"a/b");
        assert_eq!(ab.parent().unwrap().as_bytes(), b"a");
        assert!(root.parent().is_none());
    }

    #[test]
    fn component_rejects_slash_and_dotdot() {
        assert!(PathComponent::new("a/b").is_err());
        assert!(PathComponent::new("..").is_err());
        assert!(PathComponent::new("").is_err());
        assert!(PathComponent::new("ok").is_ok());
    }

    #[test]
    fn case_aware_map_sensitive() {
        let mut m: CaseAwareMap<u32> = CaseAwareMap::new(CasePolicy::Sensitive);
        m.insert(PathComponent::new("Foo").unwrap(), 1);
        assert!(m.get(&PathComponent::new("Foo").unwrap()).is_some());
        assert!(m.get(&PathComponent::new("foo").unwrap()).is_none());
    }

    #[test]
    fn case_aware_map_insensitive_preserves_original() {
        let mut m: CaseAwareMap<u32> = CaseAwareMap::new(CasePolicy::InsensitivePreserving);
        m.insert(PathComponent::new("Foo").unwrap(), 1);
        assert_eq!(m.get(&PathComponent::new("foo").unwrap()), Some(&1));
        let (name, _) = m.iter_sorted().next().unwrap();
        assert_eq!(name.as_bytes(), b"Foo");
    }
}
