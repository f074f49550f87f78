//! Deterministic clip identifiers.
//!
//! Peers never exchange their clip catalogs. Instead every peer derives a
//! [`ClipId`] from each clip's name with the same stable hash, so the same
//! name always maps to the same id on every peer:
//!
//! - [`ClipId`] - Stable 32-bit identifier derived from a clip name
//! - [`ClipHandle`] - Opaque local handle supplied by the clip catalog
//! - [`ClipRegistry`] - Frozen bidirectional id/handle mapping

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Stable identifier for a clip, derived from its name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClipId(u32);

impl ClipId {
    /// Derive the id for a clip name (32-bit FNV-1a over the UTF-8 bytes).
    pub fn from_name(name: &str) -> Self {
        let mut hash = FNV_OFFSET_BASIS;
        for byte in name.as_bytes() {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        Self(hash)
    }

    /// Wrap a raw id (as read from the wire).
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw id value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Local, in-memory handle for a loaded clip.
///
/// Handles are meaningful only inside one process and never go on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClipHandle(pub u64);

impl fmt::Display for ClipHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single catalog entry after registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClipEntry {
    /// Position in the canonical (name-sorted) order.
    pub ordinal: usize,
    /// Clip name as supplied by the catalog.
    pub name: String,
    /// Derived identifier.
    pub id: ClipId,
    /// Local handle.
    pub handle: ClipHandle,
}

/// Frozen bidirectional mapping between clip ids and local handles.
///
/// Built once from the local catalog and read-only afterwards, so it can be
/// shared freely (typically behind an `Arc`).
#[derive(Clone, Debug, Default)]
pub struct ClipRegistry {
    entries: Vec<ClipEntry>,
    by_id: HashMap<ClipId, usize>,
    by_handle: HashMap<ClipHandle, usize>,
}

impl ClipRegistry {
    /// Build the registry from a `(name, handle)` catalog.
    ///
    /// Entries are ordered by name so that diagnostic ordinals agree on every
    /// peer regardless of catalog order. Two names deriving the same id is a
    /// fatal [`Error::ClipCollision`].
    pub fn build<I, S>(catalog: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, ClipHandle)>,
        S: Into<String>,
    {
        let mut items: Vec<(String, ClipHandle)> = catalog
            .into_iter()
            .map(|(name, handle)| (name.into(), handle))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut registry = Self::default();
        for (name, handle) in items {
            let id = ClipId::from_name(&name);
            if let Some(&existing) = registry.by_id.get(&id) {
                return Err(Error::ClipCollision {
                    first: registry.entries[existing].name.clone(),
                    second: name,
                    id,
                });
            }

            let ordinal = registry.entries.len();
            if registry.by_handle.contains_key(&handle) {
                log::warn!(
                    "[CLIPS] Handle {} registered twice, keeping the mapping for '{}'",
                    handle,
                    registry.entries[registry.by_handle[&handle]].name
                );
            } else {
                registry.by_handle.insert(handle, ordinal);
            }
            registry.by_id.insert(id, ordinal);
            registry.entries.push(ClipEntry {
                ordinal,
                name,
                id,
                handle,
            });
        }

        log::info!("[CLIPS] Registered {} clips", registry.entries.len());
        Ok(registry)
    }

    /// Resolve a clip id to the local handle.
    pub fn resolve_id(&self, id: ClipId) -> Result<ClipHandle> {
        self.by_id
            .get(&id)
            .map(|&idx| self.entries[idx].handle)
            .ok_or(Error::UnknownClip(id))
    }

    /// Resolve a local handle to its clip id.
    pub fn resolve_handle(&self, handle: ClipHandle) -> Result<ClipId> {
        self.by_handle
            .get(&handle)
            .map(|&idx| self.entries[idx].id)
            .ok_or(Error::ClipNotRegistered(handle))
    }

    /// Look up an entry by clip name.
    pub fn by_name(&self, name: &str) -> Option<&ClipEntry> {
        self.by_id
            .get(&ClipId::from_name(name))
            .map(|&idx| &self.entries[idx])
            .filter(|entry| entry.name == name)
    }

    /// Iterate entries in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &ClipEntry> {
        self.entries.iter()
    }

    /// Number of registered clips.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_id_is_stable() {
        // Reference FNV-1a values
        assert_eq!(ClipId::from_name("").as_u32(), 0x811c_9dc5);
        assert_eq!(ClipId::from_name("a").as_u32(), 0xe40c_292c);
        assert_eq!(ClipId::from_name("slam"), ClipId::from_name("slam"));
        assert_ne!(ClipId::from_name("slam"), ClipId::from_name("creak"));
    }

    #[test]
    fn test_independent_registries_agree() {
        let peer_a =
            ClipRegistry::build(vec![("slam", ClipHandle(10)), ("creak", ClipHandle(11))]).unwrap();
        // Different catalog order and different local handles
        let peer_b =
            ClipRegistry::build(vec![("creak", ClipHandle(7)), ("slam", ClipHandle(3))]).unwrap();

        let slam_a = peer_a.by_name("slam").unwrap();
        let slam_b = peer_b.by_name("slam").unwrap();
        assert_eq!(slam_a.id, slam_b.id);
        assert_eq!(slam_a.ordinal, slam_b.ordinal);
        assert_eq!(peer_b.resolve_id(slam_a.id).unwrap(), ClipHandle(3));
    }

    #[test]
    fn test_resolve_both_directions() {
        let registry =
            ClipRegistry::build(vec![("slam", ClipHandle(1)), ("creak", ClipHandle(2))]).unwrap();
        let id = registry.resolve_handle(ClipHandle(2)).unwrap();
        assert_eq!(id, ClipId::from_name("creak"));
        assert_eq!(registry.resolve_id(id).unwrap(), ClipHandle(2));

        assert!(matches!(
            registry.resolve_id(ClipId::from_name("missing")),
            Err(Error::UnknownClip(_))
        ));
        assert!(matches!(
            registry.resolve_handle(ClipHandle(99)),
            Err(Error::ClipNotRegistered(ClipHandle(99)))
        ));
    }

    #[test]
    fn test_duplicate_name_is_collision() {
        let result = ClipRegistry::build(vec![("slam", ClipHandle(1)), ("slam", ClipHandle(2))]);
        match result {
            Err(Error::ClipCollision { first, second, .. }) => {
                assert_eq!(first, "slam");
                assert_eq!(second, "slam");
            }
            other => panic!("expected collision, got {:?}", other),
        }
    }

    #[test]
    fn test_canonical_order() {
        let registry = ClipRegistry::build(vec![
            ("wind", ClipHandle(1)),
            ("creak", ClipHandle(2)),
            ("slam", ClipHandle(3)),
        ])
        .unwrap();
        let names: Vec<&str> = registry.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["creak", "slam", "wind"]);
        assert_eq!(registry.len(), 3);
    }
}
