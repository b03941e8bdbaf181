//! Data model shared by every component: resolved package identities
//! and the dependency sets derived from them.
//!
//! Resolving version constraints, producing a canonical lockfile and
//! speaking a registry's index protocol are all out of scope here — a
//! [`LockfileParser`] is the external collaborator that hands us a
//! `name -> version` mapping to materialize.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::fingerprint;

/// A resolved `(name, version)` pair. Versions are concrete resolved
/// strings, never range operators.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageId {
    pub name: String,
    pub version: String,
}

impl PackageId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// `pid_hash = SHA256(name || "@" || version)`, hex-encoded.
    pub fn hash(&self) -> String {
        fingerprint::package_hash(&self.name, &self.version)
    }
}

impl std::fmt::Display for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// The full `name -> version` mapping to be materialized for one
/// project, ordered lexicographically by name (the canonical form its
/// fingerprint is computed over).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySet {
    entries: BTreeMap<String, String>,
}

impl DependencySet {
    pub fn from_map(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Package ids in canonical (sorted-by-name) order.
    pub fn package_ids(&self) -> impl Iterator<Item = PackageId> + '_ {
        self.entries
            .iter()
            .map(|(name, version)| PackageId::new(name.clone(), version.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// `tree_hash` over the current set, independent of insertion order.
    pub fn tree_hash(&self) -> String {
        fingerprint::tree_hash(self.iter())
    }

    /// Entries present in `self` but absent (or at a different version)
    /// from `other` — the "added or changed" set a sync needs to install.
    pub fn added_or_changed(&self, other: &DependencySet) -> DependencySet {
        DependencySet::from_map(self.entries.iter().filter_map(|(name, version)| {
            match other.entries.get(name) {
                Some(existing) if existing == version => None,
                _ => Some((name.clone(), version.clone())),
            }
        }))
    }

    /// Entries present in `other` but no longer in `self` — the "removed"
    /// set a sync needs to delete from the destination.
    pub fn removed_from(&self, other: &DependencySet) -> DependencySet {
        DependencySet::from_map(
            other
                .entries
                .iter()
                .filter(|(name, _)| !self.entries.contains_key(*name))
                .map(|(n, v)| (n.clone(), v.clone())),
        )
    }
}

impl FromIterator<(String, String)> for DependencySet {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter)
    }
}

/// Returns a `name -> resolved_version` mapping for a project's
/// lockfile. The actual parser (pnpm/yarn/npm lockfile syntax, etc.) is
/// an external collaborator; this crate only consumes its output.
pub trait LockfileParser {
    type Error: std::error::Error + Send + Sync + 'static;

    fn parse(&self, project_dir: &std::path::Path) -> Result<DependencySet, Self::Error>;

    /// Raw lockfile bytes, used to compute the optional `lockfile_hash`
    /// carried in a [`crate::snapshot::Fingerprint`]. `None` if there is
    /// no lockfile (or this parser doesn't track one).
    fn raw_bytes(&self, project_dir: &std::path::Path) -> Option<Vec<u8>>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dependency_set_diff() {
        let old = DependencySet::from_map([("a".into(), "1.0.0".into()), ("b".into(), "1.0.0".into())]);
        let new = DependencySet::from_map([("a".into(), "2.0.0".into()), ("c".into(), "1.0.0".into())]);

        let added_or_changed = new.added_or_changed(&old);
        assert_eq!(added_or_changed.get("a"), Some("2.0.0"));
        assert_eq!(added_or_changed.get("c"), Some("1.0.0"));
        assert_eq!(added_or_changed.get("b"), None);

        let removed = new.removed_from(&old);
        assert_eq!(removed.get("b"), Some("1.0.0"));
        assert_eq!(removed.get("a"), None);
    }

    #[test]
    fn tree_hash_matches_fingerprint_module() {
        let set = DependencySet::from_map([("a".into(), "2.0.0".into()), ("b".into(), "1.0.0".into())]);
        assert_eq!(set.tree_hash(), fingerprint::tree_hash([("a", "2.0.0"), ("b", "1.0.0")]));
    }
}
