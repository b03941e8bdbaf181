//! Deterministic hashing of package identities and dependency sets.
//!
//! Both functions are pure: given the same bytes they produce the same
//! hex digest on every platform and process, independent of local
//! encoding, map iteration order, or any version-normalization.

use sha2::{Digest, Sha256};

/// `pid_hash = SHA256(name || "@" || version)`, hex-encoded.
pub fn package_hash(name: &str, version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"@");
    hasher.update(version.as_bytes());
    hex::encode(hasher.finalize())
}

/// `tree_hash = SHA256(concat over sorted entries of (name || "@" || version || "\n"))`.
///
/// The input iterator may be given in any order; entries are sorted by
/// name before hashing so the result depends only on the set of
/// `(name, version)` pairs.
pub fn tree_hash<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut sorted: Vec<(&str, &str)> = entries.into_iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (name, version) in sorted {
        hasher.update(name.as_bytes());
        hasher.update(b"@");
        hasher.update(version.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn package_hash_is_deterministic() {
        let a = package_hash("lodash", "4.17.21");
        let b = package_hash("lodash", "4.17.21");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn package_hash_distinguishes_versions() {
        assert_ne!(package_hash("lodash", "4.17.21"), package_hash("lodash", "4.17.22"));
    }

    #[test]
    fn tree_hash_is_order_independent() {
        let a = tree_hash([("b", "1.0.0"), ("a", "2.0.0")]);
        let b = tree_hash([("a", "2.0.0"), ("b", "1.0.0")]);
        assert_eq!(a, b);

        let mut hasher = Sha256::new();
        hasher.update(b"a@2.0.0\nb@1.0.0\n");
        let expected = hex::encode(hasher.finalize());

        assert_eq!(a, expected);
    }

    #[test]
    fn tree_hash_depends_on_pairs_not_order() {
        let set1 = tree_hash([("a", "1.0.0"), ("b", "2.0.0"), ("c", "3.0.0")]);
        let set2 = tree_hash([("c", "3.0.0"), ("a", "1.0.0"), ("b", "2.0.0")]);
        let set3 = tree_hash([("b", "2.0.0"), ("c", "3.0.0"), ("a", "1.0.0")]);
        assert_eq!(set1, set2);
        assert_eq!(set2, set3);
    }
}
