//! Fallback resolver (C8): resolves a dependency set against caches,
//! a snapshot and the local tree while offline. Never downloads; the
//! orchestrator decides what to do with misses. Grounded in
//! `moss::client::install`'s "prefer what's already on disk" checks,
//! generalized into an explicit search order over three sources.

use std::path::{Path, PathBuf};

use crate::manifest::{DependencySet, PackageId};
use crate::snapshot;
use crate::store::PackageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Snapshot,
    Local,
}

#[derive(Debug, Clone)]
pub struct FallbackResult {
    pub found: bool,
    pub exact_version: bool,
    pub source: Option<Source>,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
}

impl FallbackResult {
    fn miss() -> Self {
        Self {
            found: false,
            exact_version: false,
            source: None,
            path: None,
            version: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FallbackFlags {
    pub allow_version_fallback: bool,
    pub use_cache: bool,
    pub use_snapshot: bool,
    pub use_local: bool,
}

pub struct FallbackResolver<'a> {
    store: &'a PackageStore,
    snapshot_path: Option<&'a Path>,
    project_dir: &'a Path,
    flags: FallbackFlags,
}

impl<'a> FallbackResolver<'a> {
    pub fn new(
        store: &'a PackageStore,
        snapshot_path: Option<&'a Path>,
        project_dir: &'a Path,
        flags: FallbackFlags,
    ) -> Self {
        Self {
            store,
            snapshot_path,
            project_dir,
            flags,
        }
    }

    /// Resolves every package in `dep_set` against the configured
    /// sources in order: cache, snapshot, local, then (if
    /// `allow_version_fallback`) the same three again accepting the
    /// highest compatible locally-available version.
    pub fn resolve(&self, dep_set: &DependencySet) -> Vec<(PackageId, FallbackResult)> {
        dep_set
            .package_ids()
            .map(|pid| {
                let result = self.resolve_one(&pid);
                (pid, result)
            })
            .collect()
    }

    fn resolve_one(&self, pid: &PackageId) -> FallbackResult {
        if let Some(hit) = self.exact_hit(pid) {
            return hit;
        }

        if self.flags.allow_version_fallback {
            if let Some(hit) = self.compatible_hit(pid) {
                return hit;
            }
        }

        FallbackResult::miss()
    }

    fn exact_hit(&self, pid: &PackageId) -> Option<FallbackResult> {
        if self.flags.use_cache && self.store.has(pid) {
            return Some(FallbackResult {
                found: true,
                exact_version: true,
                source: Some(Source::Cache),
                path: None,
                version: Some(pid.version.clone()),
            });
        }

        if self.flags.use_snapshot {
            if let Some(path) = self.snapshot_path {
                if let Ok(meta) = snapshot::metadata(path) {
                    if meta.dep_set.get(&pid.name) == Some(pid.version.as_str()) {
                        return Some(FallbackResult {
                            found: true,
                            exact_version: true,
                            source: Some(Source::Snapshot),
                            path: Some(path.to_path_buf()),
                            version: Some(pid.version.clone()),
                        });
                    }
                }
            }
        }

        if self.flags.use_local {
            let local_path = self.project_dir.join("node_modules").join(&pid.name);
            if local_version(&local_path).as_deref() == Some(pid.version.as_str()) {
                return Some(FallbackResult {
                    found: true,
                    exact_version: true,
                    source: Some(Source::Local),
                    path: Some(local_path),
                    version: Some(pid.version.clone()),
                });
            }
        }

        None
    }

    /// Same three sources, but accepts whatever version is actually
    /// available rather than requiring an exact match — spec.md §8's
    /// offline-fallback scenario explicitly accepts a version *older*
    /// than requested when that is all the cache holds. Tries the
    /// package store's own versions-by-name index first, then falls
    /// back to whatever is unpacked in the local tree.
    fn compatible_hit(&self, pid: &PackageId) -> Option<FallbackResult> {
        if self.flags.use_cache {
            let cached_versions = self.store.versions_for(&pid.name);
            if let Some(hit) = best_cached_version(pid, &cached_versions) {
                return Some(hit);
            }
        }

        if self.flags.use_local {
            let local_path = self.project_dir.join("node_modules").join(&pid.name);
            if let Some(found_version) = local_version(&local_path) {
                return Some(FallbackResult {
                    found: true,
                    exact_version: found_version == pid.version,
                    source: Some(Source::Local),
                    path: Some(local_path),
                    version: Some(found_version),
                });
            }
        }
        None
    }

    /// Variant of resolution that considers a caller-supplied list of
    /// cached `(name, version)` pairs instead of querying the store
    /// directly, for callers that have already gathered candidates from
    /// elsewhere. Accepts the highest version among whatever is cached,
    /// even if it is lower than the one requested (spec.md §8, scenario
    /// 5), then falls back to `compatible_hit`'s store/local lookup.
    pub fn resolve_against_candidates(&self, pid: &PackageId, cached_versions: &[String]) -> FallbackResult {
        if let Some(hit) = self.exact_hit(pid) {
            return hit;
        }

        if self.flags.allow_version_fallback {
            if let Some(hit) = best_cached_version(pid, cached_versions) {
                return hit;
            }
            if let Some(hit) = self.compatible_hit(pid) {
                return hit;
            }
        }

        FallbackResult::miss()
    }
}

/// Picks the highest version in `candidates` (spec.md §8, scenario 5
/// accepts a version older than requested) and reports it as a cache
/// hit. `None` if `candidates` is empty.
fn best_cached_version(pid: &PackageId, candidates: &[String]) -> Option<FallbackResult> {
    let best = candidates.iter().max_by(|a, b| compare_versions(a, b))?;
    Some(FallbackResult {
        found: true,
        exact_version: best == &pid.version,
        source: Some(Source::Cache),
        path: None,
        version: Some(best.clone()),
    })
}

fn local_version(package_dir: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(package_dir.join("package.json")).ok()?;
    let parsed: serde_json::Value = serde_json::from_str(&raw).ok()?;
    parsed.get("version")?.as_str().map(str::to_string)
}

/// The deliberately simplified comparison spec.md §9 specifies: strip a
/// leading non-digit prefix, compare dot-separated integer parts
/// left-to-right, missing parts treated as zero. Not full semver — it
/// ignores pre-release and build metadata by design.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parts_a = numeric_parts(a);
    let parts_b = numeric_parts(b);
    let len = parts_a.len().max(parts_b.len());

    for i in 0..len {
        let x = parts_a.get(i).copied().unwrap_or(0);
        let y = parts_b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

fn numeric_parts(version: &str) -> Vec<u64> {
    let start = version.find(|c: char| c.is_ascii_digit()).unwrap_or(0);
    version[start..]
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u64>().unwrap_or(0)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn version_compare_ignores_prerelease_metadata() {
        assert_eq!(compare_versions("1.2.0", "1.2.0"), std::cmp::Ordering::Equal);
        assert_eq!(compare_versions("1.3.0", "1.2.9"), std::cmp::Ordering::Greater);
        assert_eq!(compare_versions("v1.2", "1.2.0"), std::cmp::Ordering::Equal);
        assert_eq!(compare_versions("1.2.0-beta.1", "1.2.0"), std::cmp::Ordering::Equal);
    }

    #[test]
    fn resolve_against_candidates_accepts_highest_compatible() {
        let store_dir = tempfile::tempdir().unwrap();
        let config = crate::config::FlashConfig::default();
        let store = PackageStore::open(store_dir.path(), &config).unwrap();
        let project = tempfile::tempdir().unwrap();

        let resolver = FallbackResolver::new(
            &store,
            None,
            project.path(),
            FallbackFlags {
                allow_version_fallback: true,
                use_cache: true,
                use_snapshot: false,
                use_local: false,
            },
        );

        let pid = PackageId::new("lodash", "4.17.21");
        let result = resolver.resolve_against_candidates(&pid, &["4.17.20".to_string()]);

        assert!(result.found);
        assert!(!result.exact_version);
        assert_eq!(result.version.as_deref(), Some("4.17.20"));
        assert_eq!(result.source, Some(Source::Cache));
    }
}
