//! End-to-end scenarios, each seeded directly from the six concrete
//! cases this engine is required to satisfy: fingerprint stability,
//! snapshot hit/invalidation, parallel store puts, offline fallback,
//! and compressed round-trips.

use std::path::Path;

use flashpack::config::FlashConfig;
use flashpack::fingerprint;
use flashpack::manifest::{DependencySet, PackageId};
use flashpack::snapshot;
use flashpack::store::{PackageStore, TreeStore};

fn write_package(dir: &Path, version: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("package.json"), format!("{{\"version\":\"{version}\"}}")).unwrap();
}

#[test]
fn fingerprint_stability_is_order_independent() {
    let a = [("b".to_string(), "1.0.0".to_string()), ("a".to_string(), "2.0.0".to_string())];
    let b = [("a".to_string(), "2.0.0".to_string()), ("b".to_string(), "1.0.0".to_string())];

    let set_a = DependencySet::from_map(a);
    let set_b = DependencySet::from_map(b);

    assert_eq!(set_a.tree_hash(), set_b.tree_hash());
    assert_eq!(set_a.tree_hash(), fingerprint::tree_hash([("a", "2.0.0"), ("b", "1.0.0")]));
}

#[test]
fn snapshot_hit_restores_without_network() {
    let project = tempfile::tempdir().unwrap();
    write_package(&project.path().join("node_modules/lodash"), "4.17.21");

    let dep_set = DependencySet::from_map([("lodash".to_string(), "4.17.21".to_string())]);
    let snapshot_path = snapshot::create(project.path(), &dep_set, None, None, 1_000).unwrap();

    assert!(snapshot::is_valid(&snapshot_path, &dep_set, None));

    std::fs::remove_dir_all(project.path().join("node_modules")).unwrap();
    snapshot::restore(project.path(), &snapshot_path).unwrap();

    let restored = std::fs::read_to_string(project.path().join("node_modules/lodash/package.json")).unwrap();
    assert!(restored.contains("\"version\":\"4.17.21\""));
}

#[test]
fn snapshot_invalidation_on_version_change() {
    let project = tempfile::tempdir().unwrap();
    write_package(&project.path().join("node_modules/lodash"), "4.17.21");

    let dep_set = DependencySet::from_map([("lodash".to_string(), "4.17.21".to_string())]);
    let snapshot_path = snapshot::create(project.path(), &dep_set, None, None, 1_000).unwrap();

    let changed = DependencySet::from_map([("lodash".to_string(), "4.17.22".to_string())]);
    assert!(!snapshot::is_valid(&snapshot_path, &changed, None));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_store_put_converges_to_one_entry_per_pid() {
    let store_dir = tempfile::tempdir().unwrap();
    let config = FlashConfig::default();
    let store = std::sync::Arc::new(PackageStore::open(store_dir.path(), &config).unwrap());

    let pids: Vec<PackageId> = (0..10).map(|i| PackageId::new(format!("pkg-{i}"), "1.0.0")).collect();

    let mut handles = Vec::new();
    for orchestrator_id in 0..2 {
        for pid in pids.clone() {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let src = tempfile::tempdir().unwrap();
                write_package(src.path(), "1.0.0");
                store.put(&pid, src.path()).unwrap();

                let dst_dir = tempfile::tempdir().unwrap();
                let dst = dst_dir.path().join(format!("orchestrator-{orchestrator_id}"));
                assert!(store.get(&pid, &dst).unwrap());
            }));
        }
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.stats().packages, 10);
}

#[test]
fn offline_fallback_accepts_compatible_cached_version() {
    use flashpack::fallback::{FallbackFlags, FallbackResolver};

    let store_dir = tempfile::tempdir().unwrap();
    let config = FlashConfig::default();
    let store = PackageStore::open(store_dir.path(), &config).unwrap();

    let src = tempfile::tempdir().unwrap();
    write_package(src.path(), "4.17.20");
    store.put(&PackageId::new("lodash", "4.17.20"), src.path()).unwrap();

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

    let result = resolver.resolve_against_candidates(&PackageId::new("lodash", "4.17.21"), &["4.17.20".to_string()]);
    assert!(result.found);
    assert!(!result.exact_version);
    assert_eq!(result.version.as_deref(), Some("4.17.20"));
}

#[test]
fn compressed_round_trip_saves_space_and_restores_bytewise() {
    let store_dir = tempfile::tempdir().unwrap();
    let config = FlashConfig::default();
    let store = PackageStore::open(store_dir.path(), &config).unwrap();

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("payload.bin"), vec![42u8; 200 * 1024]).unwrap();

    let pid = PackageId::new("big-package", "1.0.0");
    store.put(&pid, src.path()).unwrap();

    let hash = pid.hash();
    let shard = &hash[0..2];
    let compressed_path = store_dir.path().join("packages").join(shard).join(format!("{hash}.gz"));
    assert!(compressed_path.exists());
    assert!(std::fs::metadata(&compressed_path).unwrap().len() < 200 * 1024);

    let dst = tempfile::tempdir().unwrap();
    store.get(&pid, dst.path()).unwrap();
    assert_eq!(
        std::fs::read(dst.path().join("payload.bin")).unwrap(),
        vec![42u8; 200 * 1024]
    );

    let saved_again = store.optimize().unwrap();
    assert_eq!(saved_again, 0);
}

#[tokio::test]
async fn tree_store_and_snapshot_cooperate_on_tree_cache_restore() {
    let store_dir = tempfile::tempdir().unwrap();
    let config = FlashConfig::default();
    let tree_store = TreeStore::open(store_dir.path(), &config).unwrap();

    let source_project = tempfile::tempdir().unwrap();
    write_package(&source_project.path().join("node_modules/lodash"), "4.17.21");

    let dep_set = DependencySet::from_map([("lodash".to_string(), "4.17.21".to_string())]);
    tree_store.put(&dep_set, &source_project.path().join("node_modules")).unwrap();
    assert!(tree_store.has(&dep_set));

    let restored_project = tempfile::tempdir().unwrap();
    let dest = restored_project.path().join("node_modules");
    assert!(tree_store.get(&dep_set, &dest).unwrap());
    assert!(dest.join("lodash/package.json").exists());
}
