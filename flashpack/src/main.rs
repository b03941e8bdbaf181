//! Thin demonstration binary: wires `env_logger`, reads a manifest and
//! a store root from two positional arguments, and runs one install.
//! Not the CLI front-end named in spec.md §1 — no subcommands, no flag
//! parsing beyond the two positionals.

use std::path::PathBuf;
use std::process::ExitCode;

use flashpack::manifest::DependencySet;
use flashpack::{config, Engine};

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let (Some(manifest_path), Some(store_root)) = (args.next(), args.next()) else {
        eprintln!("usage: flashpack <manifest.json> <store-root>");
        return ExitCode::FAILURE;
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(manifest_path.into(), store_root.into()))
}

async fn run(manifest_path: PathBuf, store_root: PathBuf) -> ExitCode {
    let dep_set = match load_manifest(&manifest_path) {
        Ok(dep_set) => dep_set,
        Err(err) => {
            eprintln!("failed to read manifest {}: {err}", manifest_path.display());
            return ExitCode::FAILURE;
        }
    };

    let project_dir = manifest_path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let cfg = config::load(project_dir).unwrap_or_default();

    let engine = match Engine::open(Some(&store_root), cfg) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("failed to open store at {}: {err}", store_root.display());
            return ExitCode::FAILURE;
        }
    };

    match engine.install(project_dir, &dep_set, None).await {
        Ok(outcome) if outcome.success => {
            println!("installed {} packages", outcome.installed.len());
            ExitCode::SUCCESS
        }
        Ok(outcome) => {
            eprintln!("{} package(s) failed:", outcome.failed.len());
            for failure in &outcome.failed {
                eprintln!("  {}: {}", failure.pid, failure.reason);
            }
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("install failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn load_manifest(path: &std::path::Path) -> std::io::Result<DependencySet> {
    let raw = std::fs::read_to_string(path)?;
    let map: std::collections::BTreeMap<String, String> =
        serde_json::from_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(DependencySet::from_map(map))
}
