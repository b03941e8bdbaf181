//! Caching, snapshotting and parallel materialization for a resolved
//! `name -> version` package manifest.
//!
//! The crate does not resolve version constraints and does not speak a
//! registry's full protocol; it consumes an already-resolved
//! [`manifest::DependencySet`] (typically produced by a lockfile parser)
//! and turns it into a materialized dependency directory as cheaply as
//! the available caches allow.

pub mod config;
pub mod engine;
pub mod fallback;
pub mod fetch;
pub mod fingerprint;
pub mod fs;
pub mod hooks;
pub mod manifest;
pub mod orchestrator;
pub mod pool;
pub mod progress;
pub mod snapshot;
pub mod store;

pub use engine::Engine;
pub use manifest::{DependencySet, PackageId};
pub use orchestrator::{InstallOutcome, InstallOrchestrator};
