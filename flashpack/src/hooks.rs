//! Lifecycle notification capability. Named checkpoints only — the
//! plugin discovery/lifecycle subsystem that might react to these is an
//! out-of-scope collaborator (spec.md §1); this crate just calls the
//! named points and swallows whatever a sink does with them.

use crate::manifest::{DependencySet, PackageId};

/// Lifecycle hooks invoked by the orchestrator at defined points.
pub trait HookSink: Send + Sync {
    fn before_fetch(&self, _pid: &PackageId) {}
    fn after_fetch(&self, _pid: &PackageId, _cached: bool) {}
    fn before_snapshot(&self, _dep_set: &DependencySet) {}
    fn after_snapshot(&self, _ok: bool) {}
}

impl HookSink for () {}

pub(crate) fn report<F>(sink: &dyn HookSink, name: &str, f: F)
where
    F: FnOnce(&dyn HookSink) + std::panic::UnwindSafe,
{
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(sink)));
    if result.is_err() {
        log::warn!("hook sink panicked in {name}, ignoring");
    }
}
