//! Progress reporting capability, invoked at coarse-grained checkpoints
//! only (one call per batch, not per byte). The terminal widgets
//! themselves are an out-of-scope collaborator; this crate only calls
//! through the trait and swallows anything a sink does wrong.

/// A progress reporter. All methods default to a no-op so a caller that
/// doesn't care about progress can pass `()`.
pub trait ProgressSink: Send + Sync {
    fn start(&self, _total: u64) {}
    fn update_status(&self, _msg: &str) {}
    fn update(&self, _delta: u64) {}
    fn stop(&self) {}
    fn complete(&self, _msg: &str) {}
}

impl ProgressSink for () {}

/// Invokes `sink`'s method, logging and discarding any panic so a
/// misbehaving reporter can never abort an install.
pub(crate) fn report<F>(sink: &dyn ProgressSink, name: &str, f: F)
where
    F: FnOnce(&dyn ProgressSink) + std::panic::UnwindSafe,
{
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(sink)));
    if result.is_err() {
        log::warn!("progress sink panicked in {name}, ignoring");
    }
}
