//! Progress reporting for long-running stages.
//!
//! Stages report through [`ProgressCallback`] so the library never depends on
//! a rendering backend; the CLI plugs in `indicatif` bars, tests and
//! headless callers use [`NullProgress`].

use std::sync::Arc;

/// Receives progress updates. Must be shareable across tokio tasks.
pub trait ProgressCallback: Send + Sync {
    /// Sets the number of units expected, enabling percentage display.
    fn set_total(&self, total: u64);

    /// Advances by `delta` units.
    fn inc(&self, delta: u64);

    /// Replaces the message shown next to the indicator.
    fn set_message(&self, msg: String);

    /// Marks the work done, leaving `msg` visible.
    fn finish(&self, msg: String);
}

/// Discards every update.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
