//! Progress reporting for a document conversion.
//!
//! The pipeline reports two things: a 0–100 progress figure and
//! human-readable activity lines. The controller forwards both into the task
//! record and the activity log; the `convert` command drives a terminal
//! progress bar. The trait is `Send + Sync` because pages and assets are
//! processed concurrently.
//!
//! ## Progress milestones
//!
//! ```text
//!  0 ─ 50   analysis (completed pages / (2 × pages))
//! 60        analysis + dedup done
//! 60 ─ 70   crops prepared
//! 70        assembly
//! 90 ─ 99   surviving diagrams resolved
//! 99        archive being written
//! 100       saved
//! ```

use std::sync::Arc;

/// Receives progress from the pipeline. Both methods default to no-ops.
pub trait ProgressSink: Send + Sync {
    /// New progress value, 0–100. Values never decrease within a document.
    fn on_progress(&self, percent: u8) {
        let _ = percent;
    }

    /// One activity line, e.g. "Phase 1: Analyzing 12 pages...".
    fn on_message(&self, message: &str) {
        let _ = message;
    }
}

/// Discards all events.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {}

pub type SharedProgress = Arc<dyn ProgressSink>;

/// `done / total` mapped onto `[from, from + span]`, rounded.
pub fn scaled(from: u8, span: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return from.saturating_add(span);
    }
    let frac = done.min(total) as f64 / total as f64;
    from.saturating_add((frac * f64::from(span)).round() as u8)
}
