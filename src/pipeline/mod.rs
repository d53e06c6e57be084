//! Pipeline stages for lecture-scan conversion.
//!
//! Each submodule implements one step; [`crate::convert`] strings them
//! together for a document.
//!
//! ## Data Flow
//!
//! ```text
//! input ─▶ render ─▶ analyze ─▶ dedup ─▶ assets(prepare) ─▶ refine ─▶ assets(resolve) ─▶ bundle
//!          (pdfium)  (VLM+parse)          (crop, markers)   (VLM)     (Excalidraw / PNG)   (zip)
//! ```
//!
//! 1. [`input`]   — validate the source file
//! 2. [`render`]  — rasterise pages in `spawn_blocking`
//! 3. [`encode`]  — PNG + base64 for multimodal requests
//! 4. [`llm`]     — the vision-model seam and the governed, retrying client
//! 5. [`analyze`] — combined transcription + diagram detection per page
//! 6. [`dedup`]   — skip build-up duplicates on consecutive pages
//! 7. [`assets`]  — crops, pending markers, final drawings or rasters
//! 8. [`refine`]  — optional whole-document pass
//! 9. [`postprocess`] — deterministic Markdown cleanup
//! 10. [`bundle`] — manifest and archive

pub mod analyze;
pub mod assets;
pub mod bundle;
pub mod dedup;
pub mod encode;
pub mod input;
pub mod llm;
pub mod postprocess;
pub mod refine;
pub mod render;

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Run `f` over `items` with at most `limit` in flight and return the
/// results in input order.
pub async fn run_bounded<T, R, F, Fut>(items: Vec<T>, limit: usize, f: F) -> Vec<R>
where
    F: Fn(usize, T) -> Fut,
    Fut: Future<Output = R>,
{
    let mut results: Vec<(usize, R)> = stream::iter(items.into_iter().enumerate().map(|(i, item)| {
        let fut = f(i, item);
        async move { (i, fut.await) }
    }))
    .buffer_unordered(limit.max(1))
    .collect()
    .await;
    results.sort_by_key(|(i, _)| *i);
    results.into_iter().map(|(_, r)| r).collect()
}
