//! Per-document conversion: PDF → Markdown + diagram resources → bundle.
//!
//! [`convert_document`] runs the whole pipeline for one source file:
//!
//! 1. **Analyze** every page (bounded pool): render, one combined call,
//!    parse transcription and diagram boxes.
//! 2. **Deduplicate** build-up diagrams across consecutive pages.
//! 3. **Prepare** crops for the remaining diagrams (bounded pool, one render
//!    per page that has diagrams) and swap placeholders for pending markers.
//! 4. **Assemble** the document and optionally **refine** it.
//! 5. **Resolve** the markers that survived refinement (bounded pool) into
//!    Excalidraw drawings or PNG attachments.
//! 6. **Bundle** everything into `<note>.zip`.
//!
//! Page-level and asset-level failures degrade in place. The function only
//! returns `Err` for document-fatal problems: unreadable input, missing
//! prompts, an unusable provider, an unwritable output, or a daily quota
//! that runs out mid-document (the controller puts such a task back in the
//! queue).

use crate::config::Settings;
use crate::error::ForgeError;
use crate::pipeline::analyze::{analyze_page, DiagramItem, PageAnalysis};
use crate::pipeline::assets::{
    drop_unresolved, inject_markers, prepare_asset, replace_pending, resolve_asset,
    surviving_ids, PendingAsset, ResolveOptions,
};
use crate::pipeline::bundle::{self, Bundle};
use crate::pipeline::dedup::{mark_build_up_duplicates, DedupThresholds};
use crate::pipeline::input::validate_pdf;
use crate::pipeline::llm::AiClient;
use crate::pipeline::refine::refine_document;
use crate::pipeline::render::{PageRenderer, RenderOptions};
use crate::pipeline::run_bounded;
use crate::progress::{scaled, SharedProgress};
use crate::prompts::combined_analysis_prompt;
use crate::store::ResolvedSubject;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One document to convert.
#[derive(Debug, Clone)]
pub struct DocumentJob {
    pub source: PathBuf,
    /// Folder of the source below its watch root; mirrored under the output
    /// root.
    pub relative_folder: PathBuf,
    pub subject: String,
}

impl DocumentJob {
    /// Note title: the source file stem.
    pub fn title(&self) -> String {
        self.source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Untitled".to_string())
    }
}

/// Everything a conversion needs besides the job itself.
#[derive(Clone)]
pub struct ConversionContext {
    pub settings: Arc<Settings>,
    pub subject: ResolvedSubject,
    pub renderer: Arc<dyn PageRenderer>,
    pub client: AiClient,
    pub progress: SharedProgress,
}

/// Summary of a finished conversion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversionReport {
    pub output: PathBuf,
    pub pages: usize,
    pub diagrams_detected: usize,
    pub diagrams_skipped: usize,
    pub drawings: usize,
    pub rasters: usize,
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
}

impl ConversionContext {
    fn render_options(&self) -> RenderOptions {
        RenderOptions {
            dpi: self.settings.render_dpi,
            max_pixels: self.settings.max_rendered_pixels,
        }
    }

    fn workers(&self) -> usize {
        self.settings.max_workers.max(1)
    }

    fn say(&self, msg: impl AsRef<str>) {
        self.progress.on_message(msg.as_ref());
    }
}

/// Convert one document and write its bundle.
pub async fn convert_document(
    ctx: &ConversionContext,
    job: &DocumentJob,
) -> Result<ConversionReport, ForgeError> {
    let start = Instant::now();
    validate_pdf(&job.source)?;

    let prompts = &ctx.subject.prompts;
    if prompts.transcription_goal.trim().is_empty() {
        return Err(ForgeError::MissingPrompt {
            which: "transcription",
            subject: job.subject.clone(),
        });
    }
    if prompts.coordinate_goal.trim().is_empty() {
        return Err(ForgeError::MissingPrompt {
            which: "diagram detection",
            subject: job.subject.clone(),
        });
    }
    let analysis_prompt =
        combined_analysis_prompt(&prompts.transcription_prompt(), &prompts.coordinate_goal);

    let page_count = ctx.renderer.page_count(&job.source).await?;
    let title = job.title();
    let mut bundle = Bundle::new(&title);

    // ── Phase 1: analyze ─────────────────────────────────────────────────
    ctx.say(format!("Phase 1: Analyzing {page_count} pages..."));
    let mut pages = analyze_all(ctx, &job.source, &analysis_prompt, page_count).await?;

    // ── Phase 2: deduplicate ─────────────────────────────────────────────
    let thresholds = DedupThresholds {
        iou: ctx.settings.iou_threshold,
        summary: ctx.settings.summary_similarity,
    };
    let (detected, skipped) = dedup_pages(&mut pages, thresholds);
    ctx.say(format!(
        "Phase 2: Filtered diagrams. Processable: {} (Original: {detected})",
        detected - skipped
    ));
    ctx.progress.on_progress(60);

    // ── Phase 3: prepare ─────────────────────────────────────────────────
    let pending = prepare_all(ctx, &job.source, &pages).await;
    ctx.progress.on_progress(70);

    // ── Phase 4: assemble + refine ───────────────────────────────────────
    let mut document = format!("# {title}\n\n");
    for page in &pages {
        document.push_str(&inject_markers(&page.text, &page.items, &pending));
        document.push_str(&ctx.settings.page_separator.render(page.page_idx + 1));
    }

    if ctx.settings.refine_markdown {
        match refine_document(
            &ctx.client,
            &prompts.refinement_goal,
            &prompts.style_guide,
            &document,
        )
        .await
        {
            Ok(Some(refined)) => {
                document = refined;
                ctx.say("Refinement complete.");
            }
            Ok(None) => {}
            Err(e) => ctx.say(format!("Refinement failed: {e}")),
        }
    }

    // ── Phase 5: resolve survivors ───────────────────────────────────────
    let survivors: Vec<PendingAsset> = surviving_ids(&document)
        .iter()
        .filter_map(|id| pending.get(id).cloned())
        .collect();
    ctx.say(format!(
        "Refinement Result: Keeping {} of {} potential diagrams.",
        survivors.len(),
        pending.len()
    ));

    let resolve_opts = ResolveOptions {
        generate_excalidraw: ctx.subject.generate_excalidraw,
        threshold: ctx.subject.excalidraw_threshold,
        excalidraw_goal: prompts.excalidraw_goal.clone(),
        parent_note_id: bundle.root_note_id.clone(),
        note_dir: bundle.safe_name.clone(),
    };
    let (drawings, rasters) =
        resolve_all(ctx, survivors, &resolve_opts, &mut document, &mut bundle).await;
    ctx.progress.on_progress(99);

    // ── Phase 6: bundle ──────────────────────────────────────────────────
    bundle.markdown = drop_unresolved(&document);
    let output = bundle.write_to(&output_dir_for(&ctx.settings, job))?;
    ctx.say(format!("Saved to {}", output.display()));

    let usage = ctx.client.usage();
    let report = ConversionReport {
        output,
        pages: page_count,
        diagrams_detected: detected,
        diagrams_skipped: skipped,
        drawings,
        rasters,
        calls: usage.calls.load(Ordering::Relaxed),
        input_tokens: usage.input_tokens.load(Ordering::Relaxed),
        output_tokens: usage.output_tokens.load(Ordering::Relaxed),
        duration_ms: start.elapsed().as_millis() as u64,
    };
    info!(
        "{}: {} pages, {} calls, {} input / {} output tokens, {} ms",
        title,
        report.pages,
        report.calls,
        report.input_tokens,
        report.output_tokens,
        report.duration_ms
    );
    Ok(report)
}

async fn analyze_all(
    ctx: &ConversionContext,
    source: &Path,
    prompt: &str,
    page_count: usize,
) -> Result<Vec<PageAnalysis>, ForgeError> {
    let done = AtomicUsize::new(0);
    let renderer = &*ctx.renderer;
    let client = &ctx.client;
    let render = ctx.render_options();
    let done_ref = &done;

    let results = run_bounded((0..page_count).collect(), ctx.workers(), |_, page_idx| async move {
        let result = analyze_page(renderer, client, source, render, prompt, page_idx).await;
        let n = done_ref.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.progress.on_progress(scaled(0, 50, n, page_count));
        if let Ok(page) = &result {
            if !page.items.is_empty() {
                ctx.say(format!("Page {}: Detected {} diagrams.", page_idx + 1, page.items.len()));
            }
        }
        result
    })
    .await;

    results.into_iter().collect()
}

/// Run deduplication over all pages. Returns `(detected, skipped)`.
fn dedup_pages(pages: &mut [PageAnalysis], thresholds: DedupThresholds) -> (usize, usize) {
    let mut all: Vec<DiagramItem> = pages.iter().flat_map(|p| p.items.clone()).collect();
    let skipped = mark_build_up_duplicates(&mut all, thresholds);
    let skip: HashMap<&str, bool> = all.iter().map(|i| (i.temp_id.as_str(), i.skip)).collect();
    for item in pages.iter_mut().flat_map(|p| p.items.iter_mut()) {
        item.skip = skip.get(item.temp_id.as_str()).copied().unwrap_or(false);
    }
    (all.len(), skipped)
}

async fn prepare_all(
    ctx: &ConversionContext,
    source: &Path,
    pages: &[PageAnalysis],
) -> HashMap<String, PendingAsset> {
    let mut by_page: BTreeMap<usize, Vec<&DiagramItem>> = BTreeMap::new();
    for item in pages.iter().flat_map(|p| &p.items) {
        if !item.skip && item.box_2d.is_some() {
            by_page.entry(item.page_idx).or_default().push(item);
        }
    }
    let total: usize = by_page.values().map(Vec::len).sum();
    let done = AtomicUsize::new(0);
    let done_ref = &done;
    let renderer = &*ctx.renderer;
    let render = ctx.render_options();

    let prepared = run_bounded(by_page.into_iter().collect(), ctx.workers(), |_, (page_idx, items)| async move {
        let image = match renderer.render_page(source, page_idx, render).await {
            Ok(img) => Some(img),
            Err(e) => {
                warn!("Page {}: re-render for crops failed: {e}", page_idx + 1);
                None
            }
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if let Some(img) = &image {
                match prepare_asset(item, img) {
                    Ok(Some(asset)) => out.push(asset),
                    Ok(None) => {}
                    Err(e) => warn!("{}: crop failed: {e}", item.temp_id),
                }
            }
            let n = done_ref.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.progress.on_progress(scaled(60, 10, n, total));
        }
        out
    })
    .await;

    let pending: HashMap<String, PendingAsset> = prepared
        .into_iter()
        .flatten()
        .map(|a| (a.temp_id.clone(), a))
        .collect();
    debug!("Prepared {} of {} diagram crops", pending.len(), total);
    pending
}

async fn resolve_all(
    ctx: &ConversionContext,
    survivors: Vec<PendingAsset>,
    opts: &ResolveOptions,
    document: &mut String,
    bundle: &mut Bundle,
) -> (usize, usize) {
    if survivors.is_empty() {
        return (0, 0);
    }
    ctx.say(format!("Phase 5: Generating {} final assets...", survivors.len()));
    let total = survivors.len();
    let done = AtomicUsize::new(0);
    let done_ref = &done;
    let client = &ctx.client;

    let resolved = run_bounded(survivors, ctx.workers(), |_, asset| async move {
        let r = resolve_asset(client, &asset, opts).await;
        let n = done_ref.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.progress.on_progress(scaled(90, 9, n, total));
        r
    })
    .await;

    let (mut drawings, mut rasters) = (0, 0);
    for r in resolved {
        *document = replace_pending(document, &r.temp_id, &r.final_path);
        if let Some(child) = r.child {
            drawings += 1;
            ctx.say(format!("Generated Excalidraw for {}", child.title));
            bundle.children.push(child);
        }
        if let Some(att) = r.attachment {
            rasters += 1;
            bundle.attachments.push(att);
        }
        bundle.files.push(r.file);
    }
    (drawings, rasters)
}

/// Default output directory for a job; used by the controller's skip check.
pub fn output_dir_for(settings: &Settings, job: &DocumentJob) -> PathBuf {
    bundle::target_dir(
        &job.source,
        &job.relative_folder,
        &settings.output_folder,
        settings.use_same_folder_for_output,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(page: usize, n: usize, b: [f32; 4]) -> DiagramItem {
        DiagramItem {
            page_idx: page,
            box_2d: Some(b),
            label: "Graph".into(),
            id: format!("DIAGRAM_{}", n + 1),
            visual_summary: None,
            output_type: None,
            temp_id: format!("P{page}_D{n}"),
            skip: false,
        }
    }

    fn page(idx: usize, items: Vec<DiagramItem>) -> PageAnalysis {
        PageAnalysis {
            page_idx: idx,
            text: String::new(),
            items,
            source: crate::pipeline::analyze::DiagramSource::Delimited,
        }
    }

    #[test]
    fn dedup_flags_are_written_back_to_pages() {
        let b = [100.0, 100.0, 600.0, 900.0];
        let mut pages = vec![page(0, vec![item(0, 0, b)]), page(1, vec![item(1, 0, b)])];
        let (detected, skipped) = dedup_pages(&mut pages, DedupThresholds::default());
        assert_eq!((detected, skipped), (2, 1));
        assert!(pages[0].items[0].skip);
        assert!(!pages[1].items[0].skip);
    }

    #[test]
    fn job_title_is_the_stem() {
        let job = DocumentJob {
            source: PathBuf::from("/in/Math/Lecture 03.pdf"),
            relative_folder: PathBuf::from("Math"),
            subject: "Math".into(),
        };
        assert_eq!(job.title(), "Lecture 03");
        let settings = Settings::builder().output_folder("/out").build().unwrap();
        assert_eq!(output_dir_for(&settings, &job), PathBuf::from("/out/Math"));
    }
}
